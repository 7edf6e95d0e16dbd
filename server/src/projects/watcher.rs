//! Filesystem watcher for the projects tree.
//!
//! A `notify` recursive watcher reports raw events on its own thread; the
//! callback maps each touched path to a project name and hands it to an async
//! debounce loop over a bounded channel. After a quiet window (trailing edge)
//! the loop invalidates the cache entries for every touched project and
//! publishes a single `projects-updated` broadcast.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{list_projects, ProjectPathCache};
use crate::error::Result;
use crate::protocol::ServerMessage;
use crate::ws::clients::ClientRegistry;

/// Version-control and dependency directories whose churn is ignored.
pub const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "dist",
    "build",
    ".cache",
    "__pycache__",
    ".venv",
];

/// Queue between the notify thread and the debounce loop.
const EVENT_QUEUE: usize = 1024;

pub fn is_ignored_component(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    Touched(String),
    /// Events were dropped; treat every project as touched.
    Overflow,
}

/// Project touched by `path`, or `None` for the root itself and anything
/// under an ignored directory.
pub fn project_of(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut components = rel.components().filter_map(|c| match c {
        Component::Normal(s) => Some(s.to_str()),
        _ => None,
    });
    let first = components.next()??;
    if is_ignored_component(first) {
        return None;
    }
    for c in components {
        if c.is_some_and(is_ignored_component) {
            return None;
        }
    }
    Some(first.to_string())
}

/// Coalesce signals until `window` passes with none arriving, then await
/// `flush` once with everything collected. Signals arriving during a flush
/// go to the next window. Returns when `rx` closes.
pub async fn debounce_loop<F, Fut>(
    mut rx: mpsc::Receiver<WatchSignal>,
    window: Duration,
    mut flush: F,
) where
    F: FnMut(BTreeSet<String>, bool) -> Fut,
    Fut: Future<Output = ()>,
{
    while let Some(first) = rx.recv().await {
        let mut touched = BTreeSet::new();
        let mut overflow = false;
        let mut absorb = |signal: WatchSignal, touched: &mut BTreeSet<String>| match signal {
            WatchSignal::Touched(name) => {
                touched.insert(name);
            }
            WatchSignal::Overflow => overflow = true,
        };
        absorb(first, &mut touched);

        let quiet = tokio::time::sleep(window);
        tokio::pin!(quiet);
        let mut closed = false;
        loop {
            tokio::select! {
                signal = rx.recv() => match signal {
                    Some(signal) => {
                        absorb(signal, &mut touched);
                        quiet.as_mut().reset(Instant::now() + window);
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
                () = &mut quiet => break,
            }
        }
        flush(touched, overflow).await;
        if closed {
            return;
        }
    }
}

/// Running watcher; dropping it stops both the OS watch and the loop.
pub struct ProjectWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ProjectWatcher {
    /// Watch `root` recursively, invalidating `cache` and broadcasting
    /// `projects-updated` through `clients` after each quiet window.
    pub fn start(
        root: PathBuf,
        debounce: Duration,
        cache: Arc<ProjectPathCache>,
        clients: ClientRegistry,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let cb_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("Project watcher error: {e}");
                    return;
                }
            };
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            for path in &event.paths {
                if let Some(project) = project_of(&cb_root, path) {
                    if tx.try_send(WatchSignal::Touched(project)).is_err() {
                        let _ = tx.try_send(WatchSignal::Overflow);
                    }
                }
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!("Watching {} for project changes", root.display());

        let task = tokio::spawn(debounce_loop(rx, debounce, move |touched, overflow| {
            let root = root.clone();
            let cache = Arc::clone(&cache);
            let clients = clients.clone();
            async move {
                // Directory listing blocks; keep it off the runtime workers.
                let job = tokio::task::spawn_blocking(move || {
                    publish_changes(&root, &cache, &clients, touched, overflow);
                });
                if let Err(e) = job.await {
                    warn!("Project refresh failed: {e}");
                }
            }
        }));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

/// Invalidate cache entries for `touched` (everything on overflow), then
/// broadcast the fresh project list.
fn publish_changes(
    root: &Path,
    cache: &ProjectPathCache,
    clients: &ClientRegistry,
    touched: BTreeSet<String>,
    overflow: bool,
) {
    if overflow {
        cache.clear();
    } else {
        for name in &touched {
            cache.invalidate(name);
        }
    }
    let projects = list_projects(root);
    let changed_projects: Vec<String> = touched.into_iter().collect();
    debug!("Projects changed: {changed_projects:?}");
    clients.broadcast(ServerMessage::ProjectsUpdated {
        changed_projects,
        projects,
    });
}

impl Drop for ProjectWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_paths_to_projects_and_skips_ignored() {
        let root = Path::new("/data/projects");
        assert_eq!(
            project_of(root, Path::new("/data/projects/-srv-app/abc.jsonl")).as_deref(),
            Some("-srv-app")
        );
        assert_eq!(
            project_of(root, Path::new("/data/projects/-srv-app")).as_deref(),
            Some("-srv-app")
        );
        assert_eq!(project_of(root, root), None);
        assert_eq!(project_of(root, Path::new("/elsewhere/x")), None);
        assert_eq!(
            project_of(root, Path::new("/data/projects/-srv-app/node_modules/x.js")),
            None
        );
        assert_eq!(project_of(root, Path::new("/data/projects/.git/HEAD")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn bursts_collapse_into_one_flush() {
        let (tx, rx) = mpsc::channel(16);
        let flushed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushed);
        let task = tokio::spawn(debounce_loop(rx, Duration::from_millis(300), move |t, o| {
            sink.lock().unwrap().push((t, o));
            std::future::ready(())
        }));

        for name in ["a", "b", "a"] {
            tx.send(WatchSignal::Touched(name.into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(flushed.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(400)).await;
        {
            let got = flushed.lock().unwrap();
            assert_eq!(got.len(), 1);
            let names: Vec<_> = got[0].0.iter().cloned().collect();
            assert_eq!(names, ["a", "b"]);
            assert!(!got[0].1);
        }

        tx.send(WatchSignal::Overflow).await.unwrap();
        drop(tx);
        task.await.unwrap();
        let got = flushed.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert!(got[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_flush_is_awaited_and_later_signals_wait_their_turn() {
        let (tx, rx) = mpsc::channel(16);
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let task = tokio::spawn(debounce_loop(rx, Duration::from_millis(50), move |t, _| {
            let sink = Arc::clone(&sink);
            async move {
                let names: Vec<String> = t.into_iter().collect();
                sink.lock().unwrap().push(format!("start {names:?}"));
                tokio::time::sleep(Duration::from_secs(1)).await;
                sink.lock().unwrap().push("end".to_string());
            }
        }));

        tx.send(WatchSignal::Touched("a".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Arrives while the first flush is still running.
        tx.send(WatchSignal::Touched("b".into())).await.unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            [r#"start ["a"]"#, "end", r#"start ["b"]"#, "end"]
        );
    }

    #[tokio::test]
    async fn file_changes_invalidate_cache_and_broadcast() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("-srv-app")).unwrap();
        std::fs::create_dir(root.join("-srv-other")).unwrap();

        let cache = Arc::new(ProjectPathCache::new());
        cache.insert("-srv-app", PathBuf::from("/srv/app"));
        cache.insert("-srv-other", PathBuf::from("/srv/other"));
        let clients = ClientRegistry::new();
        let mut events = clients.subscribe();

        let _watcher = ProjectWatcher::start(
            root.clone(),
            Duration::from_millis(100),
            Arc::clone(&cache),
            clients,
        )
        .unwrap();

        std::fs::write(root.join("-srv-app/session.jsonl"), "{}\n").unwrap();
        std::fs::create_dir(root.join("-srv-app/node_modules")).unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            ServerMessage::ProjectsUpdated {
                changed_projects,
                projects,
            } => {
                assert_eq!(changed_projects, ["-srv-app"]);
                assert_eq!(projects, ["-srv-app", "-srv-other"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cache.get("-srv-app"), None);
        assert_eq!(cache.get("-srv-other"), Some(PathBuf::from("/srv/other")));
    }
}
