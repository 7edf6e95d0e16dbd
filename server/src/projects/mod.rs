//! Project discovery, path resolution, and validation.
//!
//! Projects live under `projects.root`, one directory per project holding
//! `*.jsonl` conversation logs. A directory's name is the project's working
//! directory with `/` replaced by `-`, which is lossy for paths containing
//! `-`, so the authoritative answer comes from the `cwd` recorded in the logs.

pub mod cache;
pub mod watcher;

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

pub use cache::ProjectPathCache;
pub use watcher::ProjectWatcher;

/// Maps a logical project name to its working directory.
pub trait ProjectResolver: Send + Sync {
    fn resolve(&self, project_name: &str) -> Result<PathBuf>;
}

/// Resolver backed by the on-disk projects tree and a [`ProjectPathCache`].
pub struct WorkspaceResolver {
    root: PathBuf,
    cache: Arc<ProjectPathCache>,
}

impl WorkspaceResolver {
    pub fn new(root: PathBuf, cache: Arc<ProjectPathCache>) -> Self {
        Self { root, cache }
    }
}

impl ProjectResolver for WorkspaceResolver {
    fn resolve(&self, project_name: &str) -> Result<PathBuf> {
        if !is_valid_project_name(project_name) {
            return Err(Error::ProjectNotFound(project_name.to_string()));
        }
        if let Some(path) = self.cache.get(project_name) {
            return Ok(path);
        }

        let dir = self.root.join(project_name);
        if !dir.is_dir() {
            return Err(Error::ProjectNotFound(project_name.to_string()));
        }

        let path = cwd_from_logs(&dir).unwrap_or_else(|| decode_project_name(project_name));
        debug!("Resolved project {project_name} -> {}", path.display());
        self.cache.insert(project_name, path.clone());
        Ok(path)
    }
}

/// A project name is a single, non-special path component.
fn is_valid_project_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// Best-effort decoding of a project directory name (`-a-b` → `/a/b`).
pub fn decode_project_name(name: &str) -> PathBuf {
    PathBuf::from(name.replace('-', "/"))
}

#[derive(Deserialize)]
struct LogRecord {
    cwd: Option<String>,
}

/// Most frequent `cwd` across a project's `*.jsonl` logs. Ties go to the
/// value seen in the most recently modified file.
pub fn cwd_from_logs(dir: &Path) -> Option<PathBuf> {
    let mut counts: HashMap<String, (usize, SystemTime)> = HashMap::new();

    for entry in fs::read_dir(dir).ok()?.filter_map(std::result::Result::ok) {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let Ok(file) = fs::File::open(&path) else {
            continue;
        };
        for line in BufReader::new(file).lines().map_while(std::result::Result::ok) {
            if !line.contains("\"cwd\"") {
                continue;
            }
            let Ok(LogRecord { cwd: Some(cwd) }) = serde_json::from_str::<LogRecord>(&line) else {
                continue;
            };
            if cwd.is_empty() {
                continue;
            }
            let slot = counts.entry(cwd).or_insert((0, SystemTime::UNIX_EPOCH));
            slot.0 += 1;
            slot.1 = slot.1.max(modified);
        }
    }

    counts
        .into_iter()
        .max_by(|(_, a), (_, b)| a.0.cmp(&b.0).then(a.1.cmp(&b.1)))
        .map(|(cwd, _)| PathBuf::from(cwd))
}

/// Check that `path` is usable as a session working directory.
///
/// It must be absolute, exist, be a directory, and (when `workspace_root` is
/// set) lie inside it after symlinks are resolved. Returns the canonical path.
pub fn validate_project_path(path: &Path, workspace_root: Option<&Path>) -> Result<PathBuf> {
    let invalid = |reason: &str| Error::InvalidProjectPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if !path.is_absolute() {
        return Err(invalid("path must be absolute"));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(invalid("path must not contain `..`"));
    }
    let canonical = path
        .canonicalize()
        .map_err(|e| invalid(&format!("cannot resolve: {e}")))?;
    if !canonical.is_dir() {
        return Err(invalid("not a directory"));
    }
    if let Some(root) = workspace_root {
        let root = root
            .canonicalize()
            .map_err(|e| invalid(&format!("workspace root unavailable: {e}")))?;
        if !canonical.starts_with(&root) {
            return Err(invalid("outside the workspace root"));
        }
    }
    Ok(canonical)
}

/// Names of project directories under `root`, sorted. Empty if `root` is
/// missing.
pub fn list_projects(root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| !watcher::is_ignored_component(name))
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_log(dir: &Path, name: &str, cwds: &[&str]) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        for cwd in cwds {
            writeln!(f, r#"{{"type":"user","cwd":"{cwd}","message":"hi"}}"#).unwrap();
        }
        writeln!(f, r#"{{"type":"summary"}}"#).unwrap();
    }

    #[test]
    fn decoding_maps_dashes_to_separators() {
        assert_eq!(decode_project_name("-home-op-app"), PathBuf::from("/home/op/app"));
    }

    #[test]
    fn most_frequent_cwd_wins() {
        let tmp = tempfile::tempdir().unwrap();
        write_log(tmp.path(), "a.jsonl", &["/srv/my-app", "/srv/my-app", "/srv/other"]);
        write_log(tmp.path(), "b.jsonl", &["/srv/my-app"]);
        write_log(tmp.path(), "notes.txt", &["/ignored", "/ignored", "/ignored"]);
        assert_eq!(cwd_from_logs(tmp.path()).unwrap(), Path::new("/srv/my-app"));
    }

    #[test]
    fn ties_go_to_the_most_recent_log() {
        let tmp = tempfile::tempdir().unwrap();
        write_log(tmp.path(), "old.jsonl", &["/srv/old"]);
        write_log(tmp.path(), "new.jsonl", &["/srv/new"]);
        let old = fs::File::options()
            .write(true)
            .open(tmp.path().join("old.jsonl"))
            .unwrap();
        old.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000))
            .unwrap();
        assert_eq!(cwd_from_logs(tmp.path()).unwrap(), Path::new("/srv/new"));
    }

    #[test]
    fn no_logs_means_no_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(cwd_from_logs(tmp.path()).is_none());
    }

    #[test]
    fn resolver_caches_and_falls_back_to_decoding() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("-srv-demo")).unwrap();
        fs::create_dir(tmp.path().join("-srv-logged")).unwrap();
        write_log(&tmp.path().join("-srv-logged"), "s.jsonl", &["/srv/logged-app"]);

        let cache = Arc::new(ProjectPathCache::new());
        let resolver = WorkspaceResolver::new(tmp.path().to_path_buf(), Arc::clone(&cache));
        assert_eq!(resolver.resolve("-srv-demo").unwrap(), Path::new("/srv/demo"));
        assert_eq!(
            resolver.resolve("-srv-logged").unwrap(),
            Path::new("/srv/logged-app")
        );
        assert_eq!(cache.len(), 2);

        assert_eq!(resolver.resolve("missing").unwrap_err().code(), "project-not-found");
        assert_eq!(resolver.resolve("../etc").unwrap_err().code(), "project-not-found");
    }

    #[test]
    fn validation_rejects_relative_missing_and_escaping_paths() {
        let workspace = tempfile::tempdir().unwrap();
        let inside = workspace.path().join("p1");
        fs::create_dir(&inside).unwrap();
        let outside = tempfile::tempdir().unwrap();

        assert!(validate_project_path(&inside, Some(workspace.path())).is_ok());
        for bad in [
            PathBuf::from("relative/dir"),
            workspace.path().join("nope"),
            workspace.path().join("p1/../p1"),
            outside.path().to_path_buf(),
        ] {
            let err = validate_project_path(&bad, Some(workspace.path())).unwrap_err();
            assert_eq!(err.code(), "invalid-project-path", "{}", bad.display());
        }

        let file = inside.join("file.txt");
        fs::write(&file, "x").unwrap();
        assert!(validate_project_path(&file, None).is_err());
    }

    #[test]
    fn list_projects_skips_files_and_ignored_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("-b")).unwrap();
        fs::create_dir(tmp.path().join("-a")).unwrap();
        fs::create_dir(tmp.path().join(".git")).unwrap();
        fs::write(tmp.path().join("stray.jsonl"), "").unwrap();
        assert_eq!(list_projects(tmp.path()), vec!["-a", "-b"]);
        assert!(list_projects(&tmp.path().join("absent")).is_empty());
    }
}
