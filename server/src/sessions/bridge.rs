//! I/O streaming bridge between a child process and its attached connection.
//!
//! Each session runs one output pump per process stream and one input pump.
//! Output pumps decode and frame bytes, append them to the session's
//! [`OutputBuffer`] and offer them to the current [`Subscriber`] in the same
//! critical section, so a newly attached connection sees the buffered replay
//! followed by live output with no gap and no duplicate.
//!
//! Delivery to a subscriber never waits: the per-connection queue is bounded
//! and `try_send` is the only operation used. A full queue drops that
//! connection from the fan-out and flags it as lagged; the process keeps
//! running and other sessions are untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::buffer::{OutputBuffer, OutputEntry, OutputStream};
use crate::protocol::ServerMessage;

/// Read size for process output.
pub const CHUNK_SIZE: usize = 4096;

/// A partial line longer than this is flushed without waiting for `\n`.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// How stdout/stderr bytes are cut into messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One message per newline-terminated line (newline stripped).
    Lines,
    /// One message per read, as it arrives.
    Raw,
}

/// Incremental UTF-8 decoder that carries an incomplete trailing sequence
/// over to the next chunk instead of replacing it.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let remaining = rest.to_vec();
        self.pending = remaining;
        out
    }

    /// Flush whatever is left; an incomplete sequence becomes U+FFFD.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let s = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(s)
    }
}

/// Splits decoded text into complete lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: String,
}

impl LineFramer {
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        for piece in text.split_inclusive('\n') {
            self.partial.push_str(piece);
            if self.partial.ends_with('\n') {
                let mut line = std::mem::take(&mut self.partial);
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
                lines.push(line);
            } else if self.partial.len() >= MAX_LINE_BYTES {
                lines.push(std::mem::take(&mut self.partial));
            }
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        (!self.partial.is_empty()).then(|| std::mem::take(&mut self.partial))
    }
}

/// Decoder plus framing for one process stream.
#[derive(Debug)]
pub struct Framer {
    framing: Framing,
    decoder: Utf8Decoder,
    lines: LineFramer,
}

impl Framer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            decoder: Utf8Decoder::default(),
            lines: LineFramer::default(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let text = self.decoder.decode(chunk);
        match self.framing {
            Framing::Raw if text.is_empty() => Vec::new(),
            Framing::Raw => vec![text],
            Framing::Lines => self.lines.push(&text),
        }
    }

    pub fn finish(&mut self) -> Vec<String> {
        let tail = self.decoder.finish();
        match self.framing {
            Framing::Raw => tail.into_iter().collect(),
            Framing::Lines => {
                let mut out = tail.map(|t| self.lines.push(&t)).unwrap_or_default();
                out.extend(self.lines.finish());
                out
            }
        }
    }
}

/// The connection currently receiving a session's live output.
pub struct Subscriber {
    pub connection_id: Uuid,
    tx: mpsc::Sender<ServerMessage>,
    lagged: Arc<AtomicBool>,
}

/// Receiving half handed to the gateway on attach.
pub struct Subscription {
    pub rx: mpsc::Receiver<ServerMessage>,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    /// True when the fan-out was dropped because the queue filled up.
    pub fn lagged(&self) -> bool {
        self.lagged.load(Ordering::Acquire)
    }
}

/// Create a bounded subscriber queue for `connection_id`.
pub fn subscriber(connection_id: Uuid, capacity: usize) -> (Subscriber, Subscription) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let lagged = Arc::new(AtomicBool::new(false));
    (
        Subscriber {
            connection_id,
            tx,
            lagged: Arc::clone(&lagged),
        },
        Subscription { rx, lagged },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    NoSubscriber,
    /// Queue full: subscriber dropped and flagged.
    Lagged,
    /// Receiver gone: subscriber dropped.
    Closed,
}

/// Single-subscriber fan-out. Attaching replaces whoever was there.
#[derive(Default)]
pub struct Fanout {
    subscriber: Option<Subscriber>,
    /// Set once the session has ended; late subscribers get it immediately.
    ended: Option<ServerMessage>,
}

impl Fanout {
    /// Install `sub`, returning the connection it displaced, if any.
    pub fn replace(&mut self, sub: Subscriber) -> Option<Uuid> {
        if let Some(end) = &self.ended {
            let _ = sub.tx.try_send(end.clone());
            return self.subscriber.take().map(|s| s.connection_id);
        }
        self.subscriber.replace(sub).map(|s| s.connection_id)
    }

    /// Remove the subscriber only if it belongs to `connection_id`.
    pub fn remove_if(&mut self, connection_id: Uuid) -> bool {
        if self
            .subscriber
            .as_ref()
            .is_some_and(|s| s.connection_id == connection_id)
        {
            self.subscriber = None;
            true
        } else {
            false
        }
    }

    pub fn is_attached(&self) -> bool {
        self.subscriber.as_ref().is_some_and(|s| !s.tx.is_closed())
    }

    pub fn subscriber_id(&self) -> Option<Uuid> {
        self.subscriber.as_ref().map(|s| s.connection_id)
    }

    /// Offer `msg` to the subscriber without waiting.
    pub fn publish(&mut self, msg: ServerMessage) -> Delivery {
        let Some(sub) = &self.subscriber else {
            return Delivery::NoSubscriber;
        };
        match sub.tx.try_send(msg) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.lagged.store(true, Ordering::Release);
                self.subscriber = None;
                Delivery::Lagged
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.subscriber = None;
                Delivery::Closed
            }
        }
    }

    /// Deliver the end-of-session message and release the subscriber.
    pub fn finish(&mut self, msg: ServerMessage) -> Delivery {
        self.ended = Some(msg.clone());
        let delivery = self.publish(msg);
        self.subscriber = None;
        delivery
    }
}

/// Buffer and fan-out guarded together.
pub struct SessionOutput {
    pub buffer: OutputBuffer,
    pub fanout: Fanout,
}

impl SessionOutput {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer: OutputBuffer::new(buffer_size),
            fanout: Fanout::default(),
        }
    }

    /// Append one framed message and offer it to the subscriber.
    pub fn emit(&mut self, session_id: &str, stream: OutputStream, data: String) -> (OutputEntry, Delivery) {
        let entry = self.buffer.push(stream, data);
        let delivery = self.fanout.publish(ServerMessage::output(session_id, &entry));
        (entry, delivery)
    }
}

/// Last-activity timestamp consulted by the reaper.
pub struct ActivityClock(std::sync::Mutex<Instant>);

impl ActivityClock {
    pub fn new() -> Self {
        Self(std::sync::Mutex::new(Instant::now()))
    }

    pub fn touch(&self) {
        if let Ok(mut t) = self.0.lock() {
            *t = Instant::now();
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.0
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling tail of a stream kept for exit diagnostics.
#[derive(Default)]
pub struct StreamTail {
    text: std::sync::Mutex<String>,
}

impl StreamTail {
    const MAX: usize = 2048;

    pub fn append(&self, s: &str) {
        if let Ok(mut text) = self.text.lock() {
            text.push_str(s);
            if text.len() > Self::MAX * 2 {
                let keep = crate::util::tail_str(&text, Self::MAX).to_string();
                *text = keep;
            }
        }
    }

    pub fn get(&self) -> Option<String> {
        let text = self.text.lock().ok()?;
        let tail = crate::util::tail_str(text.trim_end(), Self::MAX);
        (!tail.is_empty()).then(|| tail.to_string())
    }
}

/// Context shared by a session's output pumps.
#[derive(Clone)]
pub struct PumpContext {
    pub session_id: String,
    pub output: Arc<Mutex<SessionOutput>>,
    pub activity: Arc<ActivityClock>,
}

/// Copy one process stream into the session buffer and fan-out until EOF.
///
/// Ends on EOF or read error (a PTY master reports EIO once the child side
/// closes). Never touches the session lifecycle.
pub async fn pump_output<R>(
    ctx: PumpContext,
    mut reader: R,
    stream: OutputStream,
    framing: Framing,
    tail: Option<Arc<StreamTail>>,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = Framer::new(framing);
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Session {} {} read ended: {e}", ctx.session_id, stream.as_str());
                break;
            }
        };
        let frames = framer.feed(&buf[..n]);
        emit_frames(&ctx, stream, framing, frames, tail.as_deref()).await;
    }
    let frames = framer.finish();
    emit_frames(&ctx, stream, framing, frames, tail.as_deref()).await;
    debug!("Session {} {} closed", ctx.session_id, stream.as_str());
}

async fn emit_frames(
    ctx: &PumpContext,
    stream: OutputStream,
    framing: Framing,
    frames: Vec<String>,
    tail: Option<&StreamTail>,
) {
    if frames.is_empty() {
        return;
    }
    ctx.activity.touch();
    let mut output = ctx.output.lock().await;
    for data in frames {
        if let Some(tail) = tail {
            tail.append(&data);
            if framing == Framing::Lines {
                tail.append("\n");
            }
        }
        let (entry, delivery) = output.emit(&ctx.session_id, stream, data);
        if delivery == Delivery::Lagged {
            warn!(
                "Session {}: subscriber fell behind at seq {}; dropped from fan-out",
                ctx.session_id, entry.seq
            );
        }
    }
}

/// Write queued input to the process in arrival order until the queue or the
/// process side closes.
pub async fn pump_input<W>(session_id: String, mut writer: W, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(data) = rx.recv().await {
        if let Err(e) = writer.write_all(&data).await {
            debug!("Session {session_id} input closed: {e}");
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn decoder_joins_split_multibyte_sequences() {
        let bytes = "héllo → wörld".as_bytes();
        let mut dec = Utf8Decoder::default();
        let mut out = String::new();
        for b in bytes {
            out.push_str(&dec.decode(std::slice::from_ref(b)));
        }
        assert_eq!(out, "héllo → wörld");
        assert!(dec.finish().is_none());
    }

    #[test]
    fn decoder_replaces_invalid_bytes_and_keeps_going() {
        let mut dec = Utf8Decoder::default();
        assert_eq!(dec.decode(b"ab\xffcd"), "ab\u{fffd}cd");
        // Truncated 3-byte sequence left at end of stream.
        assert_eq!(dec.decode(b"x\xe2\x86"), "x");
        assert_eq!(dec.finish().as_deref(), Some("\u{fffd}"));
    }

    #[test]
    fn line_framer_emits_complete_lines_only() {
        let mut f = Framer::new(Framing::Lines);
        assert_eq!(f.feed(b"{\"a\":1}\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(f.feed(b":2}\r\n\n"), vec!["{\"b\":2}", ""]);
        assert_eq!(f.feed(b"partial"), Vec::<String>::new());
        assert_eq!(f.finish(), vec!["partial"]);
    }

    #[test]
    fn raw_framer_passes_chunks_through() {
        let mut f = Framer::new(Framing::Raw);
        assert_eq!(f.feed(b"$ "), vec!["$ "]);
        assert!(f.feed(&[0xe2]).is_empty());
        assert_eq!(f.feed(&[0x86, 0x92]), vec!["→"]);
    }

    #[test]
    fn full_queue_drops_subscriber_and_flags_lag() {
        let mut out = SessionOutput::new(100);
        let conn = Uuid::new_v4();
        let (sub, subscription) = subscriber(conn, 2);
        assert_eq!(out.fanout.replace(sub), None);

        assert_eq!(out.emit("s", OutputStream::Stdout, "1".into()).1, Delivery::Delivered);
        assert_eq!(out.emit("s", OutputStream::Stdout, "2".into()).1, Delivery::Delivered);
        assert_eq!(out.emit("s", OutputStream::Stdout, "3".into()).1, Delivery::Lagged);
        assert!(subscription.lagged());
        assert!(!out.fanout.is_attached());
        // Buffer keeps everything regardless.
        assert_eq!(out.buffer.len(), 3);
        assert_eq!(out.emit("s", OutputStream::Stdout, "4".into()).1, Delivery::NoSubscriber);
    }

    #[test]
    fn replace_and_conditional_remove() {
        let mut fanout = Fanout::default();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let (a, _a_rx) = subscriber(first, 4);
        let (b, mut b_rx) = subscriber(second, 4);
        fanout.replace(a);
        assert_eq!(fanout.replace(b), Some(first));

        assert!(!fanout.remove_if(first));
        assert_eq!(fanout.subscriber_id(), Some(second));

        fanout.publish(ServerMessage::Pong);
        assert_eq!(b_rx.rx.try_recv().ok(), Some(ServerMessage::Pong));
        assert!(fanout.remove_if(second));
        assert!(!fanout.is_attached());
    }

    #[test]
    fn late_subscriber_receives_end_message() {
        let mut fanout = Fanout::default();
        let end = ServerMessage::error("gone", "ended");
        fanout.finish(end.clone());
        let (sub, mut subscription) = subscriber(Uuid::new_v4(), 4);
        fanout.replace(sub);
        assert_eq!(subscription.rx.try_recv().ok(), Some(end));
        assert!(!fanout.is_attached());
    }

    #[tokio::test]
    async fn output_pump_buffers_and_forwards() {
        let ctx = PumpContext {
            session_id: "s1".into(),
            output: Arc::new(Mutex::new(SessionOutput::new(10))),
            activity: Arc::new(ActivityClock::new()),
        };
        let (sub, mut subscription) = subscriber(Uuid::new_v4(), 8);
        ctx.output.lock().await.fanout.replace(sub);

        let (mut w, r) = tokio::io::duplex(64);
        let pump = tokio::spawn(pump_output(ctx.clone(), r, OutputStream::Stdout, Framing::Lines, None));
        w.write_all(b"one\ntw").await.unwrap();
        w.write_all(b"o\n").await.unwrap();
        drop(w);
        pump.await.unwrap();

        let mut got = Vec::new();
        while let Ok(ServerMessage::Output { data, seq, .. }) = subscription.rx.try_recv() {
            got.push((seq, data));
        }
        assert_eq!(got, vec![(1, "one".to_string()), (2, "two".to_string())]);
        assert_eq!(ctx.output.lock().await.buffer.len(), 2);
    }

    #[tokio::test]
    async fn input_pump_preserves_order() {
        let (w, mut r) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(4);
        let pump = tokio::spawn(pump_input("s1".into(), w, rx));
        for part in ["a", "b", "c"] {
            tx.send(part.as_bytes().to_vec()).await.unwrap();
        }
        drop(tx);
        pump.await.unwrap();
        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(1), r.read_to_string(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, "abc");
    }

    #[test]
    fn stream_tail_keeps_recent_text() {
        let tail = StreamTail::default();
        assert!(tail.get().is_none());
        tail.append(&"x".repeat(5000));
        tail.append("end");
        let got = tail.get().unwrap();
        assert!(got.len() <= StreamTail::MAX);
        assert!(got.ends_with("end"));
    }
}
