//! In-memory transport implementation for testing.
//!
//! Connections are backed by Tokio channels. The owning [`MemoryTransport`]
//! acts as the remote endpoint: it can push frames into the live connection
//! for a URL, cut it abruptly, or make upcoming opens fail.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChannelConnection, Frame, Transport};
use crate::error::TransportError;

enum RemoteEvent {
    Frame(Frame),
    Abort,
}

struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<RemoteEvent>,
}

#[derive(Default)]
struct UrlState {
    /// Scripted outcomes for the next opens, `false` = fail
    script: VecDeque<bool>,
    /// Fail every open until restored
    down: bool,
    link: Option<Link>,
    opens: usize,
    failed_opens: usize,
    closes: usize,
    sent: Vec<Frame>,
}

#[derive(Default)]
struct MemoryState {
    next_link_id: u64,
    urls: HashMap<String, UrlState>,
}

/// Scriptable in-process transport.
///
/// Every open succeeds unless a failure was scripted with
/// [`fail_next_opens`](Self::fail_next_opens) or the URL was taken
/// [`down`](Self::set_down).
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Make the next `count` opens of `url` fail
    pub fn fail_next_opens(&self, url: &str, count: usize) {
        let mut state = self.lock();
        let entry = state.urls.entry(url.to_string()).or_default();
        entry.script.extend(std::iter::repeat(false).take(count));
    }

    /// Fail (or stop failing) every open of `url`
    pub fn set_down(&self, url: &str, down: bool) {
        self.lock().urls.entry(url.to_string()).or_default().down = down;
    }

    /// Deliver a frame on the live connection for `url`
    pub fn push_frame(&self, url: &str, frame: Frame) -> bool {
        let state = self.lock();
        state
            .urls
            .get(url)
            .and_then(|u| u.link.as_ref())
            .is_some_and(|link| link.tx.send(RemoteEvent::Frame(frame)).is_ok())
    }

    /// Deliver a text frame on the live connection for `url`
    pub fn push_text(&self, url: &str, text: impl Into<String>) -> bool {
        self.push_frame(url, Frame::Text(text.into()))
    }

    /// Abruptly drop the live connection for `url`
    pub fn drop_connection(&self, url: &str) -> bool {
        let mut state = self.lock();
        match state.urls.get_mut(url).and_then(|u| u.link.take()) {
            Some(link) => link.tx.send(RemoteEvent::Abort).is_ok(),
            None => false,
        }
    }

    /// Whether a connection for `url` is currently open
    pub fn is_connected(&self, url: &str) -> bool {
        self.lock()
            .urls
            .get(url)
            .is_some_and(|u| u.link.is_some())
    }

    /// Number of successful opens of `url`
    pub fn open_count(&self, url: &str) -> usize {
        self.lock().urls.get(url).map_or(0, |u| u.opens)
    }

    /// Number of failed opens of `url`
    pub fn failed_open_count(&self, url: &str) -> usize {
        self.lock().urls.get(url).map_or(0, |u| u.failed_opens)
    }

    /// Number of graceful closes of `url`
    pub fn close_count(&self, url: &str) -> usize {
        self.lock().urls.get(url).map_or(0, |u| u.closes)
    }

    /// Frames written by the client side to `url`
    pub fn sent_frames(&self, url: &str) -> Vec<Frame> {
        self.lock()
            .urls
            .get(url)
            .map(|u| u.sent.clone())
            .unwrap_or_default()
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn ChannelConnection>, TransportError> {
        let mut state = self.lock();
        let link_id = state.next_link_id;
        state.next_link_id += 1;

        let entry = state.urls.entry(url.to_string()).or_default();
        let scripted = entry.script.pop_front().unwrap_or(true);
        if entry.down || !scripted {
            entry.failed_opens += 1;
            return Err(TransportError::Connect {
                url: url.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        entry.opens += 1;
        entry.link = Some(Link { id: link_id, tx });

        Ok(Box::new(MemoryConnection {
            url: url.to_string(),
            link_id,
            rx,
            state: self.state.clone(),
            closed: false,
        }))
    }
}

struct MemoryConnection {
    url: String,
    link_id: u64,
    rx: mpsc::UnboundedReceiver<RemoteEvent>,
    state: Arc<Mutex<MemoryState>>,
    closed: bool,
}

impl MemoryConnection {
    fn detach(&self) {
        let mut state = lock_state(&self.state);
        if let Some(entry) = state.urls.get_mut(&self.url) {
            if entry.link.as_ref().is_some_and(|l| l.id == self.link_id) {
                entry.link = None;
            }
        }
    }
}

#[async_trait]
impl ChannelConnection for MemoryConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Send("connection closed".to_string()));
        }
        let mut state = lock_state(&self.state);
        state
            .urls
            .entry(self.url.clone())
            .or_default()
            .sent
            .push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        if self.closed {
            return None;
        }
        match self.rx.recv().await {
            Some(RemoteEvent::Frame(frame)) => Some(Ok(frame)),
            Some(RemoteEvent::Abort) => Some(Err(TransportError::Closed(
                "connection reset by peer".to_string(),
            ))),
            None => None,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.detach();
        lock_state(&self.state)
            .urls
            .entry(self.url.clone())
            .or_default()
            .closes += 1;
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "memory://feed/btcusdt@trade";

    #[tokio::test]
    async fn test_frames_reach_open_connection() {
        let transport = MemoryTransport::new();
        let mut conn = transport.open(URL).await.unwrap();

        assert!(transport.push_text(URL, r#"{"p":"1"}"#));
        assert_eq!(
            conn.recv().await,
            Some(Ok(Frame::Text(r#"{"p":"1"}"#.to_string())))
        );
    }

    #[tokio::test]
    async fn test_scripted_failures_then_success() {
        let transport = MemoryTransport::new();
        transport.fail_next_opens(URL, 2);

        assert!(transport.open(URL).await.is_err());
        assert!(transport.open(URL).await.is_err());
        assert!(transport.open(URL).await.is_ok());
        assert_eq!(transport.failed_open_count(URL), 2);
        assert_eq!(transport.open_count(URL), 1);
    }

    #[tokio::test]
    async fn test_abrupt_close_is_reported_as_error() {
        let transport = MemoryTransport::new();
        let mut conn = transport.open(URL).await.unwrap();

        assert!(transport.drop_connection(URL));
        assert!(matches!(conn.recv().await, Some(Err(TransportError::Closed(_)))));
        assert!(!transport.is_connected(URL));
    }

    #[tokio::test]
    async fn test_close_and_send_accounting() {
        let transport = MemoryTransport::new();
        let mut conn = transport.open(URL).await.unwrap();

        conn.send(Frame::Text("ping".to_string())).await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();

        assert_eq!(transport.sent_frames(URL), vec![Frame::Text("ping".to_string())]);
        assert_eq!(transport.close_count(URL), 1);
        assert!(!transport.is_connected(URL));
        assert!(conn.send(Frame::Text("late".to_string())).await.is_err());
    }

    #[tokio::test]
    async fn test_down_url_rejects_until_restored() {
        let transport = MemoryTransport::new();
        transport.set_down(URL, true);
        assert!(transport.open(URL).await.is_err());

        transport.set_down(URL, false);
        assert!(transport.open(URL).await.is_ok());
    }
}
