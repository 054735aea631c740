//! Scripted stand-in for an ELM327 adapter.
//!
//! Answers writes with canned reply chunks through the registered
//! [`NotificationSink`], so sessions can be driven end to end without a
//! Bluetooth radio.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{NotificationSink, Transport};

/// Banner reported by the scripted adapter on reset.
pub const MOCK_BANNER: &str = "ELM327 v1.5";

/// A canned reaction to one command.
#[derive(Debug, Clone)]
enum Reply {
    /// Deliver these chunks in order.
    Chunks(Vec<Bytes>),
    /// Deliver nothing.
    Silent,
}

#[derive(Debug, Default)]
struct ScriptState {
    queued: HashMap<String, VecDeque<Reply>>,
    standing: HashMap<String, Reply>,
    sink: Option<NotificationSink>,
    writes: Vec<String>,
    connected: bool,
    link_lost: bool,
    connect_count: usize,
    fail_connects: usize,
    fail_writes: usize,
}

/// Scripted ELM327 adapter implementing [`Transport`].
///
/// Replies are looked up by command text (without the trailing `\r`).
/// One-shot replies queued with [`respond`](Self::respond) take precedence
/// over standing replies set with [`respond_always`](Self::respond_always).
/// Commands with neither get no reply.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAdapter {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedAdapter {
    /// Create an adapter that answers nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an adapter that acknowledges the usual init commands.
    ///
    /// `ATZ` echoes and reports [`MOCK_BANNER`]; every other `AT` command in
    /// the default script answers `OK`.
    pub fn with_elm327_defaults() -> Self {
        let adapter = Self::new();
        adapter.respond_always("ATZ", format!("ATZ\r\r{}\r\r>", MOCK_BANNER));
        for command in ["ATE0", "ATL0", "ATS0", "ATH1", "ATH0", "ATAL", "ATSP0"] {
            adapter.respond_always(command, "OK\r\r>");
        }
        adapter
    }

    /// Queue a one-shot reply for `command`, delivered as the given chunks.
    pub fn respond<I, B>(&self, command: &str, chunks: I) -> &Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let reply = Reply::Chunks(chunks.into_iter().map(Into::into).collect());
        self.state
            .lock()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Answer every future `command` with `reply` in a single chunk.
    pub fn respond_always(&self, command: &str, reply: impl Into<Bytes>) -> &Self {
        self.state
            .lock()
            .standing
            .insert(command.to_string(), Reply::Chunks(vec![reply.into()]));
        self
    }

    /// Queue a one-shot "no reply" for `command`.
    pub fn stay_silent(&self, command: &str) -> &Self {
        self.state
            .lock()
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(Reply::Silent);
        self
    }

    /// Make the next `count` writes fail as if the link dropped.
    pub fn fail_next_writes(&self, count: usize) -> &Self {
        self.state.lock().fail_writes = count;
        self
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) -> &Self {
        self.state.lock().fail_connects = count;
        self
    }

    /// Drop the link as if the adapter went out of range.
    ///
    /// The registered sink is released, closing the notification queue,
    /// and writes fail with [`Error::ConnectionLost`] until the next
    /// connect.
    pub fn drop_link(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.link_lost = true;
        state.sink = None;
        debug!("Scripted adapter link dropped");
    }

    /// Push unsolicited bytes, as if the adapter sent them on its own.
    pub fn inject(&self, data: impl Into<Bytes>) -> bool {
        let sink = self.state.lock().sink.clone();
        match sink {
            Some(sink) => sink.deliver(data),
            None => false,
        }
    }

    /// Every command written so far, without terminators.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    /// Whether the adapter currently considers itself connected.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[async_trait]
impl Transport for ScriptedAdapter {
    async fn connect(&self, address: &str, _service: Uuid, _characteristic: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::ConnectionFailed {
                reason: format!("scripted connect failure for {}", address),
            });
        }

        state.connected = true;
        state.link_lost = false;
        state.connect_count += 1;
        debug!("Scripted adapter connected as {}", address);
        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let (reply, sink) = {
            let mut state = self.state.lock();
            if state.link_lost {
                return Err(Error::ConnectionLost);
            }
            if !state.connected {
                return Err(Error::NotConnected);
            }

            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                state.connected = false;
                return Err(Error::Write {
                    reason: "scripted link drop".to_string(),
                });
            }

            let command = String::from_utf8_lossy(bytes)
                .trim_end_matches('\r')
                .to_string();
            state.writes.push(command.clone());

            let queued = state.queued.get_mut(&command).and_then(VecDeque::pop_front);
            let reply = queued
                .or_else(|| state.standing.get(&command).cloned())
                .unwrap_or(Reply::Silent);
            (reply, state.sink.clone())
        };

        if let (Reply::Chunks(chunks), Some(sink)) = (reply, sink) {
            for chunk in chunks {
                sink.deliver(chunk);
            }
        }

        Ok(())
    }

    fn on_notification(&self, sink: NotificationSink) {
        self.state.lock().sink = Some(sink);
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: Uuid = Uuid::nil();

    #[tokio::test]
    async fn test_scripted_replies() {
        let adapter = ScriptedAdapter::new();
        adapter
            .respond("010D", ["41 0D", " 28\r\r>"])
            .respond_always("010D", "41 0D 00\r\r>");

        let (sink, mut rx) = NotificationSink::channel(8);
        adapter.on_notification(sink);
        adapter.connect("mock", SERVICE, SERVICE).await.unwrap();

        adapter.write(b"010D\r").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().data(), b"41 0D");
        assert_eq!(rx.recv().await.unwrap().data(), b" 28\r\r>");

        adapter.write(b"010D\r").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().data(), b"41 0D 00\r\r>");

        assert_eq!(adapter.writes(), vec!["010D", "010D"]);
    }

    #[tokio::test]
    async fn test_silent_and_unknown_commands() {
        let adapter = ScriptedAdapter::with_elm327_defaults();
        adapter.stay_silent("ATZ");

        let (sink, mut rx) = NotificationSink::channel(8);
        adapter.on_notification(sink);
        adapter.connect("mock", SERVICE, SERVICE).await.unwrap();

        adapter.write(b"ATZ\r").await.unwrap();
        adapter.write(b"ATXYZ\r").await.unwrap();
        assert!(rx.try_recv().is_err());

        adapter.write(b"ATZ\r").await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_write_failures() {
        let adapter = ScriptedAdapter::new();
        assert!(matches!(
            adapter.write(b"ATZ\r").await,
            Err(Error::NotConnected)
        ));

        adapter.fail_next_writes(1);
        adapter.connect("mock", SERVICE, SERVICE).await.unwrap();
        assert!(matches!(
            adapter.write(b"ATZ\r").await,
            Err(Error::Write { .. })
        ));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_drop_link_closes_queue() {
        let adapter = ScriptedAdapter::new();
        let (sink, mut rx) = NotificationSink::channel(8);
        adapter.on_notification(sink);
        adapter.connect("mock", SERVICE, SERVICE).await.unwrap();

        adapter.drop_link();
        assert!(rx.recv().await.is_none());
        assert!(!adapter.inject(&b"41 0D 28\r\r>"[..]));
        assert!(matches!(
            adapter.write(b"010D\r").await,
            Err(Error::ConnectionLost)
        ));

        adapter.connect("mock", SERVICE, SERVICE).await.unwrap();
        assert!(adapter.write(b"010D\r").await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let adapter = ScriptedAdapter::new();
        adapter.fail_next_connects(1);
        assert!(adapter.connect("mock", SERVICE, SERVICE).await.is_err());
        assert!(adapter.connect("mock", SERVICE, SERVICE).await.is_ok());
        assert_eq!(adapter.connect_count(), 1);
    }
}
