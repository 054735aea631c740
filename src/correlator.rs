//! Matching of outbound commands to inbound frames.
//!
//! The adapter has no request IDs: a reply belongs to whatever command was
//! written last. The correlator therefore allows a single command in flight
//! and hands the next frame to it. Frames that arrive with nothing in
//! flight, or after the in-flight command timed out, are dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::command::{Command, CommandId, CommandRequest};
use crate::protocol::decoder::{DecodedReply, Decoder};
use crate::protocol::frame::{Frame, FrameAssembler, FrameEvent};
use crate::transport::{RawChunk, Transport};

/// Where the correlator is in its request/reply cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CorrelatorState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// A command was written and its reply has not arrived.
    AwaitingReply(Command),
    /// The last command's deadline passed. Its caller has been told; a late
    /// frame is still expected and will be dropped. Accepts new submissions.
    TimedOut(Command),
}

impl CorrelatorState {
    /// Whether a new command can be submitted.
    pub fn accepts_submit(&self) -> bool {
        !matches!(self, Self::AwaitingReply(_))
    }

    /// The command awaiting a reply, if any.
    pub fn in_flight(&self) -> Option<&Command> {
        match self {
            Self::AwaitingReply(command) => Some(command),
            _ => None,
        }
    }
}

impl fmt::Display for CorrelatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::AwaitingReply(command) => write!(f, "AwaitingReply({})", command),
            Self::TimedOut(command) => write!(f, "TimedOut({})", command),
        }
    }
}

type Completion = oneshot::Sender<Result<DecodedReply>>;

#[derive(Debug, Default)]
struct Slot {
    state: CorrelatorState,
    completion: Option<Completion>,
}

/// Single-outstanding-command request/reply engine.
pub struct Correlator {
    transport: Arc<dyn Transport>,
    decoder: Decoder,
    slot: Mutex<Slot>,
    next_id: AtomicU64,
}

impl Correlator {
    /// Create a correlator writing to `transport`.
    pub fn new(transport: Arc<dyn Transport>, decoder: Decoder) -> Self {
        Self {
            transport,
            decoder,
            slot: Mutex::new(Slot::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current state.
    pub fn state(&self) -> CorrelatorState {
        self.slot.lock().state.clone()
    }

    /// Whether a command is awaiting its reply.
    pub fn is_busy(&self) -> bool {
        !self.slot.lock().state.accepts_submit()
    }

    /// The decoder used for replies.
    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Send a command and wait for its decoded reply.
    ///
    /// Fails immediately with [`Error::AlreadyInFlight`] if another command
    /// is awaiting its reply; that command is left untouched. Otherwise
    /// resolves with the decoded reply, a decode error, or
    /// [`Error::Timeout`] once the command's deadline passes.
    pub async fn submit_and_await(&self, request: CommandRequest) -> Result<DecodedReply> {
        request.validate()?;

        let (tx, mut rx) = oneshot::channel();
        let command = self.begin(request, tx)?;
        let _guard = AbandonOnDrop {
            correlator: self,
            id: command.id(),
        };

        debug!("Sending {}", command);
        if let Err(e) = self.transport.write(&command.wire_bytes()).await {
            warn!("Write of {} failed: {}", command, e);
            return Err(e);
        }

        match tokio::time::timeout(command.timeout(), &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => self.expire(&command, &mut rx),
        }
    }

    /// Route a completed frame to the command in flight.
    ///
    /// Decoding and completion happen inside the same critical section as
    /// the state change, so a deadline that fires concurrently either sees
    /// the command still waiting or finds the result already sent.
    pub fn on_frame(&self, frame: Frame) {
        let mut slot = self.slot.lock();

        let command = match std::mem::take(&mut slot.state) {
            CorrelatorState::AwaitingReply(command) => command,
            CorrelatorState::TimedOut(command) => {
                warn!(
                    "Dropping late reply for timed-out {}: {:?}",
                    command,
                    frame.content()
                );
                return;
            }
            CorrelatorState::Idle => {
                debug!("Dropping unsolicited frame: {:?}", frame.content());
                return;
            }
        };

        let latency = frame
            .completed_at()
            .saturating_duration_since(command.submitted_at());
        let result = self.decoder.decode(&command, &frame).map_err(Error::from);

        match &result {
            Ok(reply) => debug!("{} answered in {:?}: {:?}", command, latency, reply),
            Err(e) => debug!("{} reply {:?} not decoded: {}", command, frame.content(), e),
        }

        if let Some(completion) = slot.completion.take() {
            let _ = completion.send(result);
        }
    }

    /// Abandon whatever is in flight, e.g. because the link went down.
    ///
    /// A caller waiting on the abandoned command gets
    /// [`Error::ConnectionLost`]. Returns the abandoned command.
    pub fn reset(&self) -> Option<Command> {
        let mut slot = self.slot.lock();
        slot.completion = None;
        match std::mem::take(&mut slot.state) {
            CorrelatorState::AwaitingReply(command) => {
                debug!("Abandoning {}", command);
                Some(command)
            }
            _ => None,
        }
    }

    /// Spawn the task that drains notification chunks into frames.
    ///
    /// Chunks are processed in delivery order. The task ends when every
    /// sender of the queue is gone, failing any command still in flight
    /// with [`Error::ConnectionLost`].
    pub fn spawn_reader(
        self: &Arc<Self>,
        mut chunks: mpsc::Receiver<RawChunk>,
        mut assembler: FrameAssembler,
    ) -> JoinHandle<()> {
        let correlator = Arc::clone(self);

        tokio::spawn(async move {
            debug!("Frame reader started");
            while let Some(chunk) = chunks.recv().await {
                for event in assembler.feed(chunk) {
                    match event {
                        FrameEvent::Frame(frame) => correlator.on_frame(frame),
                        FrameEvent::Overflow { discarded } => {
                            let err = Error::FrameOverflow { discarded };
                            warn!("{} (state: {})", err, correlator.state());
                        }
                    }
                }
            }

            // The transport dropped its sink: the link is gone.
            if let Some(command) = correlator.reset() {
                warn!("Notification queue closed with {} in flight", command);
            }
            debug!("Frame reader stopped");
        })
    }

    /// Check-and-transition Idle → AwaitingReply in one critical section.
    fn begin(&self, request: CommandRequest, completion: Completion) -> Result<Command> {
        let mut slot = self.slot.lock();

        if let Some(in_flight) = slot.state.in_flight() {
            return Err(Error::AlreadyInFlight {
                in_flight: in_flight.text().to_string(),
            });
        }

        let id = CommandId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let command = Command::new(id, request, Instant::now());
        trace!("{} -> AwaitingReply({})", slot.state, command);

        slot.state = CorrelatorState::AwaitingReply(command.clone());
        slot.completion = Some(completion);
        Ok(command)
    }

    /// Deadline passed. Unless the frame won the race, mark the command
    /// timed out.
    fn expire(
        &self,
        command: &Command,
        rx: &mut oneshot::Receiver<Result<DecodedReply>>,
    ) -> Result<DecodedReply> {
        {
            let mut slot = self.slot.lock();
            let still_waiting = slot
                .state
                .in_flight()
                .map(|c| c.id() == command.id())
                .unwrap_or(false);

            if still_waiting {
                warn!("{} timed out after {:?}", command, command.timeout());
                slot.state = CorrelatorState::TimedOut(command.clone());
                slot.completion = None;
                return Err(Error::Timeout {
                    command: command.text().to_string(),
                    timeout: command.timeout(),
                });
            }
        }

        // The frame took the slot first; its result was sent under the lock.
        // A closed channel means the command was abandoned by `reset`.
        rx.try_recv().unwrap_or(Err(Error::ConnectionLost))
    }

    /// Return to Idle if `id` is still awaiting its reply.
    fn abandon(&self, id: CommandId) {
        let mut slot = self.slot.lock();
        let matches = slot
            .state
            .in_flight()
            .map(|c| c.id() == id)
            .unwrap_or(false);

        if matches {
            trace!("Abandoning command {}", id);
            slot.state = CorrelatorState::Idle;
            slot.completion = None;
        }
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("state", &self.state())
            .finish()
    }
}

/// Puts the correlator back to Idle if a submission ends early, whether by
/// a failed write or by the caller dropping the future.
struct AbandonOnDrop<'a> {
    correlator: &'a Correlator,
    id: CommandId,
}

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        self.correlator.abandon(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pid::Pid;
    use crate::transport::mock::ScriptedAdapter;
    use crate::transport::{MockTransport, NotificationSink};
    use std::time::Duration;
    use uuid::Uuid;

    async fn connected(adapter: &ScriptedAdapter) -> Arc<Correlator> {
        let (sink, rx) = NotificationSink::channel(16);
        adapter.on_notification(sink);
        adapter
            .connect("mock", Uuid::nil(), Uuid::nil())
            .await
            .unwrap();

        let correlator = Arc::new(Correlator::new(
            Arc::new(adapter.clone()),
            Decoder::default(),
        ));
        correlator.spawn_reader(rx, FrameAssembler::new());
        correlator
    }

    #[tokio::test]
    async fn test_reply_completes_submission() {
        let adapter = ScriptedAdapter::new();
        adapter.respond("010D", ["41 0D 32\r\r>"]);
        let correlator = connected(&adapter).await;

        let reply = correlator
            .submit_and_await(CommandRequest::pid(Pid::SPEED))
            .await
            .unwrap();
        assert_eq!(reply.telemetry().unwrap().value, 50.0);
        assert_eq!(correlator.state(), CorrelatorState::Idle);
        assert_eq!(adapter.writes(), vec!["010D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_submit_rejected_while_in_flight() {
        let adapter = ScriptedAdapter::new();
        let correlator = connected(&adapter).await;

        let first = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .submit_and_await(CommandRequest::pid(Pid::RPM))
                    .await
            })
        };
        while !correlator.is_busy() {
            tokio::task::yield_now().await;
        }

        let second = correlator
            .submit_and_await(CommandRequest::pid(Pid::SPEED))
            .await;
        assert!(matches!(
            second,
            Err(Error::AlreadyInFlight { ref in_flight }) if in_flight == "010C"
        ));

        let in_flight = correlator.state().in_flight().cloned().unwrap();
        assert_eq!(in_flight.text(), "010C");

        adapter.inject(&b"41 0C 0C 1A\r\r>"[..]);
        let reply = first.await.unwrap().unwrap();
        assert_eq!(reply.telemetry().unwrap().value, 779.5);
        assert_eq!(adapter.writes(), vec!["010C"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_frame_dropped() {
        let adapter = ScriptedAdapter::new();
        let correlator = connected(&adapter).await;

        let result = correlator
            .submit_and_await(CommandRequest::pid(Pid::RPM).with_timeout(Duration::from_secs(2)))
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(matches!(correlator.state(), CorrelatorState::TimedOut(_)));
        assert!(!correlator.is_busy());

        adapter.inject(&b"41 0C 0C 1A\r\r>"[..]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_frame_dropped() {
        let adapter = ScriptedAdapter::new();
        adapter.respond("010D", ["41 0D 28\r>"]);
        let correlator = connected(&adapter).await;

        adapter.inject(&b"41 0D 99\r>"[..]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(correlator.state(), CorrelatorState::Idle);

        let reply = correlator
            .submit_and_await(CommandRequest::pid(Pid::SPEED))
            .await
            .unwrap();
        assert_eq!(reply.telemetry().unwrap().value, 40.0);
    }

    #[tokio::test]
    async fn test_decode_error_returns_to_idle() {
        let adapter = ScriptedAdapter::new();
        adapter.respond("010D", ["NO DATA\r\r>"]);
        let correlator = connected(&adapter).await;

        let result = correlator
            .submit_and_await(CommandRequest::pid(Pid::SPEED))
            .await;
        assert!(matches!(result, Err(Error::Decode(_))));
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[tokio::test]
    async fn test_write_failure_returns_to_idle() {
        let mut transport = MockTransport::new();
        transport.expect_write().times(1).returning(|_| {
            Err(Error::Write {
                reason: "link down".to_string(),
            })
        });

        let correlator = Correlator::new(Arc::new(transport), Decoder::default());
        let result = correlator.submit_and_await(CommandRequest::at("ATZ")).await;

        assert!(matches!(result, Err(Error::Write { .. })));
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_request_never_written() {
        let mut transport = MockTransport::new();
        transport.expect_write().never();

        let correlator = Correlator::new(Arc::new(transport), Decoder::default());
        let result = correlator.submit_and_await(CommandRequest::at("")).await;
        assert!(matches!(result, Err(Error::InvalidParameter { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_fails_waiting_caller() {
        let adapter = ScriptedAdapter::new();
        let correlator = connected(&adapter).await;

        let waiting = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { correlator.submit_and_await(CommandRequest::at("ATZ")).await })
        };
        while !correlator.is_busy() {
            tokio::task::yield_now().await;
        }

        let abandoned = correlator.reset().unwrap();
        assert_eq!(abandoned.text(), "ATZ");
        assert!(matches!(
            waiting.await.unwrap(),
            Err(Error::ConnectionLost)
        ));
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_submission_frees_slot() {
        let adapter = ScriptedAdapter::new();
        let correlator = connected(&adapter).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(100),
            correlator.submit_and_await(CommandRequest::at("ATZ")),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[tokio::test]
    async fn test_reply_routed_just_before_deadline_is_kept() {
        let correlator = Correlator::new(Arc::new(MockTransport::new()), Decoder::default());
        let (tx, mut rx) = oneshot::channel();
        let command = correlator
            .begin(CommandRequest::pid(Pid::SPEED), tx)
            .unwrap();

        let frame = Frame::from_raw(b"41 0D 28", Instant::now()).unwrap();
        correlator.on_frame(frame);

        let reply = correlator.expire(&command, &mut rx).unwrap();
        assert_eq!(reply.telemetry().unwrap().value, 40.0);
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[tokio::test]
    async fn test_deadline_after_reset_reports_connection_lost() {
        let correlator = Correlator::new(Arc::new(MockTransport::new()), Decoder::default());
        let (tx, mut rx) = oneshot::channel();
        let command = correlator.begin(CommandRequest::at("ATZ"), tx).unwrap();

        correlator.reset();
        assert!(matches!(
            correlator.expire(&command, &mut rx),
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_after_frame_overflow() {
        let adapter = ScriptedAdapter::new();
        adapter.respond("010D", ["41 0D 28\r\r>"]);
        let correlator = connected(&adapter).await;

        assert!(adapter.inject(vec![b'X'; 600]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(correlator.state(), CorrelatorState::Idle);

        let reply = correlator
            .submit_and_await(CommandRequest::pid(Pid::SPEED))
            .await
            .unwrap();
        assert_eq!(reply.telemetry().unwrap().value, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_fails_command_in_flight() {
        let mut transport = MockTransport::new();
        transport.expect_write().returning(|_| Ok(()));
        let correlator = Arc::new(Correlator::new(Arc::new(transport), Decoder::default()));

        let (sink, rx) = NotificationSink::channel(4);
        let reader = correlator.spawn_reader(rx, FrameAssembler::new());

        let waiting = {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .submit_and_await(CommandRequest::pid(Pid::RPM))
                    .await
            })
        };
        while !correlator.is_busy() {
            tokio::task::yield_now().await;
        }

        let started = Instant::now();
        drop(sink);
        reader.await.unwrap();

        assert!(matches!(
            waiting.await.unwrap(),
            Err(Error::ConnectionLost)
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(correlator.state(), CorrelatorState::Idle);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CorrelatorState::Idle.to_string(), "Idle");
        assert!(CorrelatorState::Idle.accepts_submit());
    }
}
