//! Session orchestration.
//!
//! A [`Session`] owns the correlator for one adapter link. It connects the
//! transport, runs the AT initialization script and polls the configured
//! PIDs into a [`TelemetryStore`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ble::uuids::{ELM327_CHARACTERISTIC_UUID, ELM327_SERVICE_UUID};
use crate::correlator::{Correlator, CorrelatorState};
use crate::error::{Error, Result};
use crate::protocol::command::{
    CommandKind, CommandRequest, DEFAULT_AT_TIMEOUT, DEFAULT_PID_TIMEOUT,
};
use crate::protocol::decoder::{DecodedReply, Decoder};
use crate::protocol::frame::{FrameAssembler, DEFAULT_FRAME_CAPACITY};
use crate::protocol::pid::{Pid, PidTable};
use crate::telemetry::{TelemetryStore, TelemetryValue};
use crate::transport::{NotificationSink, Transport, DEFAULT_QUEUE_CAPACITY};

/// Adapter initialization script sent after every connect.
pub const DEFAULT_INIT_SCRIPT: &[&str] = &["ATZ", "ATE0", "ATL0", "ATS0", "ATH1", "ATAL", "ATSP0"];

/// Deadline for `ATZ`. The adapter reboots before answering.
pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Default pause between poll rounds.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Handle for a registered callback.
///
/// The callback stays registered until the handle is dropped or
/// [`unregister`](Self::unregister) is called.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

/// Exponential backoff for reconnecting after the link drops.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before [`Session::run`] gives up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .checked_mul(factor)
            .map(|delay| delay.min(self.max_delay))
            .unwrap_or(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Configuration for a [`Session`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Peripheral address or identifier.
    pub address: String,
    /// GATT service carrying the serial link.
    pub service_uuid: Uuid,
    /// Characteristic used for both writes and notifications.
    pub characteristic_uuid: Uuid,
    /// AT commands sent in order after connecting.
    pub init_script: Vec<String>,
    /// Deadline for `ATZ`.
    pub reset_timeout: Duration,
    /// Deadline for other AT commands.
    pub at_timeout: Duration,
    /// Deadline for PID queries.
    pub pid_timeout: Duration,
    /// PIDs queried each poll round.
    pub poll_pids: Vec<Pid>,
    /// Pause between poll rounds.
    pub poll_interval: Duration,
    /// Capacity of the notification queue.
    pub queue_capacity: usize,
    /// Maximum bytes buffered while waiting for a prompt.
    pub frame_capacity: usize,
    /// Reconnection behavior for [`Session::run`].
    pub reconnect: ReconnectPolicy,
}

impl SessionConfig {
    /// Default configuration for the adapter at `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Use a different GATT layout.
    pub fn with_gatt(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.service_uuid = service;
        self.characteristic_uuid = characteristic;
        self
    }

    /// Replace the initialization script.
    pub fn with_init_script<I, S>(mut self, script: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.init_script = script.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the polled PIDs.
    pub fn with_poll_pids(mut self, pids: impl IntoIterator<Item = Pid>) -> Self {
        self.poll_pids = pids.into_iter().collect();
        self
    }

    /// Set the pause between poll rounds.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the AT and PID deadlines.
    pub fn with_timeouts(mut self, at_timeout: Duration, pid_timeout: Duration) -> Self {
        self.at_timeout = at_timeout;
        self.pid_timeout = pid_timeout;
        self
    }

    /// Set the reconnection policy.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the notification queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Deadline for an init command.
    fn init_timeout(&self, command: &str) -> Duration {
        if command.trim().eq_ignore_ascii_case("ATZ") {
            self.reset_timeout
        } else {
            self.at_timeout
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            service_uuid: ELM327_SERVICE_UUID,
            characteristic_uuid: ELM327_CHARACTERISTIC_UUID,
            init_script: DEFAULT_INIT_SCRIPT.iter().map(|s| s.to_string()).collect(),
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            at_timeout: DEFAULT_AT_TIMEOUT,
            pid_timeout: DEFAULT_PID_TIMEOUT,
            poll_pids: vec![Pid::RPM, Pid::SPEED],
            poll_interval: DEFAULT_POLL_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Outcome of running the initialization script.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitReport {
    /// Banner reported by the adapter, if any command returned one.
    pub banner: Option<String>,
    /// Commands the adapter acknowledged.
    pub acknowledged: Vec<String>,
    /// Commands that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl InitReport {
    /// Whether every command was acknowledged.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Counters for PID polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollStats {
    /// Queries submitted.
    pub polls: u64,
    /// Queries that produced a value.
    pub successes: u64,
    /// Queries that got no reply in time.
    pub timeouts: u64,
    /// Queries whose reply did not decode.
    pub decode_failures: u64,
    /// Queries refused because another command was in flight.
    pub rejected: u64,
}

/// One adapter link: transport, correlator and telemetry.
pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    correlator: Arc<Correlator>,
    telemetry: TelemetryStore,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    stats: Mutex<PollStats>,
    callback_counter: AtomicU64,
}

impl Session {
    /// Create a session using the standard PID table.
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_pid_table(config, transport, PidTable::standard())
    }

    /// Create a session decoding with `table`.
    pub fn with_pid_table(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        table: PidTable,
    ) -> Self {
        let correlator = Arc::new(Correlator::new(
            Arc::clone(&transport),
            Decoder::new(table),
        ));

        Self {
            config,
            transport,
            correlator,
            telemetry: TelemetryStore::new(),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            stats: Mutex::new(PollStats::default()),
            callback_counter: AtomicU64::new(0),
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect the transport and start draining notifications.
    pub async fn connect(&self) -> Result<()> {
        self.stop_reader();
        self.correlator.reset();

        let (sink, chunks) = NotificationSink::channel(self.config.queue_capacity);
        self.transport.on_notification(sink);

        info!("Connecting to adapter {}", self.config.address);
        self.transport
            .connect(
                &self.config.address,
                self.config.service_uuid,
                self.config.characteristic_uuid,
            )
            .await?;

        let assembler = FrameAssembler::with_capacity(self.config.frame_capacity);
        *self.reader.lock() = Some(self.correlator.spawn_reader(chunks, assembler));
        self.connected.store(true, Ordering::SeqCst);

        info!("Connected to adapter {}", self.config.address);
        Ok(())
    }

    /// Run the initialization script one command at a time.
    ///
    /// A command that times out or gets an unexpected reply is logged and
    /// skipped. A transport error aborts the script.
    pub async fn initialize(&self) -> Result<InitReport> {
        let mut report = InitReport::default();

        for text in &self.config.init_script {
            let request = CommandRequest::new(
                text.as_str(),
                CommandKind::At,
                self.config.init_timeout(text),
            );

            match self.correlator.submit_and_await(request).await {
                Ok(reply) => {
                    if let Some(banner) = reply.banner() {
                        info!("Adapter identified as {}", banner);
                        report.banner = Some(banner.to_string());
                    }
                    report.acknowledged.push(text.clone());
                }
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    warn!("Init command {} failed: {}", text, e);
                    report.failed.push((text.clone(), e.to_string()));
                }
            }
        }

        info!(
            "Initialization finished: {} acknowledged, {} failed",
            report.acknowledged.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Query one PID and store its value.
    pub async fn poll_pid(&self, pid: Pid) -> Result<TelemetryValue> {
        let request = CommandRequest::pid(pid).with_timeout(self.config.pid_timeout);
        self.stats.lock().polls += 1;

        match self.correlator.submit_and_await(request).await {
            Ok(DecodedReply::Telemetry(value)) => {
                self.stats.lock().successes += 1;
                self.telemetry.update(value.clone());
                Ok(value)
            }
            Ok(reply) => Err(Error::Internal(format!(
                "PID {} answered with {:?}",
                pid, reply
            ))),
            Err(e) => {
                match &e {
                    Error::Timeout { .. } => self.stats.lock().timeouts += 1,
                    Error::Decode(_) => self.stats.lock().decode_failures += 1,
                    Error::AlreadyInFlight { .. } => self.stats.lock().rejected += 1,
                    _ => {}
                }
                Err(e)
            }
        }
    }

    /// Query every configured PID once. Returns how many values were
    /// stored.
    ///
    /// Only transport errors are returned. Per-PID failures are logged and
    /// counted in [`PollStats`].
    pub async fn poll_once(&self) -> Result<usize> {
        let mut updated = 0;

        for &pid in &self.config.poll_pids {
            match self.poll_pid(pid).await {
                Ok(_) => updated += 1,
                Err(e) if e.is_transport() => return Err(e),
                Err(Error::AlreadyInFlight { in_flight }) => {
                    warn!("Poll of PID {} refused: `{}` still in flight", pid, in_flight);
                }
                Err(e) => warn!("Poll of PID {} failed: {}", pid, e),
            }
        }

        Ok(updated)
    }

    /// Send an arbitrary command and wait for its decoded reply.
    pub async fn submit_and_await(
        &self,
        text: &str,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<DecodedReply> {
        self.correlator
            .submit_and_await(CommandRequest::new(text, kind, timeout))
            .await
    }

    /// Connect, initialize and poll until [`shutdown`](Self::shutdown).
    ///
    /// When the link drops the session reconnects with the configured
    /// backoff. Gives up after [`ReconnectPolicy::max_attempts`]
    /// consecutive failures.
    pub async fn run(&self) -> Result<()> {
        let mut attempt = 0u32;

        while !self.is_shutdown() {
            if !self.is_connected() {
                match self.establish().await {
                    Ok(()) => attempt = 0,
                    Err(e) if e.is_transport() => {
                        self.teardown().await;
                        attempt += 1;
                        if attempt >= self.config.reconnect.max_attempts {
                            error!("Giving up after {} connection attempts: {}", attempt, e);
                            return Err(e);
                        }

                        let delay = self.config.reconnect.delay_for(attempt - 1);
                        warn!(
                            "Connection attempt {} failed: {}. Retrying in {:?}",
                            attempt, e, delay
                        );
                        self.sleep_or_shutdown(delay).await;
                        continue;
                    }
                    Err(e) => {
                        self.teardown().await;
                        return Err(e);
                    }
                }
            }

            if let Err(e) = self.poll_once().await {
                warn!("Link to {} lost: {}", self.config.address, e);
                self.teardown().await;
                continue;
            }

            self.sleep_or_shutdown(self.config.poll_interval).await;
        }

        info!("Session for {} stopping", self.config.address);
        self.teardown().await;
        Ok(())
    }

    /// Ask [`run`](Self::run) to stop after the current command.
    pub fn shutdown(&self) {
        debug!("Shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Drop the link. A command in flight fails with
    /// [`Error::ConnectionLost`].
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_reader();
        self.correlator.reset();
        self.connected.store(false, Ordering::SeqCst);
        self.transport.disconnect().await
    }

    // === Telemetry ===

    /// Latest value for `pid`.
    pub fn latest(&self, pid: Pid) -> Option<TelemetryValue> {
        self.telemetry.get(pid)
    }

    /// The telemetry store.
    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    /// Subscribe to telemetry updates.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryValue> {
        self.telemetry.subscribe()
    }

    /// Register a callback for telemetry updates.
    pub fn on_telemetry_updated<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&TelemetryValue) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.telemetry.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => callback(&value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Telemetry callback lagged, skipped {} updates", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Diagnostics ===

    /// Current correlator state.
    pub fn correlator_state(&self) -> CorrelatorState {
        self.correlator.state()
    }

    /// Poll counters since the session was created.
    pub fn stats(&self) -> PollStats {
        *self.stats.lock()
    }

    async fn establish(&self) -> Result<()> {
        self.connect().await?;
        let report = self.initialize().await?;
        if !report.is_complete() {
            warn!(
                "Adapter initialized with {} failed commands",
                report.failed.len()
            );
        }
        Ok(())
    }

    async fn teardown(&self) {
        if let Err(e) = self.disconnect().await {
            debug!("Disconnect during teardown failed: {}", e);
        }
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    async fn sleep_or_shutdown(&self, duration: Duration) {
        if self.is_shutdown() {
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown_notify.notified() => {}
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.config.address)
            .field("connected", &self.is_connected())
            .field("correlator", &self.correlator_state())
            .finish()
    }
}
