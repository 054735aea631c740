//! End-to-end session tests against the scripted adapter.

use std::sync::Arc;
use std::time::Duration;

use elm327_rust_ble::transport::mock::ScriptedAdapter;
use elm327_rust_ble::{
    CommandKind, CorrelatorState, DecodedReply, Error, Pid, ReconnectPolicy, Session,
    SessionConfig, DEFAULT_INIT_SCRIPT,
};
use pretty_assertions::assert_eq;
use tokio_test::{assert_err, assert_ok};

fn session_with(adapter: &ScriptedAdapter, config: SessionConfig) -> Session {
    Session::new(config, Arc::new(adapter.clone()))
}

fn session(adapter: &ScriptedAdapter) -> Session {
    session_with(adapter, SessionConfig::new("00:11:22:33:44:55"))
}

#[tokio::test(start_paused = true)]
async fn reset_reply_split_mid_frame() {
    let adapter = ScriptedAdapter::new();
    adapter.respond("ATZ", ["ATZ\r\rELM3", "27 v1.5\r\r>"]);
    let session = session(&adapter);
    assert_ok!(session.connect().await);

    let reply = assert_ok!(
        session
            .submit_and_await("ATZ", CommandKind::At, Duration::from_secs(5))
            .await
    );
    assert_eq!(reply.banner(), Some("ELM327 v1.5"));
    assert_eq!(session.correlator_state(), CorrelatorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn silent_pid_times_out() {
    let adapter = ScriptedAdapter::new();
    let session = session(&adapter);
    assert_ok!(session.connect().await);

    let started = tokio::time::Instant::now();
    let err = assert_err!(session.poll_pid(Pid::RPM).await);

    assert!(matches!(err, Error::Timeout { ref command, .. } if command == "010C"));
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(session.latest(Pid::RPM).is_none());
    assert_eq!(session.stats().timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn consecutive_speed_polls() {
    let adapter = ScriptedAdapter::new();
    adapter
        .respond("010D", ["41 0D 28\r\r>"])
        .respond("010D", ["41 0D 00\r\r>"]);
    let session = session(&adapter);
    assert_ok!(session.connect().await);

    let first = assert_ok!(session.poll_pid(Pid::SPEED).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = assert_ok!(session.poll_pid(Pid::SPEED).await);

    assert_eq!(first.value, 40.0);
    assert_eq!(second.value, 0.0);
    assert!(second.observed_at > first.observed_at);
    assert_eq!(session.latest(Pid::SPEED), Some(second));
}

#[tokio::test(start_paused = true)]
async fn late_reply_does_not_leak_into_next_poll() {
    let adapter = ScriptedAdapter::new();
    adapter
        .stay_silent("010D")
        .respond("010D", ["41 0D 28\r\r>"]);
    let session = session(&adapter);
    assert_ok!(session.connect().await);

    assert_err!(session.poll_pid(Pid::SPEED).await);
    adapter.inject(&b"41 0D 63\r\r>"[..]);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let value = assert_ok!(session.poll_pid(Pid::SPEED).await);
    assert_eq!(value.value, 40.0);
}

#[tokio::test(start_paused = true)]
async fn initialization_continues_past_failures() {
    let adapter = ScriptedAdapter::with_elm327_defaults();
    adapter.stay_silent("ATL0").respond("ATS0", ["?\r\r>"]);
    let session = session(&adapter);
    assert_ok!(session.connect().await);

    let report = assert_ok!(session.initialize().await);

    assert_eq!(adapter.writes(), DEFAULT_INIT_SCRIPT.to_vec());
    assert_eq!(report.banner.as_deref(), Some("ELM327 v1.5"));
    assert_eq!(report.acknowledged, vec!["ATZ", "ATE0", "ATH1", "ATAL", "ATSP0"]);
    let failed: Vec<_> = report.failed.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(failed, vec!["ATL0", "ATS0"]);
    assert!(!report.is_complete());
}

#[tokio::test(start_paused = true)]
async fn custom_command_round_trip() {
    let adapter = ScriptedAdapter::new();
    adapter.respond("0105", ["41 05 7B\r\r>"]);
    let session = session(&adapter);
    assert_ok!(session.connect().await);

    let reply = assert_ok!(
        session
            .submit_and_await(
                "0105",
                CommandKind::Pid(Pid::COOLANT_TEMPERATURE),
                Duration::from_secs(1)
            )
            .await
    );
    match reply {
        DecodedReply::Telemetry(value) => assert_eq!(value.value, 83.0),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn run_reconnects_after_link_drop() {
    let adapter = ScriptedAdapter::with_elm327_defaults();
    adapter
        .respond_always("010C", "41 0C 0C 1A\r\r>")
        .respond_always("010D", "41 0D 32\r\r>");

    let config = SessionConfig::new("00:11:22:33:44:55")
        .with_poll_interval(Duration::from_millis(100))
        .with_reconnect(ReconnectPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        });
    let session = Arc::new(session_with(&adapter, config));

    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run().await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(adapter.connect_count(), 1);

    adapter.fail_next_writes(1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(adapter.connect_count(), 2);
    assert!(session.is_connected());

    session.shutdown();
    assert_ok!(assert_ok!(runner.await));

    assert_eq!(session.latest(Pid::RPM).map(|v| v.value), Some(779.5));
    assert!(!adapter.is_connected());
}

#[tokio::test(start_paused = true)]
async fn run_gives_up_after_max_attempts() {
    let adapter = ScriptedAdapter::with_elm327_defaults();
    adapter.fail_next_connects(10);

    let config = SessionConfig::new("00:11:22:33:44:55").with_reconnect(ReconnectPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    });
    let session = session_with(&adapter, config);

    let err = assert_err!(session.run().await);
    assert!(matches!(err, Error::ConnectionFailed { .. }));
    assert_eq!(adapter.connect_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn link_drop_fails_in_flight_poll() {
    let adapter = ScriptedAdapter::new();
    let session = Arc::new(session(&adapter));
    assert_ok!(session.connect().await);

    let poll = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.poll_pid(Pid::RPM).await })
    };
    while session.correlator_state() == CorrelatorState::Idle {
        tokio::task::yield_now().await;
    }

    let started = tokio::time::Instant::now();
    adapter.drop_link();
    let err = assert_err!(assert_ok!(poll.await));

    assert!(matches!(err, Error::ConnectionLost));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(session.stats().timeouts, 0);
    assert_eq!(session.correlator_state(), CorrelatorState::Idle);

    let err = assert_err!(session.poll_pid(Pid::SPEED).await);
    assert!(matches!(err, Error::ConnectionLost));
}

#[tokio::test(start_paused = true)]
async fn run_reconnects_when_adapter_goes_away() {
    let adapter = ScriptedAdapter::with_elm327_defaults();
    adapter
        .respond_always("010C", "41 0C 0C 1A\r\r>")
        .respond_always("010D", "41 0D 32\r\r>");

    let config = SessionConfig::new("00:11:22:33:44:55")
        .with_poll_interval(Duration::from_millis(100))
        .with_reconnect(ReconnectPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        });
    let session = Arc::new(session_with(&adapter, config));

    let runner = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.run().await })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(adapter.connect_count(), 1);

    adapter.drop_link();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(adapter.connect_count(), 2);
    assert!(adapter.is_connected());
    assert_eq!(session.stats().timeouts, 0);

    session.shutdown();
    assert_ok!(assert_ok!(runner.await));
}
