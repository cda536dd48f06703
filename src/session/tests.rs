use super::facade::SessionFacade;
use super::machine::{
    CONNECTION_TIMED_OUT, ConnectionStateMachine, SessionHandle, SessionSnapshot,
    TOPIC_MAX_RETRIES_REACHED, TOPIC_RECOVERED, TOPIC_RETRY_ATTEMPT, TOPIC_STATE_CHANGED,
};
use super::state::{ConnectionState, RetryPolicy};
use crate::broker::{BusReceiver, EventBus, Payload};
use crate::session::SessionCommandHandler;
use crate::transport::router::ServiceHandler;
use crate::utils::error::CommandError;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use ConnectionState::*;

#[derive(Default)]
struct RecordingFacade {
    calls: Mutex<Vec<String>>,
}

impl RecordingFacade {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl SessionFacade for RecordingFacade {
    fn start_discovery(&self) {
        self.calls.lock().unwrap().push("start_discovery".to_string());
    }

    fn connect_to_device(&self, device_id: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("connect_to_device:{device_id}"));
    }

    fn disconnect(&self) {
        self.calls.lock().unwrap().push("disconnect".to_string());
    }
}

fn machine() -> (ConnectionStateMachine, Arc<RecordingFacade>, BusReceiver) {
    let facade = Arc::new(RecordingFacade::default());
    let (bus, bus_rx) = EventBus::new(4096);
    let machine = ConnectionStateMachine::new(RetryPolicy::default(), facade.clone(), Arc::new(bus));
    (machine, facade, bus_rx)
}

fn drain(bus_rx: &mut BusReceiver) -> Vec<(String, Payload)> {
    let mut events = Vec::new();
    while let Ok(event) = bus_rx.try_recv() {
        events.push((event.topic, event.payload));
    }
    events
}

fn count(events: &[(String, Payload)], topic: &str) -> usize {
    events.iter().filter(|(t, _)| t == topic).count()
}

#[test]
fn test_state_codes_round_trip() {
    for state in [Disconnected, Searching, Connecting, Connected, Error] {
        assert_eq!(ConnectionState::from_code(state.code()), Some(state));
    }
    assert_eq!(ConnectionState::from_code(9), None);
}

#[test]
fn test_transition_table() {
    let allowed = [
        (Disconnected, vec![Searching, Error]),
        (Searching, vec![Connecting, Disconnected, Error]),
        (Connecting, vec![Connected, Disconnected, Error]),
        (Connected, vec![Disconnected, Error]),
        (Error, vec![Searching, Disconnected]),
    ];
    let all = [Disconnected, Searching, Connecting, Connected, Error];
    for (from, targets) in allowed {
        for to in all {
            assert_eq!(
                from.can_transition_to(to),
                targets.contains(&to),
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn test_default_backoff_sequence() {
    let policy = RetryPolicy::default();
    let mut delay = policy.initial_delay;
    let mut used = Vec::new();
    for retry in 1..=10u32 {
        used.push(delay.as_secs());
        delay = policy.delay_for(retry);
    }
    assert_eq!(used, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
}

#[test]
fn test_backoff_saturates_for_large_counts() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
}

#[test]
fn test_start_connection_searches_and_discovers() {
    let (mut m, facade, mut bus_rx) = machine();
    m.start_connection();
    assert_eq!(m.state(), Searching);
    assert_eq!(facade.calls(), vec!["start_discovery"]);

    let events = drain(&mut bus_rx);
    let (topic, body) = &events[0];
    assert_eq!(topic, TOPIC_STATE_CHANGED);
    assert_eq!(body["from"], json!("disconnected"));
    assert_eq!(body["to"], json!("searching"));
}

#[test]
fn test_connected_rejects_searching() {
    let (mut m, _facade, mut bus_rx) = machine();
    m.start_connection();
    m.connect_to_device("pixel");
    m.connection_established("Pixel");
    assert_eq!(m.state(), Connected);
    let before = m.last_transition_time();
    drain(&mut bus_rx);

    m.connection_state_changed(Searching);
    assert_eq!(m.state(), Connected);
    assert_eq!(m.last_transition_time(), before);
    assert!(drain(&mut bus_rx).is_empty());

    // start_connection while connected is also ignored
    m.start_connection();
    assert_eq!(m.state(), Connected);
}

#[test]
fn test_same_state_request_is_noop() {
    let (mut m, _facade, mut bus_rx) = machine();
    m.start_connection();
    drain(&mut bus_rx);
    m.connection_state_changed(Searching);
    assert_eq!(m.state(), Searching);
    assert!(drain(&mut bus_rx).is_empty());
}

#[test]
fn test_connecting_arms_timeout_and_leaving_cancels_it() {
    let (mut m, facade, _bus_rx) = machine();
    m.start_connection();
    assert!(m.timeout_deadline().is_none());

    m.connect_to_device("pixel");
    assert_eq!(m.state(), Connecting);
    assert!(m.timeout_deadline().is_some());
    assert_eq!(
        facade.calls(),
        vec!["start_discovery", "connect_to_device:pixel"]
    );

    m.connection_established("Pixel");
    assert!(m.timeout_deadline().is_none());
    assert!(!m.is_retrying());
}

#[test]
fn test_connect_outside_searching_does_not_call_facade() {
    let (mut m, facade, _bus_rx) = machine();
    m.connect_to_device("pixel");
    assert_eq!(m.state(), Disconnected);
    assert!(facade.calls().is_empty());
}

#[test]
fn test_timeout_fires_handle_error() {
    let (mut m, _facade, _bus_rx) = machine();
    m.start_connection();
    m.connect_to_device("pixel");
    m.on_connection_timeout();
    assert_eq!(m.state(), Error);
    assert_eq!(m.last_error(), CONNECTION_TIMED_OUT);
    assert!(m.is_retrying());
    assert!(m.timeout_deadline().is_none());
}

#[test]
fn test_stale_timers_are_ignored() {
    let (mut m, facade, _bus_rx) = machine();
    m.start_connection();
    m.on_connection_timeout();
    assert_eq!(m.state(), Searching);
    m.on_retry_timer();
    assert_eq!(m.state(), Searching);
    assert_eq!(m.retry_count(), 0);
    assert_eq!(facade.calls(), vec!["start_discovery"]);
}

#[test]
fn test_retry_timer_increments_and_searches_again() {
    let (mut m, facade, mut bus_rx) = machine();
    m.start_connection();
    m.connection_failed("usb reset");
    assert_eq!(m.state(), Error);
    assert_eq!(m.last_error(), "usb reset");
    assert!(m.is_retrying());
    drain(&mut bus_rx);

    m.on_retry_timer();
    assert_eq!(m.state(), Searching);
    assert_eq!(m.retry_count(), 1);
    assert_eq!(m.next_retry_delay(), Duration::from_secs(2));
    assert_eq!(m.last_error(), "");
    assert!(!m.is_retrying());
    assert_eq!(facade.calls(), vec!["start_discovery", "start_discovery"]);

    let events = drain(&mut bus_rx);
    let attempt = events
        .iter()
        .find(|(t, _)| t == TOPIC_RETRY_ATTEMPT)
        .expect("retry attempt published");
    assert_eq!(attempt.1["retry_count"], json!(1));
    assert_eq!(attempt.1["delay_ms"], json!(1000));
}

#[test]
fn test_recovery_resets_and_signals_once() {
    let (mut m, _facade, mut bus_rx) = machine();
    m.start_connection();
    m.connection_failed("first");
    m.on_retry_timer();
    m.connection_failed("second");
    m.on_retry_timer();
    assert_eq!(m.retry_count(), 2);
    assert_eq!(m.next_retry_delay(), Duration::from_secs(4));

    m.connect_to_device("pixel");
    m.connection_state_changed(Connected);
    m.connection_established("Pixel");

    assert_eq!(m.state(), Connected);
    assert_eq!(m.retry_count(), 0);
    assert_eq!(m.next_retry_delay(), Duration::from_secs(1));

    let events = drain(&mut bus_rx);
    assert_eq!(count(&events, TOPIC_RECOVERED), 1);
    let recovered = events.iter().find(|(t, _)| t == TOPIC_RECOVERED).unwrap();
    assert_eq!(recovered.1["retry_count"], json!(2));
}

#[test]
fn test_first_time_connect_is_not_a_recovery() {
    let (mut m, _facade, mut bus_rx) = machine();
    m.start_connection();
    m.connect_to_device("pixel");
    m.connection_established("Pixel");
    assert_eq!(count(&drain(&mut bus_rx), TOPIC_RECOVERED), 0);
}

#[test]
fn test_delay_is_non_decreasing_within_a_streak() {
    let (mut m, _facade, _bus_rx) = machine();
    m.start_connection();
    let mut last = m.next_retry_delay();
    for _ in 0..10 {
        m.connection_failed("nope");
        m.on_retry_timer();
        assert!(m.next_retry_delay() >= last);
        last = m.next_retry_delay();
    }
}

#[test]
fn test_max_retries_stops_retrying() {
    let (mut m, _facade, mut bus_rx) = machine();
    m.start_connection();
    for _ in 0..10 {
        m.connection_failed("nope");
        assert!(m.is_retrying());
        m.on_retry_timer();
    }
    assert_eq!(m.retry_count(), 10);

    m.connection_failed("nope");
    assert_eq!(m.state(), Error);
    assert!(!m.is_retrying());
    let events = drain(&mut bus_rx);
    assert_eq!(count(&events, TOPIC_MAX_RETRIES_REACHED), 1);

    // A stray retry expiry cannot push past the limit.
    m.on_retry_timer();
    assert_eq!(m.retry_count(), 10);
    assert_eq!(m.state(), Error);
}

#[test]
fn test_reset_retry_count_restores_initial_delay() {
    let (mut m, _facade, _bus_rx) = machine();
    m.start_connection();
    m.connection_failed("x");
    m.on_retry_timer();
    m.connection_failed("x");
    m.on_retry_timer();
    m.reset_retry_count();
    assert_eq!(m.retry_count(), 0);
    assert_eq!(m.next_retry_delay(), Duration::from_secs(1));
}

#[test]
fn test_stop_connection_cancels_timers_and_disconnects() {
    let (mut m, facade, _bus_rx) = machine();
    m.start_connection();
    m.connection_failed("x");
    assert!(m.is_retrying());

    m.stop_connection();
    assert_eq!(m.state(), Disconnected);
    assert!(!m.is_retrying());
    assert!(m.timeout_deadline().is_none());
    assert_eq!(facade.calls().last().map(String::as_str), Some("disconnect"));
}

async fn wait_for_state(handle: &SessionHandle, state: ConnectionState) -> SessionSnapshot {
    let mut rx = handle.watch();
    let snapshot = rx
        .wait_for(|s| s.state == state)
        .await
        .expect("state machine stopped");
    snapshot.clone()
}

#[tokio::test(start_paused = true)]
async fn test_running_machine_times_out_connecting() {
    let facade = Arc::new(RecordingFacade::default());
    let (bus, _bus_rx) = EventBus::new(1024);
    let handle = ConnectionStateMachine::new(RetryPolicy::default(), facade.clone(), Arc::new(bus))
        .spawn();

    handle.start_connection();
    handle.connect_to_device("pixel");
    wait_for_state(&handle, Connecting).await;

    let started = Instant::now();
    let snapshot = wait_for_state(&handle, Error).await;
    assert_eq!(started.elapsed(), Duration::from_secs(15));
    assert_eq!(snapshot.last_error, CONNECTION_TIMED_OUT);
    assert!(snapshot.is_retrying);
}

#[tokio::test(start_paused = true)]
async fn test_eleven_failures_exhaust_retries_with_expected_backoff() {
    let facade = Arc::new(RecordingFacade::default());
    let (bus, mut bus_rx) = EventBus::new(4096);
    let handle = ConnectionStateMachine::new(RetryPolicy::default(), facade.clone(), Arc::new(bus))
        .spawn();

    handle.start_connection();
    wait_for_state(&handle, Searching).await;

    let mut delays = Vec::new();
    for _ in 0..10 {
        handle.connection_failed("device not responding");
        wait_for_state(&handle, Error).await;
        let failed_at = Instant::now();
        wait_for_state(&handle, Searching).await;
        delays.push(failed_at.elapsed().as_secs());
    }
    assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);

    handle.connection_failed("device not responding");
    let snapshot = wait_for_state(&handle, Error).await;
    assert_eq!(snapshot.retry_count, 10);
    assert!(!snapshot.is_retrying);

    // Nothing is armed: time passes and the machine stays put.
    tokio::time::sleep(Duration::from_secs(300)).await;
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, Error);
    assert_eq!(snapshot.retry_count, 10);

    let events = drain(&mut bus_rx);
    assert_eq!(count(&events, TOPIC_MAX_RETRIES_REACHED), 1);
    assert_eq!(count(&events, TOPIC_RETRY_ATTEMPT), 10);
    // discovery: initial start plus one per retry
    assert_eq!(
        facade.calls().iter().filter(|c| *c == "start_discovery").count(),
        11
    );
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_pending_retry() {
    let facade = Arc::new(RecordingFacade::default());
    let (bus, _bus_rx) = EventBus::new(1024);
    let handle = ConnectionStateMachine::new(RetryPolicy::default(), facade.clone(), Arc::new(bus))
        .spawn();

    handle.start_connection();
    handle.connection_failed("x");
    let snapshot = wait_for_state(&handle, Error).await;
    assert!(snapshot.is_retrying);

    handle.stop_connection();
    wait_for_state(&handle, Disconnected).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, Disconnected);
    assert_eq!(snapshot.retry_count, 0);
    assert!(!snapshot.is_retrying);
}

#[tokio::test]
async fn test_session_command_handler_maps_commands() {
    let facade = Arc::new(RecordingFacade::default());
    let (bus, mut bus_rx) = EventBus::new(1024);
    let handle =
        ConnectionStateMachine::new(RetryPolicy::default(), facade.clone(), Arc::new(bus.clone()))
            .spawn();
    let handler = SessionCommandHandler::new(handle.clone(), bus);

    handler
        .handle("start_discovery", &Payload::new())
        .expect("start_discovery accepted");
    wait_for_state(&handle, Searching).await;

    assert_eq!(
        handler.handle("connect_device", &Payload::new()),
        Err(CommandError::InvalidParams("device_id".to_string()))
    );
    let params = crate::broker::message::payload(json!({"device_id": "pixel"}));
    handler.handle("connect_device", &params).unwrap();
    wait_for_state(&handle, Connecting).await;

    let params = crate::broker::message::payload(json!({"resolution": "1080p"}));
    handler.handle("start_projection", &params).unwrap();
    handler.handle("stop_projection", &Payload::new()).unwrap();
    assert_eq!(
        handler.handle("pair_phone", &Payload::new()),
        Err(CommandError::Unsupported("pair_phone".to_string()))
    );

    handler.handle("disconnect", &Payload::new()).unwrap();
    wait_for_state(&handle, Disconnected).await;
    assert_eq!(
        facade.calls(),
        vec!["start_discovery", "connect_to_device:pixel", "disconnect"]
    );

    let projection: Vec<(String, Payload)> = drain(&mut bus_rx)
        .into_iter()
        .filter(|(topic, _)| topic.contains("projection"))
        .collect();
    assert_eq!(projection.len(), 2);
    assert_eq!(projection[0].0, "android_auto/start_projection_requested");
    assert_eq!(projection[0].1["resolution"], json!("1080p"));
    assert_eq!(projection[1].0, "android_auto/stop_projection_requested");
}

#[tokio::test]
async fn test_shutdown_waits_for_disconnect_to_reach_the_facade() {
    let facade = Arc::new(RecordingFacade::default());
    let (bus, _bus_rx) = EventBus::new(1024);
    let handle = ConnectionStateMachine::new(RetryPolicy::default(), facade.clone(), Arc::new(bus))
        .spawn();

    handle.start_connection();
    handle.connect_to_device("pixel");
    wait_for_state(&handle, Connecting).await;

    assert!(handle.shutdown(Duration::from_secs(1)).await);
    assert_eq!(handle.snapshot().state, Disconnected);
    assert_eq!(facade.calls().last().map(String::as_str), Some("disconnect"));
}

#[tokio::test]
async fn test_shutdown_from_idle_still_disconnects() {
    let facade = Arc::new(RecordingFacade::default());
    let (bus, _bus_rx) = EventBus::new(1024);
    let handle = ConnectionStateMachine::new(RetryPolicy::default(), facade.clone(), Arc::new(bus))
        .spawn();

    assert!(handle.shutdown(Duration::from_secs(1)).await);
    assert_eq!(facade.calls(), vec!["disconnect"]);
}

#[test]
fn test_bus_facade_publishes_requests() {
    let (bus, mut bus_rx) = EventBus::new(16);
    let facade = super::facade::BusFacade::new(bus);
    facade.start_discovery();
    facade.connect_to_device("pixel");
    facade.disconnect();

    let events = drain(&mut bus_rx);
    let topics: Vec<&str> = events.iter().map(|(t, _)| t.as_str()).collect();
    assert_eq!(
        topics,
        vec![
            "android_auto/discovery_requested",
            "android_auto/connect_requested",
            "android_auto/disconnect_requested",
        ]
    );
    assert_eq!(events[1].1["device_id"], json!("pixel"));
}
