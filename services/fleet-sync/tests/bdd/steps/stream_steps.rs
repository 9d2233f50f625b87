//! BDD step definitions for stream reconnector feature

use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when};
use tokio::sync::mpsc;

use fleet_sync::stream::{CloseReason, Reconnector, StreamConfig, StreamState};

use crate::world::{fast_retry, FleetWorld, ScriptedConnector};

fn ids(list: &str) -> Vec<&str> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn connector(world: &FleetWorld) -> &ScriptedConnector {
    world
        .connector
        .as_deref()
        .expect("no event stream configured")
}

#[given("an event stream that resumes from the last event id")]
fn resuming_stream(world: &mut FleetWorld) {
    world.connector = Some(Arc::new(ScriptedConnector::new(true)));
}

#[given("an event stream without resume")]
fn non_resuming_stream(world: &mut FleetWorld) {
    world.connector = Some(Arc::new(ScriptedConnector::new(false)));
}

#[given(expr = "the next connection delivers events {string} then drops")]
fn next_connection(world: &mut FleetWorld, events: String) {
    connector(world).connection(&ids(&events));
}

#[given(expr = "the snapshot holds events {string}")]
fn snapshot_holds(world: &mut FleetWorld, events: String) {
    connector(world).set_snapshot(&ids(&events));
}

#[when("the stream is started")]
fn stream_started(world: &mut FleetWorld) {
    let connector = world.connector.clone().expect("no event stream configured");
    let config = StreamConfig {
        retry: fast_retry(0),
        ..StreamConfig::default()
    };
    let (tx, rx) = mpsc::channel(16);
    world.stream = Some(Reconnector::spawn(connector, &config, tx));
    world.events = Some(rx);
}

#[when(expr = "{int} events are delivered")]
async fn events_delivered(world: &mut FleetWorld, count: usize) {
    let rx = world.events.as_mut().expect("stream not started");
    for _ in 0..count {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed");
        world.delivered.push(event.id.expect("event without id"));
    }

    // Nothing else trickles in afterwards
    let extra = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(extra.is_err(), "unexpected extra event: {:?}", extra);
}

#[when("the stream is closed")]
async fn stream_closed(world: &mut FleetWorld) {
    let stream = world.stream.take().expect("stream not started");
    stream.close();
    world.closed_state = Some(stream.closed().await);
}

#[then(expr = "the delivered event ids are {string}")]
fn delivered_ids(world: &mut FleetWorld, expected: String) {
    assert_eq!(world.delivered, ids(&expected));
}

#[then(expr = "the second connection resumed after {string}")]
fn second_resumed_after(world: &mut FleetWorld, id: String) {
    let requests = connector(world).resume_requests();
    assert_eq!(requests[0], None);
    assert_eq!(requests[1].as_deref(), Some(id.as_str()));
}

#[then("no connection asked to resume")]
fn no_resume(world: &mut FleetWorld) {
    let requests = connector(world).resume_requests();
    assert!(requests.len() >= 2);
    assert!(requests.iter().all(Option::is_none));
}

#[then("the stream is open")]
async fn stream_open(world: &mut FleetWorld) {
    let mut state = world
        .stream
        .as_ref()
        .expect("stream not started")
        .subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == StreamState::Open),
    )
    .await
    .expect("stream never reopened")
    .expect("stream task ended");
}

#[then("the stream ended because the caller closed it")]
fn ended_by_caller(world: &mut FleetWorld) {
    assert_eq!(
        world.closed_state,
        Some(StreamState::Closed(CloseReason::Caller))
    );
}
