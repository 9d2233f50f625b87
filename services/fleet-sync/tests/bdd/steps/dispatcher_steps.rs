//! BDD step definitions for dispatcher feature

use std::sync::Arc;
use std::time::Duration;

use cucumber::{given, then, when};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use fleet_sync::circuit::{CircuitConfig, CircuitPhase};
use fleet_sync::classifier::EndpointPolicy;
use fleet_sync::dispatcher::{DispatchPolicy, Dispatcher};
use fleet_sync::io::{ApiRequest, HttpTransport};
use fleet_sync::ErrorKind;

use crate::world::{fast_retry, FleetWorld};

#[given(regex = r#"^"([^"]+)" fails with HTTP (\d+) (\d+) times then returns (.+)$"#)]
fn fails_then_returns(world: &mut FleetWorld, path: String, status: u16, times: u32, body: String) {
    for _ in 0..times {
        world.transport.then(&path, status, "");
    }
    world.transport.always(&path, 200, &body);
}

#[given(regex = r#"^"([^"]+)" always returns HTTP (\d+) with (.+)$"#)]
fn always_returns(world: &mut FleetWorld, path: String, status: u16, body: String) {
    world.transport.always(&path, status, &body);
}

#[given(expr = "circuits open after {int} transient failures")]
fn circuit_threshold(world: &mut FleetWorld, threshold: u32) {
    world.dispatcher = Some(Arc::new(Dispatcher::new(CircuitConfig {
        failure_threshold: threshold,
        cooldown: Duration::from_secs(60),
    })));
}

#[when(expr = "{string} is fetched as {string} with at most {int} attempts")]
async fn fetch(world: &mut FleetWorld, path: String, key: String, attempts: u32) {
    let dispatcher = world.dispatcher();
    let transport = world.transport();
    let request = ApiRequest::get(path);
    let policy = DispatchPolicy::new(fast_retry(attempts), EndpointPolicy::default());
    let cancel = CancellationToken::new();

    let result = dispatcher
        .fetch::<Value, _, _>(&key, &policy, &cancel, || transport.execute(&request))
        .await;
    world.fetch_result = Some(result);
}

fn fetch_error(world: &FleetWorld) -> &fleet_sync::ClassifiedError {
    match world.fetch_result.as_ref().expect("nothing fetched") {
        Err(e) => e,
        Ok(value) => panic!("expected an error, got {:?}", value),
    }
}

#[then("the fetch fails with a transient error")]
fn fails_transient(world: &mut FleetWorld) {
    let error = fetch_error(world);
    assert_eq!(error.kind, ErrorKind::Transient);
    assert!(error.retryable);
}

#[then("the fetch fails with an unavailable error")]
fn fails_unavailable(world: &mut FleetWorld) {
    let error = fetch_error(world);
    assert_eq!(error.kind, ErrorKind::Unavailable);
    assert!(!error.retryable);
}

#[then("the fetch fails with a fatal error")]
fn fails_fatal(world: &mut FleetWorld) {
    let error = fetch_error(world);
    assert_eq!(error.kind, ErrorKind::Fatal);
    assert!(!error.retryable);
}

#[then(expr = "the error message is {string}")]
fn error_message(world: &mut FleetWorld, message: String) {
    assert_eq!(fetch_error(world).message, message);
}

#[then(expr = "the fetch succeeds with hostname {string}")]
fn succeeds_with_hostname(world: &mut FleetWorld, hostname: String) {
    match world.fetch_result.as_ref().expect("nothing fetched") {
        Ok(Some(value)) => assert_eq!(value["hostname"], hostname.as_str()),
        other => panic!("expected data, got {:?}", other),
    }
}

#[then(expr = "{string} was called {int} time\\(s\\)")]
fn called_times(world: &mut FleetWorld, path: String, times: usize) {
    assert_eq!(world.transport.calls_to(&path), times);
}

#[then(expr = "the circuit for {string} is disabled")]
fn circuit_disabled(world: &mut FleetWorld, key: String) {
    assert_eq!(
        world.dispatcher().circuits().phase(&key),
        CircuitPhase::Disabled
    );
}

#[then(expr = "the circuit for {string} is open")]
fn circuit_open(world: &mut FleetWorld, key: String) {
    assert_eq!(
        world.dispatcher().circuits().phase(&key),
        CircuitPhase::Open
    );
}
