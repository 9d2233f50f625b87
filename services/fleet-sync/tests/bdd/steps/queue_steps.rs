//! BDD step definitions for action queue feature

use std::sync::Arc;

use cucumber::{given, then, when};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use fleet_sync::classifier::NotFoundPolicy;
use fleet_sync::dispatcher::Dispatcher;
use fleet_sync::io::HttpMethod;
use fleet_sync::queue::{
    ActionQueue, ActionStatus, NewAction, QueueConfig, QueuedAction, Resolution, SubmitOutcome,
};
use fleet_sync::store::JsonFileStore;

use crate::world::{fast_retry, FleetWorld};

async fn open_queue(world: &mut FleetWorld) {
    let dir = world.store_path();
    let store = JsonFileStore::open(&dir)
        .await
        .expect("failed to open action store");
    let config = QueueConfig {
        store_dir: Some(dir),
        submit_retry: fast_retry(2),
        ..QueueConfig::default()
    };
    let queue = ActionQueue::open(
        Arc::new(store),
        world.dispatcher(),
        world.transport(),
        config,
    )
    .await
        .expect("failed to open action queue");
    world.queue = Some(queue);
}

fn queue(world: &FleetWorld) -> &ActionQueue {
    world.queue.as_ref().expect("queue not open")
}

fn door_action(kind: &str, path: &str) -> NewAction {
    NewAction {
        kind: kind.to_string(),
        endpoint: "door".to_string(),
        method: HttpMethod::Post,
        path: path.to_string(),
        payload: Some(json!({"requested": kind})),
        not_found: NotFoundPolicy::Unavailable,
    }
}

fn action(world: &FleetWorld, alias: &str) -> QueuedAction {
    let id = world.queued.get(alias).expect("unknown action alias");
    queue(world)
        .snapshot()
        .into_iter()
        .find(|a| a.id == *id)
        .unwrap_or_else(|| panic!("action {} is not in the queue", alias))
}

async fn submit(world: &mut FleetWorld, kind: &str, path: &str, online: bool) -> SubmitOutcome {
    queue(world)
        .submit(door_action(kind, path), online, &CancellationToken::new())
        .await
        .expect("submit failed")
}

#[given("an action queue stored on disk")]
async fn queue_on_disk(world: &mut FleetWorld) {
    open_queue(world).await;
}

#[when(expr = "the operator submits {string} to {string} as {string} while offline")]
async fn submit_offline(world: &mut FleetWorld, kind: String, path: String, alias: String) {
    match submit(world, &kind, &path, false).await {
        SubmitOutcome::Queued(id) => {
            world.queued.insert(alias, id);
        }
        other => panic!("expected the action to be queued, got {:?}", other),
    }
}

#[when(expr = "the operator submits {string} to {string} while online")]
async fn submit_online(world: &mut FleetWorld, kind: String, path: String) {
    let outcome = submit(world, &kind, &path, true).await;
    world.submit_outcome = Some(outcome);
}

#[when("the dashboard reloads")]
async fn dashboard_reloads(world: &mut FleetWorld) {
    world.queue = None;
    world.dispatcher = Some(Arc::new(Dispatcher::new(Default::default())));
    open_queue(world).await;
}

#[when("the queue is flushed")]
async fn queue_flushed(world: &mut FleetWorld) {
    let report = queue(world).flush(&CancellationToken::new()).await;
    world.flush_report = Some(report);
}

#[when(expr = "the operator discards {string}")]
async fn operator_discards(world: &mut FleetWorld, alias: String) {
    let id = *world.queued.get(&alias).expect("unknown action alias");
    let resolved = queue(world)
        .resolve(id, Resolution::Discard)
        .await
        .expect("resolve failed");
    assert!(resolved.is_none());
}

#[then(expr = "action {string} is pending")]
fn action_pending(world: &mut FleetWorld, alias: String) {
    assert_eq!(action(world, &alias).status, ActionStatus::Pending);
}

#[then(expr = "action {string} is pending after {int} retry/retries")]
fn action_pending_after(world: &mut FleetWorld, alias: String, retries: u32) {
    let action = action(world, &alias);
    assert_eq!(action.status, ActionStatus::Pending);
    assert_eq!(action.retry_count, retries);
    assert!(action.last_error.is_some());
}

#[then(expr = "action {string} was synced")]
fn action_synced(world: &mut FleetWorld, alias: String) {
    let id = world.queued.get(&alias).expect("unknown action alias");
    let report = world.flush_report.as_ref().expect("nothing flushed");
    assert!(report.synced.contains(id), "{:?}", report);
}

#[then(expr = "action {string} is conflicted with server state {string}")]
fn action_conflicted(world: &mut FleetWorld, alias: String, state: String) {
    let action = action(world, &alias);
    assert_eq!(action.status, ActionStatus::Conflicted);
    let conflict = action.conflict.expect("no conflict recorded");
    assert_eq!(conflict.server_state, json!(state));
    assert_eq!(conflict.message, "door already open");
}

#[then(expr = "action {string} still holds the attempted payload")]
fn attempted_payload(world: &mut FleetWorld, alias: String) {
    let action = action(world, &alias);
    let conflict = action.conflict.expect("no conflict recorded");
    assert_eq!(conflict.attempted, action.payload);
    assert!(conflict.attempted.is_some());
}

#[then("the queue is empty")]
fn queue_empty(world: &mut FleetWorld) {
    let actions = queue(world).snapshot();
    assert!(actions.is_empty(), "{:?}", actions);
    assert_eq!(queue(world).pending_count(), 0);
}

#[then(expr = "the last request carried the idempotency key of {string}")]
fn idempotency_key(world: &mut FleetWorld, alias: String) {
    let id = world.queued.get(&alias).expect("unknown action alias");
    let requests = world.transport.requests();
    let last = requests.last().expect("no requests made");
    assert_eq!(last.idempotency_key, Some(id.to_string()));
}

#[then(expr = "the backend saw {string} in that order")]
fn backend_order(world: &mut FleetWorld, paths: String) {
    let expected: Vec<&str> = paths.split(", ").collect();
    let requests = world.transport.requests();
    let seen: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(seen, expected);
}

#[then("the action was sent")]
fn action_sent(world: &mut FleetWorld) {
    match world.submit_outcome.as_ref().expect("nothing submitted") {
        SubmitOutcome::Sent(data) => assert_eq!(data["state"], "opening"),
        other => panic!("expected the action to be sent, got {:?}", other),
    }
}
