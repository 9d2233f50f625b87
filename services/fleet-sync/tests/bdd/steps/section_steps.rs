//! BDD step definitions for section composer feature

use std::sync::Arc;

use cucumber::{given, then, when};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use fleet_sync::classifier::EndpointPolicy;
use fleet_sync::dispatcher::DispatchPolicy;
use fleet_sync::section::{
    EmptyReason, EndpointLoader, Section, SectionComposer, SectionPhase, SectionSummary,
};

use crate::world::{fast_retry, FleetWorld};

fn add_section(world: &mut FleetWorld, name: String, path: String, endpoint: EndpointPolicy) {
    let loader = EndpointLoader::<Value>::new(
        world.dispatcher(),
        world.transport(),
        name.clone(),
        path,
        DispatchPolicy::new(fast_retry(2), endpoint),
    );
    world
        .composer
        .get_or_insert_with(SectionComposer::new)
        .add(Section::<Value>::new(name, Arc::new(loader), None));
}

fn summary(world: &FleetWorld, name: &str) -> SectionSummary {
    world
        .composer
        .as_ref()
        .expect("no sections")
        .summary(name)
        .unwrap_or_else(|| panic!("no section named {}", name))
}

#[given(regex = r#"^"([^"]+)" returns (.+)$"#)]
fn returns(world: &mut FleetWorld, path: String, body: String) {
    world.transport.always(&path, 200, &body);
}

#[given(expr = "a section {string} backed by {string}")]
fn section_backed_by(world: &mut FleetWorld, name: String, path: String) {
    add_section(world, name, path, EndpointPolicy::default());
}

#[given(expr = "a section {string} backed by {string} where missing means empty")]
fn section_missing_means_empty(world: &mut FleetWorld, name: String, path: String) {
    add_section(world, name, path, EndpointPolicy::not_found_is_empty());
}

#[when("the dashboard loads")]
async fn dashboard_loads(world: &mut FleetWorld) {
    // Sections without a poll interval load once, concurrently
    let composer = world.composer.as_ref().expect("no sections");
    composer.run(CancellationToken::new()).await;
}

#[when(expr = "{string} starts failing with HTTP {int}")]
fn starts_failing(world: &mut FleetWorld, path: String, status: u16) {
    world.transport.always(&path, status, "");
}

#[when(expr = "section {string} is refreshed")]
async fn section_refreshed(world: &mut FleetWorld, name: String) {
    let composer = world.composer.as_ref().expect("no sections");
    let outcome = composer.refresh(&name, &CancellationToken::new()).await;
    assert!(outcome.is_some(), "no section named {}", name);
}

#[then(expr = "section {string} is empty because the feature is unavailable")]
fn empty_unavailable(world: &mut FleetWorld, name: String) {
    let section = summary(world, &name);
    assert_eq!(section.phase, SectionPhase::Empty);
    assert_eq!(section.empty_reason, Some(EmptyReason::Unavailable));
    assert!(section.error.is_none());
}

#[then(expr = "section {string} is empty because there is no data")]
fn empty_no_data(world: &mut FleetWorld, name: String) {
    let section = summary(world, &name);
    assert_eq!(section.phase, SectionPhase::Empty);
    assert_eq!(section.empty_reason, Some(EmptyReason::NoData));
}

#[then(expr = "section {string} raises no alert")]
fn raises_no_alert(world: &mut FleetWorld, name: String) {
    assert!(!summary(world, &name).raises_alert);
}

#[then(expr = "section {string} shows {int} item\\(s\\)")]
fn shows_items(world: &mut FleetWorld, name: String, count: usize) {
    let section = summary(world, &name);
    assert_eq!(section.phase, SectionPhase::Success);
    let items = section.data.expect("no data");
    assert_eq!(items.as_array().map(Vec::len), Some(count));
}

#[then(expr = "section {string} shows the error {string}")]
fn shows_error(world: &mut FleetWorld, name: String, message: String) {
    let section = summary(world, &name);
    assert_eq!(section.phase, SectionPhase::Error);
    assert!(section.raises_alert);
    assert_eq!(section.error.expect("no error").message, message);
}

#[then(expr = "section {string} offers a retry")]
fn offers_retry(world: &mut FleetWorld, name: String) {
    assert!(summary(world, &name).retry_available);
}

#[then(expr = "section {string} offers no retry")]
fn offers_no_retry(world: &mut FleetWorld, name: String) {
    assert!(!summary(world, &name).retry_available);
}

#[then(expr = "section {string} succeeded")]
fn succeeded(world: &mut FleetWorld, name: String) {
    let section = summary(world, &name);
    assert_eq!(section.phase, SectionPhase::Success);
    assert!(section.error.is_none());
}

#[then(expr = "section {string} still shows hostname {string}")]
fn still_shows_hostname(world: &mut FleetWorld, name: String, hostname: String) {
    let data = summary(world, &name).data.expect("no data");
    assert_eq!(data["hostname"], hostname.as_str());
}
