//! BDD step definitions for fleet-sync

pub mod dispatcher_steps;
pub mod queue_steps;
pub mod section_steps;
pub mod stream_steps;
