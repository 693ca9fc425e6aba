//! Glimpse Runner - CI client for the Glimpse visual regression service
//!
//! This crate implements the Glimpse runner, the CI-side client that submits
//! a set of UI states to the remote Glimpse service, optionally tunnels the
//! locally running application out to it, and polls the resulting build to a
//! terminal status.

pub mod api;
pub mod ci;
pub mod config;
pub mod proxy;
pub mod rules;
pub mod runner;
pub mod steps;
pub mod tunnel;

pub use api::{ApiAuth, ApiClient, ApiError, BuildHandle};
pub use config::{ConfigError, RunConfig};
pub use rules::FilterRule;
pub use runner::{RunOutcome, Runner, RunnerError, RunnerOptions};
pub use steps::{Step, StepBuilder};
