//! Supervisor and worker plumbing for the `forkpool-server` binary.
//!
//! ## Structure
//!
//! - [`config`] - CLI / environment configuration.
//! - [`app`] - the demo [`Application`](forkpool::Application).
//! - [`events`] - logs and measures pool lifecycle events.
//! - [`telemetry`] - logging and optional metrics setup.

pub mod app;
pub mod config;
pub mod events;
pub mod telemetry;
