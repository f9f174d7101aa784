//! The worker side of the pool.
//!
//! A worker process binds the shared endpoint, reports `Listening` to the
//! supervisor and serves connections with an [`Application`] until it is told
//! to terminate, asks to exit, or loses its supervisor.
//!
//! ## Structure
//!
//! - [`app`] - the [`Application`] trait and its [`WorkerContext`].
//! - [`runtime`] - [`run`] / [`run_with`] and worker environment detection.

pub mod app;
pub mod runtime;

pub use app::*;
pub use runtime::*;
