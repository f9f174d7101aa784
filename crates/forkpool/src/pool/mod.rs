//! Process pool supervision.
//!
//! ## Structure
//!
//! - [`supervisor`] - owns the pool, replaces dead workers, shuts it down.
//! - [`handle`] - one worker process as seen by the supervisor.
//! - [`factory`] - how worker processes are launched.
//! - `monitor` - per-process task that owns the child and reports its exit.

pub mod factory;
pub mod handle;
mod monitor;
pub mod supervisor;

pub use factory::*;
pub use handle::*;
pub use supervisor::*;
