#![doc = include_str!("../README.md")]

mod config;
pub mod endpoint;
mod error;
mod event;
mod pool;
pub mod protocol;
pub mod worker;

pub use crate::config::*;
pub use crate::endpoint::Endpoint;
pub use crate::error::*;
pub use crate::event::*;
pub use crate::pool::*;
pub use crate::protocol::Signal;
pub use crate::worker::{Application, WorkerContext, WorkerEnv, WorkerExit};
