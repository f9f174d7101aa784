//! Control protocol between the supervisor and a worker process.
//!
//! Messages are JSON-serialized and newline-delimited. The supervisor writes
//! [`Signal`]s to the worker's stdin; the worker writes [`StatusMessage`]s to
//! its stdout. Lines that do not parse are ignored by both sides, so a worker
//! must send its own logs to stderr.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Supervisor to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// Stop accepting, finish in-flight requests, exit.
    Terminate,
    /// Embedder-defined payload handed to
    /// [`Application::on_signal`](crate::Application::on_signal).
    Custom { payload: serde_json::Value },
}

/// Worker to supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    /// The worker bound the shared endpoint and is accepting connections.
    Listening { addr: SocketAddr },
}

impl Signal {
    pub fn custom(payload: impl Into<serde_json::Value>) -> Self {
        Self::Custom {
            payload: payload.into(),
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        to_line(self)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

impl StatusMessage {
    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String> {
        to_line(self)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

fn to_line<T: Serialize>(message: &T) -> Result<String> {
    let mut json = serde_json::to_string(message)?;
    json.push('\n');
    Ok(json)
}
