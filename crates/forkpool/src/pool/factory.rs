//! How worker processes are launched.
//!
//! A [`WorkerFactory`] only describes the command. The supervisor adds the
//! worker environment ([`ENV_WORKER_ID`], [`ENV_ENDPOINT`]), pipes stdin and
//! stdout for the control protocol, leaves stderr inherited, and spawns it.

use super::handle::WorkerId;
use std::{ffi::OsString, io};
use tokio::process::Command;

/// Environment variable carrying the worker's [`WorkerId`].
pub const ENV_WORKER_ID: &str = "FORKPOOL_WORKER_ID";

/// Environment variable carrying the shared [`Endpoint`](crate::Endpoint).
pub const ENV_ENDPOINT: &str = "FORKPOOL_ENDPOINT";

/// Builds the command that starts one worker process.
///
/// Called once per launch, including every replacement. Any
/// `Fn(WorkerId) -> io::Result<Command>` closure is a factory.
pub trait WorkerFactory: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns an error if the command cannot be prepared (for example, the
    /// current executable cannot be located).
    fn command(&self, worker: WorkerId) -> io::Result<Command>;
}

impl<F> WorkerFactory for F
where
    F: Fn(WorkerId) -> io::Result<Command> + Send + Sync + 'static,
{
    fn command(&self, worker: WorkerId) -> io::Result<Command> {
        self(worker)
    }
}

/// Re-executes the running binary as a worker.
///
/// The child sees the worker environment and can detect its role with
/// [`WorkerEnv::from_env`](crate::WorkerEnv::from_env).
#[derive(Debug, Clone, Default)]
pub struct CurrentExe {
    args: Vec<OsString>,
}

impl CurrentExe {
    /// Passes this process's own arguments to every worker.
    pub fn inherit_args() -> Self {
        Self {
            args: std::env::args_os().skip(1).collect(),
        }
    }

    pub fn with_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl WorkerFactory for CurrentExe {
    fn command(&self, _worker: WorkerId) -> io::Result<Command> {
        let mut command = Command::new(std::env::current_exe()?);
        command.args(&self.args);
        Ok(command)
    }
}

/// Runs an arbitrary program as a worker.
#[derive(Debug, Clone)]
pub struct Program {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl Program {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl WorkerFactory for Program {
    fn command(&self, _worker: WorkerId) -> io::Result<Command> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(self.envs.iter().cloned());
        Ok(command)
    }
}
