use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
};
use core::time::Duration;

/// Respawn delay schedule for a slot whose workers keep dying.
///
/// The first replacement after a failure is immediate. Each further failure
/// in the same slot doubles the delay, starting from `initial` and capped at
/// `cap`. A worker that stayed up for at least `stable_after` resets its
/// slot's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub cap: Duration,
    pub stable_after: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            stable_after: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub const fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    /// Delay before the next attempt, given how many consecutive failures the
    /// slot has already seen.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2_u32.saturating_pow(failures - 1);
        self.initial.saturating_mul(factor).min(self.cap)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Settings for a [`Supervisor`](crate::Supervisor).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers kept alive. Defaults to the number of CPUs.
    pub pool_size: usize,
    /// Address every worker binds.
    pub endpoint: Endpoint,
    /// How long a new worker may take to report that it is listening.
    pub startup_timeout: Duration,
    /// Default grace period used by callers that have no better value.
    pub shutdown_grace: Duration,
    pub backoff: Backoff,
}

impl PoolConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            pool_size: num_cpus::get(),
            endpoint,
            startup_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            backoff: Backoff::default(),
        }
    }

    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    #[must_use]
    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    #[must_use]
    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks the settings a pool cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when the pool is empty, the port is
    /// `0` (each worker would get its own ephemeral port), the startup timeout
    /// is zero, or the backoff cap is below its initial delay.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.pool_size == 0 {
            return invalid("pool size must be greater than 0");
        }
        if self.endpoint.port() == 0 {
            return invalid("endpoint port must not be 0; workers could not share it");
        }
        if self.startup_timeout.is_zero() {
            return invalid("startup timeout must be greater than 0");
        }
        if self.backoff.cap < self.backoff.initial {
            return invalid("respawn backoff cap must not be below its initial delay");
        }
        Ok(())
    }
}
