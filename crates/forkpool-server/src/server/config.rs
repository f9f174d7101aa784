use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use forkpool::{Backoff, Endpoint, PoolConfig};

/// Runtime configuration for the `forkpool-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first). Workers are launched with the same
/// arguments, so they see the same configuration as the supervisor.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "forkpool-server",
    version,
    about = "A self-healing pool of HTTP worker processes sharing one port"
)]
pub struct CliArgs {
    /// Number of worker processes kept alive.
    ///
    /// Defaults to the number of CPUs on the host.
    ///
    /// Environment variable: `POOL_SIZE`
    #[arg(long, env = "POOL_SIZE", default_value_t = num_cpus::get())]
    pub pool_size: usize,

    /// Address every worker binds, as `host:port`.
    ///
    /// Environment variable: `ENDPOINT`
    #[arg(long, env = "ENDPOINT", default_value_t = String::from("0.0.0.0:3000"))]
    pub endpoint: String,

    /// How long workers get to finish in-flight requests on shutdown before
    /// they are killed.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_MS`
    #[arg(long, env = "SHUTDOWN_GRACE_MS", default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    /// How long a worker may take to start listening.
    ///
    /// Environment variable: `STARTUP_TIMEOUT_MS`
    #[arg(long, env = "STARTUP_TIMEOUT_MS", default_value_t = 10_000)]
    pub startup_timeout_ms: u64,

    /// First respawn delay for a slot whose workers keep dying.
    ///
    /// Environment variable: `RESPAWN_BACKOFF_INITIAL_MS`
    #[arg(long, env = "RESPAWN_BACKOFF_INITIAL_MS", default_value_t = 100)]
    pub respawn_backoff_initial_ms: u64,

    /// Upper bound for the respawn delay.
    ///
    /// Environment variable: `RESPAWN_BACKOFF_CAP_MS`
    #[arg(long, env = "RESPAWN_BACKOFF_CAP_MS", default_value_t = 5_000)]
    pub respawn_backoff_cap_ms: u64,

    /// A worker that stays up this long resets its slot's respawn delay.
    ///
    /// Environment variable: `RESPAWN_STABLE_AFTER_MS`
    #[arg(long, env = "RESPAWN_STABLE_AFTER_MS", default_value_t = 10_000)]
    pub respawn_stable_after_ms: u64,

    /// Response delay of the demo `/slow` route.
    ///
    /// Environment variable: `SLOW_ROUTE_MS`
    #[arg(long, env = "SLOW_ROUTE_MS", default_value_t = 15_000)]
    pub slow_route_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub pool: PoolConfig,
    pub slow_route: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.pool_size == 0 {
            bail!("POOL_SIZE must be greater than 0");
        }

        let endpoint: Endpoint = args
            .endpoint
            .parse()
            .with_context(|| format!("invalid ENDPOINT `{}`", args.endpoint))?;
        if endpoint.port() == 0 {
            bail!("ENDPOINT must name a fixed port, got `{endpoint}`");
        }

        if args.respawn_backoff_cap_ms < args.respawn_backoff_initial_ms {
            bail!(
                "RESPAWN_BACKOFF_CAP_MS ({}) must not be less than RESPAWN_BACKOFF_INITIAL_MS ({})",
                args.respawn_backoff_cap_ms,
                args.respawn_backoff_initial_ms
            );
        }

        let backoff = Backoff::new(
            Duration::from_millis(args.respawn_backoff_initial_ms),
            Duration::from_millis(args.respawn_backoff_cap_ms),
        )
        .with_stable_after(Duration::from_millis(args.respawn_stable_after_ms));

        let pool = PoolConfig::new(endpoint)
            .with_pool_size(args.pool_size)
            .with_startup_timeout(Duration::from_millis(args.startup_timeout_ms))
            .with_shutdown_grace(Duration::from_millis(args.shutdown_grace_ms))
            .with_backoff(backoff);
        pool.validate()?;

        Ok(Self {
            pool,
            slow_route: Duration::from_millis(args.slow_route_ms),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let args = CliArgs::try_parse_from(["forkpool-server"].iter().chain(args))?;
        ServerConfig::try_from(args)
    }

    #[test]
    fn flags_build_pool_config() {
        let config = parse(&[
            "--pool-size",
            "3",
            "--endpoint",
            "127.0.0.1:8080",
            "--shutdown-grace-ms",
            "250",
            "--respawn-backoff-initial-ms",
            "50",
            "--respawn-backoff-cap-ms",
            "800",
            "--slow-route-ms",
            "20",
        ])
        .unwrap();

        assert_eq!(config.pool.pool_size, 3);
        assert_eq!(config.pool.endpoint, Endpoint::new("127.0.0.1", 8080));
        assert_eq!(config.pool.shutdown_grace, Duration::from_millis(250));
        assert_eq!(config.pool.backoff.initial, Duration::from_millis(50));
        assert_eq!(config.pool.backoff.cap, Duration::from_millis(800));
        assert_eq!(config.slow_route, Duration::from_millis(20));
    }

    #[test]
    fn rejects_unusable_settings() {
        for args in [
            &["--pool-size", "0"][..],
            &["--endpoint", "localhost"],
            &["--endpoint", "127.0.0.1:0"],
            &["--respawn-backoff-initial-ms", "500", "--respawn-backoff-cap-ms", "100"],
            &["--startup-timeout-ms", "0"],
        ] {
            assert!(parse(args).is_err(), "{args:?} should be rejected");
        }
    }
}
