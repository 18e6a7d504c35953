//! Worker and pool configuration

use crate::framing::DEFAULT_MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable that pins the sandbox binary used by tests
pub const JSONNET_PATH_ENV: &str = "JSANDBOX_JSONNET_PATH";

/// Flag that puts a worker binary into "frames on stdin forever" mode
pub const STREAM_MODE_FLAG: &str = "-0";

/// How to launch and talk to one worker process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Sandbox binary
    pub binary: PathBuf,

    /// Arguments placed before the stream-mode flag
    pub args: Vec<String>,

    /// Complete child environment; nothing is inherited from the host
    pub env: Vec<(String, String)>,

    /// Largest frame accepted from the worker
    pub max_frame_size: usize,

    /// Budget for the warm-up evaluation
    pub warmup_timeout: Duration,

    /// How long teardown waits for the killed process to be reaped
    pub wait_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("jsandbox-worker"),
            args: vec![],
            env: vec![("TOKIO_WORKER_THREADS".into(), "1".into())],
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            warmup_timeout: Duration::from_secs(5),
            wait_delay: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }

    /// Config that re-executes the running binary with `subcommand`.
    pub fn current_exe(subcommand: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self::builder()
            .binary(std::env::current_exe()?)
            .arg(subcommand)
            .build())
    }

    /// Binary, args and stream-mode flag as one display string.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.binary.display().to_string();
        for arg in self.args.iter().map(String::as_str).chain([STREAM_MODE_FLAG]) {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Builder for WorkerConfig
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    #[must_use]
    pub fn binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.binary = path.into();
        self
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.config.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.config.max_frame_size = bytes;
        self
    }

    #[must_use]
    pub fn warmup_timeout(mut self, timeout: Duration) -> Self {
        self.config.warmup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn wait_delay(mut self, delay: Duration) -> Self {
        self.config.wait_delay = delay;
        self
    }

    #[must_use]
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// Sizing and maintenance policy for a worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Requested number of workers, clamped into `[floor, ceiling]`
    pub size: usize,

    /// Lower bound for the effective size
    pub floor: usize,

    /// Upper bound for the effective size
    pub ceiling: usize,

    /// Spawn workers in the background at construction
    pub prewarm: bool,

    /// Interval of the idle-worker health sweep
    pub health_check_interval: Duration,

    /// Spawn attempts per acquire before giving up
    pub max_spawn_attempts: u32,

    /// Recycle workers after this many evaluations (0 disables)
    pub recycle_after: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            floor: 5,
            ceiling: i32::MAX as usize,
            prewarm: true,
            health_check_interval: Duration::from_secs(10),
            max_spawn_attempts: 3,
            recycle_after: 1000,
        }
    }
}

impl PoolConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// The cap and pre-warm target: `size` clamped into `[floor, ceiling]`.
    #[must_use]
    pub fn effective_size(&self) -> usize {
        let ceiling = self.ceiling.max(1);
        self.size.clamp(self.floor.clamp(1, ceiling), ceiling)
    }
}

/// Builder for PoolConfig
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.config.size = size;
        self
    }

    #[must_use]
    pub fn floor(mut self, floor: usize) -> Self {
        self.config.floor = floor;
        self
    }

    #[must_use]
    pub fn ceiling(mut self, ceiling: usize) -> Self {
        self.config.ceiling = ceiling;
        self
    }

    #[must_use]
    pub fn prewarm(mut self, prewarm: bool) -> Self {
        self.config.prewarm = prewarm;
        self
    }

    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health_check_interval = interval;
        self
    }

    #[must_use]
    pub fn max_spawn_attempts(mut self, attempts: u32) -> Self {
        self.config.max_spawn_attempts = attempts;
        self
    }

    #[must_use]
    pub fn recycle_after(mut self, evaluations: u64) -> Self {
        self.config.recycle_after = evaluations;
        self
    }

    #[must_use]
    pub fn build(self) -> PoolConfig {
        self.config
    }
}

/// Sandbox binary pinned through `JSANDBOX_JSONNET_PATH`, if set
///
/// Useful to test against a different worker build than the one cargo
/// produced for the current run.
pub fn jsonnet_binary_override() -> Option<PathBuf> {
    std::env::var_os(JSONNET_PATH_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_clamped_into_floor_and_ceiling() {
        let below = PoolConfig::builder().size(2).build();
        assert_eq!(below.effective_size(), 5);

        let above = PoolConfig::builder().size(50).ceiling(8).build();
        assert_eq!(above.effective_size(), 8);

        let inside = PoolConfig::builder().size(2).floor(1).build();
        assert_eq!(inside.effective_size(), 2);
    }

    #[test]
    fn floor_above_ceiling_yields_ceiling() {
        let config = PoolConfig::builder().size(1).floor(10).ceiling(3).build();
        assert_eq!(config.effective_size(), 3);
    }

    #[test]
    fn zero_size_still_gets_one_worker() {
        let config = PoolConfig::builder().size(0).floor(0).build();
        assert_eq!(config.effective_size(), 1);
    }

    #[test]
    fn command_line_ends_with_stream_flag() {
        let config = WorkerConfig::builder()
            .binary("/usr/bin/app")
            .arg("jsonnet")
            .build();
        assert_eq!(config.command_line(), "/usr/bin/app jsonnet -0");
    }

    #[test]
    fn default_env_forces_single_threaded_runtime() {
        let config = WorkerConfig::default();
        assert!(
            config
                .env
                .contains(&("TOKIO_WORKER_THREADS".to_string(), "1".to_string()))
        );
    }

    #[test]
    fn pool_config_survives_serde() {
        let config = PoolConfig::builder().size(3).recycle_after(0).build();
        let text = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
