//! Choosing which binary backs the sandbox
//!
//! Tests run a dedicated helper binary that cargo builds once per test run;
//! production re-executes the running binary with an internal subcommand.
//! Either way the provider owns one pool for its whole lifetime and hands
//! out cheap VMs bound to it.

use crate::config::{PoolConfig, WorkerConfig, jsonnet_binary_override};
use crate::context::Context;
use crate::pool::Pool;
use crate::vm::SecureVm;
use crate::{JsandboxError, Result};
use std::num::NonZeroUsize;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum Provider {
    Test(TestStrategy),
    Production(ProductionStrategy),
}

/// Dedicated worker binary with its own pool
#[derive(Debug, Clone)]
pub struct TestStrategy {
    pub binary: PathBuf,
    pool: Pool,
}

/// The running executable, re-invoked with `subcommand`
#[derive(Debug, Clone)]
pub struct ProductionStrategy {
    pub subcommand: String,
    pool: Pool,
}

impl Provider {
    /// Provider backed by the helper binary at `default_binary`, unless
    /// `JSANDBOX_JSONNET_PATH` pins another one.
    ///
    /// Integration tests pass `env!("CARGO_BIN_EXE_jsandbox-worker")`.
    pub fn for_tests(default_binary: impl Into<PathBuf>) -> Result<Self> {
        let binary = test_binary(default_binary);
        let parallelism = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);

        let worker = WorkerConfig::builder().binary(&binary).build();
        let pool = Pool::new(worker, PoolConfig::builder().size(parallelism).build())?;

        tracing::debug!(binary = %binary.display(), parallelism, "test provider ready");
        Ok(Self::Test(TestStrategy { binary, pool }))
    }

    /// Provider that re-executes the current binary as `<exe> <subcommand> -0`.
    ///
    /// Build it once at startup and clone it; all clones share the pool.
    pub fn production(subcommand: impl Into<String>, config: PoolConfig) -> Result<Self> {
        let subcommand = subcommand.into();
        let worker = WorkerConfig::current_exe(subcommand.clone()).map_err(|e| {
            JsandboxError::Config(format!("cannot locate the running executable: {e}"))
        })?;
        let pool = Pool::new(worker, config)?;
        Ok(Self::Production(ProductionStrategy { subcommand, pool }))
    }

    #[must_use]
    pub const fn pool(&self) -> &Pool {
        match self {
            Self::Test(strategy) => &strategy.pool,
            Self::Production(strategy) => &strategy.pool,
        }
    }

    /// A fresh VM whose evaluations end when `ctx` does.
    pub fn jsonnet_vm(&self, ctx: &Context) -> Result<SecureVm> {
        let pool = self.pool();
        if pool.is_closed() {
            return Err(JsandboxError::PoolClosed);
        }
        Ok(SecureVm::new(pool.clone(), ctx.clone()))
    }

    /// Shut the shared pool down.
    pub async fn close(&self) {
        self.pool().close().await;
    }
}

/// `JSANDBOX_JSONNET_PATH` if set, else `default`.
pub fn test_binary(default: impl Into<PathBuf>) -> PathBuf {
    jsonnet_binary_override().unwrap_or_else(|| default.into())
}
