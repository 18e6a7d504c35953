//! # jsandbox-core
//!
//! Process-isolated evaluation of untrusted templating snippets.
//!
//! Every evaluation runs in a separate, pooled worker process reached over
//! its standard streams:
//! - NUL-terminated frames over stdin/stdout/stderr
//! - Warm-up on spawn, kill and reap on teardown
//! - Bounded pool with pre-warming and a background health sweep
//! - A VM facade that turns one call into acquire, evaluate, release
//! - Test and production strategies for locating the worker binary

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod evaluator;
pub mod framing;
pub mod pool;
pub mod protocol;
pub mod provider;
pub mod vm;
pub mod worker;
pub mod worker_main;

pub use config::{PoolConfig, WorkerConfig};
pub use context::{Context, ContextError};
pub use error::JsandboxError;
pub use pool::{Pool, PoolStatus, PooledWorker};
pub use provider::Provider;
pub use vm::SecureVm;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, JsandboxError>;
