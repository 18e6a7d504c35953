//! Error types for jsandbox-core

use crate::context::ContextError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JsandboxError {
    /// Spawning the worker or its warm-up evaluation failed.
    #[error("worker construction failed: {0}")]
    Construction(String),

    /// Framing broke, a stream closed, or the worker sent something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The sandboxed evaluator rejected the snippet. Carries its text verbatim.
    #[error("{0}")]
    Evaluation(String),

    #[error(transparent)]
    Cancellation(#[from] ContextError),

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl JsandboxError {
    /// Whether the worker that produced this error may go back to the pool.
    #[must_use]
    pub const fn is_recyclable(&self) -> bool {
        matches!(self, Self::Evaluation(_))
    }

    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancellation(_))
    }
}
