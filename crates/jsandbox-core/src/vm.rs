//! Process-isolated VM facade
//!
//! A [`SecureVm`] collects bindings and turns each evaluation into one
//! acquire, evaluate, release round trip against its pool. Use one VM per
//! logical call; concurrency comes from many VMs sharing a pool.

use crate::context::Context;
use crate::pool::Pool;
use crate::protocol::{self, Bindings, EvaluationRequest};
use crate::{JsandboxError, Result};

#[derive(Debug, Clone)]
pub struct SecureVm {
    pool: Pool,
    ctx: Context,
    bindings: Bindings,
}

impl SecureVm {
    /// Bind a VM to `pool`; every evaluation runs under `ctx`.
    #[must_use]
    pub fn new(pool: Pool, ctx: Context) -> Self {
        Self {
            pool,
            ctx,
            bindings: Bindings::default(),
        }
    }

    /// External variable whose value is code.
    pub fn ext_code(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.bindings.ext_code(key, value);
    }

    /// External variable whose value is a string.
    pub fn ext_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.bindings.ext_var(key, value);
    }

    /// Top-level argument whose value is code.
    pub fn tla_code(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.bindings.tla_code(key, value);
    }

    /// Top-level argument whose value is a string.
    pub fn tla_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.bindings.tla_var(key, value);
    }

    #[must_use]
    pub const fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    #[must_use]
    pub const fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Evaluate `snippet` in a pooled worker and return the manifested JSON.
    ///
    /// Diagnostics from the sandboxed evaluator come back as
    /// [`JsandboxError::Evaluation`] with their text untouched.
    pub async fn evaluate_anonymous_snippet(&self, filename: &str, snippet: &str) -> Result<String> {
        let request =
            EvaluationRequest::new(filename, snippet).with_bindings(self.bindings.clone());
        let payload = protocol::encode(&request)?;

        let mut worker = self.pool.acquire(&self.ctx).await?;
        let outcome = worker.evaluate(&self.ctx, &payload).await;
        worker.release().await;

        let output = outcome.inspect_err(|e| {
            if !e.is_recyclable() {
                tracing::warn!(filename, error = %e, "sandboxed evaluation failed");
            }
        })?;

        String::from_utf8(output)
            .map_err(|e| JsandboxError::Protocol(format!("worker returned non UTF-8 output: {e}")))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{PoolConfig, WorkerConfig};
    use crate::context::ContextError;
    use std::time::{Duration, Instant};

    /// Replies with the request it was sent, so tests can inspect it.
    fn echo_pool() -> Pool {
        let worker = WorkerConfig::builder()
            .binary("/bin/sh")
            .args(["-c", "exec cat"])
            .env("PATH", "/usr/bin:/bin")
            .build();
        Pool::new(worker, PoolConfig::builder().size(2).floor(1).prewarm(false).build()).unwrap()
    }

    #[tokio::test]
    async fn request_carries_snippet_and_bindings() {
        let pool = echo_pool();
        let mut vm = SecureVm::new(pool.clone(), Context::background());
        vm.ext_var("env", "prod");
        vm.ext_code("replicas", "3");
        vm.tla_var("name", "api");
        vm.tla_code("debug", "false");

        let echoed = vm.evaluate_anonymous_snippet("svc.jsonnet", "{a:1}").await.unwrap();
        let request: EvaluationRequest = serde_json::from_str(&echoed).unwrap();
        assert_eq!(request.filename, "svc.jsonnet");
        assert_eq!(request.snippet, "{a:1}");
        assert_eq!(&request.bindings, vm.bindings());

        assert_eq!(pool.status().idle, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn setters_do_not_evaluate() {
        let pool = echo_pool();
        let mut vm = SecureVm::new(pool.clone(), Context::background());
        vm.ext_var("a", "1");
        assert_eq!(pool.status().total, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn cancelled_vm_context_ends_evaluation() {
        let worker = WorkerConfig::builder()
            .binary("/bin/sh")
            .args(["-c", "printf 'ok\\000'; exec sleep 3600"])
            .env("PATH", "/usr/bin:/bin")
            .build();
        let pool =
            Pool::new(worker, PoolConfig::builder().size(1).floor(1).prewarm(false).build()).unwrap();

        let ctx = Context::background();
        let vm = SecureVm::new(pool.clone(), ctx.clone());
        let call = tokio::spawn(async move { vm.evaluate_anonymous_snippet("t", "{}").await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let cancelled_at = Instant::now();
        ctx.cancel();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, JsandboxError::Cancellation(ContextError::Canceled)));
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));
        assert_eq!(pool.status().total, 0);
        pool.close().await;
    }
}
