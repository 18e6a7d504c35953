//! Worker pool management

use crate::config::{PoolConfig, WorkerConfig};
use crate::context::Context;
use crate::worker::{Terminator, Worker};
use crate::{JsandboxError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Bounded pool of warmed-up workers, cheap to clone.
///
/// At most `cap` workers are checked out at once; further [`Pool::acquire`]
/// calls wait in FIFO order. Idle workers are swept for dead processes in
/// the background.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    worker_config: WorkerConfig,
    config: PoolConfig,
    cap: usize,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<Worker>,
    /// Idle + checked out + being spawned
    live: usize,
    checked_out: HashMap<u64, Terminator>,
    closed: bool,
}

/// Status of the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub cap: usize,
}

impl Pool {
    /// Create a pool and start its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(worker_config: WorkerConfig, config: PoolConfig) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| JsandboxError::Config(format!("worker pool needs a tokio runtime: {e}")))?;

        let cap = config.effective_size();
        let inner = Arc::new(PoolInner {
            worker_config,
            cap,
            permits: Arc::new(Semaphore::new(cap)),
            state: Mutex::new(PoolState::default()),
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
            config,
        });

        tracing::info!(
            cap,
            command = %inner.worker_config.command_line(),
            prewarm = inner.config.prewarm,
            "worker pool created"
        );

        if inner.config.prewarm {
            for _ in 0..cap {
                handle.spawn(prewarm(Arc::clone(&inner)));
            }
        }
        handle.spawn(sweep_loop(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            inner.config.health_check_interval,
        ));

        Ok(Self { inner })
    }

    /// Wait for a checkout slot and hand out a healthy worker.
    pub async fn acquire(&self, ctx: &Context) -> Result<PooledWorker> {
        let inner = &self.inner;
        if inner.state.lock().closed {
            return Err(JsandboxError::PoolClosed);
        }

        let permit = tokio::select! {
            biased;
            reason = ctx.done() => return Err(reason.into()),
            permit = Arc::clone(&inner.permits).acquire_owned() => {
                permit.map_err(|_| JsandboxError::PoolClosed)?
            }
        };

        loop {
            let candidate = inner.state.lock().idle.pop_front();
            let Some(mut worker) = candidate else { break };
            if worker.has_exited() {
                tracing::debug!(worker_id = worker.id, "discarding dead idle worker");
                inner.forget(worker).await;
                continue;
            }
            return inner.check_out(worker, permit).await;
        }

        let worker = inner.spawn_reserved(ctx).await?;
        inner.check_out(worker, permit).await
    }

    /// Return a worker; broken, exited or surplus workers are destroyed.
    pub async fn release(&self, worker: PooledWorker) {
        worker.release().await;
    }

    /// Terminate every live worker and refuse new checkouts.
    ///
    /// Idle workers are destroyed here. Checked-out workers are killed and
    /// their in-flight calls fail with [`JsandboxError::PoolClosed`]; each
    /// is reaped when its holder releases or drops it.
    pub async fn close(&self) {
        let (idle, checked_out) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = std::mem::take(&mut state.idle);
            state.live -= idle.len();
            (idle, std::mem::take(&mut state.checked_out))
        };
        self.inner.permits.close();
        self.inner.shutdown.cancel();

        tracing::info!(
            idle = idle.len(),
            checked_out = checked_out.len(),
            "closing worker pool"
        );
        for terminator in checked_out.values() {
            terminator.terminate();
        }
        for mut worker in idle {
            worker.destroy().await;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let busy = if state.closed {
            state.live - state.idle.len()
        } else {
            self.inner.cap - self.inner.permits.available_permits()
        };
        PoolStatus {
            total: state.live,
            idle: state.idle.len(),
            busy,
            cap: self.inner.cap,
        }
    }

    #[must_use]
    pub fn worker_config(&self) -> &WorkerConfig {
        &self.inner.worker_config
    }
}

impl PoolInner {
    /// Hand `worker` to a caller, unless the pool closed in the meantime.
    async fn check_out(
        self: &Arc<Self>,
        mut worker: Worker,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledWorker> {
        let closed = {
            let mut state = self.state.lock();
            if state.closed {
                state.live -= 1;
            } else {
                state.checked_out.insert(worker.id, worker.terminator());
            }
            state.closed
        };

        if closed {
            worker.destroy().await;
            return Err(JsandboxError::PoolClosed);
        }
        Ok(PooledWorker::new(worker, Arc::clone(self), permit))
    }

    /// Spawn a worker for a caller that already holds a permit.
    async fn spawn_reserved(&self, ctx: &Context) -> Result<Worker> {
        let reservation = Reservation::claim(self);

        let attempts = self.config.max_spawn_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match Worker::spawn(id, &self.worker_config, ctx).await {
                Ok(worker) => {
                    reservation.keep();
                    return Ok(worker);
                }
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "worker spawn failed");
                    if let Some(reason) = ctx.err() {
                        last_error = Some(reason.into());
                        break;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| JsandboxError::Construction("no spawn attempted".into())))
    }

    async fn put_back(&self, mut worker: Worker) {
        let recycle_after = self.config.recycle_after;
        let worn_out = recycle_after > 0 && worker.execution_count >= recycle_after;
        let exited = worker.has_exited();

        {
            let mut state = self.state.lock();
            if !exited && !worn_out && !state.closed && state.live <= self.cap {
                state.idle.push_back(worker);
                return;
            }
            state.live -= 1;
        }

        tracing::debug!(
            worker_id = worker.id,
            executions = worker.execution_count,
            exited,
            worn_out,
            "retiring worker"
        );
        worker.destroy().await;
    }

    /// Destroy a worker that still counts as live.
    async fn forget(&self, mut worker: Worker) {
        self.state.lock().live -= 1;
        worker.destroy().await;
    }

    /// Remove dead idle workers. Runs under the pool lock, so acquire and
    /// release never see a worker while it is being inspected.
    async fn sweep_idle(&self) {
        let dead: Vec<Worker> = {
            let mut state = self.state.lock();
            let mut dead = Vec::new();
            for mut worker in std::mem::take(&mut state.idle) {
                if worker.has_exited() {
                    dead.push(worker);
                } else {
                    state.idle.push_back(worker);
                }
            }
            state.live -= dead.len();
            dead
        };

        if !dead.is_empty() {
            tracing::info!(count = dead.len(), "health sweep removed dead workers");
        }
        for mut worker in dead {
            worker.destroy().await;
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A `live` slot claimed ahead of a spawn. Dropping it unkept gives the
/// slot back, so an abandoned acquire cannot leak capacity.
struct Reservation<'a> {
    pool: &'a PoolInner,
    kept: bool,
}

impl<'a> Reservation<'a> {
    fn claim(pool: &'a PoolInner) -> Self {
        pool.state.lock().live += 1;
        Self { pool, kept: false }
    }

    /// Claim a slot only while the pool is open and below its cap.
    fn claim_below_cap(pool: &'a PoolInner) -> Option<Self> {
        let mut state = pool.state.lock();
        if state.closed || state.live >= pool.cap {
            return None;
        }
        state.live += 1;
        Some(Self { pool, kept: false })
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.pool.state.lock().live -= 1;
        }
    }
}

async fn prewarm(inner: Arc<PoolInner>) {
    let Some(reservation) = Reservation::claim_below_cap(&inner) else {
        return;
    };

    let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
    let ctx = Context::background();
    match Worker::spawn(id, &inner.worker_config, &ctx).await {
        Ok(worker) => {
            reservation.keep();
            inner.put_back(worker).await;
        }
        Err(e) => tracing::warn!(error = %e, "pre-warming worker failed"),
    }
}

async fn sweep_loop(inner: Weak<PoolInner>, shutdown: CancellationToken, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        inner.sweep_idle().await;
    }
}

/// A worker checked out of a [`Pool`].
///
/// Hand it back with [`PooledWorker::release`]. Dropping it instead
/// discards the worker, since an abandoned checkout may have a call in flight.
#[derive(Debug)]
pub struct PooledWorker {
    worker: Option<Worker>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledWorker {
    fn new(worker: Worker, pool: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            worker: Some(worker),
            pool,
            _permit: permit,
        }
    }

    pub async fn evaluate(&mut self, ctx: &Context, payload: &[u8]) -> Result<Vec<u8>> {
        match self.worker.as_mut() {
            Some(worker) => worker.evaluate(ctx, payload).await,
            None => Err(JsandboxError::Protocol("worker already returned".into())),
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.worker.as_ref().map(|w| w.id)
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.worker.as_ref().and_then(|w| w.pid)
    }

    pub async fn release(mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.state.lock().checked_out.remove(&worker.id);
            self.pool.put_back(worker).await;
        }
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        {
            let mut state = self.pool.state.lock();
            state.checked_out.remove(&worker.id);
            state.live -= 1;
        }
        tracing::debug!(worker_id = worker.id, "checked-out worker dropped, discarding");
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move { worker.destroy().await });
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PoolConfigBuilder;
    use crate::context::ContextError;
    use std::time::Instant;

    fn echo_worker() -> WorkerConfig {
        WorkerConfig::builder()
            .binary("/bin/sh")
            .args(["-c", "exec cat"])
            .env("PATH", "/usr/bin:/bin")
            .build()
    }

    /// Answers the warm-up, then never answers again.
    fn hang_worker() -> WorkerConfig {
        WorkerConfig::builder()
            .binary("/bin/sh")
            .args(["-c", "printf 'ok\\000'; exec sleep 3600"])
            .env("PATH", "/usr/bin:/bin")
            .build()
    }

    fn pool_config(size: usize) -> PoolConfigBuilder {
        PoolConfig::builder().size(size).floor(1).prewarm(false)
    }

    async fn wait_for(pool: &Pool, what: impl Fn(PoolStatus) -> bool) -> PoolStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = pool.status();
            if what(status) || Instant::now() > deadline {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hung_checkouts_block_acquire_until_deadline() {
        let pool = Pool::new(hang_worker(), pool_config(2).build()).unwrap();

        let mut calls = Vec::new();
        for _ in 0..2 {
            let mut worker = pool.acquire(&Context::background()).await.unwrap();
            calls.push(tokio::spawn(async move {
                let outcome = worker.evaluate(&Context::background(), b"{}").await;
                worker.release().await;
                outcome
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.status().busy, 2);

        let started = Instant::now();
        let err = pool
            .acquire(&Context::background().with_timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JsandboxError::Cancellation(ContextError::DeadlineExceeded)
        ));
        assert!(started.elapsed() >= Duration::from_millis(90));
        assert!(calls.iter().all(|call| !call.is_finished()));

        pool.close().await;
        for call in calls {
            let outcome = tokio::time::timeout(Duration::from_secs(2), call)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(outcome, Err(JsandboxError::PoolClosed)));
        }
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn abandoned_cold_acquire_gives_its_slot_back() {
        let config = WorkerConfig::builder()
            .binary("/bin/sh")
            .args(["-c", "sleep 0.3; exec cat"])
            .env("PATH", "/usr/bin:/bin")
            .build();
        let pool = Pool::new(config, pool_config(1).build()).unwrap();
        let ctx = Context::background();

        let abandoned = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&ctx)).await;
        assert!(abandoned.is_err());
        assert_eq!(pool.status().total, 0);

        let worker = pool.acquire(&ctx).await.unwrap();
        let pid = worker.pid();
        worker.release().await;
        assert_eq!(pool.status().idle, 1);

        let again = pool.acquire(&ctx).await.unwrap();
        assert_eq!(again.pid(), pid);
        again.release().await;
        pool.close().await;
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiting_acquire_gets_released_worker() {
        let pool = Pool::new(echo_worker(), pool_config(1).build()).unwrap();
        let ctx = Context::background();

        let held = pool.acquire(&ctx).await.unwrap();
        let pid = held.pid();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&Context::background()).await.map(|w| w.pid()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        held.release().await;
        let next_pid = waiter.await.unwrap().unwrap();
        assert_eq!(next_pid, pid);
        pool.close().await;
    }

    #[tokio::test]
    async fn released_worker_is_reused() {
        let pool = Pool::new(echo_worker(), pool_config(2).build()).unwrap();
        let ctx = Context::background();

        let mut worker = pool.acquire(&ctx).await.unwrap();
        assert_eq!(worker.evaluate(&ctx, b"hi").await.unwrap(), b"hi");
        let pid = worker.pid();
        pool.release(worker).await;

        let status = pool.status();
        assert_eq!((status.total, status.idle, status.busy), (1, 1, 0));

        let again = pool.acquire(&ctx).await.unwrap();
        assert_eq!(again.pid(), pid);
        again.release().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn failing_warmup_is_never_handed_out() {
        let config = WorkerConfig::builder()
            .binary("/bin/sh")
            .args(["-c", "exec cat >&2"])
            .env("PATH", "/usr/bin:/bin")
            .build();
        let pool = Pool::new(config, pool_config(2).max_spawn_attempts(2).build()).unwrap();

        let err = pool
            .acquire(&Context::background().with_timeout(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, JsandboxError::Construction(_)), "{err}");
        assert_eq!(pool.status().total, 0);
        assert_eq!(pool.status().busy, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn failed_warmup_is_retried_with_a_fresh_process() {
        let marker = std::env::temp_dir().join(format!(
            "jsandbox-warmup-retry-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let script = format!(
            "if [ -e '{m}' ]; then exec cat; fi; touch '{m}'; exit 1",
            m = marker.display()
        );
        let config = WorkerConfig::builder()
            .binary("/bin/sh")
            .args(["-c".to_owned(), script])
            .env("PATH", "/usr/bin:/bin")
            .build();
        let pool = Pool::new(config, pool_config(1).max_spawn_attempts(3).build()).unwrap();
        let ctx = Context::background();

        let mut worker = pool.acquire(&ctx).await.unwrap();
        assert!(marker.exists());
        assert_eq!(pool.status().total, 1);
        assert_eq!(worker.evaluate(&ctx, b"ok").await.unwrap(), b"ok");

        worker.release().await;
        pool.close().await;
        std::fs::remove_file(&marker).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn close_kills_idle_checkouts() {
        fn running(pid: u32) -> bool {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .is_ok_and(|stat| !stat.contains(") Z "))
        }

        let pool = Pool::new(echo_worker(), pool_config(1).build()).unwrap();
        let ctx = Context::background();
        let mut worker = pool.acquire(&ctx).await.unwrap();
        let pid = worker.pid().unwrap();
        assert!(running(pid));

        pool.close().await;
        let deadline = Instant::now() + Duration::from_secs(2);
        while running(pid) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!running(pid));
        assert!(worker.evaluate(&ctx, b"{}").await.is_err());

        worker.release().await;
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn prewarm_fills_pool_to_target() {
        let config = PoolConfig::builder().size(3).floor(1).build();
        let pool = Pool::new(echo_worker(), config).unwrap();

        let status = wait_for(&pool, |s| s.idle == 3).await;
        assert_eq!(status.idle, 3);
        assert_eq!(status.total, 3);
        pool.close().await;
        assert_eq!(pool.status().total, 0);
    }

    #[tokio::test]
    async fn health_sweep_drops_killed_idle_worker() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let config = pool_config(1)
            .health_check_interval(Duration::from_millis(50))
            .build();
        let pool = Pool::new(echo_worker(), config).unwrap();
        let ctx = Context::background();

        let worker = pool.acquire(&ctx).await.unwrap();
        let pid = worker.pid().unwrap();
        worker.release().await;
        assert_eq!(pool.status().idle, 1);

        kill(Pid::from_raw(i32::try_from(pid).unwrap()), Signal::SIGKILL).unwrap();

        let status = wait_for(&pool, |s| s.idle == 0).await;
        assert_eq!(status.idle, 0);
        assert_eq!(status.total, 0);

        let fresh = pool.acquire(&ctx).await.unwrap();
        assert_ne!(fresh.pid(), Some(pid));
        fresh.release().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn cancelled_call_discards_worker() {
        let pool = Pool::new(hang_worker(), pool_config(1).build()).unwrap();

        let mut worker = pool.acquire(&Context::background()).await.unwrap();
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        assert!(worker.evaluate(&ctx, b"{}").await.unwrap_err().is_cancellation());
        worker.release().await;

        assert_eq!(pool.status().total, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn worn_out_workers_are_recycled() {
        let config = pool_config(1).recycle_after(2).build();
        let pool = Pool::new(echo_worker(), config).unwrap();
        let ctx = Context::background();

        let mut worker = pool.acquire(&ctx).await.unwrap();
        let pid = worker.pid();
        worker.evaluate(&ctx, b"1").await.unwrap();
        worker.evaluate(&ctx, b"2").await.unwrap();
        worker.release().await;
        assert_eq!(pool.status().total, 0);

        let fresh = pool.acquire(&ctx).await.unwrap();
        assert_ne!(fresh.pid(), pid);
        fresh.release().await;
        pool.close().await;
    }

    #[tokio::test]
    async fn dropped_checkout_is_discarded() {
        let pool = Pool::new(echo_worker(), pool_config(1).build()).unwrap();
        let worker = pool.acquire(&Context::background()).await.unwrap();
        drop(worker);

        let status = pool.status();
        assert_eq!((status.total, status.busy), (0, 0));
        pool.close().await;
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let pool = Pool::new(echo_worker(), pool_config(1).build()).unwrap();
        let worker = pool.acquire(&Context::background()).await.unwrap();

        pool.close().await;
        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire(&Context::background()).await,
            Err(JsandboxError::PoolClosed)
        ));

        worker.release().await;
        assert_eq!(pool.status().total, 0);
    }

    #[test]
    fn pool_requires_runtime() {
        let err = Pool::new(echo_worker(), PoolConfig::default()).unwrap_err();
        assert!(matches!(err, JsandboxError::Config(_)));
    }
}
