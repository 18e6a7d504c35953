//! One supervised worker process and its three pipes
//!
//! Two scan tasks turn stdout and stderr into frames and hand each frame to
//! the single evaluation currently waiting on the worker. A writer task drains
//! a one-slot queue into stdin so a stalled child never blocks submission.

use crate::config::{STREAM_MODE_FLAG, WorkerConfig};
use crate::context::Context;
use crate::framing::{FrameReader, encode_frame};
use crate::protocol::{self, EvaluationRequest};
use crate::{JsandboxError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span, field};

type Reply = Result<Vec<u8>>;

/// Which child stream a frame arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// One-shot reply channel for the evaluation currently in flight.
///
/// Whichever stream produces a frame first takes the sender; a frame that
/// finds the slot empty was not asked for.
#[derive(Debug, Clone, Default)]
struct ReplySlot(Arc<Mutex<Option<oneshot::Sender<Reply>>>>);

impl ReplySlot {
    fn arm(&self) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        *self.0.lock() = Some(tx);
        rx
    }

    fn disarm(&self) {
        self.0.lock().take();
    }

    fn deliver(&self, reply: Reply) -> bool {
        match self.0.lock().take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

/// Stops a worker from outside while someone else holds it.
#[derive(Debug, Clone)]
pub(crate) struct Terminator {
    child: Arc<Mutex<Option<Child>>>,
    reply: ReplySlot,
    broken: Arc<AtomicBool>,
}

impl Terminator {
    /// Fail the in-flight call with [`JsandboxError::PoolClosed`] and kill
    /// the process. The holder still reaps it through [`Worker::destroy`].
    pub(crate) fn terminate(&self) {
        self.broken.store(true, Ordering::Release);
        self.reply.deliver(Err(JsandboxError::PoolClosed));
        if let Some(child) = self.child.lock().as_mut() {
            if let Err(e) = child.start_kill() {
                tracing::trace!(error = %e, "kill skipped");
            }
        }
    }
}

#[derive(Debug)]
pub struct Worker {
    pub id: u64,
    pub pid: Option<u32>,
    pub execution_count: u64,
    command_line: String,
    child: Arc<Mutex<Option<Child>>>,
    input: Option<mpsc::Sender<Vec<u8>>>,
    reply: ReplySlot,
    broken: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
    wait_delay: Duration,
    destroyed: bool,
}

impl Worker {
    /// Start a worker process and warm it up.
    ///
    /// The warm-up runs under `ctx` narrowed to the configured warm-up
    /// timeout; on failure the process is torn down before returning.
    pub async fn spawn(id: u64, config: &WorkerConfig, ctx: &Context) -> Result<Self> {
        let span = tracing::info_span!(
            "jsandbox.worker.spawn",
            worker_id = id,
            process.command = %config.binary.display(),
            process.args = ?config.args,
            process.pid = field::Empty,
            error = field::Empty,
        );

        let result = Self::start(id, config, ctx).instrument(span.clone()).await;
        if let Err(e) = &result {
            record_failure(&span, e);
        }
        result
    }

    async fn start(id: u64, config: &WorkerConfig, ctx: &Context) -> Result<Self> {
        let mut cmd = Command::new(&config.binary);
        cmd.args(&config.args)
            .arg(STREAM_MODE_FLAG)
            .env_clear()
            .envs(config.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let command_line = config.command_line();
        let mut child = cmd.spawn().map_err(|e| {
            JsandboxError::Construction(format!("failed to start `{command_line}`: {e}"))
        })?;

        let pid = child.id();
        if let Some(pid) = pid {
            Span::current().record("process.pid", pid);
        }

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(JsandboxError::Construction(
                "child process is missing a piped stream".into(),
            ));
        };

        let reply = ReplySlot::default();
        let broken = Arc::new(AtomicBool::new(false));
        let (input_tx, input_rx) = mpsc::channel(1);

        // Armed before the scanners start so an eager child cannot race it.
        let warmup_reply = reply.arm();

        let tasks = vec![
            tokio::spawn(pump_input(stdin, input_rx, id)),
            tokio::spawn(scan(
                stdout,
                Stream::Stdout,
                reply.clone(),
                Arc::clone(&broken),
                config.max_frame_size,
                id,
            )),
            tokio::spawn(scan(
                stderr,
                Stream::Stderr,
                reply.clone(),
                Arc::clone(&broken),
                config.max_frame_size,
                id,
            )),
        ];

        let mut worker = Self {
            id,
            pid,
            execution_count: 0,
            command_line,
            child: Arc::new(Mutex::new(Some(child))),
            input: Some(input_tx),
            reply,
            broken,
            tasks,
            wait_delay: config.wait_delay,
            destroyed: false,
        };

        let warmup = encode_frame(&protocol::encode(&EvaluationRequest::warm_up())?)?;
        let warmup_ctx = ctx.with_timeout(config.warmup_timeout);
        match worker.exchange(&warmup_ctx, warmup, warmup_reply).await {
            Ok(_) => {
                tracing::debug!(worker_id = id, pid, "worker spawned and warmed up");
                Ok(worker)
            }
            Err(e) => {
                worker.destroy().await;
                Err(JsandboxError::Construction(format!("warm up failed: {e}")))
            }
        }
    }

    /// Send one request and wait for its reply.
    ///
    /// A cancelled call leaves the pipes in an unknown state, so the worker
    /// is marked broken and will not be reused.
    pub async fn evaluate(&mut self, ctx: &Context, payload: &[u8]) -> Result<Vec<u8>> {
        let span = tracing::debug_span!(
            "jsandbox.worker.eval",
            worker_id = self.id,
            process.command = %self.command_line,
            process.pid = self.pid,
            error = field::Empty,
        );

        let result = self.roundtrip(ctx, payload).instrument(span.clone()).await;
        match &result {
            Ok(_) => self.execution_count += 1,
            Err(JsandboxError::Evaluation(_)) => {
                self.execution_count += 1;
                span.record("error", "evaluation failed");
            }
            Err(e) => record_failure(&span, e),
        }
        result
    }

    async fn roundtrip(&mut self, ctx: &Context, payload: &[u8]) -> Result<Vec<u8>> {
        if self.is_broken() {
            return Err(JsandboxError::Protocol(format!(
                "worker {} is no longer usable",
                self.id
            )));
        }
        let frame = encode_frame(payload)?;
        let reply = self.reply.arm();
        self.exchange(ctx, frame, reply).await
    }

    async fn exchange(
        &mut self,
        ctx: &Context,
        frame: Vec<u8>,
        reply: oneshot::Receiver<Reply>,
    ) -> Result<Vec<u8>> {
        let Some(input) = self.input.clone() else {
            self.reply.disarm();
            return Err(JsandboxError::Protocol(format!(
                "worker {} has been destroyed",
                self.id
            )));
        };

        tokio::select! {
            biased;
            reason = ctx.done() => return Err(self.abandon(reason.into())),
            sent = input.send(frame) => {
                if sent.is_err() {
                    self.reply.disarm();
                    self.broken.store(true, Ordering::Release);
                    return Err(JsandboxError::Protocol("worker stdin is closed".into()));
                }
            }
        }

        tokio::select! {
            biased;
            reason = ctx.done() => Err(self.abandon(reason.into())),
            outcome = reply => outcome.unwrap_or_else(|_| {
                Err(JsandboxError::Protocol("worker dropped the reply".into()))
            }),
        }
    }

    fn abandon(&self, err: JsandboxError) -> JsandboxError {
        self.reply.disarm();
        self.broken.store(true, Ordering::Release);
        tracing::debug!(worker_id = self.id, error = %err, "evaluation abandoned");
        err
    }

    /// Framing broke, the child went away, or a call was abandoned.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.destroyed || self.broken.load(Ordering::Acquire)
    }

    /// Non-blocking liveness probe; also true once the worker is broken.
    pub fn has_exited(&mut self) -> bool {
        self.is_broken()
            || self
                .child
                .lock()
                .as_mut()
                .is_none_or(|child| !matches!(child.try_wait(), Ok(None)))
    }

    pub(crate) fn terminator(&self) -> Terminator {
        Terminator {
            child: Arc::clone(&self.child),
            reply: self.reply.clone(),
            broken: Arc::clone(&self.broken),
        }
    }

    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Close stdin, kill the process and reap it. Safe to call repeatedly.
    pub async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.reply.disarm();

        // Dropping the sender ends the writer task, which closes stdin.
        self.input = None;

        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::trace!(worker_id = self.id, error = %e, "kill skipped");
            }

            match tokio::time::timeout(self.wait_delay, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(worker_id = self.id, pid = self.pid, %status, "worker reaped");
                }
                Ok(Err(e)) => tracing::warn!(worker_id = self.id, error = %e, "failed to reap worker"),
                Err(_) => tracing::warn!(worker_id = self.id, pid = self.pid, "worker did not exit in time"),
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn record_failure(span: &Span, err: &JsandboxError) {
    span.record("error", field::display(err));
    tracing::warn!(parent: span, error = %err, "worker operation failed");
}

async fn pump_input(mut stdin: ChildStdin, mut frames: mpsc::Receiver<Vec<u8>>, id: u64) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::debug!(worker_id = id, error = %e, "worker stdin closed");
            break;
        }
    }
}

async fn scan<R: AsyncRead + Unpin>(
    source: R,
    stream: Stream,
    reply: ReplySlot,
    broken: Arc<AtomicBool>,
    max_frame_size: usize,
    id: u64,
) {
    let mut frames = FrameReader::new(source, max_frame_size);

    loop {
        let failure = match frames.read_frame().await {
            Ok(Some(frame)) => {
                let outcome = match stream {
                    Stream::Stdout => Ok(frame),
                    Stream::Stderr => Err(JsandboxError::Evaluation(
                        String::from_utf8_lossy(&frame).into_owned(),
                    )),
                };
                if reply.deliver(outcome) {
                    continue;
                }
                JsandboxError::Protocol(format!("unsolicited frame on worker {stream}"))
            }
            Ok(None) => JsandboxError::Protocol(format!("worker closed {stream}")),
            Err(e) => e,
        };

        broken.store(true, Ordering::Release);
        tracing::debug!(worker_id = id, %stream, error = %failure, "worker stream unusable");
        reply.deliver(Err(failure));
        return;
    }
}
