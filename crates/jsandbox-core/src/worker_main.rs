//! Entry point for the worker side of the pipe
//!
//! In stream mode the process reads NUL-terminated requests from stdin
//! forever, answering each with exactly one frame on stdout (result) or
//! stderr (diagnostic). Nothing else may be written to either stream, so
//! worker processes never install a tracing subscriber.

use crate::evaluator::Evaluator;
use crate::framing::{BlockingFrameReader, write_frame};
use crate::protocol::{self, EvaluationRequest};
use crate::Result;
use std::borrow::Cow;
use std::io::{self, Read, Write};

/// How the worker consumes stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// One request per frame until stdin closes
    Stream,
    /// Whole stdin is a single request; raw result on stdout
    Single,
}

/// Run the worker against the process's standard streams.
///
/// Returns `false` when a single-shot evaluation failed, so the caller can
/// exit non-zero.
pub fn run<V: Evaluator>(mode: WorkerMode, evaluator: &V, max_frame_size: usize) -> Result<bool> {
    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    let stderr = io::stderr().lock();

    match mode {
        WorkerMode::Stream => {
            serve_frames(stdin, stdout, stderr, evaluator, max_frame_size)?;
            Ok(true)
        }
        WorkerMode::Single => serve_once(stdin, stdout, stderr, evaluator),
    }
}

/// Answer framed requests until `input` reaches end-of-stream.
pub fn serve_frames<R, W, E, V>(
    input: R,
    mut output: W,
    mut errors: E,
    evaluator: &V,
    max_frame_size: usize,
) -> Result<()>
where
    R: Read,
    W: Write,
    E: Write,
    V: Evaluator,
{
    let mut frames = BlockingFrameReader::new(input, max_frame_size);

    while let Some(frame) = frames.read_frame()? {
        match handle(&frame, evaluator) {
            Ok(json) => write_frame(&mut output, json.as_bytes())?,
            Err(message) => write_frame(&mut errors, scrub(&message).as_bytes())?,
        }
    }

    Ok(())
}

/// Evaluate all of `input` as one request.
pub fn serve_once<R, W, E, V>(mut input: R, mut output: W, mut errors: E, evaluator: &V) -> Result<bool>
where
    R: Read,
    W: Write,
    E: Write,
    V: Evaluator,
{
    let mut request = Vec::new();
    input.read_to_end(&mut request)?;

    let (sink, text, ok): (&mut dyn Write, String, bool) = match handle(&request, evaluator) {
        Ok(json) => (&mut output, json, true),
        Err(message) => (&mut errors, message, false),
    };
    sink.write_all(text.as_bytes())?;
    sink.write_all(b"\n")?;
    sink.flush()?;
    Ok(ok)
}

fn handle<V: Evaluator>(frame: &[u8], evaluator: &V) -> std::result::Result<String, String> {
    let request: EvaluationRequest =
        protocol::decode(frame).map_err(|e| format!("invalid request: {e}"))?;
    evaluator.evaluate(&request)
}

/// Diagnostics may quote arbitrary input; keep them frame-safe.
fn scrub(message: &str) -> Cow<'_, str> {
    if message.contains('\0') {
        Cow::Owned(message.replace('\0', "\u{FFFD}"))
    } else {
        Cow::Borrowed(message)
    }
}
