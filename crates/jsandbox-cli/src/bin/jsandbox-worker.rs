//! Dedicated sandbox worker, used by the test provider

use clap::Parser;
use jsandbox_core::evaluator::Json5Evaluator;
use jsandbox_core::framing::DEFAULT_MAX_FRAME_SIZE;
use jsandbox_core::worker_main::{self, WorkerMode};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "jsandbox-worker")]
#[command(version, about = "Evaluate sandboxed snippets read from stdin")]
struct Args {
    /// Read NUL-terminated requests until stdin closes
    #[arg(short = '0')]
    stream: bool,

    /// Largest request frame accepted
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
    max_frame_size: usize,
}

fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    let mode = if args.stream {
        WorkerMode::Stream
    } else {
        WorkerMode::Single
    };

    let ok = worker_main::run(mode, &Json5Evaluator, args.max_frame_size)?;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
