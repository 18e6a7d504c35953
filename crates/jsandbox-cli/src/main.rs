//! jsandbox CLI - evaluate templating snippets in pooled sandbox processes

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use jsandbox_core::evaluator::Json5Evaluator;
use jsandbox_core::framing::DEFAULT_MAX_FRAME_SIZE;
use jsandbox_core::worker_main::{self, WorkerMode};
use jsandbox_core::{Context, PoolConfig, Provider, SecureVm};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// Subcommand the pool re-executes this binary with
const WORKER_SUBCOMMAND: &str = "jsonnet";

#[derive(Parser)]
#[command(name = "jsandbox")]
#[command(author, version, about = "Process-isolated evaluation of untrusted templates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a file (or - for stdin) and print the resulting JSON
    Eval {
        /// Snippet to evaluate
        file: PathBuf,

        /// External variable with a string value
        #[arg(long = "ext-str", value_name = "K=V", value_parser = parse_binding)]
        ext_str: Vec<(String, String)>,

        /// External variable with a code value
        #[arg(long = "ext-code", value_name = "K=V", value_parser = parse_binding)]
        ext_code: Vec<(String, String)>,

        /// Top-level argument with a string value
        #[arg(long = "tla-str", value_name = "K=V", value_parser = parse_binding)]
        tla_str: Vec<(String, String)>,

        /// Top-level argument with a code value
        #[arg(long = "tla-code", value_name = "K=V", value_parser = parse_binding)]
        tla_code: Vec<(String, String)>,

        /// Worker processes to keep warm
        #[arg(short, long, default_value = "1")]
        workers: usize,

        /// Timeout in seconds
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },

    /// Sandboxed worker loop, started by the pool
    #[command(name = "jsonnet", hide = true)]
    Jsonnet {
        /// Read NUL-terminated requests until stdin closes
        #[arg(short = '0')]
        stream: bool,

        /// Largest request frame accepted
        #[arg(long, default_value_t = DEFAULT_MAX_FRAME_SIZE)]
        max_frame_size: usize,
    },
}

fn parse_binding(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Jsonnet {
            stream,
            max_frame_size,
        } => {
            // stderr belongs to the protocol here; no subscriber
            let mode = if stream {
                WorkerMode::Stream
            } else {
                WorkerMode::Single
            };
            let ok = worker_main::run(mode, &Json5Evaluator, max_frame_size)?;
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }

        Commands::Eval {
            file,
            ext_str,
            ext_code,
            tla_str,
            tla_code,
            workers,
            timeout,
        } => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive("jsandbox=info".parse()?),
                )
                .init();

            let (filename, snippet) = read_snippet(&file)?;
            tracing::debug!(%filename, workers, timeout, "evaluating snippet");
            let runtime = tokio::runtime::Runtime::new()?;

            runtime.block_on(async move {
                let config = PoolConfig::builder().size(workers).floor(1).build();
                let provider = Provider::production(WORKER_SUBCOMMAND, config)?;
                let ctx = Context::background().with_timeout(Duration::from_secs(timeout));

                let mut vm = provider.jsonnet_vm(&ctx)?;
                bind_all(&mut vm, ext_str, ext_code, tla_str, tla_code);

                let outcome = vm.evaluate_anonymous_snippet(&filename, &snippet).await;
                provider.close().await;

                let json = outcome.with_context(|| format!("evaluating {filename}"))?;
                println!("{}", json.trim_end());
                Ok::<_, anyhow::Error>(ExitCode::SUCCESS)
            })
        }
    }
}

fn read_snippet(file: &Path) -> anyhow::Result<(String, String)> {
    if file.as_os_str() == "-" {
        let mut snippet = String::new();
        std::io::stdin()
            .read_to_string(&mut snippet)
            .context("reading snippet from stdin")?;
        return Ok(("<stdin>".to_owned(), snippet));
    }

    if !file.is_file() {
        bail!("{} is not a file", file.display());
    }
    let snippet = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    Ok((file.display().to_string(), snippet))
}

fn bind_all(
    vm: &mut SecureVm,
    ext_str: Vec<(String, String)>,
    ext_code: Vec<(String, String)>,
    tla_str: Vec<(String, String)>,
    tla_code: Vec<(String, String)>,
) {
    for (key, value) in ext_str {
        vm.ext_var(key, value);
    }
    for (key, value) in ext_code {
        vm.ext_code(key, value);
    }
    for (key, value) in tla_str {
        vm.tla_var(key, value);
    }
    for (key, value) in tla_code {
        vm.tla_code(key, value);
    }
}
