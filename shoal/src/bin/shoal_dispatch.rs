//! shoal-dispatch - worker-side configuration merge.
//!
//! Reads the base configuration and the batch list, selects the batch at the
//! worker's index, and writes the merged configuration (plus, optionally, the
//! selected batch on its own).
//!
//! Exit status is 2 for errors that would repeat on retry (index out of
//! bounds, malformed documents, missing index) and 1 for I/O failures.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, Parser, error::ErrorKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shoal::dispatch::{
    ENV_BASE_CONFIG, ENV_BATCH_CONFIG, ENV_BATCHES, ENV_COMPLETION_INDEX, ENV_MERGED_CONFIG,
    ENV_WORKER_INDEX, merge_documents, render,
};

const EXIT_FATAL: u8 = 2;
const EXIT_RETRYABLE: u8 = 1;

#[derive(Debug, Parser)]
#[command(name = "shoal-dispatch", version, about = "Merge this worker's batch into the base configuration")]
struct Cli {
    /// Base configuration document (JSON object).
    #[arg(long, env = ENV_BASE_CONFIG)]
    base_config: PathBuf,

    /// Batch list document: an array, or an object with a `batches` array.
    #[arg(long, env = ENV_BATCHES)]
    batches: PathBuf,

    /// Worker index; falls back to JOB_COMPLETION_INDEX.
    #[arg(long, env = ENV_WORKER_INDEX)]
    index: Option<usize>,

    /// Where to write the merged configuration; stdout when omitted.
    #[arg(long, env = ENV_MERGED_CONFIG)]
    output: Option<PathBuf>,

    /// Where to write the selected batch document.
    #[arg(long, env = ENV_BATCH_CONFIG)]
    batch_output: Option<PathBuf>,
}

impl Cli {
    fn worker_index(&self) -> Option<usize> {
        self.index.or_else(|| {
            std::env::var(ENV_COMPLETION_INDEX)
                .ok()
                .and_then(|raw| raw.trim().parse().ok())
        })
    }
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let Some(index) = cli.worker_index() else {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                format!("worker index missing: pass --index or set {ENV_WORKER_INDEX} or {ENV_COMPLETION_INDEX}"),
            )
            .exit();
    };

    match run(&cli, index) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let fatal = err
                .downcast_ref::<shoal::Error>()
                .is_some_and(shoal::Error::is_fatal);
            if fatal {
                tracing::error!(error_kind = "fatal", "{err:#}");
                ExitCode::from(EXIT_FATAL)
            } else {
                tracing::error!(error_kind = "retryable", "{err:#}");
                ExitCode::from(EXIT_RETRYABLE)
            }
        }
    }
}

fn run(cli: &Cli, index: usize) -> anyhow::Result<()> {
    let base = read(&cli.base_config)?;
    let batches = read(&cli.batches)?;

    let output = merge_documents(&base, &batches, index)?;

    let merged = render(&output.merged)?;
    match &cli.output {
        Some(path) => write(path, &merged)?,
        None => print!("{merged}"),
    }
    if let Some(path) = &cli.batch_output {
        write(path, &render(&output.batch)?)?;
    }

    tracing::info!(worker_index = index, "configuration dispatched");
    Ok(())
}

fn read(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn write(path: &Path, contents: &str) -> anyhow::Result<()> {
    std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))
}
