//! Logging for the harness binaries.
//!
//! Three situations with different needs:
//!
//! - [`init_service`]: the projection service runs for days, so it writes
//!   machine-readable JSON with daily rotation and bounded retention.
//! - [`init_step`]: a step invocation is a bounded job; its host-side
//!   diagnostics append to one plain-text file under the harness log tree
//!   (the agent's own output lands in the project's `logs/step-<id>/`
//!   separately, via the orchestrator).
//! - [`init_quiet`]: one-shot subcommands print their results on stdout,
//!   so diagnostics stay on stderr and default to warnings.
//!
//! All modes honor `RUST_LOG`.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Rotated service log files kept on disk before the oldest is pruned.
const SERVICE_LOG_RETENTION: usize = 14;

/// Name of the append-only step diagnostics file.
const STEP_LOG_FILE: &str = "step.log";

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes buffered entries and closes the file, so
/// callers hold it for the lifetime of the command.
pub struct LoggingGuard {
    _writer: WorkerGuard,
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Logging for `serve`.
///
/// JSON entries go to `{logs_dir}/laforge.<date>.log` with daily rotation;
/// only the most recent [`SERVICE_LOG_RETENTION`] files are kept, so an
/// unattended deployment cannot fill the disk. A human-readable copy goes
/// to stderr.
///
/// # Errors
///
/// Returns an error when the log directory is unusable or logging was
/// already initialised in this process.
pub fn init_service(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("cannot create log dir {}", logs_dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("laforge")
        .filename_suffix("log")
        .max_log_files(SERVICE_LOG_RETENTION)
        .build(logs_dir)
        .with_context(|| format!("cannot open service log dir {}", logs_dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter("info"))
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("logging already initialised")?;

    Ok(LoggingGuard { _writer: guard })
}

/// Logging for a `step` invocation.
///
/// Host-side diagnostics append to `{logs_dir}/step.log` as plain text
/// (one file across runs; each run is bounded, and the interesting
/// per-step record is the captured container output the orchestrator
/// stores elsewhere). Stderr gets the same stream for the operator
/// watching the run.
///
/// # Errors
///
/// Returns an error when the log file cannot be opened or logging was
/// already initialised in this process.
pub fn init_step(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("cannot create log dir {}", logs_dir.display()))?;
    let path = logs_dir.join(STEP_LOG_FILE);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("cannot open step log {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(filter("info"))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("logging already initialised")?;

    Ok(LoggingGuard { _writer: guard })
}

/// Console-only logging for one-shot subcommands.
///
/// Stdout belongs to command output (task listings, JSON); diagnostics go
/// to stderr and default to warnings. Double initialisation is tolerated
/// so library consumers embedding the CLI paths never panic.
pub fn init_quiet() {
    let _ = tracing_subscriber::registry()
        .with(filter("warn"))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
