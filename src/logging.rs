//! Log output wiring for the orchestrator.
//!
//! Everything human-facing goes to stderr, leaving stdout to the
//! sandboxed command so its output stays pipeable. When the awf data
//! directory is writable, the same events are mirrored as daily-rotated
//! JSON lines with flattened fields, the shape the awf log tooling
//! ingests.

use std::io;
use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the background JSON writer alive until the run ends; dropping it
/// flushes anything buffered.
#[must_use]
pub struct Logging {
    _file_guard: Option<WorkerGuard>,
}

/// Wire up the global subscriber.
///
/// `level` seeds the filter when `RUST_LOG` is unset. Passing a logs
/// directory adds the JSON mirror; `None` means stderr only. Nothing is
/// installed globally until every fallible step has succeeded, so a
/// failed call can be retried with different arguments.
///
/// # Errors
///
/// Returns an error when `level` is not a valid filter directive or the
/// logs directory cannot be created.
pub fn init(level: &str, logs_dir: Option<&Path>) -> anyhow::Result<Logging> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log level {level:?}"))?,
    };

    let file = logs_dir
        .map(|dir| {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create log directory {}", dir.display()))?;
            Ok::<_, anyhow::Error>(tracing_appender::non_blocking(
                tracing_appender::rolling::daily(dir, "awf.json"),
            ))
        })
        .transpose()?;

    let (json_layer, guard) = match file {
        Some((writer, guard)) => {
            let layer = fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .with(json_layer)
        .init();

    Ok(Logging { _file_guard: guard })
}
