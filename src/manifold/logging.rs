use std::io;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::manifold::config::{LogFormat, LogOutput, LoggingConfig};

/// Keeps the background log writer alive; dropping it stops flushing.
#[must_use]
pub struct LogGuard {
    _guard: WorkerGuard,
}

/// Installs the global subscriber. `RUST_LOG` wins over `LOG_LEVEL`, and the
/// level accepts any env-filter directive, not just a bare level name.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .with_context(|| format!("logging: bad LOG_LEVEL {:?}", cfg.level))?;

    let (writer, guard) = match &cfg.output {
        LogOutput::Stderr => tracing_appender::non_blocking(io::stderr()),
        LogOutput::Stdout => tracing_appender::non_blocking(io::stdout()),
        LogOutput::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
    };

    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_target(true);
    let fmt = match cfg.format {
        LogFormat::Text => fmt.boxed(),
        LogFormat::Json => fmt.json().boxed(),
    };

    tracing_subscriber::registry().with(filter).with(fmt).init();

    Ok(LogGuard { _guard: guard })
}
