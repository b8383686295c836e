use std::{net::SocketAddr, path::Path};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Process-wide logging and metrics. Created once in `main` before any
/// component starts and shut down after the relay has stopped.
pub struct Telemetry {
    file_guard: Option<WorkerGuard>,
}

impl Telemetry {
    pub fn init(config: &LoggingConfig) -> Result<Self> {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(tracing_directive(&config.level)));

        let console_layer = config
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_target(false).boxed());

        let mut file_guard = None;
        let file_layer = if config.enable_file_logging {
            let (writer, guard) = file_writer(&config.file)?;
            file_guard = Some(guard);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        if let Some(listen) = &config.metrics_listen {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("invalid metrics listen address: {listen}"))?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("failed to install Prometheus exporter")?;
            info!(%addr, "prometheus exporter listening");
        }

        Ok(Self { file_guard })
    }

    /// Flushes buffered file output.
    pub fn shutdown(mut self) {
        if let Some(guard) = self.file_guard.take() {
            drop(guard);
        }
    }
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let directory = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("failed to create log directory {}", directory.display()))?;
    let appender = tracing_appender::rolling::never(directory, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Maps configured level names onto tracing directives.
pub fn tracing_directive(level: &str) -> &'static str {
    match level.to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warning" | "warn" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

#[cfg(test)]
mod tests {
    use super::tracing_directive;

    #[test]
    fn level_names_map_to_directives() {
        assert_eq!(tracing_directive("debug"), "debug");
        assert_eq!(tracing_directive("warning"), "warn");
        assert_eq!(tracing_directive("critical"), "error");
        assert_eq!(tracing_directive("INFO"), "info");
        assert_eq!(tracing_directive("unknown"), "info");
    }
}
