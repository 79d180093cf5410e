//! Logging and metrics setup.
//!
//! Logging is initialized before the config file is parsed, so verbosity
//! changes driven by the config (`gateway.debug`) go through a delayed
//! handle backed by a reloadable filter. Violation and decision events
//! are exported as Prometheus metrics for the external monitoring
//! collaborator; there is no tracing exporter here.

use clap::ValueEnum;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

use crate::error::{Error, ErrorDetails};

#[derive(Clone, Debug, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

const DEFAULT_DIRECTIVES: &str = "warn,floodgate_core=info,gateway=info";
const DEBUG_DIRECTIVES: &str = "warn,floodgate_core=debug,gateway=debug";

/// Allows raising verbosity after logging is already initialized.
/// The gateway enables this once the config file reports `debug = true`.
pub struct DelayedDebugLogs {
    enable_cb: Box<dyn FnOnce() -> Result<(), Error> + Send + Sync>,
}

impl DelayedDebugLogs {
    pub fn enable_debug(self) -> Result<(), Error> {
        (self.enable_cb)()
    }
}

pub struct ObservabilityHandle {
    pub delayed_debug_logs: DelayedDebugLogs,
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the
/// default directives when set.
pub fn setup_observability(log_format: LogFormat) -> Result<ObservabilityHandle, Error> {
    let base_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let (filter, reload_handle) = reload::Layer::new(base_filter);

    let registry = Registry::default().with(filter);
    let init_result = match log_format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    init_result.map_err(|e| {
        Error::new_without_logging(ErrorDetails::Observability {
            message: format!("Failed to initialize tracing subscriber: {e}"),
        })
    })?;

    let delayed_debug_logs = DelayedDebugLogs {
        enable_cb: Box::new(move || {
            reload_handle
                .modify(|filter| *filter = EnvFilter::new(DEBUG_DIRECTIVES))
                .map_err(|e| {
                    Error::new(ErrorDetails::Observability {
                        message: format!("Failed to enable debug logs: {e}"),
                    })
                })
        }),
    };

    Ok(ObservabilityHandle { delayed_debug_logs })
}

/// Installs the global Prometheus recorder and returns the handle the
/// `/metrics` route renders from.
pub fn setup_metrics() -> Result<PrometheusHandle, Error> {
    PrometheusBuilder::new().install_recorder().map_err(|e| {
        Error::new_without_logging(ErrorDetails::Observability {
            message: format!("Failed to install Prometheus recorder: {e}"),
        })
    })
}
