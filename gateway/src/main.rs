use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use clap::Parser;
use tokio::signal;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use floodgate_core::config::Config;
use floodgate_core::db::postgres::manual_run_postgres_migrations;
use floodgate_core::endpoints;
use floodgate_core::endpoints::admission::rate_limit_middleware;
use floodgate_core::endpoints::status::FLOODGATE_VERSION;
use floodgate_core::gateway_util::GatewayHandle;
use floodgate_core::observability::{self, LogFormat};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to a floodgate.toml config file. Incompatible with `--default-config`
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Use the default configuration. Incompatible with `--config-file`
    #[arg(long)]
    default_config: bool,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,

    /// Run database migrations manually then exit.
    #[arg(long)]
    run_migrations_only: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs immediately, so that we can use `tracing`. Debug-level
    // logging is enabled later, once the config file has been parsed.
    let observability_handle = observability::setup_observability(args.log_format)
        .expect_pretty("Failed to set up logs");

    if args.run_migrations_only {
        manual_run_postgres_migrations()
            .await
            .expect_pretty("Failed to run migrations");
        return;
    }

    tracing::info!("Starting Floodgate Gateway {FLOODGATE_VERSION}");

    if args.config_file.is_some() && args.default_config {
        tracing::error!("Cannot specify both `--config-file` and `--default-config`");
        std::process::exit(1);
    }

    let config = if let Some(path) = &args.config_file {
        Arc::new(Config::load_from_path(path).expect_pretty(&format!(
            "Failed to load config file `{}`",
            path.display()
        )))
    } else {
        if !args.default_config {
            tracing::warn!(
                "No config file provided; starting with default settings. \
                 Use `--config-file path/to/floodgate.toml` to specify one."
            );
        }
        Arc::new(Config::default())
    };

    if config.gateway.debug {
        observability_handle
            .delayed_debug_logs
            .enable_debug()
            .expect_pretty("Failed to enable debug logs");
    }

    let metrics_handle = observability::setup_metrics().expect_pretty("Failed to set up metrics");

    let gateway_handle = GatewayHandle::new(config.clone())
        .await
        .expect_pretty("Failed to initialize application state");
    let app_state = gateway_handle.app_state.clone();

    let api_routes = Router::new()
        .route(
            "/v1/sync/webhook/{source}",
            post(endpoints::sync_queue::sync_webhook_handler),
        )
        // Everything above this layer is subject to admission control.
        .layer(from_fn_with_state(app_state.clone(), rate_limit_middleware))
        .route(
            "/v1/admin/rate-limits",
            get(endpoints::rules::list_rules_handler).post(endpoints::rules::create_rule_handler),
        )
        .route(
            "/v1/admin/rate-limits/{id}",
            get(endpoints::rules::get_rule_handler)
                .put(endpoints::rules::update_rule_handler)
                .delete(endpoints::rules::delete_rule_handler),
        )
        .route(
            "/v1/admin/sync-queue",
            get(endpoints::sync_queue::list_sync_items_handler),
        )
        .route(
            "/v1/admin/sync-queue/{id}",
            get(endpoints::sync_queue::get_sync_item_handler),
        )
        .route("/status", get(endpoints::status::status_handler))
        .route("/health", get(endpoints::status::health_handler))
        .route(
            "/metrics",
            get(move || std::future::ready(metrics_handle.render())),
        );

    let base_path = config.gateway.base_path.as_deref().unwrap_or("/");
    let base_path = base_path.trim_end_matches('/');

    // The path was just `/` (or multiple slashes)
    let router = if base_path.is_empty() {
        Router::new().merge(api_routes)
    } else {
        Router::new().nest(base_path, api_routes)
    };

    let router = router
        .fallback(endpoints::fallback::handle_404)
        // Failed requests are logged at DEBUG, since our errors already
        // log themselves on construction.
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state);

    // Bind to the socket address specified in the config, or default to 0.0.0.0:3000
    let bind_address = config
        .gateway
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };

    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    tracing::info!("Floodgate Gateway is listening on {actual_bind_address}");

    if base_path.is_empty() {
        tracing::info!("├ API Base Path: /");
    } else {
        tracing::info!("├ API Base Path: {base_path}");
    }

    if let Some(path) = &args.config_file {
        tracing::info!("├ Configuration: {}", path.display());
    } else {
        tracing::info!("├ Configuration: default");
    }

    if gateway_handle.app_state.postgres_connection_info.is_enabled() {
        tracing::info!("├ Postgres: enabled");
    } else {
        tracing::info!("├ Postgres: disabled (rate limits fail open, sync queue inactive)");
    }

    if config.sync_queue.enabled {
        tracing::info!(
            "└ Sync Queue: enabled (poll_interval_ms = {}, batch_size = {})",
            config.sync_queue.poll_interval_ms,
            config.sync_queue.batch_size
        );
    } else {
        tracing::info!("└ Sync Queue: disabled");
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");

    tracing::info!("Shutting down sync queue processor");
    gateway_handle.shutdown().await;
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// ┌──────────────────────────────────────────────────────────────────────────┐
/// │                           MAIN.RS ESCAPE HATCH                           │
/// └──────────────────────────────────────────────────────────────────────────┘
///
/// We don't allow panic, escape, unwrap, or similar methods in the codebase,
/// except for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code to
/// handle errors gracefully.
///
/// We use `expect_pretty` for better DX when handling errors in main.rs.
/// `expect_pretty` will print an error message and exit with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
