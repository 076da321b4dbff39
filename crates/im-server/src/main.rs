//! im-server: IM gateway.
//!
//! Accepts authenticated WebSocket clients, multiplexes their sessions onto a
//! single upstream bus connection, and routes bus envelopes back to the
//! owning client.

mod auth;
mod bridge;
mod bus;
mod config;
mod device;
mod server;
mod session;

use clap::Parser;
use config::{CliOverrides, LogConfig, ServerConfig};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// im-server: session-multiplexing IM gateway
#[derive(Parser, Debug)]
#[command(name = "im-server", version, about = "Session-multiplexing IM gateway")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Client WebSocket port
    #[arg(long)]
    ws_port: Option<u16>,

    /// Bus listener port
    #[arg(long)]
    bus_port: Option<u16>,

    /// Shared token secret (overrides server.token)
    #[arg(long)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        ws_port: cli.ws_port,
        bus_port: cli.bus_port,
        token: cli.token,
        log_level: cli.log_level,
    };

    // Config is loaded before tracing exists, so load errors go to stderr.
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("im-server: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let _guard = init_tracing(&server_config.log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        ws_addr = %server_config.ws_addr,
        bus_addr = %server_config.bus_addr,
        "starting im-server"
    );
    if server_config.skip_expiry {
        warn!("auth.skip_expiry is set: expired device tokens are accepted");
    }

    if let Err(e) = server::run(server_config, shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("im-server stopped");
}

/// Console logging, plus a daily rolling file when `log.dir` is set.
///
/// The returned guard flushes the file writer and must live until exit.
fn init_tracing(log: &LogConfig) -> Option<WorkerGuard> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let console_layer = fmt::layer().with_target(false);

    let mut file_error = None;
    let (file_layer, guard) = match &log.dir {
        Some(dir) => match RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(&log.file)
            .max_log_files(log.max_files)
            .build(dir)
        {
            Ok(appender) => {
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                file_error = Some(format!("{}: {e}", dir.display()));
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        warn!(error = %e, "file logging disabled");
    }
    guard
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
