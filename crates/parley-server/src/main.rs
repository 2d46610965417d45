//! parley-server binary.

use clap::Parser;
use parley_server::config::ServerConfig;
use parley_server::server::ChatServer;
use parley_server::store::sqlite::SqliteStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// parley-server: one-to-one chat relay
#[derive(Parser, Debug)]
#[command(name = "parley-server", version, about = "One-to-one chat relay over WebSocket")]
struct Cli {
    /// Listen port
    #[arg(short, long, env = "PARLEY_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database file
    #[arg(long, env = "PARLEY_DB_PATH")]
    db: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.parley/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.port,
        cli.bind.as_deref(),
        cli.db.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.listen_addr(),
        db = %config.db_path.display(),
        "starting parley-server"
    );

    let store = match SqliteStore::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, path = %config.db_path.display(), "failed to open database");
            std::process::exit(1);
        }
    };

    let server = ChatServer::new(config, Arc::new(store));
    let listener = match server.bind().await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to bind");
            std::process::exit(1);
        }
    };

    let report = server.serve(listener, shutdown_signal()).await;
    info!(
        notified = report.notified,
        forced = report.forced,
        "parley-server stopped"
    );
}

/// Wait for SIGTERM, SIGINT (Ctrl+C), or `exit` typed on stdin.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
        _ = stdin_exit() => info!("operator requested exit"),
    }
}

/// Resolve when a line reading `exit` arrives on stdin. Never resolves if
/// stdin is closed or not readable.
async fn stdin_exit() {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim() == "exit" => return,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    std::future::pending::<()>().await;
}
