//! `drivechatd` — the DriveChat command and task server.
//!
//! Usage:
//!   drivechatd -c <context-name-or-path> [--listen <addr>]
//!
//! The context name resolves to `/etc/drivechat/<name>.toml`.
//! If a path with `/` or `.` is given, it's used directly.

mod auth;
mod bootstrap;
mod config;
mod routes;

use std::sync::Arc;

use clap::Parser;
use drivechat_core::Module;
use tracing::info;

use auth::JwtAuthenticator;
use config::ServerConfig;

/// DriveChat server.
#[derive(Parser, Debug)]
#[command(name = "drivechatd", about = "DriveChat command and task server")]
struct Cli {
    /// Context name or path to config file.
    #[arg(short = 'c', long = "config", required = true)]
    config: String,

    /// Listen address (overrides the config file; default 0.0.0.0:8080).
    #[arg(long = "listen")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Load server configuration.
    let config_path = ServerConfig::resolve_path(&cli.config);
    info!("Loading configuration from {}", config_path.display());
    let server_config = ServerConfig::load(&config_path)?;

    bootstrap::verify_config(&server_config)?;

    // Initialize storage.
    let data_dir = std::path::PathBuf::from(&server_config.storage.data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let mut core_config = drivechat_core::ServiceConfig {
        data_dir: Some(data_dir),
        ..Default::default()
    };
    if let Some(listen) = cli.listen.or(server_config.listen.clone()) {
        core_config.listen = listen;
    }

    let sql: Arc<dyn drivechat_sql::SQLStore> = Arc::new(
        drivechat_sql::SqliteStore::open(&core_config.resolve_sqlite_path())
            .map_err(|e| anyhow::anyhow!("failed to open SQL store: {e}"))?,
    );

    let authenticator: Arc<dyn drivechat_core::Authenticator> =
        Arc::new(JwtAuthenticator::new(&server_config.jwt.secret));

    let task_module = task::TaskModule::new(
        Arc::clone(&sql),
        authenticator,
        server_config.tasks.clone(),
    )?;
    info!(
        "Task module initialized (poll_interval={}ms, log_tail={})",
        server_config.tasks.poll_interval_ms, server_config.tasks.log_tail
    );

    let module_routes = vec![(task_module.name(), task_module.routes())];
    let app = routes::build_router(module_routes);

    // Start server.
    let listener = tokio::net::TcpListener::bind(&core_config.listen).await?;
    info!("DriveChat server listening on {}", core_config.listen);
    axum::serve(listener, app).await?;

    Ok(())
}
