use std::sync::Arc;

use clap::Parser;
use relay_domain::config::ConfigSeverity;
use relay_gateway::cli::{self, Cli, Command, ConfigCommand};
use relay_gateway::state::AppState;
use relay_gateway::{api, ws};
use relay_sessions::{PersistenceStore, SessionRegistry, SessionRegistryConfig};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,relay_gateway=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
        Command::Doctor => {
            let (config, path) = cli::load_config()?;
            let ok = relay_gateway::cli::doctor::run(&config, &path).await?;
            std::process::exit(if ok { 0 } else { 1 })
        }
        Command::Config(cmd) => {
            let (config, _path) = cli::load_config()?;
            match cmd {
                ConfigCommand::Show => relay_gateway::cli::config::show(&config)?,
                ConfigCommand::Validate => {
                    let ok = relay_gateway::cli::config::validate(&config);
                    std::process::exit(if ok { 0 } else { 1 });
                }
            }
            Ok(())
        }
        Command::Version => {
            println!("relay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn serve() -> anyhow::Result<()> {
    init_tracing();

    let (config, path) = cli::load_config()?;
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Error => tracing::error!("{issue}"),
            ConfigSeverity::Warning => tracing::warn!("{issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("invalid configuration in {path}, see logged errors above");
    }
    let config = Arc::new(config);

    let persistence = PersistenceStore::new(config.workspace.state_path.join("bridge-sessions.json"));
    persistence.load_from_disk().await;

    let registry_config = SessionRegistryConfig {
        max_sessions: config.sessions.max_sessions,
        idle_timeout_ms: config.sessions.idle_timeout_ms,
        default_cwd: config.sessions.default_cwd.clone(),
        persistent_path: config.backends.persistent_path.clone(),
        ephemeral_path: config.backends.ephemeral_path.clone(),
        ephemeral_models: config.backends.ephemeral_models.clone(),
        mcp_config: config.backends.mcp_config.clone(),
        append_system_prompt: config.backends.append_system_prompt.clone(),
    };
    let registry = SessionRegistry::new(registry_config, persistence);
    registry.start_sweeper();

    let state = AppState::new(config.clone(), registry.clone());

    let shutdown = CancellationToken::new();
    if config.bot.is_configured() {
        let bot_state = state.clone();
        let bot_shutdown = shutdown.clone();
        tokio::spawn(async move {
            ws::run(bot_state, bot_shutdown).await;
        });
    }

    let cors = build_cors_layer(&config.server.cors.allowed_origins);

    let app = api::router()
        .with_state(state.clone())
        .layer(tower::limit::ConcurrencyLimitLayer::new(64))
        .layer(cors);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "relay gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry.stop_all().await;
    Ok(())
}

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<_> = allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new().allow_origin(AllowOrigin::list(origins))
}


async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
