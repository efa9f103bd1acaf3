//! Main entry point for the llamafile load-balancing proxy

use llamafile_proxy::{
    api,
    backend::{
        launcher::{LaunchedInstance, Launcher},
        registry::InstanceRegistry,
    },
    config::{LoggingConfig, Settings},
    AppError, AppState,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load_from_path(path)?,
        None => Settings::load()?,
    };

    init_logging(&settings.logging);
    info!("Starting llamafile proxy");

    // Register backends before anything listens
    let registry = Arc::new(InstanceRegistry::new());
    let launched = populate_registry(&settings, &registry).await?;

    if registry.is_empty() {
        error!("No instances registered; refusing to serve an empty pool");
        return Err(AppError::NoInstancesAvailable.into());
    }
    info!(ports = ?registry.ports(), "Instance pool ready");

    let addr = settings.bind_address();
    let health_interval = settings.health.interval_secs;

    let app_state = Arc::new(AppState::new(settings, registry)?);

    if health_interval > 0 {
        app_state.health_manager.start(health_interval).await;
    }

    // Build the router
    let app = api::routes::create_router(app_state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Load balancer proxy started on http://{}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    app_state.health_manager.stop().await;
    info!(instances = launched.len(), "Proxy shut down, stopping launched instances");
    drop(launched);

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Register configured instances, then launch any from the commands file.
async fn populate_registry(
    settings: &Settings,
    registry: &InstanceRegistry,
) -> anyhow::Result<Vec<LaunchedInstance>> {
    for instance in &settings.instances {
        registry.add(instance.host.clone(), instance.port)?;
    }

    let mut launched = Vec::new();
    if !settings.launcher.enabled {
        return Ok(launched);
    }

    let commands_file = &settings.launcher.commands_file;
    if !Path::new(commands_file).exists() {
        warn!(commands_file = %commands_file, "Commands file not found, launching nothing");
        return Ok(launched);
    }

    let launcher = Launcher::new(settings.launcher.clone());
    for instance in launcher.launch_all().await? {
        registry.add(launcher.host(), instance.port)?;
        launched.push(instance);
    }

    Ok(launched)
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
