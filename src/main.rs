mod models;
mod handlers;
mod routes;
mod docs;
mod config;
mod datasafe;
mod ws;

use chrono::{DateTime, Utc};
use config::Config;
use datasafe::DataSafeRegistry;
use routes::build_app;
use std::panic;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use ws::registry::{SessionRegistry, SessionSettings};

/// State shared by every request handler
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            sessions,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "colabri_writer=debug,tower_http=debug,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });
    if config.is_development() {
        info!("Running in development mode (log level {})", config.log_level);
    }

    // Open the storage backend, the server is useless without it
    let backends = DataSafeRegistry::with_builtin();
    let datasafe = match backends.open(&config.datasafe, &config.datasafe_config).await {
        Ok(datasafe) => datasafe,
        Err(e) => {
            error!("Failed to open datasafe: {}", e);
            error!("Known datasafes: {:?}", backends.names());
            std::process::exit(1);
        }
    };
    if !datasafe.is_durable() {
        warn!("Storage backend is not durable, documents are lost on restart");
    }

    let sessions = SessionRegistry::new(
        datasafe,
        SessionSettings {
            grace: config.sync_interval(),
            save_interval: config.save_interval(),
        },
    );
    match config.gc_interval() {
        Some(every) => sessions.spawn_reaper(every),
        None => info!("Session reaper disabled"),
    }

    let address = config.server_address();
    let server_path = config.server_path.clone();
    let app = build_app(AppState::new(config, sessions.clone()));

    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            sessions.shutdown().await;
            std::process::exit(1);
        }
    };

    info!("🚀 Server running on http://{}{}/", address, server_path);
    info!("📚 Swagger UI available at http://{}/swagger", address);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = served {
        error!("Server error: {}", e);
    }

    sessions.shutdown().await;
    info!("Server stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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
