use std::net::SocketAddr;

use app::build_router;
use config::BridgeConfig;
use dispatcher::Dispatcher;
use launch::LaunchSpec;
use registry::SessionRegistry;

pub mod app;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod framing;
pub mod launch;
pub mod process;
pub mod registry;
pub mod rpc;
pub mod session;
pub mod sink;
pub mod timers;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub launch: LaunchSpec,
    pub bridge: BridgeConfig,
}

pub async fn run_server(
    config: ServerConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing::info!(
        command = %config.launch.display(),
        request_timeout_ms = config.bridge.request_timeout.as_millis() as u64,
        session_idle_timeout_ms = config.bridge.session_idle_timeout.as_millis() as u64,
        session_max_lifetime_ms = config.bridge.session_max_lifetime.as_millis() as u64,
        initialization_timeout_ms = config.bridge.initialization_timeout.as_millis() as u64,
        "bridge configuration"
    );
    let registry = SessionRegistry::start(config.launch, config.bridge);
    run_server_with_registry(config.host, config.port, registry).await
}

pub async fn run_server_with_registry(
    host: String,
    port: u16,
    registry: SessionRegistry,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = build_router(Dispatcher::new(registry.clone()));
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "mcp-session-bridge listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(registry))
    .await?;
    Ok(())
}

async fn shutdown_signal(registry: SessionRegistry) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, cleaning up sessions");
    registry.shutdown().await;
}
