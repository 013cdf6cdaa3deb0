use muxd::backend::BackendFactory;
use muxd::config::{BackendKind, Config};
use muxd::docker::DockerFactory;
use muxd::health::HealthServer;
use muxd::kubernetes::{kube_client, KubePodApi, KubernetesFactory};
use muxd::server::{ServerState, TcpServer};
use muxd::tls;
use muxd::ws::WsServer;
use muxd::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("muxd=info".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("muxd.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        anyhow::anyhow!(e)
    })?;

    info!(
        name = PKG_NAME,
        version = VERSION,
        path = %config_path.display(),
        "Starting multiplexer"
    );

    let factory = build_factory(&config).await?;
    let state = Arc::new(ServerState::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Health endpoint (0 disables).
    let health_handle = if config.frontend.health_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.frontend.health_port));
        let health = HealthServer::bind(addr, Arc::clone(&state), shutdown_rx.clone()).await?;
        Some(tokio::spawn(async move {
            if let Err(e) = health.run().await {
                error!(error = %e, "Health server error");
            }
        }))
    } else {
        None
    };

    // Optional WebSocket front door.
    let ws_handle = if config.frontend.ws_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.frontend.ws_port));
        let ws_server = WsServer::bind(
            addr,
            Arc::clone(&factory),
            Arc::clone(&state),
            shutdown_rx.clone(),
        )
        .await?;
        Some(tokio::spawn(async move {
            if let Err(e) = ws_server.run().await {
                error!(error = %e, "WebSocket server error");
            }
        }))
    } else {
        None
    };

    // Main TCP front door, plain or TLS.
    let addr = SocketAddr::from(([0, 0, 0, 0], config.frontend.port));
    let mut server = TcpServer::bind(
        addr,
        Arc::clone(&factory),
        Arc::clone(&state),
        shutdown_rx.clone(),
    )
    .await?;

    if config.frontend.tls {
        let cert = config
            .frontend
            .cert
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("frontend.tls requires frontend.cert"))?;
        let key = config
            .frontend
            .key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("frontend.tls requires frontend.key"))?;
        server = server.with_tls(tls::server_acceptor(cert, key)?);
    }
    if config.frontend.remote_tls {
        server = server.with_remote_tls(tls::insecure_connector());
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await;

    // Broadcast shutdown; the servers stop accepting and drain their pipes.
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(65), async {
        let _ = server_handle.await;
        if let Some(handle) = ws_handle {
            let _ = handle.await;
        }
        if let Some(handle) = health_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

async fn build_factory(config: &Config) -> anyhow::Result<Arc<dyn BackendFactory>> {
    match config.backend.kind {
        BackendKind::Docker => {
            let image = config
                .backend
                .image
                .clone()
                .ok_or_else(|| anyhow::anyhow!("backend.image is required for docker"))?;
            info!(image = %image, port = config.backend.port, "Using Docker backends");
            Ok(Arc::new(DockerFactory::new(
                image,
                config.backend.port,
                config.backend.network.clone(),
            )))
        }
        BackendKind::Kubernetes => {
            let label_selector = config
                .backend
                .label_selector
                .clone()
                .ok_or_else(|| anyhow::anyhow!("backend.label_selector is required for kubernetes"))?;
            info!(
                label_selector = %label_selector,
                namespace = %config.backend.namespace,
                "Using Kubernetes backends"
            );
            let client = kube_client(config.backend.kubeconfig.as_deref()).await?;
            let api = Arc::new(KubePodApi::new(client, &config.backend.namespace));
            Ok(Arc::new(KubernetesFactory::new(
                api,
                &config.backend.namespace,
                label_selector,
                config.backend.port,
            )))
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for Ctrl+C");
    info!("Received Ctrl+C, shutting down...");
}
