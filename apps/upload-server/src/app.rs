//! Application orchestrator — wires storage, service, reaper and server together.

use std::sync::Arc;

use chunkup_server::{ServerConfig, UploadServer};
use chunkup_transfer::{LocalStorage, SessionStore, UploadService};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::handler::UploadHandler;

/// A started server and its background tasks.
pub struct Running {
    pub server: Arc<UploadServer<UploadHandler>>,
    pub service: Arc<UploadService>,
    pub port: u16,
    cancel: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
    reaper_task: tokio::task::JoinHandle<()>,
}

impl Running {
    /// Stops the reaper and the server and waits for both.
    pub async fn shutdown(self) {
        tracing::info!("stopping services...");
        self.cancel.cancel();
        self.server.shutdown();
        let _ = self.reaper_task.await;
        let _ = self.server_task.await;
    }
}

/// Recovers persisted sessions and starts the reaper and WebSocket server.
pub async fn start(config: &Config) -> anyhow::Result<Running> {
    let cancel = CancellationToken::new();

    // -- Storage --
    tokio::fs::create_dir_all(&config.storage_root).await?;
    let storage = Arc::new(LocalStorage::new(&config.storage_root));
    let store = Arc::new(SessionStore::new(storage));

    let report = store.recover().await?;
    tracing::info!(
        restored = report.restored,
        removed = report.removed,
        root = %config.storage_root.display(),
        "pending uploads recovered"
    );

    let service = Arc::new(UploadService::new(store, config.service_options()));

    // -- Reaper --
    let reaper = service.reaper(config.session_ttl(), config.sweep_interval());
    let reaper_task = tokio::spawn(reaper.run(cancel.clone()));

    // -- WS server --
    let handler = UploadHandler::new(Arc::clone(&service));
    let server = UploadServer::new(ServerConfig { port: config.port }, handler);
    let server_run = Arc::clone(&server);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server_run.run().await {
            tracing::error!("server error: {e}");
        }
    });

    // Wait for the server to bind.
    let port = loop {
        let p = server.port().await;
        if p > 0 {
            break p;
        }
        if server_task.is_finished() {
            anyhow::bail!("server failed to start on port {}", config.port);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    tracing::info!(port, "WebSocket server listening");

    Ok(Running {
        server,
        service,
        port,
        cancel,
        server_task,
        reaper_task,
    })
}

/// Runs the server until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let running = start(&config).await?;
    tracing::info!("upload server ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    running.shutdown().await;
    Ok(())
}
