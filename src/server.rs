//! Hub assembly and lifecycle
//!
//! Wires the core services onto a gateway and a metadata store, runs the
//! webhook worker and scheduler beside the HTTP server, and drives graceful
//! shutdown: stop accepting, let sockets drain until the grace deadline,
//! then force-close. Background workers leave in-flight stream state for
//! the next instance.

use crate::api::{self, AppState};
use crate::config::HubConfig;
use crate::consumer::ConsumerManager;
use crate::dlq::DlqService;
use crate::error::{HubError, Result};
use crate::publish::Publisher;
use crate::schedule::SchedulerService;
use crate::store::MetadataStore;
use crate::stream::StreamGateway;
use crate::webhook::{Deliverer, WebhookWorker};
use crate::ws::SessionDeps;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A fully wired hub instance
pub struct Hub {
    pub state: AppState,
    worker: Arc<WebhookWorker>,
    scheduler: Arc<SchedulerService>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Wire the services onto a gateway and metadata store
    pub fn build<S>(config: HubConfig, gateway: Arc<dyn StreamGateway>, store: Arc<S>) -> Self
    where
        S: MetadataStore + 'static,
    {
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let publisher = Arc::new(Publisher::new(
            gateway.clone(),
            store.clone(),
            config.stream.max_payload,
        ));
        let consumers = Arc::new(ConsumerManager::new(
            gateway.clone(),
            config.session.prefetch,
        ));
        let dlq = Arc::new(DlqService::new(gateway.clone(), publisher.clone()));
        let scheduler = Arc::new(SchedulerService::new(
            store.clone(),
            publisher.clone(),
            config.scheduler.clone(),
        ));
        let deliverer = Arc::new(Deliverer::new(store.clone(), &config.webhook));
        let worker = Arc::new(WebhookWorker::new(
            gateway.clone(),
            store.clone(),
            dlq.clone(),
            deliverer,
            config.webhook.clone(),
        ));
        let session_deps = Arc::new(SessionDeps {
            consumers: consumers.clone(),
            dlq: dlq.clone(),
            config: config.session.clone(),
        });

        let state = AppState {
            publisher,
            consumers,
            dlq,
            scheduler: scheduler.clone(),
            store,
            gateway,
            session_deps,
            shutdown: shutdown.clone(),
            config,
        };

        Self {
            state,
            worker,
            scheduler,
            shutdown,
        }
    }

    /// Token observed by every session and background worker
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token fires
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let shutdown = self.shutdown.clone();
        let grace = Duration::from_secs(self.state.config.server.shutdown_grace_secs);

        let worker_task = tokio::spawn(self.worker.clone().run(shutdown.clone()));
        let scheduler_task = tokio::spawn(self.scheduler.clone().run(shutdown.clone()));

        let addr = listener
            .local_addr()
            .map_err(|e| HubError::Connection(e.to_string()))?;
        tracing::info!(addr = %addr, "Hub listening");

        let app = api::router(self.state);
        let server = axum::serve(listener, app).with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        });
        let mut server_task = tokio::spawn(server.into_future());

        tokio::select! {
            res = &mut server_task => {
                res.map_err(|e| HubError::Connection(e.to_string()))?
                    .map_err(|e| HubError::Connection(e.to_string()))?;
            }
            _ = shutdown.cancelled() => {
                // Existing sockets drain until the deadline, then force-close
                if tokio::time::timeout(grace, &mut server_task).await.is_err() {
                    tracing::warn!("Shutdown grace elapsed, force-closing connections");
                    server_task.abort();
                }
            }
        }

        let _ = worker_task.await;
        let _ = scheduler_task.await;
        tracing::info!("Hub stopped");
        Ok(())
    }
}
