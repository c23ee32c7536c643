use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use taskdeck_common::types::Plan;

use crate::config::ClientConfig;
use crate::connection::ws::WsConnector;
use crate::connection::{ConnectionHandle, ConnectionManager, Connector, SyncContext, SyncSignal};
use crate::handlers::HandlerRegistry;
use crate::hydration::{HttpSnapshotSource, HydrationScope, Reconciler, SnapshotSource};
use crate::rpc::plans::{self, PlanDraft};
use crate::rpc::{RequestChannel, RequestError};
use crate::store::Store;

/// Everything one session of use needs: the store, the handlers feeding it,
/// the request channel and the connection manager.
pub struct SyncClient<C: Connector = WsConnector, S: SnapshotSource = HttpSnapshotSource> {
    config: ClientConfig,
    context: SyncContext,
    manager: ConnectionManager<C>,
    reconciler: Arc<Reconciler<S>>,
}

impl SyncClient {
    /// Client talking to the configured backend over WebSocket and HTTP.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let source = HttpSnapshotSource::from_config(&config).context("invalid backend url")?;
        let connector = WsConnector::new(config.heartbeat());
        Ok(Self::with_parts(config, connector, source))
    }
}

impl<C: Connector, S: SnapshotSource + 'static> SyncClient<C, S> {
    pub fn with_parts(config: ClientConfig, connector: C, source: S) -> Self {
        let store = Arc::new(Store::new());
        let registry = Arc::new(HandlerRegistry::with_default_handlers(&store));
        let requests = Arc::new(RequestChannel::new(config.request_timeout()));
        let context = SyncContext { store: Arc::clone(&store), registry, requests };
        let manager = ConnectionManager::new(connector, context.clone())
            .with_reconnect_policy(config.reconnect_policy());
        let reconciler = Arc::new(Reconciler::new(source, store));
        Self { config, context, manager, reconciler }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.context.store
    }

    pub fn requests(&self) -> &Arc<RequestChannel> {
        &self.context.requests
    }

    pub fn reconciler(&self) -> &Arc<Reconciler<S>> {
        &self.reconciler
    }

    /// Open the connection, hydrate once and refetch after every resync.
    /// Must be called inside a Tokio runtime.
    pub fn start(&self, scope: HydrationScope) -> Result<SyncSession> {
        let url = self.config.ws_url().context("failed to derive websocket url")?;
        if let Some(workspace_id) = &scope.workspace_id {
            self.context.store.switch_workspace(Some(workspace_id.clone()));
        }
        let connection = self.manager.connect(url.as_str()).context("failed to start connection")?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let hydration = tokio::spawn(keep_hydrated(
            Arc::clone(&self.reconciler),
            scope,
            connection.signals(),
            shutdown_rx,
        ));

        info!(%url, "sync session started");
        Ok(SyncSession { connection, shutdown_tx, hydration: Some(hydration) })
    }

    pub async fn get_task_plan(&self, task_id: &str) -> Result<Option<Plan>, RequestError> {
        plans::get_task_plan(&self.context.requests, &self.context.store, task_id).await
    }

    pub async fn create_task_plan(
        &self,
        task_id: &str,
        draft: &PlanDraft,
    ) -> Result<Option<Plan>, RequestError> {
        plans::create_task_plan(&self.context.requests, &self.context.store, task_id, draft).await
    }

    pub async fn update_task_plan(
        &self,
        task_id: &str,
        draft: &PlanDraft,
    ) -> Result<Option<Plan>, RequestError> {
        plans::update_task_plan(&self.context.requests, &self.context.store, task_id, draft).await
    }

    pub async fn delete_task_plan(&self, task_id: &str) -> Result<(), RequestError> {
        plans::delete_task_plan(&self.context.requests, &self.context.store, task_id).await
    }
}

async fn keep_hydrated<S: SnapshotSource>(
    reconciler: Arc<Reconciler<S>>,
    scope: HydrationScope,
    mut signals: broadcast::Receiver<SyncSignal>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::select! {
        biased;
        _ = shutdown.recv() => return,
        report = reconciler.mount(&scope) => {
            if let Some(report) = report {
                debug!(applied = ?report.applied, failed = report.failed.len(), "initial hydration done");
            }
        }
    }

    loop {
        let signal = tokio::select! {
            biased;
            _ = shutdown.recv() => return,
            signal = signals.recv() => signal,
        };
        match signal {
            Ok(SyncSignal::Resync) => {
                let report = reconciler.refresh(&scope).await;
                if !report.is_complete() {
                    warn!(failed = report.failed.len(), "resync left some slices unloaded");
                }
            }
            Ok(SyncSignal::Closed) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "missed connection signals, refreshing");
                reconciler.refresh(&scope).await;
            }
        }
    }
}

/// A running session. Dropping it stops hydration; the connection stops when
/// its last handle goes away.
pub struct SyncSession {
    connection: ConnectionHandle,
    shutdown_tx: broadcast::Sender<()>,
    hydration: Option<JoinHandle<()>>,
}

impl SyncSession {
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn signals(&self) -> broadcast::Receiver<SyncSignal> {
        self.connection.signals()
    }

    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.hydration.take() {
            let _ = task.await;
        }
        self.connection.close().await;
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plan_calls_fail_fast_before_start() {
        let client = SyncClient::from_config(ClientConfig::default()).expect("default config is valid");
        let result = client.get_task_plan("t1").await;
        assert!(matches!(result, Err(RequestError::NotConnected)));
        assert!(client.store().snapshot().plans.loading.is_empty());
    }

    #[test]
    fn bad_backend_url_is_rejected() {
        let config = ClientConfig { backend_url: Some("ftp://example.com".into()), ..ClientConfig::default() };
        assert!(SyncClient::from_config(config).is_err());
    }
}
