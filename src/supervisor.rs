//! Lifecycle of the single stream consumer task.
//!
//! Two states: [`SupervisorState::Stopped`] and
//! [`SupervisorState::Running`].  [`StreamSupervisor::sync`] compares the
//! registry's followed-source set with the one the running consumer was
//! started with and moves between states:
//!
//! * empty set → stop the consumer (if any);
//! * non-empty set, nothing running → start one;
//! * set changed → stop, then start.  Never the other way round: two live
//!   subscriptions would dispatch every item twice.
//!
//! Every transition happens under one mutex and awaits the old task's exit
//! and the new subscription's readiness, so callers return only once the
//! subscription matches the registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StreamConfig;
use crate::consumer::{self, Backoff, ConsumerContext};
use crate::dispatch::Dispatcher;
use crate::item::SourceId;
use crate::reconcile::Reconciler;
use crate::registry::SharedRegistry;
use crate::upstream::Upstream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Running,
}

/// Handle to the live consumer task.
struct RunningConsumer {
    sources: Vec<SourceId>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningConsumer {
    /// Cancel and wait until the task has released its subscription.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "stream consumer ended abnormally");
        }
    }
}

pub struct StreamSupervisor {
    registry: Arc<SharedRegistry>,
    ctx: Arc<ConsumerContext>,
    ready_timeout: Duration,
    running: Mutex<Option<RunningConsumer>>,
}

impl StreamSupervisor {
    pub fn new(
        registry: Arc<SharedRegistry>,
        upstream: Arc<dyn Upstream>,
        dispatcher: Arc<Dispatcher>,
        reconciler: Arc<Reconciler>,
        config: &StreamConfig,
    ) -> Self {
        Self {
            registry,
            ctx: Arc::new(ConsumerContext {
                upstream,
                dispatcher,
                reconciler,
                backoff: Backoff::from_config(config),
            }),
            ready_timeout: config.ready_timeout(),
            running: Mutex::new(None),
        }
    }

    /// Bring the consumer in line with the registry's current source set.
    pub async fn sync(&self) -> SupervisorState {
        let mut running = self.running.lock().await;
        let sources = self.registry.read(|r| r.all_source_ids()).await;

        if let Some(current) = running.as_ref() {
            if current.sources == sources && !current.handle.is_finished() {
                return SupervisorState::Running;
            }
        }

        if let Some(old) = running.take() {
            old.stop().await;
            if sources.is_empty() {
                info!("no followed sources, stream stopped");
            }
        }
        if sources.is_empty() {
            return SupervisorState::Stopped;
        }

        *running = Some(self.start(sources).await);
        SupervisorState::Running
    }

    pub async fn stop(&self) {
        if let Some(old) = self.running.lock().await.take() {
            old.stop().await;
            info!("stream stopped");
        }
    }

    pub async fn state(&self) -> SupervisorState {
        match self.running.lock().await.as_ref() {
            Some(_) => SupervisorState::Running,
            None => SupervisorState::Stopped,
        }
    }

    /// Sources covered by the running subscription.
    pub async fn subscribed_sources(&self) -> Vec<SourceId> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.sources.clone())
            .unwrap_or_default()
    }

    async fn start(&self, sources: Vec<SourceId>) -> RunningConsumer {
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = tokio::spawn(consumer::run(
            Arc::clone(&self.ctx),
            sources.clone(),
            cancel.clone(),
            ready_tx,
        ));

        match tokio::time::timeout(self.ready_timeout, ready_rx).await {
            Ok(Ok(())) => info!(sources = sources.len(), "stream started"),
            Ok(Err(_)) => warn!("stream consumer exited before subscribing"),
            Err(_) => warn!(
                timeout = ?self.ready_timeout,
                "subscription not ready yet, consumer keeps retrying in the background"
            ),
        }

        RunningConsumer {
            sources,
            cancel,
            handle,
        }
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(consumer) = running.take() {
                consumer.cancel.cancel();
            }
        }
    }
}
