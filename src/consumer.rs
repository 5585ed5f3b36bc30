//! Body of the background stream task.
//!
//! The consumer is started with a frozen list of source ids.  It opens one
//! subscription for all of them, then handles events one at a time: items go
//! to the [`Dispatcher`], `Connected` signals run the [`Reconciler`] over
//! every followed source.  When the subscription drops it reconnects with
//! exponential backoff; the fresh connection's `Connected` event covers the
//! outage.
//!
//! Cancellation is only observed while waiting (for the next event, for a
//! connection, or during a backoff sleep), never in the middle of a dispatch
//! or a backfill.  The subscription is dropped before the task returns.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::dispatch::Dispatcher;
use crate::item::{SourceId, StreamEvent};
use crate::reconcile::Reconciler;
use crate::upstream::Upstream;

/// Exponential backoff, doubling up to a cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(config.backoff_initial(), config.backoff_max())
    }

    /// Delay to wait now; the following one is doubled.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Shared collaborators of every consumer task.
pub struct ConsumerContext {
    pub upstream: Arc<dyn Upstream>,
    pub dispatcher: Arc<Dispatcher>,
    pub reconciler: Arc<Reconciler>,
    pub backoff: Backoff,
}

/// Sleep for `delay` unless cancelled first.  Returns `false` on cancel.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run until `cancel` fires.  `ready` is signalled once the first
/// subscription is open.
pub async fn run(
    ctx: Arc<ConsumerContext>,
    sources: Vec<SourceId>,
    cancel: CancellationToken,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut backoff = ctx.backoff.clone();

    loop {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            opened = ctx.upstream.open_subscription(&sources) => opened,
        };

        let mut subscription = match opened {
            Ok(subscription) => subscription,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in = ?delay, "failed to open subscription");
                if !pause(&cancel, delay).await {
                    break;
                }
                continue;
            }
        };
        backoff.reset();
        debug!(sources = sources.len(), "subscription open");
        if let Some(tx) = ready.take() {
            let _ = tx.send(());
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drop(subscription);
                    info!("stream consumer cancelled");
                    return;
                }
                event = subscription.next() => event,
            };

            match event {
                Some(StreamEvent::Item(item)) => {
                    ctx.dispatcher.dispatch(&item).await;
                }
                Some(StreamEvent::Connected) => {
                    info!("stream (re)connected, reconciling");
                    ctx.reconciler.reconcile_all().await;
                }
                None => {
                    info!("subscription dropped, reconnecting");
                    break;
                }
            }
        }

        drop(subscription);
        let delay = backoff.next_delay();
        if !pause(&cancel, delay).await {
            break;
        }
    }

    info!("stream consumer cancelled");
}
