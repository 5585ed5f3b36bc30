//! Delivery of one item to every destination following its source.
//!
//! Per destination the sequence is deliver → advance cursor → persist, so a
//! failed delivery leaves the cursor behind and the item is picked up again
//! by the next reconciliation.  Destinations whose cursor already covers the
//! item are skipped, which is what makes backfill replays safe.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::delivery::Delivery;
use crate::item::Item;
use crate::registry::SharedRegistry;

/// What happened to one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    /// Destinations that had already received the item.
    pub skipped: usize,
}

impl DispatchReport {
    pub(crate) fn merge(&mut self, other: DispatchReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

pub struct Dispatcher {
    registry: Arc<SharedRegistry>,
    delivery: Arc<dyn Delivery>,
    /// Serialises live dispatch with backfill replays.
    gate: Mutex<()>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SharedRegistry>, delivery: Arc<dyn Delivery>) -> Self {
        Self {
            registry,
            delivery,
            gate: Mutex::new(()),
        }
    }

    /// Dispatch a single live item.
    pub async fn dispatch(&self, item: &Item) -> DispatchReport {
        let _gate = self.gate.lock().await;
        self.dispatch_gated(item).await
    }

    /// Hold the gate across a longer operation (fetch + replay).
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Dispatch while the caller already holds [`Dispatcher::lock`].
    pub(crate) async fn dispatch_gated(&self, item: &Item) -> DispatchReport {
        let mut report = DispatchReport::default();

        let destinations = self
            .registry
            .read(|r| r.destinations_of(item.source_id))
            .await;
        if destinations.is_empty() {
            // Streams also carry items from accounts nobody follows any more.
            debug!(source_id = %item.source_id, item_id = %item.id, "dropping item for unfollowed source");
            return report;
        }

        for (destination, cursor) in destinations {
            if cursor >= item.id {
                report.skipped += 1;
                continue;
            }

            if let Err(e) = self.delivery.deliver(destination, &item.url).await {
                warn!(%destination, item_id = %item.id, error = %e, "delivery failed, cursor left behind");
                report.failed += 1;
                continue;
            }

            let saved = self
                .registry
                .update(|r| Ok(r.advance_cursor(item.source_id, destination, item.id)))
                .await;
            if let Err(e) = saved {
                warn!(%destination, item_id = %item.id, error = %e, "failed to persist cursor");
            }
            report.delivered += 1;
        }

        debug!(
            source_id = %item.source_id,
            item_id = %item.id,
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "dispatched item"
        );
        report
    }
}
