//! Backfill of items missed while the subscription was down.
//!
//! For each followed source the timeline is fetched from the smallest cursor
//! among its destinations, sorted oldest first and replayed through the
//! [`Dispatcher`].  Destinations that are ahead skip what they already have,
//! destinations that are behind catch up in publish order.
//!
//! Sources are handled one after the other and each replay holds the
//! dispatch gate, so live items cannot interleave with a replay.
//!
//! Backfill is best effort.  Items older than the provider's history depth
//! are never delivered, and a source whose fetch fails is skipped until the
//! next reconnect.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{RelayError, Result};
use crate::item::{ItemId, SourceId};
use crate::registry::SharedRegistry;
use crate::upstream::{FetchMode, SourceRef, Upstream};

/// Items pulled for a source whose destinations have never received
/// anything (cursor zero).
pub const FIRST_FOLLOW_LIMIT: usize = 3;

/// Totals for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub sources: usize,
    pub fetched: usize,
    pub failed_sources: usize,
    pub dispatch: DispatchReport,
}

pub struct Reconciler {
    registry: Arc<SharedRegistry>,
    upstream: Arc<dyn Upstream>,
    dispatcher: Arc<Dispatcher>,
    /// Bound on a whole multi-page fetch.
    backfill_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<SharedRegistry>,
        upstream: Arc<dyn Upstream>,
        dispatcher: Arc<Dispatcher>,
        backfill_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            upstream,
            dispatcher,
            backfill_timeout,
        }
    }

    /// Backfill every source followed right now.
    pub async fn reconcile_all(&self) -> ReconcileReport {
        let sources = self.registry.read(|r| r.all_source_ids()).await;
        let mut report = ReconcileReport::default();

        for source in sources {
            report.sources += 1;
            match self.reconcile_source(source).await {
                Ok((fetched, dispatch)) => {
                    report.fetched += fetched;
                    report.dispatch.merge(dispatch);
                }
                Err(e) => {
                    warn!(source_id = %source, error = %e, "backfill failed, retrying on next reconnect");
                    report.failed_sources += 1;
                }
            }
        }

        info!(
            sources = report.sources,
            fetched = report.fetched,
            delivered = report.dispatch.delivered,
            failed_sources = report.failed_sources,
            "reconciliation finished"
        );
        report
    }

    /// Backfill one source.  Returns the number of fetched items and what
    /// dispatching them did.
    pub async fn reconcile_source(&self, source: SourceId) -> Result<(usize, DispatchReport)> {
        let _gate = self.dispatcher.lock().await;

        let Some(since) = self.registry.read(|r| r.min_cursor(source)).await else {
            return Ok((0, DispatchReport::default()));
        };
        let mode = if since == ItemId(0) {
            FetchMode::Latest(FIRST_FOLLOW_LIMIT)
        } else {
            FetchMode::Since(since)
        };

        let source_ref = SourceRef::Id(source);
        let fetch = self.upstream.fetch_timeline(&source_ref, mode);
        let mut items = tokio::time::timeout(self.backfill_timeout, fetch)
            .await
            .map_err(|_| RelayError::upstream(format!("timeline fetch for {source} timed out")))??;

        // Newest first from the provider; replay oldest first.
        items.sort_by_key(|item| item.id);

        let mut report = DispatchReport::default();
        for item in &items {
            report.merge(self.dispatcher.dispatch_gated(item).await);
        }

        debug!(source_id = %source, since = %since, fetched = items.len(), "backfilled source");
        Ok((items.len(), report))
    }
}
