//! The relay service: owns the registry and wires the components together.
//!
//! Operator actions enter here.  Each one mutates the registry (persisting
//! it), then brings the stream supervisor in line before returning, so that
//! when `follow` or `unfollow` completes the live subscription already
//! reflects it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::delivery::Delivery;
use crate::dispatch::Dispatcher;
use crate::error::{RelayError, Result};
use crate::item::{item_url, normalize_handle, DestinationId, ItemId, SourceId};
use crate::reconcile::Reconciler;
use crate::registry::{RemovalReport, SharedRegistry};
use crate::store::RegistryStore;
use crate::supervisor::{StreamSupervisor, SupervisorState};
use crate::upstream::{FetchMode, SourceRef, SourceSummary, Upstream};

/// Confirmation of a successful follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowReceipt {
    pub source_id: SourceId,
    pub handle: String,
    /// Cursor the destination starts from; only later items are relayed.
    pub cursor: ItemId,
    pub new_source: bool,
    /// URL of the item at the cursor, if the source has published anything.
    pub last_item_url: Option<String>,
}

pub struct Relay {
    registry: Arc<SharedRegistry>,
    upstream: Arc<dyn Upstream>,
    delivery: Arc<dyn Delivery>,
    reconciler: Arc<Reconciler>,
    supervisor: StreamSupervisor,
    item_url_base: String,
    fetch_timeout: Duration,
}

impl Relay {
    /// Load the persisted registry and assemble the components.  The stream
    /// is not started until [`Relay::start`].
    pub async fn new(
        store: Arc<dyn RegistryStore>,
        upstream: Arc<dyn Upstream>,
        delivery: Arc<dyn Delivery>,
        config: &Config,
    ) -> Result<Self> {
        let registry = Arc::new(SharedRegistry::load(store).await?);
        let fetch_timeout = config.upstream.fetch_timeout();

        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&delivery)));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            Arc::clone(&upstream),
            Arc::clone(&dispatcher),
            config.upstream.backfill_timeout(),
        ));
        let supervisor = StreamSupervisor::new(
            Arc::clone(&registry),
            Arc::clone(&upstream),
            dispatcher,
            Arc::clone(&reconciler),
            &config.stream,
        );

        Ok(Self {
            registry,
            upstream,
            delivery,
            reconciler,
            supervisor,
            item_url_base: config.upstream.item_url_base.clone(),
            fetch_timeout,
        })
    }

    /// Start streaming if anything is followed.
    pub async fn start(&self) -> SupervisorState {
        let state = self.supervisor.sync().await;
        info!(?state, "relay started");
        state
    }

    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
    }

    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    pub async fn state(&self) -> SupervisorState {
        self.supervisor.state().await
    }

    pub async fn subscribed_sources(&self) -> Vec<SourceId> {
        self.supervisor.subscribed_sources().await
    }

    // -- operator actions ----------------------------------------------------

    /// Relay `handle`'s future items to `destination`.
    pub async fn follow(&self, handle: &str, destination: DestinationId) -> Result<FollowReceipt> {
        let handle = normalize_handle(handle);

        let known = self
            .registry
            .read(|r| {
                r.find_by_handle(&handle)
                    .map(|(id, follow)| (id, follow.destinations.contains_key(&destination)))
            })
            .await;

        let (source_id, seed) = match known {
            Some((_, true)) => {
                return Err(RelayError::AlreadyFollowing {
                    handle,
                    destination,
                })
            }
            Some((id, false)) => (id, None),
            None => {
                let profile = self.upstream.resolve_source(&handle).await?;
                (profile.id, Some(profile.latest_item.unwrap_or_default()))
            }
        };

        // A source can be known under an older handle; it then resumes from
        // its destinations' cursors like any re-follow.
        let outcome = self
            .registry
            .update(|r| {
                let seed = if r.get(source_id).is_some() { None } else { seed };
                r.follow(source_id, &handle, destination, seed)
            })
            .await?;
        info!(
            %source_id,
            handle = %handle,
            %destination,
            cursor = %outcome.cursor,
            new_source = outcome.new_source,
            "followed"
        );

        if outcome.cursor > ItemId(0) {
            if let Err(e) = self.reconciler.reconcile_source(source_id).await {
                warn!(%source_id, error = %e, "initial backfill failed");
            }
        }
        self.supervisor.sync().await;

        let last_item_url =
            (outcome.cursor > ItemId(0)).then(|| item_url(&self.item_url_base, &handle, outcome.cursor));
        Ok(FollowReceipt {
            source_id,
            handle,
            cursor: outcome.cursor,
            new_source: outcome.new_source,
            last_item_url,
        })
    }

    /// Stop relaying `handle` to `destination`.
    pub async fn unfollow(&self, handle: &str, destination: DestinationId) -> Result<()> {
        let handle = normalize_handle(handle);
        let source_id = self
            .registry
            .read(|r| r.find_by_handle(&handle).map(|(id, _)| id))
            .await
            .ok_or_else(|| RelayError::NotFollowing {
                handle: handle.clone(),
                destination,
            })?;

        let source_removed = self
            .registry
            .update(|r| r.unfollow(source_id, destination))
            .await?;
        info!(%source_id, handle = %handle, %destination, source_removed, "unfollowed");

        if source_removed {
            self.supervisor.sync().await;
        }
        Ok(())
    }

    /// Handles followed from `destination`.
    pub async fn list(&self, destination: DestinationId) -> Vec<String> {
        self.registry.read(|r| r.handles_for(destination)).await
    }

    /// Deliver `handle`'s newest `limit` items to `destination`, oldest
    /// first.  Cursors are not touched.
    pub async fn fetch(
        &self,
        handle: &str,
        limit: usize,
        destination: DestinationId,
    ) -> Result<usize> {
        let source = SourceRef::Handle(normalize_handle(handle));
        let fetch = self.upstream.fetch_timeline(&source, FetchMode::Latest(limit));
        let mut items = tokio::time::timeout(self.fetch_timeout, fetch)
            .await
            .map_err(|_| RelayError::upstream("timeline fetch timed out"))??;
        items.sort_by_key(|item| item.id);

        for item in &items {
            self.delivery.deliver(destination, &item.url).await?;
        }
        Ok(items.len())
    }

    /// Accounts matching `query`, best match first.  Read-only: nothing is
    /// followed.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SourceSummary>> {
        let search = self.upstream.search_sources(query.trim(), limit);
        tokio::time::timeout(self.fetch_timeout, search)
            .await
            .map_err(|_| RelayError::upstream("account search timed out"))?
    }

    /// Forget destinations that no longer exist (a deleted channel, or every
    /// channel of a guild the bot left).
    pub async fn remove_destinations(&self, destinations: &[DestinationId]) -> Result<RemovalReport> {
        let report = self
            .registry
            .update(|r| Ok(r.remove_destinations(destinations)))
            .await?;
        info!(
            destinations = destinations.len(),
            removed = report.removed,
            unfollowed = report.unfollowed,
            "removed destinations"
        );

        if report.unfollowed > 0 {
            self.supervisor.sync().await;
        }
        Ok(report)
    }
}
