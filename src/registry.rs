//! The follow registry: which destinations follow which source, and how far
//! each destination has been delivered.
//!
//! [`Registry`] is plain data with synchronous accessors so its invariants
//! can be checked in isolation:
//!
//! * a source with zero destinations is removed, never kept empty;
//! * a destination's `last_delivered_id` never moves backwards.
//!
//! [`SharedRegistry`] wraps it for the running service: one async mutex
//! serialises every writer, and every successful mutation is persisted
//! through the [`RegistryStore`] before the lock is released, so readers
//! only ever observe fully applied changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::item::{normalize_handle, DestinationId, ItemId, SourceId};
use crate::store::RegistryStore;

/// Delivery state of one destination for one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Most recent item delivered here.  Only ever advances.
    pub last_delivered_id: ItemId,
}

/// All destinations following one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    /// Normalised display handle of the source.
    pub handle: String,
    pub destinations: BTreeMap<DestinationId, Destination>,
}

/// Result of [`Registry::follow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowOutcome {
    /// Cursor the new destination starts from.
    pub cursor: ItemId,
    /// Whether the source entry was created by this follow.
    pub new_source: bool,
}

/// Counts reported by [`Registry::remove_destinations`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemovalReport {
    /// Destination entries removed across all sources.
    pub removed: usize,
    /// Sources that lost their last destination and were deleted.
    pub unfollowed: usize,
}

/// Source id → follow relation.  The unit of persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    follows: BTreeMap<SourceId, Follow>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.follows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.follows.len()
    }

    pub fn get(&self, source: SourceId) -> Option<&Follow> {
        self.follows.get(&source)
    }

    /// Case-insensitive lookup by display handle.
    pub fn find_by_handle(&self, handle: &str) -> Option<(SourceId, &Follow)> {
        let handle = normalize_handle(handle);
        self.follows
            .iter()
            .find(|(_, follow)| follow.handle == handle)
            .map(|(id, follow)| (*id, follow))
    }

    /// Add `destination` as a follower of `source`.
    ///
    /// The starting cursor is `seed` when given, otherwise the furthest cursor
    /// among the source's existing destinations (so a re-follow only receives
    /// future items), otherwise zero.  The stored handle is refreshed since
    /// display handles are mutable upstream.
    pub fn follow(
        &mut self,
        source: SourceId,
        handle: &str,
        destination: DestinationId,
        seed: Option<ItemId>,
    ) -> Result<FollowOutcome> {
        let handle = normalize_handle(handle);

        if let Some(follow) = self.follows.get(&source) {
            if follow.destinations.contains_key(&destination) {
                return Err(RelayError::AlreadyFollowing {
                    handle,
                    destination,
                });
            }
        }

        let cursor = seed
            .or_else(|| self.max_cursor(source))
            .unwrap_or_default();
        let new_source = !self.follows.contains_key(&source);

        let follow = self.follows.entry(source).or_insert_with(|| Follow {
            handle: handle.clone(),
            destinations: BTreeMap::new(),
        });
        follow.handle = handle;
        follow.destinations.insert(
            destination,
            Destination {
                last_delivered_id: cursor,
            },
        );

        Ok(FollowOutcome { cursor, new_source })
    }

    /// Remove `destination` from `source`.  Returns `true` when that was the
    /// last destination and the source itself was deleted.
    pub fn unfollow(&mut self, source: SourceId, destination: DestinationId) -> Result<bool> {
        let Some(follow) = self.follows.get_mut(&source) else {
            return Err(RelayError::NotFollowing {
                handle: source.to_string(),
                destination,
            });
        };

        if follow.destinations.remove(&destination).is_none() {
            return Err(RelayError::NotFollowing {
                handle: follow.handle.clone(),
                destination,
            });
        }

        if follow.destinations.is_empty() {
            self.follows.remove(&source);
            return Ok(true);
        }
        Ok(false)
    }

    /// Drop every listed destination from every source.  Absent destinations
    /// are ignored, so repeating a removal is a no-op.
    pub fn remove_destinations(&mut self, destinations: &[DestinationId]) -> RemovalReport {
        let mut report = RemovalReport::default();

        self.follows.retain(|_, follow| {
            for destination in destinations {
                if follow.destinations.remove(destination).is_some() {
                    report.removed += 1;
                }
            }
            if follow.destinations.is_empty() {
                report.unfollowed += 1;
                return false;
            }
            true
        });

        report
    }

    /// Smallest cursor across the source's destinations, i.e. the lower
    /// bound for a backfill that leaves nobody behind.  `None` when nobody
    /// follows the source.
    pub fn min_cursor(&self, source: SourceId) -> Option<ItemId> {
        self.follows
            .get(&source)?
            .destinations
            .values()
            .map(|d| d.last_delivered_id)
            .min()
    }

    /// Largest cursor across the source's destinations.
    pub fn max_cursor(&self, source: SourceId) -> Option<ItemId> {
        self.follows
            .get(&source)?
            .destinations
            .values()
            .map(|d| d.last_delivered_id)
            .max()
    }

    /// Snapshot of every followed source, in ascending id order.
    pub fn all_source_ids(&self) -> Vec<SourceId> {
        self.follows.keys().copied().collect()
    }

    /// Snapshot of `(destination, cursor)` pairs for one source.
    pub fn destinations_of(&self, source: SourceId) -> Vec<(DestinationId, ItemId)> {
        self.follows
            .get(&source)
            .map(|follow| {
                follow
                    .destinations
                    .iter()
                    .map(|(id, d)| (*id, d.last_delivered_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Handles followed from `destination`, sorted.
    pub fn handles_for(&self, destination: DestinationId) -> Vec<String> {
        let mut handles: Vec<String> = self
            .follows
            .values()
            .filter(|follow| follow.destinations.contains_key(&destination))
            .map(|follow| follow.handle.clone())
            .collect();
        handles.sort();
        handles
    }

    /// Move a destination's cursor forward to `item`.  Returns `false` (and
    /// changes nothing) when the follow no longer exists or the cursor is
    /// already at or past `item`.
    pub fn advance_cursor(
        &mut self,
        source: SourceId,
        destination: DestinationId,
        item: ItemId,
    ) -> bool {
        let Some(dest) = self
            .follows
            .get_mut(&source)
            .and_then(|follow| follow.destinations.get_mut(&destination))
        else {
            return false;
        };

        if item <= dest.last_delivered_id {
            return false;
        }
        dest.last_delivered_id = item;
        true
    }
}

// ---------------------------------------------------------------------------
// Shared, persisted handle
// ---------------------------------------------------------------------------

/// The registry as owned by the running service.
pub struct SharedRegistry {
    inner: Mutex<Registry>,
    store: Arc<dyn RegistryStore>,
}

impl SharedRegistry {
    pub fn new(registry: Registry, store: Arc<dyn RegistryStore>) -> Self {
        Self {
            inner: Mutex::new(registry),
            store,
        }
    }

    /// Load the persisted registry from `store`.
    pub async fn load(store: Arc<dyn RegistryStore>) -> Result<Self> {
        let registry = store.load().await?;
        debug!(sources = registry.len(), "loaded follow registry");
        Ok(Self::new(registry, store))
    }

    /// Run `f` against a consistent view of the registry.
    pub async fn read<R>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// Apply `f` and persist the result.  Nothing is saved when `f` fails;
    /// `f` must leave the registry untouched in that case.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Registry) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.lock().await;
        let out = f(&mut guard)?;
        self.store.save(&guard).await?;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
