//! Identities and the item type shared by every component.
//!
//! `Item` is a single published post from a followed source.  The upstream
//! provider converts its native payloads into `Item`s so that the dispatcher,
//! reconciler and stream consumer stay provider-agnostic.
//!
//! ## Ordering
//!
//! Item ids increase monotonically per provider, so the id doubles as the
//! ordering key and the delivery cursor.  Sorting by [`Item::id`] gives
//! **chronological** order (oldest first), which is the order items must be
//! replayed in.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Stable numeric id of an upstream account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub u64);

/// Id of a chat channel receiving items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(pub u64);

/// Id of a published item.  Also the cursor value: `ItemId(0)` means
/// "nothing delivered yet".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ItemId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lower-case a handle and strip a leading `@`, the form used as the
/// case-insensitive lookup key.
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A single post, normalised from the upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Ordering key and cursor value.
    pub id: ItemId,

    /// Account that published the item.
    pub source_id: SourceId,

    /// Canonical URL, the representation delivered to destinations.
    pub url: String,
}

/// Build the canonical URL of an item.
pub fn item_url(base: &str, handle: &str, id: ItemId) -> String {
    format!("{}/{handle}/status/{id}", base.trim_end_matches('/'))
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

/// One event read off a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A newly published item.
    Item(Item),
    /// The subscription (re)connected; anything published while it was down
    /// must be backfilled.
    Connected,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
