//! Upstream provider abstraction.
//!
//! This module defines the [`Upstream`] trait, the boundary between the relay
//! core and the social-media provider whose accounts are followed.  The
//! concrete HTTP implementation lives in [`http`].
//!
//! ## For contributors: adding a provider
//!
//! 1. Create a new file in this directory (e.g. `mastodon.rs`).
//! 2. Implement [`Upstream`] for your client type, converting native payloads
//!    into [`Item`]s.
//! 3. Re-export it below and construct it in `main.rs`.
//!
//! The dispatcher, reconciler and supervisor only see this trait.

pub mod http;

pub use http::HttpUpstream;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::Result;
use crate::item::{Item, ItemId, SourceId, StreamEvent};

/// A live subscription.  Dropping it releases the connection; the stream
/// ending means the connection dropped.
pub type Subscription = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Profile returned by [`Upstream::resolve_source`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProfile {
    pub id: SourceId,
    /// Normalised display handle.
    pub handle: String,
    /// Most recent item published by the source, if any.
    pub latest_item: Option<ItemId>,
}

/// One hit of [`Upstream::search_sources`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub id: SourceId,
    /// Normalised display handle.
    pub handle: String,
    /// Free-form display name.
    pub name: String,
    pub description: Option<String>,
    /// Items published so far.
    pub items: u64,
    pub followers: u64,
}

/// How to address a source when fetching its timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Id(SourceId),
    Handle(String),
}

/// How far back a timeline fetch goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Every item strictly newer than the given id.
    Since(ItemId),
    /// The newest `n` items.
    Latest(usize),
}

/// Boundary to the upstream provider.
///
/// Implementations are shared between the supervisor's background task and
/// operator calls, so they must be [`Send`] + [`Sync`].
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Look up an account by handle.
    ///
    /// Fails with `SourceNotFound` for unknown accounts and `SourceProtected`
    /// for accounts whose content is access-restricted.  A rejected
    /// credential is `UpstreamUnavailable`, never `SourceProtected`.
    async fn resolve_source(&self, handle: &str) -> Result<SourceProfile>;

    /// Find accounts matching a free-text query, best match first, at most
    /// `limit` of them.  No match is an empty list.
    async fn search_sources(&self, query: &str, limit: usize) -> Result<Vec<SourceSummary>>;

    /// Pull recent items of a source, **newest first**.  Callers sort the
    /// result oldest first before dispatching.
    async fn fetch_timeline(&self, source: &SourceRef, mode: FetchMode) -> Result<Vec<Item>>;

    /// Open one live subscription covering every source in `sources`.
    async fn open_subscription(&self, sources: &[SourceId]) -> Result<Subscription>;
}
