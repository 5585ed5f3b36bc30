//! feedrelay: follow social-media accounts over a live stream and relay
//! their new items to chat destinations, exactly once per destination.
//!
//! ## Architecture overview
//!
//! ```text
//!  operator ──► relay ──► registry ◄──────────────┐
//!                 │          ▲                     │ cursors
//!                 ▼          │ source set          │
//!            supervisor ─► consumer ──► dispatcher ─┴──► delivery
//!                            │  Connected    ▲
//!                            └─► reconciler ─┘ (timeline backfill)
//! ```
//!
//! * **`registry`**: source → destinations with per-destination cursors.
//! * **`dispatch`**: delivers an item and advances cursors.
//! * **`reconcile`**: replays items missed while the stream was down.
//! * **`supervisor`** / **`consumer`**: the single background stream task.
//! * **`upstream`** / **`delivery`** / **`store`**: external boundaries.
//! * **`relay`**: operator actions, wiring everything together.

pub mod config;
pub mod consumer;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod input;
pub mod item;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod store;
pub mod supervisor;
pub mod upstream;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{RelayError, Result};
pub use item::{DestinationId, Item, ItemId, SourceId, StreamEvent};
pub use registry::{Registry, SharedRegistry};
pub use relay::{FollowReceipt, Relay};
pub use supervisor::{StreamSupervisor, SupervisorState};
