//! Chat delivery boundary.
//!
//! The core hands every item to a [`Delivery`] as `(destination, text)` and
//! only cares whether it succeeded: a failure keeps the destination's cursor
//! where it was so reconciliation can retry the item later.

pub mod webhook;

pub use webhook::WebhookDelivery;

use async_trait::async_trait;

use crate::error::Result;
use crate::item::DestinationId;

#[async_trait]
pub trait Delivery: Send + Sync {
    /// Post `text` to `destination`.  Errors are `DeliveryFailed`.
    async fn deliver(&self, destination: DestinationId, text: &str) -> Result<()>;
}
