//! Webhook-based delivery: each destination maps to an incoming-webhook URL
//! accepting `{"content": "..."}`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::Delivery;
use crate::error::{RelayError, Result};
use crate::item::DestinationId;

#[derive(Serialize)]
struct WebhookMessage<'a> {
    content: &'a str,
}

pub struct WebhookDelivery {
    client: Client,
    webhooks: HashMap<DestinationId, String>,
}

impl WebhookDelivery {
    pub fn new(webhooks: HashMap<DestinationId, String>) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self { client, webhooks })
    }

    pub fn knows(&self, destination: DestinationId) -> bool {
        self.webhooks.contains_key(&destination)
    }
}

#[async_trait]
impl Delivery for WebhookDelivery {
    async fn deliver(&self, destination: DestinationId, text: &str) -> Result<()> {
        let url = self
            .webhooks
            .get(&destination)
            .ok_or_else(|| RelayError::delivery(destination, "no webhook configured"))?;

        let resp = self
            .client
            .post(url)
            .json(&WebhookMessage { content: text })
            .send()
            .await
            .map_err(|e| RelayError::delivery(destination, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(RelayError::delivery(
                destination,
                format!("HTTP {}", resp.status()),
            ));
        }
        Ok(())
    }
}
