use reqwest::{header, Client};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::WhatsAppConfig;
use crate::services::mpesa::normalize_phone;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Sender API returned status {0}")]
    Status(u16),
}

pub struct WhatsAppClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl WhatsAppClient {
    pub fn new(config: WhatsAppConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint,
            api_key: config.api_key,
        })
    }

    pub async fn send_text(&self, phone: &str, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&json!({
                "recipients": [phone],
                "type": "text",
                "text": message,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }

        Ok(())
    }
}

/// Delivery notifications degrade to a no-op when the sender is not
/// configured; a failed send is logged, never surfaced.
#[derive(Clone)]
pub struct Notifier {
    client: Option<Arc<WhatsAppClient>>,
    country_prefix: String,
}

impl Notifier {
    pub fn new(
        config: Option<WhatsAppConfig>,
        country_prefix: String,
    ) -> Result<Self, NotifyError> {
        let client = match config {
            Some(config) => Some(Arc::new(WhatsAppClient::new(config)?)),
            None => None,
        };

        Ok(Self {
            client,
            country_prefix,
        })
    }

    pub async fn send_delivery_note(
        &self,
        recipient_phone: &str,
        recipient_first_name: &str,
        tracking_code: &str,
        origin_town: &str,
        destination_address: &str,
    ) {
        let Some(client) = &self.client else {
            info!("WhatsApp sender not configured, skipping delivery note");
            return;
        };

        let phone = normalize_phone(recipient_phone, &self.country_prefix);
        let message = delivery_message(
            recipient_first_name,
            tracking_code,
            origin_town,
            destination_address,
        );

        match client.send_text(&phone, &message).await {
            Ok(()) => info!("Delivery note sent to {}", phone),
            Err(e) => warn!("Failed to send delivery note to {}: {}", phone, e),
        }
    }
}

fn delivery_message(
    first_name: &str,
    tracking_code: &str,
    origin_town: &str,
    destination_address: &str,
) -> String {
    format!(
        "Hello {}, your parcel ({}) from {} has been delivered to {}. \
         Thank you for using JetQuickly!",
        first_name, tracking_code, origin_town, destination_address
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_message_mentions_tracking_code_and_address() {
        let message = delivery_message("Wanjiku", "JETABC123", "Nairobi", "Moi Ave 12, Mombasa");
        assert!(message.contains("Wanjiku"));
        assert!(message.contains("JETABC123"));
        assert!(message.contains("Nairobi"));
        assert!(message.contains("Moi Ave 12, Mombasa"));
    }
}
