use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    clients::{
        adapter::{AdapterError, ChannelAdapter, OutboundMessage, SendReceipt, resolve_phone},
        store::RecipientDirectory,
    },
    config::Config,
    models::{channel::Channel, validation::validate_phone_number},
};

#[derive(Debug, Deserialize)]
struct WhatsAppResponse {
    #[serde(default)]
    messages: Vec<WhatsAppMessageId>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppMessageId {
    id: String,
}

/// Chat-template adapter. Sends an approved template with positional body
/// parameters taken from the non-hint context values.
pub struct WhatsAppClient {
    http_client: Client,
    api_url: String,
    access_token: String,
    directory: Arc<dyn RecipientDirectory>,
}

impl WhatsAppClient {
    pub fn new(config: &Config, directory: Arc<dyn RecipientDirectory>) -> Result<Self, Error> {
        Self::with_endpoint(&config.whatsapp_api_url, &config.whatsapp_access_token, directory)
    }

    pub fn with_endpoint(
        api_url: &str,
        access_token: &str,
        directory: Arc<dyn RecipientDirectory>,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        info!(api_url, "WhatsApp client initialized");

        Ok(Self {
            http_client,
            api_url: api_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
            directory,
        })
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppClient {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, AdapterError> {
        let phone = resolve_phone(message, self.directory.as_ref()).await?;
        if let Err(e) = validate_phone_number(&phone) {
            warn!(user_id = %message.user_id, error = %e, "Unusable phone number for WhatsApp");
            return Err(AdapterError::NoPhone);
        }

        let template_name = message
            .template_name
            .clone()
            .unwrap_or_else(|| message.subject.clone());

        let parameters: Vec<_> = message
            .template_params()
            .into_iter()
            .map(|(_, value)| json!({ "type": "text", "text": value }))
            .collect();

        let payload = json!({
            "messaging_product": "whatsapp",
            "to": phone.trim_start_matches('+'),
            "type": "template",
            "template": {
                "name": template_name,
                "language": { "code": message.language() },
                "components": [{ "type": "body", "parameters": parameters }],
            },
        });

        debug!(user_id = %message.user_id, template = %template_name, "Sending WhatsApp template");

        let response = self
            .http_client
            .post(format!("{}/messages", self.api_url))
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AdapterError::Provider(format!(
                "WhatsApp returned {}: {}",
                status, error_text
            )));
        }

        let body: WhatsAppResponse = response.json().await?;
        let message_id = body
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| AdapterError::Provider("WhatsApp response had no message id".into()))?;

        Ok(SendReceipt { message_id })
    }
}
