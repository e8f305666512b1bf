use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    clients::{
        adapter::{AdapterError, ChannelAdapter, OutboundMessage, SendReceipt, resolve_phone},
        store::RecipientDirectory,
    },
    config::Config,
    models::{channel::Channel, validation::validate_phone_number},
};

#[derive(Debug, Serialize)]
struct SmsRequest<'a> {
    to: &'a str,
    sender_id: &'a str,
    message: String,
    reference: &'a str,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    message_id: String,
    status: String,
}

pub struct SmsClient {
    http_client: Client,
    gateway_url: String,
    api_key: String,
    sender_id: String,
    directory: Arc<dyn RecipientDirectory>,
}

impl SmsClient {
    pub fn new(config: &Config, directory: Arc<dyn RecipientDirectory>) -> Result<Self, Error> {
        Self::with_gateway(
            &config.sms_gateway_url,
            &config.sms_api_key,
            &config.sms_sender_id,
            directory,
        )
    }

    pub fn with_gateway(
        gateway_url: &str,
        api_key: &str,
        sender_id: &str,
        directory: Arc<dyn RecipientDirectory>,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        Ok(Self {
            http_client,
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            sender_id: sender_id.to_string(),
            directory,
        })
    }

    /// `_body` when given, otherwise the subject followed by the parameters.
    fn compose(message: &OutboundMessage) -> String {
        if let Some(body) = message.hint("_body") {
            return body.to_string();
        }

        if !message.body.is_empty() {
            return message.body.clone();
        }

        let params = message
            .template_params()
            .into_iter()
            .map(|(key, value)| format!("{}: {}", key, value))
            .collect::<Vec<_>>()
            .join(", ");

        if params.is_empty() {
            message.subject.clone()
        } else {
            format!("{} - {}", message.subject, params)
        }
    }
}

#[async_trait]
impl ChannelAdapter for SmsClient {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, AdapterError> {
        let phone = resolve_phone(message, self.directory.as_ref()).await?;
        if let Err(e) = validate_phone_number(&phone) {
            warn!(user_id = %message.user_id, error = %e, "Unusable phone number for SMS");
            return Err(AdapterError::NoPhone);
        }

        let request = SmsRequest {
            to: &phone,
            sender_id: &self.sender_id,
            message: Self::compose(message),
            reference: &message.user_id,
        };

        debug!(user_id = %message.user_id, "Sending SMS");

        let response = self
            .http_client
            .post(format!("{}/messages", self.gateway_url))
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AdapterError::Provider(format!(
                "SMS gateway returned {}: {}",
                status, error_text
            )));
        }

        let body: SmsResponse = response.json().await?;
        if body.status != "sent" && body.status != "queued" {
            return Err(AdapterError::Provider(format!(
                "SMS gateway reported status '{}'",
                body.status
            )));
        }

        Ok(SendReceipt {
            message_id: body.message_id,
        })
    }
}
