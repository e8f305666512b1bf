use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::{clients::store::RecipientDirectory, models::channel::Channel};

/// What an adapter is asked to deliver. Context keys starting with `_` are
/// routing hints for adapters and never reach a provider as parameters.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub user_id: String,
    pub subject: String,
    pub body: String,
    pub context_data: HashMap<String, String>,
    pub template_name: Option<String>,
}

impl OutboundMessage {
    pub fn hint(&self, key: &str) -> Option<&str> {
        self.context_data
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Provider-facing parameters, sorted by key.
    pub fn template_params(&self) -> Vec<(&str, &str)> {
        let mut params: Vec<(&str, &str)> = self
            .context_data
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        params.sort();
        params
    }

    pub fn language(&self) -> &str {
        self.hint("_language").unwrap_or("en")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("no registered device tokens")]
    NoTokens,

    #[error("no phone number on record")]
    NoPhone,

    #[error("all {rejected} device(s) rejected the message")]
    AllDevicesRejected { rejected: usize },

    #[error("provider rejected the request: {0}")]
    Provider(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AdapterError {
    /// Missing recipient data; not a sign of provider trouble.
    pub fn is_missing_recipient(&self) -> bool {
        matches!(self, AdapterError::NoTokens | AdapterError::NoPhone)
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, AdapterError>;
}

/// `_phone` hint first, then the directory.
pub async fn resolve_phone(
    message: &OutboundMessage,
    directory: &dyn RecipientDirectory,
) -> Result<String, AdapterError> {
    if let Some(phone) = message.hint("_phone") {
        return Ok(phone.to_string());
    }

    directory
        .phone_number(&message.user_id)
        .await?
        .filter(|phone| !phone.is_empty())
        .ok_or(AdapterError::NoPhone)
}
