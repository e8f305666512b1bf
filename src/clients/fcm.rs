use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::Client;
use tracing::{debug, info, warn};

use crate::{
    clients::{
        adapter::{AdapterError, ChannelAdapter, OutboundMessage, SendReceipt},
        store::RecipientDirectory,
    },
    config::Config,
    models::{
        channel::Channel,
        fcm::{FcmMessage, FcmNotification, FcmRequest, FcmResponse},
        validation::validate_fcm_token,
    },
};

const FCM_SCOPES: &[&str] = &["https://www.googleapis.com/auth/firebase.messaging"];

/// Per-device failure. Only `Stale` tokens are removed from the directory.
enum DeviceError {
    Stale(String),
    Failed(AdapterError),
}

impl From<reqwest::Error> for DeviceError {
    fn from(e: reqwest::Error) -> Self {
        DeviceError::Failed(AdapterError::Transport(e))
    }
}

/// FCM answers 404 UNREGISTERED for uninstalled apps and 400
/// INVALID_ARGUMENT for tokens it cannot parse.
fn is_stale_token_response(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::NOT_FOUND
        || body.contains("UNREGISTERED")
        || (status == reqwest::StatusCode::BAD_REQUEST && body.contains("INVALID_ARGUMENT"))
}

pub enum FcmAuth {
    Gcp(Arc<dyn TokenProvider>),
    /// Fixed bearer token, for emulators and tests.
    Static(String),
}

/// Push adapter over the FCM HTTP v1 API. Sends to every registered device;
/// one accepted device is enough for the attempt to count as sent.
pub struct FcmClient {
    http_client: Client,
    base_url: String,
    project_id: String,
    auth: FcmAuth,
    directory: Arc<dyn RecipientDirectory>,
}

impl FcmClient {
    pub async fn new(config: &Config, directory: Arc<dyn RecipientDirectory>) -> Result<Self, Error> {
        let provider = gcp_auth::provider()
            .await
            .map_err(|e| anyhow!("Failed to initialise GCP credentials: {}", e))?;

        info!(project_id = %config.fcm_project_id, "FCM client initialized");

        Self::with_auth(
            &config.fcm_base_url,
            &config.fcm_project_id,
            FcmAuth::Gcp(provider),
            directory,
        )
    }

    pub fn with_auth(
        base_url: &str,
        project_id: &str,
        auth: FcmAuth,
        directory: Arc<dyn RecipientDirectory>,
    ) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            auth,
            directory,
        })
    }

    async fn bearer_token(&self) -> Result<String, AdapterError> {
        match &self.auth {
            FcmAuth::Static(token) => Ok(token.clone()),
            FcmAuth::Gcp(provider) => {
                let token = provider
                    .token(FCM_SCOPES)
                    .await
                    .map_err(|e| anyhow!("Failed to obtain FCM access token: {}", e))?;
                Ok(token.as_str().to_string())
            }
        }
    }

    async fn send_to_device(
        &self,
        bearer: &str,
        device_token: &str,
        message: &OutboundMessage,
    ) -> Result<String, DeviceError> {
        let data: HashMap<String, String> = message
            .template_params()
            .into_iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        let request = FcmRequest {
            message: FcmMessage {
                token: device_token.to_string(),
                notification: FcmNotification {
                    title: message.subject.clone(),
                    body: message.body.clone(),
                },
                data: (!data.is_empty()).then_some(data),
            },
        };

        let url = format!(
            "{}/v1/projects/{}/messages:send",
            self.base_url, self.project_id
        );

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(bearer)
            .json(&request)
            .send()
            .await?;

        if response.status().is_success() {
            let body: FcmResponse = response.json().await?;
            Ok(body.name)
        } else {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            let detail = format!("FCM returned {}: {}", status, error_text);

            if is_stale_token_response(status, &error_text) {
                Err(DeviceError::Stale(detail))
            } else {
                Err(DeviceError::Failed(AdapterError::Provider(detail)))
            }
        }
    }
}

#[async_trait]
impl ChannelAdapter for FcmClient {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, AdapterError> {
        let tokens = self.directory.device_tokens(&message.user_id).await?;
        if tokens.is_empty() {
            return Err(AdapterError::NoTokens);
        }

        let bearer = self.bearer_token().await?;

        let mut message_ids = Vec::new();
        let mut stale = Vec::new();
        let mut failed = 0;

        for token in &tokens {
            if let Err(e) = validate_fcm_token(token) {
                debug!(user_id = %message.user_id, error = %e, "Skipping malformed device token");
                stale.push(token.clone());
                continue;
            }

            match self.send_to_device(&bearer, token, message).await {
                Ok(message_id) => message_ids.push(message_id),
                Err(DeviceError::Stale(detail)) => {
                    debug!(user_id = %message.user_id, detail = %detail, "Device token no longer registered");
                    stale.push(token.clone());
                }
                Err(DeviceError::Failed(e)) => {
                    warn!(user_id = %message.user_id, error = %e, "FCM delivery to device failed");
                    failed += 1;
                }
            }
        }

        if !stale.is_empty() {
            if let Err(e) = self
                .directory
                .invalidate_device_tokens(&message.user_id, &stale)
                .await
            {
                warn!(user_id = %message.user_id, error = %e, "Failed to invalidate device tokens");
            }
        }

        if message_ids.is_empty() {
            return Err(AdapterError::AllDevicesRejected {
                rejected: stale.len() + failed,
            });
        }

        info!(
            user_id = %message.user_id,
            delivered = message_ids.len(),
            stale = stale.len(),
            failed,
            "FCM push notification sent"
        );

        Ok(SendReceipt {
            message_id: message_ids.swap_remove(0),
        })
    }
}
