use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use tracing::debug;

use crate::{
    clients::store::PreferenceStore,
    models::{
        channel::Channel,
        preference::{is_critical_event, preference_field},
    },
};

pub struct PreferenceGate {
    store: Arc<dyn PreferenceStore>,
}

impl PreferenceGate {
    pub fn new(store: Arc<dyn PreferenceStore>) -> Self {
        Self { store }
    }

    /// Hard opt-outs; these remove a channel from the chain for every event type.
    pub async fn hard_opt_outs(&self, user_id: &str) -> Result<HashSet<Channel>> {
        self.store.channel_opt_outs(user_id).await
    }

    /// Category-level decision. Critical events are always permitted and
    /// unmapped event types default to permitted.
    pub async fn is_permitted(
        &self,
        user_id: &str,
        event_type: Option<&str>,
        channel: Channel,
    ) -> Result<bool> {
        let Some(event_type) = event_type else {
            return Ok(true);
        };

        if is_critical_event(event_type) {
            return Ok(true);
        }

        let Some(category) = preference_field(event_type) else {
            return Ok(true);
        };

        let enabled = self
            .store
            .category_enabled(user_id, category, channel)
            .await?
            .unwrap_or(true);

        debug!(user_id, event_type, category, channel = %channel, enabled, "Preference evaluated");

        Ok(enabled)
    }

    pub async fn record_opt_out(&self, user_id: &str, channel: Channel) -> Result<()> {
        self.store.set_channel_opt_out(user_id, channel, true).await
    }

    pub async fn record_opt_in(&self, user_id: &str, channel: Channel) -> Result<()> {
        self.store.set_channel_opt_out(user_id, channel, false).await
    }
}
