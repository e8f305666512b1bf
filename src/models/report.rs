use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::channel::Channel;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelTotals {
    pub sent: u64,
    pub delivered: u64,
    pub read: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl ChannelTotals {
    pub fn total(&self) -> u64 {
        self.sent + self.delivered + self.read + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReport {
    pub totals: ChannelTotals,
    /// Percentage of rows that reached the provider (sent, delivered or read).
    pub delivery_rate: f64,
    pub failure_rate: f64,
    pub sla_breaches: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReasonCount {
    pub reason: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub channels: BTreeMap<Channel, ChannelReport>,
    pub top_failure_reasons: Vec<FailureReasonCount>,
    pub duplicates_suppressed: u64,
    /// Skipped rows where opt-outs left nothing to attempt.
    pub opt_out_skips: u64,
}
