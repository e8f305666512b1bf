use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Sent,
    Delivered,
    Read,
    Failed,
    Skipped,
}

impl LogStatus {
    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(LogStatus::Sent),
            "delivered" => Some(LogStatus::Delivered),
            "read" => Some(LogStatus::Read),
            "failed" => Some(LogStatus::Failed),
            "skipped" => Some(LogStatus::Skipped),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Sent => "sent",
            LogStatus::Delivered => "delivered",
            LogStatus::Read => "read",
            LogStatus::Failed => "failed",
            LogStatus::Skipped => "skipped",
        }
    }

    /// Statuses that count as a successful delivery for dedup purposes.
    pub fn is_successful(&self) -> bool {
        matches!(self, LogStatus::Sent | LogStatus::Delivered | LogStatus::Read)
    }

    /// Statuses a row may be in for a webhook to move it to `self`.
    pub fn predecessors(&self) -> &'static [LogStatus] {
        match self {
            LogStatus::Delivered => &[LogStatus::Sent],
            LogStatus::Read => &[LogStatus::Sent, LogStatus::Delivered],
            LogStatus::Failed => &[LogStatus::Sent, LogStatus::Delivered],
            LogStatus::Sent | LogStatus::Skipped => &[],
        }
    }
}

impl Display for LogStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.write_str(self.as_str())
    }
}
