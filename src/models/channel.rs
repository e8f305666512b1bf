use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use anyhow::{Error, anyhow};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Push,
    Whatsapp,
    Sms,
}

impl Channel {
    /// Global fallback order before rotation.
    pub const DEFAULT_ORDER: [Channel; 3] = [Channel::Push, Channel::Whatsapp, Channel::Sms];

    pub fn from_string(s: &str) -> Option<Self> {
        match s {
            "push" => Some(Channel::Push),
            "whatsapp" => Some(Channel::Whatsapp),
            "sms" => Some(Channel::Sms),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Push => "push",
            Channel::Whatsapp => "whatsapp",
            Channel::Sms => "sms",
        }
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::from_string(s).ok_or_else(|| anyhow!("Unknown channel '{}'", s))
    }
}

/// Accepts any string for an optional channel; unknown names become `None`.
pub fn lenient_channel<'de, D>(deserializer: D) -> Result<Option<Channel>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.as_deref().and_then(Channel::from_string))
}
