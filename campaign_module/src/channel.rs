use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Outbound channel a campaign dispatches on.
///
/// WhatsApp is never sent by a worker directly; its pending tasks are pulled
/// by the external extension agent through the bridge endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
    WhatsApp,
}

impl Default for Channel {
    fn default() -> Self {
        Channel::Email
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
            Channel::WhatsApp => "whatsapp",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sms" => Ok(Channel::Sms),
            "email" => Ok(Channel::Email),
            "whatsapp" => Ok(Channel::WhatsApp),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Transient network/provider failure. Retried with backoff.
    #[error("provider request failed: {0}")]
    Request(String),
    /// Provider understood the request and refused it.
    #[error("provider rejected message: {0}")]
    Rejected(String),
}

/// Seam between dispatch workers and concrete providers. The recipient is
/// always a normalized key (E.164-like phone or validated email address).
pub trait MessageSender: Send + Sync {
    fn send(&self, recipient: &str, message: &str) -> Result<String, ProviderError>;
    fn channel(&self) -> Channel;
}
