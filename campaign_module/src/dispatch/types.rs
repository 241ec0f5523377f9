use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::Channel;

/// Dispatch task lifecycle. `sent`, `failed` and `skipped_duplicate` are
/// terminal; `failed` means retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Sent,
    Failed,
    SkippedDuplicate,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::InFlight => "in_flight",
            TaskState::Sent => "sent",
            TaskState::Failed => "failed",
            TaskState::SkippedDuplicate => "skipped_duplicate",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Sent | TaskState::Failed | TaskState::SkippedDuplicate
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TaskState::Pending),
            "in_flight" => Ok(TaskState::InFlight),
            "sent" => Ok(TaskState::Sent),
            "failed" => Ok(TaskState::Failed),
            "skipped_duplicate" => Ok(TaskState::SkippedDuplicate),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

/// One queued message. `recipient_key` is the normalized contact key the
/// dedup ledger is keyed on; the message is fully rendered at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTask {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_key: String,
    pub rendered_message: String,
    pub channel: Channel,
    pub state: TaskState,
    pub attempts: u32,
    pub scheduled_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl DispatchTask {
    pub fn new(
        campaign_id: Uuid,
        recipient_key: &str,
        rendered_message: &str,
        channel: Channel,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            recipient_key: recipient_key.to_string(),
            rendered_message: rendered_message.to_string(),
            channel,
            state: TaskState::Pending,
            attempts: 0,
            scheduled_at,
            last_error: None,
        }
    }
}

/// Result of a dedup-ledger claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This task owns the (campaign, recipient) pair and may send.
    Claimed,
    /// Another task already contacted this recipient for this campaign.
    AlreadyClaimed,
}

/// Per-campaign delivery counters for the stats endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub pending: u64,
    pub in_flight: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped_duplicate: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_roundtrips() {
        for state in [
            TaskState::Pending,
            TaskState::InFlight,
            TaskState::Sent,
            TaskState::Failed,
            TaskState::SkippedDuplicate,
        ] {
            let parsed: TaskState = state.as_str().parse().expect("parse");
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::InFlight.is_terminal());
        assert!(TaskState::Sent.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::SkippedDuplicate.is_terminal());
    }
}
