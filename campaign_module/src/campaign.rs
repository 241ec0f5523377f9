//! Campaign value types and the status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audience::AudienceSpec;
use crate::channel::Channel;
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
        }
    }

    /// `completed` is terminal; everything else follows
    /// draft -> active <-> paused -> completed.
    pub fn can_transition(self, next: CampaignStatus) -> bool {
        matches!(
            (self, next),
            (CampaignStatus::Draft, CampaignStatus::Active)
                | (CampaignStatus::Active, CampaignStatus::Paused)
                | (CampaignStatus::Active, CampaignStatus::Completed)
                | (CampaignStatus::Paused, CampaignStatus::Active)
                | (CampaignStatus::Paused, CampaignStatus::Completed)
        )
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(CampaignStatus::Draft),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            other => Err(format!("unknown campaign status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

/// When a matching submission should produce a dispatch task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Immediate,
    Delayed { amount: i64, unit: DelayUnit },
    DateFiltered { since: DateTime<Utc> },
}

impl ScheduleSpec {
    /// Fire time for a submission, or `None` when the schedule filters the
    /// submission out entirely.
    pub fn fire_time(
        &self,
        submitted_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Immediate => Some(now),
            ScheduleSpec::Delayed { amount, unit } => {
                let delay = match unit {
                    DelayUnit::Minutes => Duration::minutes(*amount),
                    DelayUnit::Hours => Duration::hours(*amount),
                    DelayUnit::Days => Duration::days(*amount),
                };
                Some(submitted_at + delay)
            }
            ScheduleSpec::DateFiltered { since } => {
                if submitted_at >= *since {
                    Some(now)
                } else {
                    None
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub owner_id: String,
    pub form_id: String,
    pub channel: Channel,
    /// Rotation list; the composer picks one deterministically per recipient.
    pub templates: Vec<String>,
    pub audience: AudienceSpec,
    pub schedule: ScheduleSpec,
    pub status: CampaignStatus,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(
        owner_id: &str,
        form_id: &str,
        channel: Channel,
        templates: Vec<String>,
        audience: AudienceSpec,
        schedule: ScheduleSpec,
    ) -> Result<Self, EngineError> {
        let campaign = Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            form_id: form_id.to_string(),
            channel,
            templates,
            audience,
            schedule,
            status: CampaignStatus::Draft,
            created_at: Utc::now(),
        };
        campaign.validate()?;
        Ok(campaign)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.owner_id.trim().is_empty() {
            return Err(EngineError::InvalidCampaign("owner_id is empty".into()));
        }
        if self.form_id.trim().is_empty() {
            return Err(EngineError::InvalidCampaign("form_id is empty".into()));
        }
        if self.templates.is_empty()
            || self.templates.iter().any(|tpl| tpl.trim().is_empty())
        {
            return Err(EngineError::InvalidCampaign(
                "campaign needs at least one non-blank template".into(),
            ));
        }
        if let AudienceSpec::FieldEquals { field_id, .. } = &self.audience {
            if field_id.trim().is_empty() {
                return Err(EngineError::InvalidCampaign(
                    "field filter needs a field id".into(),
                ));
            }
        }
        if let ScheduleSpec::Delayed { amount, .. } = &self.schedule {
            if *amount <= 0 {
                return Err(EngineError::InvalidCampaign(
                    "delay amount must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}
