//! Audience segmentation. `matches` is stateless and side-effect free so it
//! can be tested against literal submission fixtures without a database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extract::Submission;

/// Segmentation rule attached to a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudienceSpec {
    All,
    Completed,
    Abandoned,
    SinceDate { date: DateTime<Utc> },
    /// Field=value filter against the normalized variable map.
    FieldEquals { field_id: String, value: String },
}

pub fn matches(spec: &AudienceSpec, submission: &Submission) -> bool {
    match spec {
        AudienceSpec::All => true,
        AudienceSpec::Completed => submission.is_complete,
        AudienceSpec::Abandoned => !submission.is_complete,
        AudienceSpec::SinceDate { date } => submission.submitted_at >= *date,
        AudienceSpec::FieldEquals { field_id, value } => submission
            .variables
            .get(field_id)
            .map(|answer| answer.trim() == value.trim())
            .unwrap_or(false),
    }
}
