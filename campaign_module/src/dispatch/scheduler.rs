//! Fan-out from submissions to dispatch tasks. For each new submission the
//! scheduler walks the active campaigns on its form, applies the audience
//! and schedule rules, renders the message, and enqueues a pending task.
//!
//! The pre-checks against the ledger and the open-task index here only trim
//! obvious duplicates; the send-time ledger claim stays authoritative.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::audience;
use crate::campaign::Campaign;
use crate::campaign_store::SqliteCampaignStore;
use crate::channel::Channel;
use crate::compose;
use crate::error::EngineError;
use crate::extract::Submission;

use super::store::SqliteDispatchStore;
use super::types::DispatchTask;

pub struct CampaignScheduler {
    campaigns: Arc<SqliteCampaignStore>,
    dispatch: Arc<SqliteDispatchStore>,
}

impl CampaignScheduler {
    pub fn new(
        campaigns: Arc<SqliteCampaignStore>,
        dispatch: Arc<SqliteDispatchStore>,
    ) -> Self {
        Self { campaigns, dispatch }
    }

    /// Fan a submission out across the active campaigns on its form.
    /// Returns the number of tasks enqueued.
    pub fn on_submission(&self, submission: &Submission) -> Result<usize, EngineError> {
        self.on_submission_at(submission, Utc::now())
    }

    pub fn on_submission_at(
        &self,
        submission: &Submission,
        now: DateTime<Utc>,
    ) -> Result<usize, EngineError> {
        let active = self.campaigns.active_for_form(&submission.form_id)?;
        let mut created = 0;

        for campaign in &active {
            if !audience::matches(&campaign.audience, submission) {
                continue;
            }
            let Some(recipient_key) = recipient_key_for(campaign.channel, submission) else {
                warn!(
                    campaign_id = %campaign.id,
                    submission_id = %submission.id,
                    channel = %campaign.channel,
                    "submission has no usable contact for channel, skipping"
                );
                continue;
            };
            let Some(fire_at) = campaign.schedule.fire_time(submission.submitted_at, now)
            else {
                continue;
            };

            if self.dispatch.already_contacted(&campaign.id, recipient_key)? {
                debug!(
                    campaign_id = %campaign.id,
                    recipient = recipient_key,
                    "recipient already contacted, skipping enqueue"
                );
                continue;
            }
            if self.dispatch.has_open_task(&campaign.id, recipient_key)? {
                debug!(
                    campaign_id = %campaign.id,
                    recipient = recipient_key,
                    "open task exists for recipient, skipping enqueue"
                );
                continue;
            }

            let message = match render_for(campaign, recipient_key, submission) {
                Some(message) => message,
                None => continue,
            };

            let task = DispatchTask::new(
                campaign.id,
                recipient_key,
                &message,
                campaign.channel,
                fire_at,
            );
            self.dispatch.insert_task(&task)?;
            debug!(
                campaign_id = %campaign.id,
                task_id = %task.id,
                scheduled_at = %fire_at,
                "enqueued dispatch task"
            );
            created += 1;
        }

        Ok(created)
    }
}

/// Contact key for a channel: phone for the phone channels, email otherwise.
fn recipient_key_for(channel: Channel, submission: &Submission) -> Option<&str> {
    match channel {
        Channel::Sms | Channel::WhatsApp => submission.phone.as_deref(),
        Channel::Email => submission.email.as_deref(),
    }
}

fn render_for(
    campaign: &Campaign,
    recipient_key: &str,
    submission: &Submission,
) -> Option<String> {
    let template = compose::pick_template(&campaign.templates, recipient_key)?;
    Some(compose::render(template, &submission.variables))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::audience::AudienceSpec;
    use crate::campaign::{CampaignStatus, DelayUnit, ScheduleSpec};

    use super::*;

    struct Fixture {
        _temp: TempDir,
        campaigns: Arc<SqliteCampaignStore>,
        dispatch: Arc<SqliteDispatchStore>,
        scheduler: CampaignScheduler,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("tempdir");
        let campaigns = Arc::new(
            SqliteCampaignStore::new(temp.path().join("campaigns.db")).expect("store"),
        );
        let dispatch = Arc::new(
            SqliteDispatchStore::new(temp.path().join("dispatch.db")).expect("store"),
        );
        let scheduler = CampaignScheduler::new(campaigns.clone(), dispatch.clone());
        Fixture {
            _temp: temp,
            campaigns,
            dispatch,
            scheduler,
        }
    }

    fn activate(fixture: &Fixture, campaign: &Campaign) {
        fixture.campaigns.insert(campaign).expect("insert");
        fixture
            .campaigns
            .transition(&campaign.id, CampaignStatus::Active)
            .expect("activate");
    }

    fn submission(phone: Option<&str>, is_complete: bool) -> Submission {
        Submission {
            id: Uuid::new_v4(),
            form_id: "form-1".to_string(),
            variables: HashMap::from([("name".to_string(), "Ana".to_string())]),
            phone: phone.map(str::to_string),
            email: Some("ana@example.com".to_string()),
            name: Some("Ana".to_string()),
            is_complete,
            completion_percent: if is_complete { 100 } else { 50 },
            submitted_at: Utc::now(),
            country: None,
        }
    }

    fn whatsapp_campaign(audience: AudienceSpec, schedule: ScheduleSpec) -> Campaign {
        Campaign::new(
            "owner-1",
            "form-1",
            Channel::WhatsApp,
            vec!["Hi {name}".to_string()],
            audience,
            schedule,
        )
        .expect("campaign")
    }

    #[test]
    fn matching_submission_enqueues_a_rendered_task() {
        let fx = fixture();
        let campaign = whatsapp_campaign(AudienceSpec::Completed, ScheduleSpec::Immediate);
        activate(&fx, &campaign);

        let now = Utc::now();
        let created = fx
            .scheduler
            .on_submission_at(&submission(Some("5511999998888"), true), now)
            .expect("fan out");
        assert_eq!(created, 1);

        let claimed = fx
            .dispatch
            .claim_due_batch(Channel::WhatsApp, now, 10, "test")
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].rendered_message, "Hi Ana");
        assert_eq!(claimed[0].recipient_key, "5511999998888");
    }

    #[test]
    fn audience_mismatch_enqueues_nothing() {
        let fx = fixture();
        let campaign = whatsapp_campaign(AudienceSpec::Completed, ScheduleSpec::Immediate);
        activate(&fx, &campaign);

        let created = fx
            .scheduler
            .on_submission(&submission(Some("5511999998888"), false))
            .expect("fan out");
        assert_eq!(created, 0);
    }

    #[test]
    fn missing_contact_key_skips_without_error() {
        let fx = fixture();
        let campaign = whatsapp_campaign(AudienceSpec::All, ScheduleSpec::Immediate);
        activate(&fx, &campaign);

        let created = fx
            .scheduler
            .on_submission(&submission(None, true))
            .expect("fan out");
        assert_eq!(created, 0);
    }

    #[test]
    fn delayed_schedule_sets_future_fire_time() {
        let fx = fixture();
        let campaign = whatsapp_campaign(
            AudienceSpec::All,
            ScheduleSpec::Delayed {
                amount: 2,
                unit: DelayUnit::Hours,
            },
        );
        activate(&fx, &campaign);

        let now = Utc::now();
        let sub = submission(Some("5511999998888"), true);
        fx.scheduler.on_submission_at(&sub, now).expect("fan out");

        // Not due yet.
        let claimed = fx
            .dispatch
            .claim_due_batch(Channel::WhatsApp, now, 10, "test")
            .expect("claim");
        assert!(claimed.is_empty());

        // Due once the delay has elapsed.
        let later = sub.submitted_at + chrono::Duration::hours(2);
        let claimed = fx
            .dispatch
            .claim_due_batch(Channel::WhatsApp, later, 10, "test")
            .expect("claim");
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn repeat_submission_does_not_double_enqueue() {
        let fx = fixture();
        let campaign = whatsapp_campaign(AudienceSpec::All, ScheduleSpec::Immediate);
        activate(&fx, &campaign);

        let sub = submission(Some("5511999998888"), true);
        assert_eq!(fx.scheduler.on_submission(&sub).expect("first"), 1);
        assert_eq!(fx.scheduler.on_submission(&sub).expect("second"), 0);
    }

    #[test]
    fn already_contacted_recipient_is_not_enqueued_again() {
        let fx = fixture();
        let campaign = whatsapp_campaign(AudienceSpec::All, ScheduleSpec::Immediate);
        activate(&fx, &campaign);

        let sub = submission(Some("5511999998888"), true);
        let now = Utc::now();
        fx.scheduler.on_submission_at(&sub, now).expect("fan out");

        // Drive the first task to sent through the ledger.
        let claimed = fx
            .dispatch
            .claim_due_batch(Channel::WhatsApp, now, 10, "test")
            .expect("claim");
        let task = &claimed[0];
        fx.dispatch
            .try_claim(&task.campaign_id, &task.recipient_key, &task.id)
            .expect("ledger");
        fx.dispatch.mark_sent(&task.id).expect("sent");

        // The same phone resubmitting (even under a new submission id)
        // creates no further task for this campaign.
        let again = submission(Some("5511999998888"), true);
        assert_eq!(fx.scheduler.on_submission(&again).expect("fan out"), 0);
    }

    #[test]
    fn fan_out_covers_every_active_campaign() {
        let fx = fixture();
        let whatsapp = whatsapp_campaign(AudienceSpec::All, ScheduleSpec::Immediate);
        activate(&fx, &whatsapp);
        let email = Campaign::new(
            "owner-1",
            "form-1",
            Channel::Email,
            vec!["Hello {name}".to_string()],
            AudienceSpec::All,
            ScheduleSpec::Immediate,
        )
        .expect("campaign");
        activate(&fx, &email);

        let created = fx
            .scheduler
            .on_submission(&submission(Some("5511999998888"), true))
            .expect("fan out");
        assert_eq!(created, 2);

        let stats = fx.dispatch.campaign_counts(&email.id).expect("stats");
        assert_eq!(stats.pending, 1);
    }
}
