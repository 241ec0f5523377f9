//! Sqlite-backed campaign repository. Status transitions are the only
//! mutation path; deletion is a soft flag so delivery logs can keep
//! referencing the campaign row.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::campaign::{Campaign, CampaignStatus};
use crate::channel::Channel;
use crate::error::EngineError;
use crate::util::{format_datetime, parse_datetime};

const CAMPAIGN_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS campaigns (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    form_id TEXT NOT NULL,
    channel TEXT NOT NULL,
    templates TEXT NOT NULL,
    audience TEXT NOT NULL,
    schedule TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS campaigns_form_idx ON campaigns(form_id, status, deleted);
"#;

#[derive(Debug)]
pub struct SqliteCampaignStore {
    path: PathBuf,
}

impl SqliteCampaignStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, EngineError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(CAMPAIGN_SCHEMA)?;
        Ok(conn)
    }

    pub fn insert(&self, campaign: &Campaign) -> Result<(), EngineError> {
        campaign.validate()?;
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO campaigns (id, owner_id, form_id, channel, templates, audience, schedule, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                campaign.id.to_string(),
                campaign.owner_id,
                campaign.form_id,
                campaign.channel.to_string(),
                serde_json::to_string(&campaign.templates)?,
                serde_json::to_string(&campaign.audience)?,
                serde_json::to_string(&campaign.schedule)?,
                campaign.status.as_str(),
                format_datetime(campaign.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &Uuid) -> Result<Option<Campaign>, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, form_id, channel, templates, audience, schedule, status, created_at
             FROM campaigns
             WHERE id = ?1 AND deleted = 0",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_campaign(row)?)),
            None => Ok(None),
        }
    }

    /// Active, non-deleted campaigns targeting a form. The scheduler fans
    /// every new submission out across this set.
    pub fn active_for_form(&self, form_id: &str) -> Result<Vec<Campaign>, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, form_id, channel, templates, audience, schedule, status, created_at
             FROM campaigns
             WHERE form_id = ?1 AND status = 'active' AND deleted = 0
             ORDER BY created_at",
        )?;
        let mut rows = stmt.query(params![form_id])?;
        let mut campaigns = Vec::new();
        while let Some(row) = rows.next()? {
            campaigns.push(row_to_campaign(row)?);
        }
        Ok(campaigns)
    }

    /// Distinct owners with any non-deleted campaign on a form; the
    /// completion detector notifies these.
    pub fn owners_for_form(&self, form_id: &str) -> Result<Vec<String>, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT owner_id FROM campaigns WHERE form_id = ?1 AND deleted = 0",
        )?;
        let mut rows = stmt.query(params![form_id])?;
        let mut owners = Vec::new();
        while let Some(row) = rows.next()? {
            owners.push(row.get::<_, String>(0)?);
        }
        Ok(owners)
    }

    /// Apply a validated status transition and return the updated campaign.
    pub fn transition(
        &self,
        id: &Uuid,
        next: CampaignStatus,
    ) -> Result<Campaign, EngineError> {
        let mut campaign = self.get(id)?.ok_or(EngineError::CampaignNotFound(*id))?;
        if !campaign.status.can_transition(next) {
            return Err(EngineError::InvalidTransition {
                from: campaign.status,
                to: next,
            });
        }
        let conn = self.open()?;
        conn.execute(
            "UPDATE campaigns SET status = ?1 WHERE id = ?2 AND deleted = 0",
            params![next.as_str(), id.to_string()],
        )?;
        campaign.status = next;
        Ok(campaign)
    }

    /// Soft delete. Rows stay behind for delivery-log references.
    pub fn soft_delete(&self, id: &Uuid) -> Result<bool, EngineError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE campaigns SET deleted = 1 WHERE id = ?1 AND deleted = 0",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_campaign(row: &Row<'_>) -> Result<Campaign, EngineError> {
    let id_raw: String = row.get(0)?;
    let channel_raw: String = row.get(3)?;
    let templates_raw: String = row.get(4)?;
    let audience_raw: String = row.get(5)?;
    let schedule_raw: String = row.get(6)?;
    let status_raw: String = row.get(7)?;
    let created_at_raw: String = row.get(8)?;

    Ok(Campaign {
        id: Uuid::parse_str(&id_raw)?,
        owner_id: row.get(1)?,
        form_id: row.get(2)?,
        channel: Channel::from_str(&channel_raw).map_err(EngineError::Storage)?,
        templates: serde_json::from_str(&templates_raw)?,
        audience: serde_json::from_str(&audience_raw)?,
        schedule: serde_json::from_str(&schedule_raw)?,
        status: CampaignStatus::from_str(&status_raw).map_err(EngineError::Storage)?,
        created_at: parse_datetime(&created_at_raw)?,
    })
}
