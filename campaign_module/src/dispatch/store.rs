//! Sqlite-backed dispatch queue and dedup ledger. Both tables live in the
//! same database file so a send claim and its ledger entry commit together.
//!
//! Queue rows follow a lease model: a claimer marks rows `in_flight` with
//! `locked_at`/`locked_by`, and a watchdog releases leases whose holder has
//! gone quiet.

use std::fs;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::EngineError;
use crate::util::{format_datetime, parse_datetime};

use super::types::{CampaignStats, ClaimOutcome, DispatchTask, TaskState};

const DISPATCH_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dispatch_tasks (
    id TEXT PRIMARY KEY,
    campaign_id TEXT NOT NULL,
    recipient_key TEXT NOT NULL,
    rendered_message TEXT NOT NULL,
    channel TEXT NOT NULL,
    state TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    scheduled_at TEXT NOT NULL,
    locked_at TEXT,
    locked_by TEXT,
    sent_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS dispatch_due_idx
    ON dispatch_tasks(channel, state, scheduled_at);
CREATE INDEX IF NOT EXISTS dispatch_campaign_idx
    ON dispatch_tasks(campaign_id, state);

CREATE TABLE IF NOT EXISTS dedup_entries (
    campaign_id TEXT NOT NULL,
    recipient_key TEXT NOT NULL,
    task_id TEXT NOT NULL,
    claimed_at TEXT NOT NULL,
    PRIMARY KEY (campaign_id, recipient_key)
);
"#;

#[derive(Debug)]
pub struct SqliteDispatchStore {
    path: PathBuf,
}

impl SqliteDispatchStore {
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
        conn.busy_timeout(StdDuration::from_secs(5))?;
        conn.execute_batch(DISPATCH_SCHEMA)?;
        Ok(conn)
    }

    pub fn insert_task(&self, task: &DispatchTask) -> Result<(), EngineError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO dispatch_tasks
                 (id, campaign_id, recipient_key, rendered_message, channel,
                  state, attempts, scheduled_at, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                task.id.to_string(),
                task.campaign_id.to_string(),
                task.recipient_key,
                task.rendered_message,
                task.channel.to_string(),
                task.state.as_str(),
                i64::from(task.attempts),
                format_datetime(task.scheduled_at),
                task.last_error,
                format_datetime(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &Uuid) -> Result<Option<DispatchTask>, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, campaign_id, recipient_key, rendered_message, channel,
                    state, attempts, scheduled_at, last_error
             FROM dispatch_tasks WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_task(row)?)),
            None => Ok(None),
        }
    }

    /// Lease up to `limit` due pending tasks on a channel, oldest first.
    /// Runs in a transaction so two claimers never lease the same row.
    pub fn claim_due_batch(
        &self,
        channel: Channel,
        now: DateTime<Utc>,
        limit: usize,
        locked_by: &str,
    ) -> Result<Vec<DispatchTask>, EngineError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let mut claimed = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT id, campaign_id, recipient_key, rendered_message, channel,
                        state, attempts, scheduled_at, last_error
                 FROM dispatch_tasks
                 WHERE channel = ?1 AND state = 'pending' AND scheduled_at <= ?2
                 ORDER BY scheduled_at
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(params![
                channel.to_string(),
                format_datetime(now),
                limit as i64
            ])?;
            while let Some(row) = rows.next()? {
                claimed.push(row_to_task(row)?);
            }
        }
        for task in &mut claimed {
            tx.execute(
                "UPDATE dispatch_tasks
                 SET state = 'in_flight', locked_at = ?1, locked_by = ?2
                 WHERE id = ?3",
                params![
                    format_datetime(now),
                    locked_by,
                    task.id.to_string()
                ],
            )?;
            task.state = TaskState::InFlight;
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// Claim the (campaign, recipient) pair in the dedup ledger for a task.
    ///
    /// First claimer wins; a re-claim by the same task (a retry after a
    /// crash between claim and send report) also wins. Anyone else gets
    /// [`ClaimOutcome::AlreadyClaimed`].
    pub fn try_claim(
        &self,
        campaign_id: &Uuid,
        recipient_key: &str,
        task_id: &Uuid,
    ) -> Result<ClaimOutcome, EngineError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO dedup_entries
                 (campaign_id, recipient_key, task_id, claimed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                campaign_id.to_string(),
                recipient_key,
                task_id.to_string(),
                format_datetime(Utc::now()),
            ],
        )?;
        if inserted > 0 {
            return Ok(ClaimOutcome::Claimed);
        }
        let owner: String = conn.query_row(
            "SELECT task_id FROM dedup_entries
             WHERE campaign_id = ?1 AND recipient_key = ?2",
            params![campaign_id.to_string(), recipient_key],
            |row| row.get(0),
        )?;
        if owner == task_id.to_string() {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }

    /// Whether the dedup ledger already has an entry for this pair. Used as
    /// a cheap enqueue-time pre-check; [`try_claim`](Self::try_claim) at send
    /// time remains the authoritative gate.
    pub fn already_contacted(
        &self,
        campaign_id: &Uuid,
        recipient_key: &str,
    ) -> Result<bool, EngineError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dedup_entries
             WHERE campaign_id = ?1 AND recipient_key = ?2",
            params![campaign_id.to_string(), recipient_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether a non-terminal task already exists for this pair, so the
    /// scheduler does not enqueue the same recipient twice.
    pub fn has_open_task(
        &self,
        campaign_id: &Uuid,
        recipient_key: &str,
    ) -> Result<bool, EngineError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dispatch_tasks
             WHERE campaign_id = ?1 AND recipient_key = ?2
               AND state IN ('pending', 'in_flight')",
            params![campaign_id.to_string(), recipient_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Mark a task delivered. Only non-terminal tasks move; a stale report
    /// for an already-settled task is a no-op surfaced as `false`.
    pub fn mark_sent(&self, task_id: &Uuid) -> Result<bool, EngineError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE dispatch_tasks
             SET state = 'sent', sent_at = ?1, locked_at = NULL, locked_by = NULL,
                 last_error = NULL
             WHERE id = ?2 AND state IN ('pending', 'in_flight')",
            params![format_datetime(Utc::now()), task_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Settle a task as a duplicate after it lost the ledger claim.
    pub fn mark_skipped_duplicate(&self, task_id: &Uuid) -> Result<bool, EngineError> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE dispatch_tasks
             SET state = 'skipped_duplicate', locked_at = NULL, locked_by = NULL
             WHERE id = ?1 AND state IN ('pending', 'in_flight')",
            params![task_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Put a leased task back to pending without consuming an attempt. Used
    /// when the throttle refused a slot rather than the send failing.
    pub fn release_task(&self, task_id: &Uuid) -> Result<(), EngineError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE dispatch_tasks
             SET state = 'pending', locked_at = NULL, locked_by = NULL
             WHERE id = ?1 AND state = 'in_flight'",
            params![task_id.to_string()],
        )?;
        Ok(())
    }

    /// Record a failed attempt. The task returns to pending with exponential
    /// backoff until `max_retries` attempts are consumed, then settles as
    /// failed. Returns the resulting state. A stale report against an
    /// already-settled task leaves it untouched.
    pub fn record_failure(
        &self,
        task_id: &Uuid,
        error: &str,
        now: DateTime<Utc>,
        max_retries: u32,
        backoff_base: StdDuration,
    ) -> Result<TaskState, EngineError> {
        use std::str::FromStr;

        let conn = self.open()?;
        let (attempts, state_raw): (i64, String) = conn.query_row(
            "SELECT attempts, state FROM dispatch_tasks WHERE id = ?1",
            params![task_id.to_string()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).map_err(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => EngineError::TaskNotFound(*task_id),
            other => EngineError::Sqlite(other),
        })?;
        let current = TaskState::from_str(&state_raw).map_err(EngineError::Storage)?;
        if current.is_terminal() {
            return Ok(current);
        }

        let attempts = attempts as u32 + 1;
        if attempts >= max_retries {
            conn.execute(
                "UPDATE dispatch_tasks
                 SET state = 'failed', attempts = ?1, last_error = ?2,
                     locked_at = NULL, locked_by = NULL
                 WHERE id = ?3",
                params![i64::from(attempts), error, task_id.to_string()],
            )?;
            return Ok(TaskState::Failed);
        }

        let backoff = Duration::from_std(backoff_base * 2u32.pow(attempts.min(20) - 1))
            .unwrap_or_else(|_| Duration::days(3650));
        conn.execute(
            "UPDATE dispatch_tasks
             SET state = 'pending', attempts = ?1, last_error = ?2,
                 scheduled_at = ?3, locked_at = NULL, locked_by = NULL
             WHERE id = ?4",
            params![
                i64::from(attempts),
                error,
                format_datetime(now + backoff),
                task_id.to_string()
            ],
        )?;
        Ok(TaskState::Pending)
    }

    /// Release in-flight leases on a channel older than `cutoff` whose
    /// holder is not in `live_holders`. The lost-agent watchdog runs this
    /// for the pull channel; attempts are not consumed.
    pub fn release_stale_except(
        &self,
        channel: Channel,
        cutoff: DateTime<Utc>,
        live_holders: &[String],
    ) -> Result<usize, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, locked_by FROM dispatch_tasks
             WHERE channel = ?1 AND state = 'in_flight' AND locked_at < ?2",
        )?;
        let mut rows = stmt.query(params![channel.to_string(), format_datetime(cutoff)])?;
        let mut stale = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let holder: Option<String> = row.get(1)?;
            let alive = holder
                .as_deref()
                .map(|h| live_holders.iter().any(|live| live == h))
                .unwrap_or(false);
            if !alive {
                stale.push(id);
            }
        }
        drop(rows);
        drop(stmt);

        for id in &stale {
            conn.execute(
                "UPDATE dispatch_tasks
                 SET state = 'pending', locked_at = NULL, locked_by = NULL
                 WHERE id = ?1 AND state = 'in_flight'",
                params![id],
            )?;
        }
        Ok(stale.len())
    }

    pub fn campaign_counts(&self, campaign_id: &Uuid) -> Result<CampaignStats, EngineError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT state, COUNT(*) FROM dispatch_tasks
             WHERE campaign_id = ?1 GROUP BY state",
        )?;
        let mut rows = stmt.query(params![campaign_id.to_string()])?;
        let mut stats = CampaignStats::default();
        while let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            let count = count as u64;
            match state.as_str() {
                "pending" => stats.pending = count,
                "in_flight" => stats.in_flight = count,
                "sent" => stats.sent = count,
                "failed" => stats.failed = count,
                "skipped_duplicate" => stats.skipped_duplicate = count,
                _ => {}
            }
        }
        Ok(stats)
    }
}

fn row_to_task(row: &Row<'_>) -> Result<DispatchTask, EngineError> {
    use std::str::FromStr;

    let id_raw: String = row.get(0)?;
    let campaign_raw: String = row.get(1)?;
    let channel_raw: String = row.get(4)?;
    let state_raw: String = row.get(5)?;
    let attempts: i64 = row.get(6)?;
    let scheduled_raw: String = row.get(7)?;

    Ok(DispatchTask {
        id: Uuid::parse_str(&id_raw)?,
        campaign_id: Uuid::parse_str(&campaign_raw)?,
        recipient_key: row.get(2)?,
        rendered_message: row.get(3)?,
        channel: Channel::from_str(&channel_raw).map_err(EngineError::Storage)?,
        state: TaskState::from_str(&state_raw).map_err(EngineError::Storage)?,
        attempts: attempts as u32,
        scheduled_at: parse_datetime(&scheduled_raw)?,
        last_error: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn store(temp: &TempDir) -> SqliteDispatchStore {
        SqliteDispatchStore::new(temp.path().join("dispatch.db")).expect("store")
    }

    fn task(channel: Channel, scheduled_at: DateTime<Utc>) -> DispatchTask {
        DispatchTask::new(Uuid::new_v4(), "5511999998888", "Hi Ana", channel, scheduled_at)
    }

    #[test]
    fn claim_due_batch_leases_only_due_pending_rows() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();

        let due = task(Channel::Sms, now - Duration::minutes(1));
        let future = task(Channel::Sms, now + Duration::minutes(5));
        let other_channel = task(Channel::Email, now - Duration::minutes(1));
        store.insert_task(&due).expect("insert");
        store.insert_task(&future).expect("insert");
        store.insert_task(&other_channel).expect("insert");

        let claimed = store
            .claim_due_batch(Channel::Sms, now, 10, "worker-1")
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].state, TaskState::InFlight);

        // A second claimer gets nothing; the lease is held.
        let again = store
            .claim_due_batch(Channel::Sms, now, 10, "worker-2")
            .expect("claim");
        assert!(again.is_empty());
    }

    #[test]
    fn ledger_claim_is_first_wins_with_owner_retry() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let campaign = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            store.try_claim(&campaign, "5511999998888", &first).expect("claim"),
            ClaimOutcome::Claimed
        );
        // Owner retry wins again.
        assert_eq!(
            store.try_claim(&campaign, "5511999998888", &first).expect("claim"),
            ClaimOutcome::Claimed
        );
        // A different task for the same pair loses.
        assert_eq!(
            store.try_claim(&campaign, "5511999998888", &second).expect("claim"),
            ClaimOutcome::AlreadyClaimed
        );
        // Same recipient under another campaign is a fresh pair.
        assert_eq!(
            store
                .try_claim(&Uuid::new_v4(), "5511999998888", &second)
                .expect("claim"),
            ClaimOutcome::Claimed
        );
        assert!(store.already_contacted(&campaign, "5511999998888").expect("check"));
    }

    #[test]
    fn concurrent_claims_for_one_recipient_yield_a_single_winner() {
        use std::sync::Arc;

        let temp = TempDir::new().expect("tempdir");
        let store = Arc::new(
            SqliteDispatchStore::new(temp.path().join("dispatch.db")).expect("store"),
        );
        let campaign = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                let task_id = Uuid::new_v4();
                store
                    .try_claim(&campaign, "5511999998888", &task_id)
                    .expect("claim")
            }));
        }

        let outcomes: Vec<ClaimOutcome> = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread"))
            .collect();
        let winners = outcomes
            .iter()
            .filter(|outcome| **outcome == ClaimOutcome::Claimed)
            .count();
        assert_eq!(winners, 1, "exactly one task may own the recipient");
        assert_eq!(outcomes.len(), 8);
    }

    #[test]
    fn record_failure_backs_off_then_fails_terminally() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let task = task(Channel::Sms, now);
        store.insert_task(&task).expect("insert");

        let state = store
            .record_failure(&task.id, "timeout", now, 3, StdDuration::from_secs(60))
            .expect("failure");
        assert_eq!(state, TaskState::Pending);
        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.scheduled_at, now + Duration::seconds(60));
        assert_eq!(loaded.last_error.as_deref(), Some("timeout"));

        let state = store
            .record_failure(&task.id, "timeout", now, 3, StdDuration::from_secs(60))
            .expect("failure");
        assert_eq!(state, TaskState::Pending);
        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.scheduled_at, now + Duration::seconds(120));

        let state = store
            .record_failure(&task.id, "timeout", now, 3, StdDuration::from_secs(60))
            .expect("failure");
        assert_eq!(state, TaskState::Failed);
    }

    #[test]
    fn mark_sent_is_guarded_against_stale_reports() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let task = task(Channel::Email, now);
        store.insert_task(&task).expect("insert");

        assert!(store.mark_sent(&task.id).expect("sent"));
        // Settled tasks ignore further reports.
        assert!(!store.mark_sent(&task.id).expect("sent again"));
        assert!(!store.mark_skipped_duplicate(&task.id).expect("skip"));

        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.state, TaskState::Sent);
    }

    #[test]
    fn release_task_returns_lease_without_attempt() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let task = task(Channel::Sms, now - Duration::minutes(1));
        store.insert_task(&task).expect("insert");

        let claimed = store
            .claim_due_batch(Channel::Sms, now, 1, "worker-1")
            .expect("claim");
        assert_eq!(claimed.len(), 1);

        store.release_task(&task.id).expect("release");
        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.state, TaskState::Pending);
        assert_eq!(loaded.attempts, 0);
    }

    #[test]
    fn stale_leases_are_released_unless_holder_is_live() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();

        let lost = task(Channel::WhatsApp, now - Duration::minutes(10));
        let held = task(Channel::WhatsApp, now - Duration::minutes(10));
        store.insert_task(&lost).expect("insert");
        store.insert_task(&held).expect("insert");

        let claimed = store
            .claim_due_batch(Channel::WhatsApp, now - Duration::minutes(5), 10, "agent-a")
            .expect("claim");
        assert_eq!(claimed.len(), 2);
        // Reassign one lease to a holder that stays live.
        {
            let conn = Connection::open(temp.path().join("dispatch.db")).expect("open");
            conn.execute(
                "UPDATE dispatch_tasks SET locked_by = 'agent-b' WHERE id = ?1",
                params![held.id.to_string()],
            )
            .expect("update");
        }

        let released = store
            .release_stale_except(Channel::WhatsApp, now, &["agent-b".to_string()])
            .expect("release");
        assert_eq!(released, 1);

        assert_eq!(
            store.get_task(&lost.id).expect("get").expect("some").state,
            TaskState::Pending
        );
        assert_eq!(
            store.get_task(&held.id).expect("get").expect("some").state,
            TaskState::InFlight
        );
    }

    #[test]
    fn campaign_counts_group_by_state() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let campaign = Uuid::new_v4();

        let sent = DispatchTask::new(campaign, "a@example.com", "hi", Channel::Email, now);
        let pending = DispatchTask::new(campaign, "b@example.com", "hi", Channel::Email, now);
        store.insert_task(&sent).expect("insert");
        store.insert_task(&pending).expect("insert");
        store.mark_sent(&sent.id).expect("sent");

        let stats = store.campaign_counts(&campaign).expect("stats");
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 0);
    }
}
