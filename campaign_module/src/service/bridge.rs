//! Extension bridge: the pull-queue API the WhatsApp browser agent works
//! against. The agent polls `/extension/pending` for leased tasks, reports
//! outcomes on `/extension/report`, and heartbeats on `/extension/status`.
//! The service never pushes; an offline agent simply stops polling and the
//! watchdog reclaims its leases.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{ClaimOutcome, TaskState, ThrottleError};
use crate::error::EngineError;

use super::{blocking, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub agent_id: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PendingItem {
    pub task_id: Uuid,
    pub phone: String,
    pub message: String,
    /// Minimum delay before the agent should send this item.
    pub delay_ms: u64,
    /// When the lease lapses if no report arrives.
    pub lease_expires_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub items: Vec<PendingItem>,
}

/// Lease due WhatsApp tasks for a polling agent. Pacing happens here: each
/// item carries the throttle-assigned delay, and a saturated throttle stops
/// the hand-out early with the surplus released back to pending.
pub(crate) async fn pending(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<PendingResponse>, ApiError> {
    // A poll is proof of life.
    state.agents.record(&query.agent_id, None, None);

    let limit = query
        .limit
        .unwrap_or(state.config.bridge_batch_cap)
        .min(state.config.bridge_batch_cap);
    let lease = Duration::from_std(state.config.agent_lease)
        .unwrap_or_else(|_| Duration::seconds(120));

    let dispatch = state.dispatch.clone();
    let throttle = state.whatsapp_throttle.clone();
    let agent_id = query.agent_id.clone();
    let items = blocking(move || {
        let now = Utc::now();
        let locked_by = format!("agent:{}", agent_id);
        let batch = dispatch.claim_due_batch(
            crate::channel::Channel::WhatsApp,
            now,
            limit,
            &locked_by,
        )?;

        let throttle_key = format!("whatsapp:{}", agent_id);
        let mut items = Vec::new();
        let mut saturated = false;
        for task in batch {
            if saturated {
                dispatch.release_task(&task.id)?;
                continue;
            }
            match throttle.acquire(&throttle_key) {
                Ok(wait) => items.push(PendingItem {
                    task_id: task.id,
                    phone: task.recipient_key,
                    message: task.rendered_message,
                    delay_ms: wait.as_millis() as u64,
                    lease_expires_at: now + lease,
                }),
                Err(ThrottleError::Saturated { key }) => {
                    warn!(key = key.as_str(), "whatsapp throttle saturated during poll");
                    dispatch.release_task(&task.id)?;
                    saturated = true;
                }
            }
        }
        Ok(items)
    })
    .await?;

    debug!(agent = query.agent_id.as_str(), handed_out = items.len(), "pending poll");
    Ok(Json(PendingResponse { items }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Sent,
    Failed,
}

#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub agent_id: String,
    pub task_id: Uuid,
    pub outcome: ReportOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReportResponse {
    pub task_id: Uuid,
    pub state: TaskState,
}

/// Settle a leased task from an agent's outcome report. A `sent` report
/// still runs the dedup claim; losing it settles the task as a duplicate
/// (the agent raced another task for the recipient).
pub(crate) async fn report(
    State(state): State<AppState>,
    Json(request): Json<ReportRequest>,
) -> Result<Json<ReportResponse>, ApiError> {
    state.agents.record(&request.agent_id, None, None);

    let dispatch = state.dispatch.clone();
    let max_retries = state.config.max_retries;
    let backoff_base = state.config.backoff_base;
    let task_id = request.task_id;
    let state_after = blocking(move || {
        let task = dispatch
            .get_task(&request.task_id)?
            .ok_or(EngineError::TaskNotFound(request.task_id))?;

        match request.outcome {
            ReportOutcome::Sent => {
                match dispatch.try_claim(&task.campaign_id, &task.recipient_key, &task.id)? {
                    ClaimOutcome::Claimed => {
                        dispatch.mark_sent(&task.id)?;
                        Ok(TaskState::Sent)
                    }
                    ClaimOutcome::AlreadyClaimed => {
                        dispatch.mark_skipped_duplicate(&task.id)?;
                        Ok(TaskState::SkippedDuplicate)
                    }
                }
            }
            ReportOutcome::Failed => {
                let error = request.error.as_deref().unwrap_or("agent reported failure");
                dispatch.record_failure(
                    &task.id,
                    error,
                    Utc::now(),
                    max_retries,
                    backoff_base,
                )
            }
        }
    })
    .await?;

    Ok(Json(ReportResponse {
        task_id,
        state: state_after,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub agent_id: String,
    pub version: Option<String>,
    pub pending_count: Option<u64>,
    pub sent_count: Option<u64>,
    pub failed_count: Option<u64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub lease_secs: u64,
}

/// Heartbeat from an agent. Keeps its leases alive past the watchdog.
pub(crate) async fn status(
    State(state): State<AppState>,
    Json(request): Json<StatusRequest>,
) -> Json<StatusResponse> {
    info!(
        agent = request.agent_id.as_str(),
        version = request.version.as_deref().unwrap_or("unknown"),
        sent = request.sent_count,
        failed = request.failed_count,
        active = request.is_active,
        "extension heartbeat"
    );
    state
        .agents
        .record(&request.agent_id, request.version, request.pending_count);
    Json(StatusResponse {
        lease_secs: state.config.agent_lease.as_secs(),
    })
}
