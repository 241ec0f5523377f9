//! Router construction and service wiring: stores, workers, detector,
//! watchdog and the axum server with graceful shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::adapters::{EmailProvider, LogNotifier, SmsProvider, WebhookNotifier};
use crate::audience::AudienceSpec;
use crate::campaign::{Campaign, CampaignStatus, ScheduleSpec};
use crate::campaign_store::SqliteCampaignStore;
use crate::channel::{Channel, MessageSender};
use crate::detector::{CompletionDetector, Notifier};
use crate::dispatch::{
    start_worker, AntiBanThrottle, CampaignScheduler, CampaignStats, SqliteDispatchStore,
    ThrottleConfig, WorkerConfig, WorkerControl,
};
use crate::error::EngineError;
use crate::extract::{extract_submission, FieldType, RawAnswer};
use crate::submission_store::SqliteSubmissionStore;

use super::{blocking, bridge, ApiError, AppState, ServiceConfig};
use super::state::AgentRegistry;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub async fn run_server(config: ServiceConfig) -> Result<(), BoxError> {
    let config = Arc::new(config);
    let campaigns = Arc::new(SqliteCampaignStore::new(config.campaigns_db())?);
    let submissions = Arc::new(SqliteSubmissionStore::new(config.submissions_db())?);
    let dispatch = Arc::new(SqliteDispatchStore::new(config.dispatch_db())?);
    let scheduler = Arc::new(CampaignScheduler::new(campaigns.clone(), dispatch.clone()));
    let whatsapp_throttle = Arc::new(AntiBanThrottle::new(ThrottleConfig::for_channel(
        Channel::WhatsApp,
    )));
    let agents = Arc::new(AgentRegistry::default());

    let mut control = WorkerControl::new();
    let stop = control.stop_flag();

    spawn_channel_workers(&config, &dispatch, &mut control);

    let notifier: Arc<dyn Notifier> = match config.notify_webhook_url.clone() {
        Some(webhook_url) => Arc::new(WebhookNotifier {
            webhook_url,
            auth_token: config.notify_auth_token.clone(),
        }),
        None => {
            info!("no notification webhook configured, logging completions only");
            Arc::new(LogNotifier)
        }
    };
    let detector =
        CompletionDetector::new(submissions.clone(), campaigns.clone(), notifier)?;
    control.push(detector.run_loop(config.detector_interval, stop.clone()));

    control.push(spawn_lease_watchdog(
        dispatch.clone(),
        agents.clone(),
        config.agent_lease,
        config.watchdog_interval,
        stop.clone(),
    ));

    let state = AppState {
        config: config.clone(),
        campaigns,
        submissions,
        dispatch,
        scheduler,
        whatsapp_throttle,
        agents,
    };

    let app = router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(%addr, "campaign service listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    control.stop_and_join();
    info!("campaign service stopped");
    Ok(())
}

fn spawn_channel_workers(
    config: &Arc<ServiceConfig>,
    dispatch: &Arc<SqliteDispatchStore>,
    control: &mut WorkerControl,
) {
    let stop = control.stop_flag();

    let mut push_senders: Vec<Arc<dyn MessageSender>> = Vec::new();
    match config.sms.clone() {
        Some(sms) => push_senders.push(Arc::new(SmsProvider {
            api_url: sms.api_url,
            api_key: sms.api_key,
            from: sms.from,
        })),
        None => warn!("no SMS provider configured, sms campaigns will queue unsent"),
    }
    match config.email.clone() {
        Some(email) => push_senders.push(Arc::new(EmailProvider {
            api_url: email.api_url,
            server_token: email.server_token,
            from: email.from,
            subject: email.subject,
        })),
        None => warn!("no email provider configured, email campaigns will queue unsent"),
    }

    for sender in push_senders {
        let channel = sender.channel();
        let mut worker_config =
            WorkerConfig::new(channel, format!("{}:default", channel));
        worker_config.batch_size = config.worker_batch_size;
        worker_config.poll_interval = config.worker_poll_interval;
        worker_config.max_retries = config.max_retries;
        worker_config.backoff_base = config.backoff_base;

        let throttle = Arc::new(AntiBanThrottle::new(ThrottleConfig::for_channel(channel)));
        control.push(start_worker(
            dispatch.clone(),
            sender,
            throttle,
            worker_config,
            stop.clone(),
        ));
    }
}

/// Watchdog for the pull channel: leases older than the agent lease whose
/// holder has not heartbeated go back to pending.
fn spawn_lease_watchdog(
    dispatch: Arc<SqliteDispatchStore>,
    agents: Arc<AgentRegistry>,
    lease: StdDuration,
    interval: StdDuration,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("lease watchdog started");
        while !stop.load(Ordering::SeqCst) {
            let cutoff = Utc::now()
                - Duration::from_std(lease).unwrap_or_else(|_| Duration::seconds(120));
            let live = agents.live_agents(cutoff);
            match dispatch.release_stale_except(Channel::WhatsApp, cutoff, &live) {
                Ok(0) => {}
                Ok(released) => {
                    warn!(released, "reclaimed leases from lost extension agents")
                }
                Err(err) => error!(error = %err, "lease watchdog pass failed"),
            }
            let mut remaining = interval;
            while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
                let slice = remaining.min(StdDuration::from_millis(200));
                thread::sleep(slice);
                remaining -= slice;
            }
        }
        info!("lease watchdog stopped");
    })
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/submissions", post(ingest_submission))
        .route("/campaigns", post(create_campaign))
        .route("/campaigns/:id/start", post(start_campaign))
        .route("/campaigns/:id/pause", post(pause_campaign))
        .route("/campaigns/:id/resume", post(resume_campaign))
        .route("/campaigns/:id/complete", post(complete_campaign))
        .route("/campaigns/:id", delete(delete_campaign))
        .route("/campaigns/:id/stats", get(campaign_stats))
        .route("/extension/pending", get(bridge::pending))
        .route("/extension/report", post(bridge::report))
        .route("/extension/status", post(bridge::status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn root() -> &'static str {
    "campaign dispatch service"
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    /// Stable id from the quiz renderer; resubmissions reuse it so a late
    /// completion upgrades the earlier partial record.
    submission_id: Option<Uuid>,
    form_id: String,
    answers: Vec<RawAnswer>,
    field_types: HashMap<String, FieldType>,
    total_fields: usize,
    submitted_at: Option<DateTime<Utc>>,
    country: Option<String>,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    submission_id: Uuid,
    is_complete: bool,
    completion_percent: u8,
    tasks_created: usize,
}

async fn ingest_submission(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let submissions = state.submissions.clone();
    let scheduler = state.scheduler.clone();
    let normalize = state.config.normalize.clone();

    let response = blocking(move || {
        let submission = extract_submission(
            request.submission_id.unwrap_or_else(Uuid::new_v4),
            &request.form_id,
            &request.answers,
            &request.field_types,
            request.total_fields,
            request.submitted_at.unwrap_or_else(Utc::now),
            request.country,
            &normalize,
        );
        submissions.upsert(&submission)?;
        let tasks_created = scheduler.on_submission(&submission)?;
        Ok(IngestResponse {
            submission_id: submission.id,
            is_complete: submission.is_complete,
            completion_percent: submission.completion_percent,
            tasks_created,
        })
    })
    .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct CreateCampaignRequest {
    owner_id: String,
    form_id: String,
    channel: Channel,
    templates: Vec<String>,
    audience: AudienceSpec,
    schedule: ScheduleSpec,
}

async fn create_campaign(
    State(state): State<AppState>,
    Json(request): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaigns = state.campaigns.clone();
    let campaign = blocking(move || {
        let campaign = Campaign::new(
            &request.owner_id,
            &request.form_id,
            request.channel,
            request.templates,
            request.audience,
            request.schedule,
        )?;
        campaigns.insert(&campaign)?;
        info!(campaign_id = %campaign.id, form_id = campaign.form_id.as_str(), "campaign created");
        Ok(campaign)
    })
    .await?;

    Ok((StatusCode::CREATED, Json(campaign)))
}

async fn transition_campaign(
    state: AppState,
    id: Uuid,
    next: CampaignStatus,
) -> Result<Json<Campaign>, ApiError> {
    let campaigns = state.campaigns.clone();
    let campaign = blocking(move || {
        let campaign = campaigns.transition(&id, next)?;
        info!(campaign_id = %id, status = %next, "campaign transitioned");
        Ok(campaign)
    })
    .await?;
    Ok(Json(campaign))
}

async fn start_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    transition_campaign(state, id, CampaignStatus::Active).await
}

async fn pause_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    transition_campaign(state, id, CampaignStatus::Paused).await
}

async fn resume_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    transition_campaign(state, id, CampaignStatus::Active).await
}

async fn complete_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Campaign>, ApiError> {
    transition_campaign(state, id, CampaignStatus::Completed).await
}

async fn delete_campaign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let campaigns = state.campaigns.clone();
    blocking(move || {
        if campaigns.soft_delete(&id)? {
            info!(campaign_id = %id, "campaign deleted");
            Ok(())
        } else {
            Err(EngineError::CampaignNotFound(id))
        }
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    campaign_id: Uuid,
    status: CampaignStatus,
    #[serde(flatten)]
    counts: CampaignStats,
}

async fn campaign_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatsResponse>, ApiError> {
    let campaigns = state.campaigns.clone();
    let dispatch = state.dispatch.clone();
    let response = blocking(move || {
        let campaign = campaigns.get(&id)?.ok_or(EngineError::CampaignNotFound(id))?;
        let counts = dispatch.campaign_counts(&id)?;
        Ok(StatsResponse {
            campaign_id: id,
            status: campaign.status,
            counts,
        })
    })
    .await?;
    Ok(Json(response))
}
