use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign_store::SqliteCampaignStore;
use crate::dispatch::{AntiBanThrottle, CampaignScheduler, SqliteDispatchStore};
use crate::submission_store::SqliteSubmissionStore;

use super::config::ServiceConfig;

/// Latest heartbeat from one extension agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub version: Option<String>,
    pub pending_count: Option<u64>,
    pub last_seen: DateTime<Utc>,
}

/// In-memory registry of extension agents, fed by `/extension/status` and
/// read by the lost-agent watchdog. Heartbeats are ephemeral on purpose; a
/// restarted service treats every lease as potentially stale.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentHeartbeat>>,
}

impl AgentRegistry {
    pub fn record(&self, agent_id: &str, version: Option<String>, pending_count: Option<u64>) {
        let mut agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        agents.insert(
            agent_id.to_string(),
            AgentHeartbeat {
                agent_id: agent_id.to_string(),
                version,
                pending_count,
                last_seen: Utc::now(),
            },
        );
    }

    pub fn last_seen(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        let agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        agents.get(agent_id).map(|beat| beat.last_seen)
    }

    /// Agents heard from since `cutoff`. Their leases are left alone.
    pub fn live_agents(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let agents = self.agents.lock().unwrap_or_else(|e| e.into_inner());
        agents
            .values()
            .filter(|beat| beat.last_seen >= cutoff)
            .map(|beat| beat.agent_id.clone())
            .collect()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub campaigns: Arc<SqliteCampaignStore>,
    pub submissions: Arc<SqliteSubmissionStore>,
    pub dispatch: Arc<SqliteDispatchStore>,
    pub scheduler: Arc<CampaignScheduler>,
    pub whatsapp_throttle: Arc<AntiBanThrottle>,
    pub agents: Arc<AgentRegistry>,
}
