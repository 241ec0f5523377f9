//! Anti-ban send pacing. Each throttle key (one per sender identity, e.g. a
//! WhatsApp number or an SMS sender id) owns a next-slot pointer: callers
//! reserve the next slot and are told how long to wait for it. A short burst
//! window lets an idle key absorb a small spike, and a backlog bound turns
//! further requests away instead of queueing unbounded delay.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::channel::Channel;

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// The key's reserved backlog already covers `max_backlog` slots; the
    /// caller should release the task back to the queue and retry later.
    #[error("throttle saturated for key {key}")]
    Saturated { key: String },
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Minimum spacing between sends on one key.
    pub min_interval: Duration,
    /// How many immediate sends an idle key may absorb before spacing kicks in.
    pub burst_cap: u32,
    /// Maximum number of unspent slots a key may have reserved ahead of now.
    pub max_backlog: u32,
    /// Random extra delay added per slot, up to this much. Breaks up the
    /// metronome pattern ban heuristics look for.
    pub jitter: Duration,
}

impl ThrottleConfig {
    /// Channel defaults. WhatsApp is paced hardest; ban heuristics there
    /// react to sustained machine-regular sending.
    pub fn for_channel(channel: Channel) -> Self {
        match channel {
            Channel::WhatsApp => Self {
                min_interval: Duration::from_secs(20),
                burst_cap: 3,
                max_backlog: 10,
                jitter: Duration::from_secs(10),
            },
            Channel::Sms => Self {
                min_interval: Duration::from_millis(200),
                burst_cap: 10,
                max_backlog: 100,
                jitter: Duration::from_millis(100),
            },
            Channel::Email => Self {
                min_interval: Duration::from_millis(100),
                burst_cap: 20,
                max_backlog: 200,
                jitter: Duration::ZERO,
            },
        }
    }
}

#[derive(Debug)]
struct Bucket {
    next_slot: Instant,
}

/// Shared pacing state across all workers and bridge calls for a channel.
#[derive(Debug)]
pub struct AntiBanThrottle {
    config: ThrottleConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl AntiBanThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next send slot for a key. Returns how long the caller
    /// must wait before sending (zero inside the burst window).
    pub fn acquire(&self, key: &str) -> Result<Duration, ThrottleError> {
        self.acquire_at(key, Instant::now())
    }

    fn acquire_at(&self, key: &str, now: Instant) -> Result<Duration, ThrottleError> {
        // A window of (cap - 1) intervals behind now yields exactly
        // `burst_cap` zero-wait slots from idle.
        let burst_window = self.config.min_interval * self.config.burst_cap.saturating_sub(1);
        let saturation_bound = self.config.min_interval * self.config.max_backlog;

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            // A fresh key starts with its burst credit fully available.
            next_slot: now.checked_sub(burst_window).unwrap_or(now),
        });

        // A long-idle key never accumulates more than one burst window of
        // credit, otherwise a pause would license an arbitrarily large spike.
        let floor = now.checked_sub(burst_window).unwrap_or(now);
        let slot = bucket.next_slot.max(floor);

        let wait = slot.saturating_duration_since(now);
        if wait > saturation_bound {
            return Err(ThrottleError::Saturated {
                key: key.to_string(),
            });
        }

        let jitter = if self.config.jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=self.config.jitter)
        };
        bucket.next_slot = slot + self.config.min_interval + jitter;
        Ok(wait)
    }
}
