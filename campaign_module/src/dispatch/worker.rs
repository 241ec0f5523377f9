//! Channel dispatch workers. Each worker owns one push channel (SMS or
//! email): it leases due tasks, claims the dedup ledger, paces itself
//! through the throttle and reports the outcome back to the store.
//!
//! WhatsApp has no worker; its tasks are leased by the extension agent
//! through the bridge endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, MessageSender};
use crate::error::EngineError;

use super::store::SqliteDispatchStore;
use super::throttle::{AntiBanThrottle, ThrottleError};
use super::types::{ClaimOutcome, TaskState};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub channel: Channel,
    /// Throttle key for this worker's sender identity.
    pub throttle_key: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Total attempts before a task settles as failed.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub backoff_base: Duration,
}

impl WorkerConfig {
    pub fn new(channel: Channel, throttle_key: impl Into<String>) -> Self {
        Self {
            channel,
            throttle_key: throttle_key.into(),
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            max_retries: 3,
            backoff_base: Duration::from_secs(60),
        }
    }
}

/// Handle to the running worker threads.
pub struct WorkerControl {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_and_join(mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }
    }
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// One dispatch pass: lease due tasks and drive each to an outcome.
/// Returns the number of tasks settled as sent.
pub fn run_worker_once(
    store: &SqliteDispatchStore,
    sender: &dyn MessageSender,
    throttle: &AntiBanThrottle,
    config: &WorkerConfig,
    now: DateTime<Utc>,
) -> Result<usize, EngineError> {
    let locked_by = format!("worker:{}", config.channel);
    let batch = store.claim_due_batch(config.channel, now, config.batch_size, &locked_by)?;
    if batch.is_empty() {
        return Ok(0);
    }
    debug!(channel = %config.channel, leased = batch.len(), "leased dispatch batch");

    let mut sent = 0;
    let mut saturated = false;
    for task in &batch {
        if saturated {
            // The key has no capacity left this pass; hand the lease back.
            store.release_task(&task.id)?;
            continue;
        }

        match store.try_claim(&task.campaign_id, &task.recipient_key, &task.id)? {
            ClaimOutcome::AlreadyClaimed => {
                store.mark_skipped_duplicate(&task.id)?;
                debug!(
                    task_id = %task.id,
                    recipient = task.recipient_key.as_str(),
                    "recipient already claimed, task skipped as duplicate"
                );
                continue;
            }
            ClaimOutcome::Claimed => {}
        }

        let wait = match throttle.acquire(&config.throttle_key) {
            Ok(wait) => wait,
            Err(ThrottleError::Saturated { key }) => {
                warn!(key = key.as_str(), "throttle saturated, releasing leased tasks");
                store.release_task(&task.id)?;
                saturated = true;
                continue;
            }
        };
        if !wait.is_zero() {
            thread::sleep(wait);
        }

        match sender.send(&task.recipient_key, &task.rendered_message) {
            Ok(provider_id) => {
                store.mark_sent(&task.id)?;
                info!(
                    task_id = %task.id,
                    channel = %config.channel,
                    provider_id = provider_id.as_str(),
                    "message sent"
                );
                sent += 1;
            }
            Err(err) => {
                let state = store.record_failure(
                    &task.id,
                    &err.to_string(),
                    now,
                    config.max_retries,
                    config.backoff_base,
                )?;
                match state {
                    TaskState::Failed => error!(
                        task_id = %task.id,
                        error = %err,
                        "send failed, retries exhausted"
                    ),
                    _ => warn!(
                        task_id = %task.id,
                        error = %err,
                        "send failed, task rescheduled"
                    ),
                }
            }
        }
    }
    Ok(sent)
}

/// Spawn the polling loop for one channel worker.
pub fn start_worker(
    store: Arc<SqliteDispatchStore>,
    sender: Arc<dyn MessageSender>,
    throttle: Arc<AntiBanThrottle>,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        info!(channel = %config.channel, "dispatch worker started");
        while !stop.load(Ordering::SeqCst) {
            match run_worker_once(&store, sender.as_ref(), &throttle, &config, Utc::now()) {
                Ok(0) => {}
                Ok(count) => debug!(channel = %config.channel, sent = count, "dispatch pass"),
                Err(err) => error!(channel = %config.channel, error = %err, "dispatch pass failed"),
            }
            // Sleep in short slices so shutdown stays responsive.
            let mut remaining = config.poll_interval;
            while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
                let slice = remaining.min(Duration::from_millis(200));
                thread::sleep(slice);
                remaining -= slice;
            }
        }
        info!(channel = %config.channel, "dispatch worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::channel::ProviderError;
    use crate::dispatch::throttle::ThrottleConfig;
    use crate::dispatch::types::DispatchTask;

    use super::*;

    struct FakeSender {
        channel: Channel,
        sent: Mutex<Vec<(String, String)>>,
        fail_times: Mutex<u32>,
    }

    impl FakeSender {
        fn new(channel: Channel) -> Self {
            Self {
                channel,
                sent: Mutex::new(Vec::new()),
                fail_times: Mutex::new(0),
            }
        }

        fn failing(channel: Channel, times: u32) -> Self {
            let sender = Self::new(channel);
            *sender.fail_times.lock().unwrap() = times;
            sender
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl MessageSender for FakeSender {
        fn send(&self, recipient: &str, message: &str) -> Result<String, ProviderError> {
            let mut remaining = self.fail_times.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProviderError::Request("connection reset".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((recipient.to_string(), message.to_string()));
            Ok(format!("provider-{}", recipient))
        }

        fn channel(&self) -> Channel {
            self.channel
        }
    }

    fn open_throttle() -> AntiBanThrottle {
        AntiBanThrottle::new(ThrottleConfig {
            min_interval: Duration::ZERO,
            burst_cap: 1,
            max_backlog: 1000,
            jitter: Duration::ZERO,
        })
    }

    fn store(temp: &TempDir) -> SqliteDispatchStore {
        SqliteDispatchStore::new(temp.path().join("dispatch.db")).expect("store")
    }

    fn pending_task(campaign: Uuid, recipient: &str, now: DateTime<Utc>) -> DispatchTask {
        DispatchTask::new(campaign, recipient, "Hi Ana", Channel::Sms, now)
    }

    #[test]
    fn due_task_is_sent_and_settled() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let task = pending_task(Uuid::new_v4(), "5511999998888", now);
        store.insert_task(&task).expect("insert");

        let sender = FakeSender::new(Channel::Sms);
        let throttle = open_throttle();
        let config = WorkerConfig::new(Channel::Sms, "sms:default");

        let sent = run_worker_once(&store, &sender, &throttle, &config, now).expect("pass");
        assert_eq!(sent, 1);
        assert_eq!(
            sender.sent(),
            vec![("5511999998888".to_string(), "Hi Ana".to_string())]
        );
        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.state, TaskState::Sent);
    }

    #[test]
    fn duplicate_claim_settles_as_skipped_without_sending() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let campaign = Uuid::new_v4();

        // Another task already owns the recipient in the ledger.
        let winner = Uuid::new_v4();
        store
            .try_claim(&campaign, "5511999998888", &winner)
            .expect("claim");

        let task = pending_task(campaign, "5511999998888", now);
        store.insert_task(&task).expect("insert");

        let sender = FakeSender::new(Channel::Sms);
        let throttle = open_throttle();
        let config = WorkerConfig::new(Channel::Sms, "sms:default");

        let sent = run_worker_once(&store, &sender, &throttle, &config, now).expect("pass");
        assert_eq!(sent, 0);
        assert!(sender.sent().is_empty());
        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.state, TaskState::SkippedDuplicate);
    }

    #[test]
    fn transient_failure_reschedules_then_succeeds() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let task = pending_task(Uuid::new_v4(), "5511999998888", now);
        store.insert_task(&task).expect("insert");

        let sender = FakeSender::failing(Channel::Sms, 1);
        let throttle = open_throttle();
        let mut config = WorkerConfig::new(Channel::Sms, "sms:default");
        config.backoff_base = Duration::from_secs(60);

        let sent = run_worker_once(&store, &sender, &throttle, &config, now).expect("pass");
        assert_eq!(sent, 0);
        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.state, TaskState::Pending);
        assert_eq!(loaded.attempts, 1);

        // Once the backoff elapses the retry goes through. The ledger claim
        // is owned by this task, so the retry is not treated as a duplicate.
        let later = now + chrono::Duration::seconds(61);
        let sent = run_worker_once(&store, &sender, &throttle, &config, later).expect("pass");
        assert_eq!(sent, 1);
        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.state, TaskState::Sent);
    }

    #[test]
    fn retries_exhaust_into_terminal_failure() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let task = pending_task(Uuid::new_v4(), "5511999998888", now);
        store.insert_task(&task).expect("insert");

        let sender = FakeSender::failing(Channel::Sms, 10);
        let throttle = open_throttle();
        let mut config = WorkerConfig::new(Channel::Sms, "sms:default");
        config.max_retries = 2;
        config.backoff_base = Duration::ZERO;

        run_worker_once(&store, &sender, &throttle, &config, now).expect("pass");
        run_worker_once(&store, &sender, &throttle, &config, now).expect("pass");

        let loaded = store.get_task(&task.id).expect("get").expect("some");
        assert_eq!(loaded.state, TaskState::Failed);
        assert_eq!(loaded.attempts, 2);
        assert_eq!(loaded.last_error.as_deref(), Some("provider request failed: connection reset"));
    }

    #[test]
    fn saturated_throttle_releases_the_lease() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let now = Utc::now();
        let first = pending_task(Uuid::new_v4(), "5511999990001", now);
        let second = pending_task(Uuid::new_v4(), "5511999990002", now);
        store.insert_task(&first).expect("insert");
        store.insert_task(&second).expect("insert");

        // Zero backlog allowance saturates after the burst slot.
        let throttle = AntiBanThrottle::new(ThrottleConfig {
            min_interval: Duration::from_secs(600),
            burst_cap: 1,
            max_backlog: 0,
            jitter: Duration::ZERO,
        });
        let sender = FakeSender::new(Channel::Sms);
        let config = WorkerConfig::new(Channel::Sms, "sms:default");

        let sent = run_worker_once(&store, &sender, &throttle, &config, now).expect("pass");
        assert_eq!(sent, 1);

        // The saturated task went back to pending with no attempt consumed.
        let other = [first.id, second.id]
            .into_iter()
            .map(|id| store.get_task(&id).expect("get").expect("some"))
            .find(|task| task.state != TaskState::Sent)
            .expect("one released task");
        assert_eq!(other.state, TaskState::Pending);
        assert_eq!(other.attempts, 0);
    }
}
