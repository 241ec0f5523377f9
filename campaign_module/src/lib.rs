//! Lead segmentation and multi-channel campaign dispatch engine.
//!
//! Quiz submissions come in through the ingestion boundary, get their
//! contact fields normalized, and fan out across the active campaigns on
//! their form. Dispatch tasks flow through a dedup ledger, an anti-ban
//! throttle and per-channel workers; WhatsApp tasks are pulled by an
//! external extension agent through the bridge endpoints.

pub mod adapters;
pub mod audience;
pub mod campaign;
pub mod campaign_store;
pub mod channel;
pub mod compose;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod normalize;
pub mod service;
pub mod submission_store;
mod util;

pub use audience::AudienceSpec;
pub use campaign::{Campaign, CampaignStatus, DelayUnit, ScheduleSpec};
pub use campaign_store::SqliteCampaignStore;
pub use channel::{Channel, MessageSender, ProviderError};
pub use detector::{CompletionDetector, Notifier};
pub use dispatch::{
    AntiBanThrottle, CampaignScheduler, CampaignStats, DispatchTask, SqliteDispatchStore,
    TaskState, ThrottleConfig, WorkerConfig, WorkerControl,
};
pub use error::EngineError;
pub use extract::{extract_submission, FieldType, RawAnswer, Submission};
pub use normalize::{normalize_email, normalize_phone, NormalizeConfig};
pub use service::{run_server, ServiceConfig};
pub use submission_store::SqliteSubmissionStore;
