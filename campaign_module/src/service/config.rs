//! Environment-driven service configuration. Every knob has a parsed
//! fallback so a bare environment still boots a usable service.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::normalize::NormalizeConfig;

#[derive(Debug, Clone)]
pub struct SmsProviderConfig {
    pub api_url: String,
    pub api_key: String,
    pub from: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmailProviderConfig {
    pub api_url: String,
    pub server_token: String,
    pub from: String,
    pub subject: String,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,

    pub worker_poll_interval: Duration,
    pub worker_batch_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,

    pub detector_interval: Duration,

    /// How long an extension lease stays valid without a heartbeat.
    pub agent_lease: Duration,
    pub watchdog_interval: Duration,
    /// Max tasks handed to the extension per pending poll.
    pub bridge_batch_cap: usize,

    pub normalize: NormalizeConfig,

    pub sms: Option<SmsProviderConfig>,
    pub email: Option<EmailProviderConfig>,

    pub notify_webhook_url: Option<String>,
    pub notify_auth_token: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let data_dir = env::var("QUIZCAST_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let sms = match (env::var("SMS_API_URL"), env::var("SMS_API_KEY")) {
            (Ok(api_url), Ok(api_key)) => Some(SmsProviderConfig {
                api_url,
                api_key,
                from: env::var("SMS_FROM").ok(),
            }),
            _ => None,
        };

        let email = match (env::var("EMAIL_API_URL"), env::var("EMAIL_SERVER_TOKEN")) {
            (Ok(api_url), Ok(server_token)) => Some(EmailProviderConfig {
                api_url,
                server_token,
                from: env::var("EMAIL_FROM")
                    .unwrap_or_else(|_| "noreply@example.com".to_string()),
                subject: env::var("EMAIL_SUBJECT")
                    .unwrap_or_else(|_| "You have a new message".to_string()),
            }),
            _ => None,
        };

        Self {
            host: env::var("QUIZCAST_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env("QUIZCAST_PORT", 8090),
            data_dir,
            worker_poll_interval: Duration::from_secs(parse_env("WORKER_POLL_SECS", 5u64)),
            worker_batch_size: parse_env("WORKER_BATCH_SIZE", 10usize),
            max_retries: parse_env("DISPATCH_MAX_RETRIES", 3u32),
            backoff_base: Duration::from_secs(parse_env("DISPATCH_BACKOFF_SECS", 60u64)),
            detector_interval: Duration::from_secs(parse_env("DETECTOR_POLL_SECS", 10u64)),
            agent_lease: Duration::from_secs(parse_env("AGENT_LEASE_SECS", 120u64)),
            watchdog_interval: Duration::from_secs(parse_env("WATCHDOG_POLL_SECS", 30u64)),
            bridge_batch_cap: parse_env("BRIDGE_BATCH_CAP", 20usize),
            normalize: NormalizeConfig {
                default_country_code: env::var("DEFAULT_COUNTRY_CODE")
                    .unwrap_or_else(|_| "55".to_string()),
                min_phone_digits: parse_env("MIN_PHONE_DIGITS", 10usize),
            },
            sms,
            email,
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok(),
            notify_auth_token: env::var("NOTIFY_AUTH_TOKEN").ok(),
        }
    }

    pub fn campaigns_db(&self) -> PathBuf {
        self.data_dir.join("campaigns.db")
    }

    pub fn submissions_db(&self) -> PathBuf {
        self.data_dir.join("submissions.db")
    }

    pub fn dispatch_db(&self) -> PathBuf {
        self.data_dir.join("dispatch.db")
    }
}

fn parse_env<T>(key: &str, fallback: T) -> T
where
    T: FromStr + Copy,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = raw.as_str(), "unparseable env value, using fallback");
            fallback
        }),
        Err(_) => fallback,
    }
}
