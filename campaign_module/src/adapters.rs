//! Concrete provider adapters: bind the dispatch seams
//! ([`MessageSender`], [`Notifier`]) to the blocking HTTP senders in
//! `send_messages_module`.

use send_messages_module::{
    post_notification, send_email, send_sms, PostNotificationParams, SendEmailParams,
    SendError, SendSmsParams,
};
use tracing::info;

use crate::channel::{Channel, MessageSender, ProviderError};
use crate::detector::Notifier;

fn map_send_error(err: SendError) -> ProviderError {
    match err {
        SendError::Rejected { status, body } => {
            ProviderError::Rejected(format!("status {}: {}", status, body))
        }
        other => ProviderError::Request(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct SmsProvider {
    pub api_url: String,
    pub api_key: String,
    pub from: Option<String>,
}

impl MessageSender for SmsProvider {
    fn send(&self, recipient: &str, message: &str) -> Result<String, ProviderError> {
        let params = SendSmsParams {
            api_url: self.api_url.clone(),
            api_key: self.api_key.clone(),
            from: self.from.clone(),
            to: recipient.to_string(),
            body: message.to_string(),
        };
        let response = send_sms(&params).map_err(map_send_error)?;
        Ok(response.message_id)
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }
}

#[derive(Debug, Clone)]
pub struct EmailProvider {
    pub api_url: String,
    pub server_token: String,
    pub from: String,
    pub subject: String,
}

impl MessageSender for EmailProvider {
    fn send(&self, recipient: &str, message: &str) -> Result<String, ProviderError> {
        let params = SendEmailParams {
            api_url: self.api_url.clone(),
            server_token: self.server_token.clone(),
            from: self.from.clone(),
            to: recipient.to_string(),
            subject: self.subject.clone(),
            text_body: message.to_string(),
        };
        let response = send_email(&params).map_err(map_send_error)?;
        Ok(response.message_id)
    }

    fn channel(&self) -> Channel {
        Channel::Email
    }
}

/// Pushes completion notifications to a configured webhook.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    pub webhook_url: String,
    pub auth_token: Option<String>,
}

impl Notifier for WebhookNotifier {
    fn notify(
        &self,
        owner_id: &str,
        title: &str,
        body: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), ProviderError> {
        let params = PostNotificationParams {
            webhook_url: self.webhook_url.clone(),
            auth_token: self.auth_token.clone(),
            user_id: owner_id.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            metadata: metadata.clone(),
        };
        post_notification(&params).map_err(map_send_error)
    }
}

/// Log-only notifier used when no webhook is configured.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(
        &self,
        owner_id: &str,
        title: &str,
        body: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), ProviderError> {
        info!(owner = owner_id, title, body, metadata = %metadata, "completion notification");
        Ok(())
    }
}
