//! Outbound provider boundary: blocking HTTP senders for SMS and
//! transactional email. The engine crate talks to providers only through
//! the param structs and functions in this module, so provider swaps and
//! test doubles never leak into dispatch logic.

use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("malformed provider response: missing {0}")]
    MalformedResponse(&'static str),
}

/// Provider acknowledgement for a single outbound message.
#[derive(Debug, Clone)]
pub struct SendResponse {
    pub message_id: String,
    pub submitted_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SendSmsParams {
    /// Full provider endpoint, e.g. `https://sms.example.com/v1/messages`.
    pub api_url: String,
    pub api_key: String,
    pub from: Option<String>,
    pub to: String,
    pub body: String,
}

/// Send a single SMS through the configured HTTP provider.
pub fn send_sms(params: &SendSmsParams) -> Result<SendResponse, SendError> {
    let client = reqwest::blocking::Client::new();
    let mut payload = json!({
        "To": params.to,
        "Body": params.body,
    });
    if let Some(from) = params.from.as_deref() {
        payload["From"] = json!(from);
    }

    let response = client
        .post(&params.api_url)
        .bearer_auth(&params.api_key)
        .json(&payload)
        .send()?;

    parse_response(response)
}

#[derive(Debug, Clone)]
pub struct SendEmailParams {
    /// Full provider endpoint, e.g. `https://api.postmarkapp.com/email`.
    pub api_url: String,
    pub server_token: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text_body: String,
}

/// Send a single transactional email through the configured HTTP provider.
pub fn send_email(params: &SendEmailParams) -> Result<SendResponse, SendError> {
    let client = reqwest::blocking::Client::new();
    let payload = json!({
        "From": params.from,
        "To": params.to,
        "Subject": params.subject,
        "TextBody": params.text_body,
    });

    let response = client
        .post(&params.api_url)
        .header("X-Server-Token", &params.server_token)
        .header("Accept", "application/json")
        .json(&payload)
        .send()?;

    parse_response(response)
}

#[derive(Debug, Clone)]
pub struct PostNotificationParams {
    pub webhook_url: String,
    pub auth_token: Option<String>,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub metadata: serde_json::Value,
}

/// Fire a notification at the configured webhook. Only the status code
/// matters; webhook response bodies are not parsed.
pub fn post_notification(params: &PostNotificationParams) -> Result<(), SendError> {
    let client = reqwest::blocking::Client::new();
    let payload = json!({
        "user_id": params.user_id,
        "title": params.title,
        "body": params.body,
        "metadata": params.metadata,
    });

    let mut request = client.post(&params.webhook_url).json(&payload);
    if let Some(token) = params.auth_token.as_deref() {
        request = request.bearer_auth(token);
    }
    let response = request.send()?;

    let status = response.status();
    if !status.is_success() {
        return Err(SendError::Rejected {
            status: status.as_u16(),
            body: response.text().unwrap_or_default(),
        });
    }
    Ok(())
}

fn parse_response(response: reqwest::blocking::Response) -> Result<SendResponse, SendError> {
    let status = response.status();
    let body = response.text()?;
    if !status.is_success() {
        return Err(SendError::Rejected {
            status: status.as_u16(),
            body,
        });
    }

    let value: serde_json::Value =
        serde_json::from_str(&body).map_err(|_| SendError::MalformedResponse("json body"))?;
    let message_id = value
        .get("MessageID")
        .or_else(|| value.get("MessageId"))
        .or_else(|| value.get("id"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or(SendError::MalformedResponse("MessageID"))?;
    let submitted_at = value
        .get("SubmittedAt")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    Ok(SendResponse {
        message_id,
        submitted_at,
    })
}
