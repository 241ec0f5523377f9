//! HTTP service: router, state, configuration and the extension bridge.

pub mod bridge;
pub mod config;
pub mod server;
pub mod state;

pub use config::ServiceConfig;
pub use server::run_server;
pub use state::{AgentRegistry, AppState};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::EngineError;

/// Engine error as an HTTP response. Storage-level failures stay opaque.
pub(crate) struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::CampaignNotFound(_) | EngineError::TaskNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::InvalidCampaign(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
            json!({ "error": "internal error" })
        } else {
            json!({ "error": self.0.to_string() })
        };
        (status, Json(body)).into_response()
    }
}

/// Run a blocking store call off the async runtime.
pub(crate) async fn blocking<T, F>(task: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| ApiError(EngineError::Storage(format!("blocking task: {}", err))))?
        .map_err(ApiError::from)
}
