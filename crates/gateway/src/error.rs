//! §7 error kinds. C7 is the error boundary: every path out of it completes
//! the request's result future with one of these, never leaves it pending.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
	#[error("client disconnected")]
	ClientGone,
	#[error("browser session unavailable")]
	ServiceUnavailable { retry_after_secs: u64 },
	#[error("model `{0}` unavailable")]
	ModelUnavailable(String),
	#[error("upstream response timed out")]
	UpstreamTimeout,
	#[error("upstream failed: {0}")]
	UpstreamFailed(String),
	#[error("internal error: {0}")]
	Internal(#[from] anyhow::Error),
	#[error("bad request: {0}")]
	BadRequest(String),
}

impl PipelineError {
	pub fn status(&self) -> StatusCode {
		match self {
			PipelineError::ClientGone => StatusCode::from_u16(499).expect("499 is a valid status"),
			PipelineError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
			PipelineError::ModelUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
			PipelineError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
			PipelineError::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
			PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
			PipelineError::BadRequest(_) => StatusCode::BAD_REQUEST,
		}
	}
}

impl IntoResponse for PipelineError {
	fn into_response(self) -> Response {
		let status = self.status();
		let retry_after = match &self {
			PipelineError::ServiceUnavailable { retry_after_secs } => Some(*retry_after_secs),
			_ => None,
		};
		let mut resp = (
			status,
			Json(json!({"error": {"message": self.to_string(), "type": kind_name(&self)}})),
		)
			.into_response();
		if let Some(secs) = retry_after {
			if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
				resp.headers_mut().insert(header::RETRY_AFTER, v);
			}
		}
		resp
	}
}

fn kind_name(e: &PipelineError) -> &'static str {
	match e {
		PipelineError::ClientGone => "client_gone",
		PipelineError::ServiceUnavailable { .. } => "service_unavailable",
		PipelineError::ModelUnavailable(_) => "model_unavailable",
		PipelineError::UpstreamTimeout => "upstream_timeout",
		PipelineError::UpstreamFailed(_) => "upstream_failed",
		PipelineError::Internal(_) => "internal_error",
		PipelineError::BadRequest(_) => "bad_request",
	}
}
