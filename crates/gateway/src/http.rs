//! C9 Worker HTTP Surface (§4.2, §6): the OpenAI-shaped endpoints a single
//! worker process exposes. Enqueues onto C8's `RequestQueue`, streams back
//! `PipelineOutcome::Stream` as SSE, and exposes `/v1/cancel/{req_id}`
//! against C13's registry.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::context::WorkerContext;
use crate::error::PipelineError;
use crate::queue::RequestQueue;
use crate::sse;
use crate::types::{ChatCompletionRequest, PipelineOutcome, QueuedItem, Strng};

#[derive(Clone)]
pub struct AppState {
	pub ctx: Arc<WorkerContext>,
	pub queue: Arc<RequestQueue>,
}

pub fn router(state: AppState) -> axum::Router {
	axum::Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/v1/models", get(list_models))
		.route("/v1/cancel/{req_id}", post(cancel_request))
		.route("/health", get(health))
		.with_state(state)
}

/// 200 only if the worker is actually able to take a request right now:
/// the browser page is up and, when side-channel mode is configured, the
/// MITM sniffer has somewhere to deliver frames.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
	let page_ready = state.ctx.browser.is_page_ready();
	let side_channel_ready = !state.ctx.side_channel_enabled || !state.ctx.side_channel_tx.is_closed();
	let ready = page_ready && side_channel_ready;
	let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
	(
		status,
		Json(json!({
			"status": if ready { "ok" } else { "not_ready" },
			"page_ready": page_ready,
			"side_channel_ready": side_channel_ready,
		})),
	)
}

async fn list_models() -> Json<serde_json::Value> {
	Json(json!({
		"object": "list",
		"data": [
			{ "id": "studio-default", "object": "model", "owned_by": "studio-bridge" },
		],
	}))
}

/// 200 only on a hit against a request that's still queued or already
/// in-flight; 404 on an unknown id (§6).
async fn cancel_request(State(state): State<AppState>, Path(req_id): Path<String>) -> (StatusCode, Json<serde_json::Value>) {
	let req_id = Strng::from(req_id.as_str());
	let queued_hit = state.queue.mark_cancelled(&req_id).await;
	let in_flight_hit = state.ctx.is_in_flight(&req_id);
	if queued_hit || in_flight_hit {
		state.ctx.cancellation.cancel(&req_id);
		(StatusCode::OK, Json(json!({ "req_id": req_id.as_str(), "cancelled": true })))
	} else {
		(StatusCode::NOT_FOUND, Json(json!({ "req_id": req_id.as_str(), "cancelled": false })))
	}
}

async fn chat_completions(State(state): State<AppState>, Json(body): Json<ChatCompletionRequest>) -> Response {
	let request = body.normalized();
	let req_id = Strng::from(uuid_like());
	let streaming = request.stream;

	let client_gone = Arc::new(|| false);
	let (item, result_rx) = QueuedItem::new(req_id.clone(), request, client_gone);
	state.queue.push(item).await;

	let result = match result_rx.await {
		Ok(r) => r,
		Err(_) => Err(PipelineError::Internal(anyhow::anyhow!("pipeline dropped the result channel"))),
	};

	match result {
		Ok(PipelineOutcome::Complete(body)) => Json(body).into_response(),
		Ok(PipelineOutcome::Stream(handle)) => {
			if !streaming {
				warn!(%req_id, "non-streaming request produced a stream outcome, forwarding as SSE anyway");
			}
			let stream = ReceiverStream::new(handle.rx).map(|line| Ok::<Event, Infallible>(Event::default().data(strip_event_framing(&line))));
			Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))).into_response()
		},
		Err(e) => e.into_response(),
	}
}

/// `sse.rs` builders already emit framed `data: ...\n\n` lines (and the
/// literal `data: [DONE]\n\n` sentinel); axum's `Event::data` re-adds that
/// framing, so strip the `data: ` prefix and trailing blank line back off.
fn strip_event_framing(line: &str) -> String {
	line.trim_start_matches("data: ").trim_end().to_string()
}

fn uuid_like() -> String {
	use rand::Rng;
	let mut rng = rand::rng();
	let bytes: [u8; 16] = rng.random();
	bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::browser::NullBrowserController;
	use crate::config::RuntimeConfig;

	#[tokio::test]
	async fn cancel_marks_in_flight_request() {
		let ctx = WorkerContext::new(Arc::new(NullBrowserController::default()), Arc::new(RuntimeConfig::default()));
		let queue = RequestQueue::new();
		let state = AppState { ctx: ctx.clone(), queue };
		let req_id = "abc".to_string();
		ctx.mark_in_flight(Strng::from(req_id.as_str()));
		let (status, Json(body)) = cancel_request(State(state), Path(req_id.clone())).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["cancelled"], true);
		assert!(ctx.cancellation.is_cancelled(&Strng::from(req_id.as_str())));
	}

	#[tokio::test]
	async fn cancel_marks_queued_request() {
		let ctx = WorkerContext::new(Arc::new(NullBrowserController::default()), Arc::new(RuntimeConfig::default()));
		let queue = RequestQueue::new();
		let req_id = Strng::from("queued-1");
		let (item, _rx) = QueuedItem::new(req_id.clone(), build_request(), Arc::new(|| false));
		queue.push(item).await;
		let state = AppState { ctx, queue };

		let (status, Json(body)) = cancel_request(State(state), Path(req_id.to_string())).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["cancelled"], true);
	}

	#[tokio::test]
	async fn cancel_unknown_request_returns_not_found() {
		let ctx = WorkerContext::new(Arc::new(NullBrowserController::default()), Arc::new(RuntimeConfig::default()));
		let queue = RequestQueue::new();
		let state = AppState { ctx, queue };
		let (status, Json(body)) = cancel_request(State(state), Path("does-not-exist".to_string())).await;
		assert_eq!(status, StatusCode::NOT_FOUND);
		assert_eq!(body["cancelled"], false);
	}

	#[tokio::test]
	async fn health_reports_ok_when_page_ready() {
		let ctx = WorkerContext::new(Arc::new(NullBrowserController::default()), Arc::new(RuntimeConfig::default()));
		let queue = RequestQueue::new();
		let state = AppState { ctx, queue };
		let (status, Json(body)) = health(State(state)).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["status"], "ok");
	}

	#[tokio::test]
	async fn health_reports_unavailable_when_page_not_ready() {
		let browser = NullBrowserController::default();
		browser.page_ready.store(false, std::sync::atomic::Ordering::SeqCst);
		let ctx = WorkerContext::new(Arc::new(browser), Arc::new(RuntimeConfig::default()));
		let queue = RequestQueue::new();
		let state = AppState { ctx, queue };
		let (status, Json(body)) = health(State(state)).await;
		assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
		assert_eq!(body["status"], "not_ready");
	}

	fn build_request() -> ChatCompletionRequest {
		use crate::types::{ChatMessage, MessageContent, Role};
		ChatCompletionRequest {
			model: Strng::from("studio-default"),
			messages: vec![ChatMessage {
				role: Role::User,
				content: MessageContent::Text("hi".to_string()),
			}],
			stream: false,
			temperature: 1.0,
			max_output_tokens: 100,
			top_p: 0.95,
			stop: None,
			reasoning_effort: None,
			tools: None,
		}
	}

	#[test]
	fn strip_event_framing_removes_data_prefix_and_blank_line() {
		let framed = sse::format_sse_line(&serde_json::json!({"a": 1}));
		let stripped = strip_event_framing(&framed);
		assert!(stripped.starts_with('{'));
		assert!(!stripped.contains('\n'));
	}
}
