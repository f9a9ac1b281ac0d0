//! End-to-end coverage of the worker's OpenAI-shaped HTTP surface: requests
//! enqueued by `axum::Router` flow through the real `RequestQueue` and
//! `pipeline::run`, driven by `queue::run_worker_loop` exactly as `main.rs`
//! wires it, just against a `NullBrowserController` instead of a live page.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use bridge_gateway::browser::NullBrowserController;
use bridge_gateway::config::RuntimeConfig;
use bridge_gateway::context::WorkerContext;
use bridge_gateway::http::{self as worker_http, AppState};
use bridge_gateway::queue::{self, RequestQueue};
use http_body_util::BodyExt;
use tokio::sync::Notify;
use tower::ServiceExt;

struct Harness {
	app: axum::Router,
	shutdown: Arc<Notify>,
	worker: tokio::task::JoinHandle<()>,
}

impl Harness {
	async fn new(canned_response: &str) -> Self {
		let ctx = WorkerContext::new_with_side_channel(Arc::new(NullBrowserController::with_response(canned_response)), Arc::new(RuntimeConfig::default()), false);
		let queue = RequestQueue::new();
		let app = worker_http::router(AppState { ctx: ctx.clone(), queue: queue.clone() });

		let shutdown = Arc::new(Notify::new());
		let shutdown_for_worker = shutdown.clone();
		let worker = tokio::spawn(async move {
			queue::run_worker_loop(ctx, queue, async move { shutdown_for_worker.notified().await }).await;
		});

		Harness { app, shutdown, worker }
	}

	async fn stop(self) {
		self.shutdown.notify_one();
		let _ = tokio::time::timeout(Duration::from_secs(1), self.worker).await;
	}
}

#[tokio::test]
async fn health_endpoint_returns_ok() -> anyhow::Result<()> {
	let harness = Harness::new("unused").await;
	let response = harness.app.clone().oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty())?).await?;
	assert_eq!(response.status(), StatusCode::OK);
	harness.stop().await;
	Ok(())
}

#[tokio::test]
async fn models_endpoint_lists_default_model() -> anyhow::Result<()> {
	let harness = Harness::new("unused").await;
	let response = harness
		.app
		.clone()
		.oneshot(axum::http::Request::builder().uri("/v1/models").body(axum::body::Body::empty())?)
		.await?;
	let body = response.into_body().collect().await?.to_bytes();
	let json: serde_json::Value = serde_json::from_slice(&body)?;
	assert_eq!(json["data"][0]["id"], "studio-default");
	harness.stop().await;
	Ok(())
}

#[tokio::test]
async fn non_streaming_chat_completion_round_trips_through_the_queue() -> anyhow::Result<()> {
	let harness = Harness::new("hello from studio").await;

	let body = serde_json::json!({
		"model": "studio-default",
		"stream": false,
		"messages": [{"role": "user", "content": "hi"}],
	});

	let response = harness
		.app
		.clone()
		.oneshot(
			axum::http::Request::builder()
				.method("POST")
				.uri("/v1/chat/completions")
				.header("content-type", "application/json")
				.body(axum::body::Body::from(serde_json::to_vec(&body)?))?,
		)
		.await?;

	assert_eq!(response.status(), StatusCode::OK);
	let response_body = response.into_body().collect().await?.to_bytes();
	let json: serde_json::Value = serde_json::from_slice(&response_body)?;
	assert_eq!(json["choices"][0]["message"]["content"], "hello from studio");

	harness.stop().await;
	Ok(())
}

#[tokio::test]
async fn cancel_endpoint_marks_the_registry() -> anyhow::Result<()> {
	let harness = Harness::new("unused").await;
	let response = harness
		.app
		.clone()
		.oneshot(axum::http::Request::builder().method("POST").uri("/v1/cancel/some-request-id").body(axum::body::Body::empty())?)
		.await?;
	assert_eq!(response.status(), StatusCode::OK);
	let body = response.into_body().collect().await?.to_bytes();
	let json: serde_json::Value = serde_json::from_slice(&body)?;
	assert_eq!(json["req_id"], "some-request-id");
	harness.stop().await;
	Ok(())
}

#[tokio::test]
async fn unknown_route_returns_not_found() -> anyhow::Result<()> {
	let harness = Harness::new("unused").await;
	let response = harness.app.clone().oneshot(axum::http::Request::builder().uri("/nope").body(axum::body::Body::empty())?).await?;
	assert_eq!(response.status(), StatusCode::NOT_FOUND);
	harness.stop().await;
	Ok(())
}
