//! C11 Gateway: round-robins OpenAI-shaped requests across running workers,
//! quarantining any worker whose response carries a rate-limit phrase (§4.4).
//! Streams the upstream body through unbuffered (an mpsc channel feeding a
//! `ReceiverStream` rather than chained `Stream` combinators) while scanning
//! a bounded trailing window of bytes for rate-limit phrases.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::pool::WorkerSummary;
use crate::types::WorkerStatus;

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;
const RATE_LIMIT_PHRASES: &[&str] = &[
	"exceeded your current quota",
	"exceeded quota",
	"out of free generations",
	"rate limit",
	"quota exceeded",
];
/// Bytes of trailing text kept around to catch a phrase split across two
/// network reads.
const SCAN_TAIL_BUDGET: usize = 256;

struct WorkerListCache {
	workers: Vec<WorkerSummary>,
	fetched_at: Instant,
}

pub struct GatewayProxy {
	client: reqwest::Client,
	manager_base_url: String,
	worker_cache_ttl: Duration,
	cache: Mutex<Option<WorkerListCache>>,
	next_index: AtomicUsize,
}

impl GatewayProxy {
	pub fn new(manager_base_url: String, worker_cache_ttl: Duration) -> anyhow::Result<Arc<Self>> {
		let client = reqwest::Client::builder()
			.pool_max_idle_per_host(20)
			.pool_idle_timeout(Duration::from_secs(30))
			.timeout(Duration::from_secs(300))
			.build()?;
		Ok(Arc::new(GatewayProxy {
			client,
			manager_base_url,
			worker_cache_ttl,
			cache: Mutex::new(None),
			next_index: AtomicUsize::new(0),
		}))
	}

	/// §4.4: a 5s-TTL cache in front of the manager's `/workers` listing, so a
	/// burst of requests doesn't hammer it.
	async fn fetch_workers(&self) -> anyhow::Result<Vec<WorkerSummary>> {
		let mut cache = self.cache.lock().await;
		if let Some(c) = cache.as_ref() {
			if c.fetched_at.elapsed() < self.worker_cache_ttl {
				return Ok(c.workers.clone());
			}
		}
		let url = format!("{}/workers", self.manager_base_url.trim_end_matches('/'));
		let workers: Vec<WorkerSummary> = self.client.get(&url).send().await?.error_for_status()?.json().await?;
		*cache = Some(WorkerListCache {
			workers: workers.clone(),
			fetched_at: Instant::now(),
		});
		Ok(workers)
	}

	async fn pick_worker(&self) -> Option<WorkerSummary> {
		let workers = self.fetch_workers().await.ok()?;
		let running: Vec<&WorkerSummary> = workers.iter().filter(|w| matches!(w.status, WorkerStatus::Running)).collect();
		if running.is_empty() {
			return None;
		}
		let idx = self.next_index.fetch_add(1, Ordering::SeqCst) % running.len();
		Some(running[idx].clone())
	}

	/// Fire-and-forget per §4.4: the proxy doesn't wait on or fail the
	/// in-flight response because the manager rejected the report.
	async fn report_rate_limit(&self, worker_id: &str, model: &str) {
		let url = format!("{}/api/workers/{}/rate-limit", self.manager_base_url.trim_end_matches('/'), worker_id);
		let body = serde_json::json!({ "model": model });
		if let Err(e) = self.client.post(&url).json(&body).send().await {
			warn!(error = %e, worker = worker_id, "failed to report rate limit to manager");
		}
	}
}

fn contains_rate_limit_phrase(haystack: &str) -> bool {
	let lower = haystack.to_lowercase();
	RATE_LIMIT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

fn append_scan_tail(tail: &mut String, chunk: &[u8]) {
	tail.push_str(&String::from_utf8_lossy(chunk));
	if tail.len() > SCAN_TAIL_BUDGET * 4 {
		let cut = tail.len() - SCAN_TAIL_BUDGET;
		*tail = tail.split_off(cut);
	}
}

pub async fn forward_chat_completions(State(proxy): State<Arc<GatewayProxy>>, req: Request) -> Response {
	let (parts, body) = req.into_parts();
	let body_bytes = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
		Ok(b) => b,
		Err(e) => return (StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")).into_response(),
	};

	let model = serde_json::from_slice::<serde_json::Value>(&body_bytes)
		.ok()
		.and_then(|v| v.get("model").and_then(|m| m.as_str()).map(|s| s.to_string()))
		.unwrap_or_else(|| "unknown".to_string());

	let Some(worker) = proxy.pick_worker().await else {
		return (StatusCode::SERVICE_UNAVAILABLE, "no workers available").into_response();
	};

	let path = parts.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/v1/chat/completions");
	let url = format!("http://127.0.0.1:{}{}", worker.port, path);

	let mut builder = proxy.client.request(parts.method.clone(), &url);
	for (name, value) in parts.headers.iter() {
		if name == header::HOST || name == header::CONTENT_LENGTH {
			continue;
		}
		builder = builder.header(name.as_str(), value.as_bytes());
	}
	builder = builder.body(body_bytes);

	let upstream_resp = match builder.send().await {
		Ok(r) => r,
		Err(e) => {
			warn!(error = %e, worker = %worker.id, "upstream request to worker failed");
			return (StatusCode::BAD_GATEWAY, "upstream worker request failed").into_response();
		},
	};

	let status = StatusCode::from_u16(upstream_resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
	let content_type = upstream_resp
		.headers()
		.get(reqwest::header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string());

	let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(32);
	let worker_id = worker.id.clone();
	let proxy_for_scan = proxy.clone();
	tokio::spawn(async move {
		let mut stream = upstream_resp.bytes_stream();
		let mut tail = String::new();
		while let Some(chunk) = stream.next().await {
			match chunk {
				Ok(bytes) => {
					append_scan_tail(&mut tail, &bytes);
					if contains_rate_limit_phrase(&tail) {
						proxy_for_scan.report_rate_limit(&worker_id, &model).await;
						tail.clear();
					}
					if tx.send(Ok(bytes)).await.is_err() {
						break;
					}
				},
				Err(e) => {
					let _ = tx.send(Err(std::io::Error::other(e))).await;
					break;
				},
			}
		}
	});

	let mut builder = Response::builder().status(status);
	if let Some(ct) = content_type {
		builder = builder.header(header::CONTENT_TYPE, ct);
	}
	builder = builder.header("x-accel-buffering", HeaderValue::from_static("no"));
	builder
		.body(Body::from_stream(ReceiverStream::new(rx)))
		.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn detects_known_rate_limit_phrases_case_insensitively() {
		assert!(contains_rate_limit_phrase("You have EXCEEDED YOUR CURRENT QUOTA for today"));
		assert!(contains_rate_limit_phrase("looks like you're out of free generations"));
		assert!(contains_rate_limit_phrase("error: exceeded quota for this model"));
		assert!(!contains_rate_limit_phrase("everything is fine"));
	}

	#[test]
	fn scan_tail_stays_bounded() {
		let mut tail = String::new();
		for _ in 0..2000 {
			append_scan_tail(&mut tail, b"xxxxxxxxxx");
		}
		assert!(tail.len() <= SCAN_TAIL_BUDGET * 4);
	}

	#[tokio::test]
	async fn worker_cache_respects_ttl() {
		let server = wiremock::MockServer::start().await;
		wiremock::Mock::given(wiremock::matchers::method("GET"))
			.and(wiremock::matchers::path("/workers"))
			.respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!([
				{"id": "w1", "port": 9001, "status": "running"}
			])))
			.expect(1)
			.mount(&server)
			.await;

		let proxy = GatewayProxy::new(server.uri(), Duration::from_secs(60)).unwrap();
		let first = proxy.fetch_workers().await.unwrap();
		let second = proxy.fetch_workers().await.unwrap();
		assert_eq!(first.len(), 1);
		assert_eq!(second.len(), 1);
	}
}
