//! Data model (§3): chat wire types, the queued item that rides the pipeline,
//! the param cache, the decoded frame published by the MITM sniffer, and the
//! worker record persisted to `workers.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Cheap, cloneable interned string.
pub type Strng = arcstr::ArcStr;

fn default_model() -> Strng {
	Strng::from("studio-default")
}
fn default_temperature() -> f32 {
	1.0
}
fn default_max_output_tokens() -> u32 {
	65536
}
fn default_top_p() -> f32 {
	0.95
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	System,
	User,
	Assistant,
	Tool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
	Text(String),
	Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
	Text { text: String },
	#[serde(rename = "image_url")]
	Image { image_url: ImageRef },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageRef {
	pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
	pub role: Role,
	pub content: MessageContent,
}

/// `{model, messages[], stream, temperature?, max_output_tokens?, top_p?, stop?,
/// reasoning_effort?, tools?}`. Unknown top-level fields are accepted and ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionRequest {
	#[serde(default = "default_model")]
	pub model: Strng,
	pub messages: Vec<ChatMessage>,
	#[serde(default)]
	pub stream: bool,
	#[serde(default = "default_temperature")]
	pub temperature: f32,
	#[serde(default = "default_max_output_tokens")]
	pub max_output_tokens: u32,
	#[serde(default = "default_top_p")]
	pub top_p: f32,
	#[serde(default)]
	pub stop: Option<Vec<String>>,
	#[serde(default)]
	pub reasoning_effort: Option<String>,
	#[serde(default)]
	pub tools: Option<Vec<serde_json::Value>>,
}

impl ChatCompletionRequest {
	/// Clamp bounded fields per §3 (`temperature` in `[0,2]`, `top_p` in `[0,1]`).
	pub fn normalized(mut self) -> Self {
		self.temperature = self.temperature.clamp(0.0, 2.0);
		self.top_p = self.top_p.clamp(0.0, 1.0);
		self
	}
}

/// A function call surfaced in a terminating decoded frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionCall {
	pub name: String,
	pub params: serde_json::Value,
}

/// Decoded frame (C3 -> C4 -> C7). `reason`/`body` are cumulative across frames
/// belonging to the same request; `function` is only populated once, on the
/// frame carrying `done = true`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DecodedFrame {
	#[serde(default)]
	pub reason: String,
	#[serde(default)]
	pub body: String,
	#[serde(default)]
	pub function: Vec<FunctionCall>,
	#[serde(default)]
	pub done: bool,
}

/// Process-global record of what is currently set on the browser page (§3).
/// Invariant: if `last_model_id` no longer matches the live model, the whole
/// cache is stale and must be cleared before reuse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamCache {
	pub last_model_id: Option<Strng>,
	pub temperature: Option<f32>,
	pub max_output_tokens: Option<u32>,
	pub top_p: Option<f32>,
	pub stop_sequences: Option<Vec<String>>,
}

impl ParamCache {
	/// Returns true when every DOM-observable field already matches `req`
	/// for the given model -- the case where C7 can skip all writes.
	pub fn matches(&self, model: &Strng, req: &ChatCompletionRequest) -> bool {
		self.last_model_id.as_ref() == Some(model)
			&& self.temperature == Some(req.temperature)
			&& self.max_output_tokens == Some(req.max_output_tokens)
			&& self.top_p == Some(req.top_p)
			&& self.stop_sequences == req.stop
	}

	pub fn clear(&mut self) {
		*self = ParamCache::default();
	}
}

/// Published by C4 onto the side-channel queue that C7 drains (§4.1, §4.2.3).
#[derive(Debug, Clone)]
pub enum SideChannelEvent {
	Frame(DecodedFrame),
	RateLimit {
		source: String,
		path: String,
	},
}

/// A streaming response in flight: the channel of already-framed SSE lines
/// (`data: ...\n\n`, ending in `[DONE]`) plus the completion signal C8's
/// post-dispatch wait blocks on (§4.3 "await completion_event").
pub struct StreamHandle {
	pub rx: tokio::sync::mpsc::Receiver<String>,
	pub completion: Arc<tokio::sync::Notify>,
}

/// What the pipeline hands back to the HTTP layer: either a complete body or
/// a live stream handle.
pub enum PipelineOutcome {
	Complete(serde_json::Value),
	Stream(StreamHandle),
}

pub type PipelineResult = Result<PipelineOutcome, crate::error::PipelineError>;

/// A request sitting in C8's queue (§3). `cancelled` is observed at the three
/// checkpoints described in §4.2/§5; `result_tx` is the single-shot promise
/// completing the item exactly once. `client_gone` is the transport-level
/// liveness probe the HTTP layer hands in at enqueue time, consulted by C8's
/// top-of-loop cleanup pass and pre-lock guard (§4.3) before a `DisconnectMonitor`
/// even exists for this request.
pub struct QueuedItem {
	pub req_id: Strng,
	pub request: Arc<ChatCompletionRequest>,
	pub enqueued_at: std::time::Instant,
	pub cancelled: Arc<AtomicBool>,
	pub client_gone: Arc<dyn Fn() -> bool + Send + Sync>,
	pub result_tx: Option<oneshot::Sender<PipelineResult>>,
}

impl QueuedItem {
	pub fn new(
		req_id: Strng,
		request: ChatCompletionRequest,
		client_gone: Arc<dyn Fn() -> bool + Send + Sync>,
	) -> (Self, oneshot::Receiver<PipelineResult>) {
		let (tx, rx) = oneshot::channel();
		(
			QueuedItem {
				req_id,
				request: Arc::new(request),
				enqueued_at: std::time::Instant::now(),
				cancelled: Arc::new(AtomicBool::new(false)),
				client_gone,
				result_tx: Some(tx),
			},
			rx,
		)
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	pub fn mark_cancelled(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	/// Completes the result future exactly once; a second call is a no-op,
	/// satisfying invariant 1 in §8 even under racing completions.
	pub fn complete(&mut self, result: PipelineResult) {
		if let Some(tx) = self.result_tx.take() {
			let _ = tx.send(result);
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
	Stopped,
	Running,
}

/// `{id, profile_name, profile_path, worker_port, browser_debug_port,
/// child_process?, status, request_count}` (§3). Quarantine state lives in
/// `RateLimitRegistry`, not here, so every worker shares one eviction policy
/// instead of tracking it per instance.
pub struct Worker {
	pub id: Strng,
	pub profile_name: Strng,
	pub profile_path: PathBuf,
	pub worker_port: u16,
	pub browser_debug_port: u16,
	pub child: Option<tokio::process::Child>,
	pub status: WorkerStatus,
	pub request_count: u64,
}

/// On-disk `workers.json` schema (§6): `{workers: [...], settings: {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersFile {
	pub workers: Vec<WorkerRecord>,
	#[serde(default)]
	pub settings: WorkerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
	pub id: String,
	pub profile: String,
	pub port: u16,
	pub camoufox_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
	#[serde(default = "default_recovery_hours")]
	pub recovery_hours: u64,
}

fn default_recovery_hours() -> u64 {
	6
}

impl Default for WorkerSettings {
	fn default() -> Self {
		WorkerSettings {
			recovery_hours: default_recovery_hours(),
		}
	}
}
