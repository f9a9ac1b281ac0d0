//! C8 Queue Worker (§4.3): a single long-lived cooperative loop that owns the
//! serialization guarantee by draining one `RequestQueue` at a time behind
//! the worker's `processing_lock`.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::context::WorkerContext;
use crate::disconnect::{DisconnectMonitor, enhanced_poll_until};
use crate::error::PipelineError;
use crate::pipeline::{self, PipelineInput};
use crate::types::{PipelineOutcome, QueuedItem};

const CLEANUP_SCAN_LIMIT: usize = 10;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_STREAM_GAP: Duration = Duration::from_secs(1);
const SUBMIT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RequestQueue {
	items: Mutex<VecDeque<QueuedItem>>,
	notify: Notify,
}

impl RequestQueue {
	pub fn new() -> Arc<Self> {
		Arc::new(RequestQueue {
			items: Mutex::new(VecDeque::new()),
			notify: Notify::new(),
		})
	}

	pub async fn push(&self, item: QueuedItem) {
		self.items.lock().await.push_back(item);
		self.notify.notify_one();
	}

	async fn dequeue_with_timeout(&self, timeout: Duration) -> Option<QueuedItem> {
		let deadline = tokio::time::sleep(timeout);
		tokio::pin!(deadline);
		loop {
			{
				let mut items = self.items.lock().await;
				if let Some(item) = items.pop_front() {
					return Some(item);
				}
			}
			tokio::select! {
				_ = &mut deadline => return None,
				_ = self.notify.notified() => {},
			}
		}
	}

	/// Top-of-loop cleanup pass (§4.3): examine up to 10 queued items
	/// concurrently for client disconnect, fail and drop the dead ones, and
	/// re-enqueue the survivors preserving relative order.
	async fn cleanup_pass(&self) {
		let mut items = self.items.lock().await;
		let scan_count = items.len().min(CLEANUP_SCAN_LIMIT);
		let mut scanned: Vec<QueuedItem> = Vec::with_capacity(scan_count);
		for _ in 0..scan_count {
			if let Some(item) = items.pop_front() {
				scanned.push(item);
			}
		}
		drop(items);

		let mut survivors = Vec::with_capacity(scanned.len());
		for mut item in scanned {
			if item.is_cancelled() || (item.client_gone)() {
				debug!(req_id = %item.req_id, "dropping queued item, client already gone");
				item.mark_cancelled();
				item.complete(Err(PipelineError::ClientGone));
			} else {
				survivors.push(item);
			}
		}

		let mut items = self.items.lock().await;
		for item in survivors.into_iter().rev() {
			items.push_front(item);
		}
	}

	/// Flips `cancelled` on a still-queued item, scanning the whole queue
	/// (unlike `cleanup_pass`'s bounded scan). Returns whether a matching
	/// item was found, so `/v1/cancel` can tell a queued hit from a miss.
	pub async fn mark_cancelled(&self, req_id: &crate::types::Strng) -> bool {
		let items = self.items.lock().await;
		if let Some(item) = items.iter().find(|item| &item.req_id == req_id) {
			item.mark_cancelled();
			true
		} else {
			false
		}
	}
}

struct PacingState {
	last_completed_at: Option<Instant>,
	last_was_streaming: bool,
}

/// Runs until `shutdown` resolves. `ctx` is the single worker's shared state;
/// `queue` feeds it requests enqueued by the HTTP layer.
pub async fn run_worker_loop(ctx: Arc<WorkerContext>, queue: Arc<RequestQueue>, shutdown: impl Future<Output = ()>) {
	tokio::pin!(shutdown);
	let mut pacing = PacingState {
		last_completed_at: None,
		last_was_streaming: false,
	};

	loop {
		tokio::select! {
			_ = &mut shutdown => {
				info!("queue worker received shutdown signal");
				break;
			},
			_ = process_one(&ctx, &queue, &mut pacing) => {},
		}
	}
}

async fn process_one(ctx: &Arc<WorkerContext>, queue: &Arc<RequestQueue>, pacing: &mut PacingState) {
	queue.cleanup_pass().await;

	let Some(mut item) = queue.dequeue_with_timeout(DEQUEUE_TIMEOUT).await else {
		return;
	};

	if item.is_cancelled() || (item.client_gone)() {
		item.complete(Err(PipelineError::ClientGone));
		return;
	}

	if pacing.last_was_streaming && item.request.stream {
		if let Some(last) = pacing.last_completed_at {
			let gap = last.elapsed();
			if gap < MIN_STREAM_GAP {
				let sleep_for = (MIN_STREAM_GAP - gap).max(Duration::from_millis(500));
				tokio::time::sleep(sleep_for).await;
			}
		}
	}

	let _processing_guard = ctx.processing_lock.lock().await;

	let client_gone_probe = item.client_gone.clone();
	if client_gone_probe() {
		item.complete(Err(PipelineError::ClientGone));
		return;
	}

	let check_disconnect: &(dyn Fn(&str) -> bool + Send + Sync) = &|_stage: &str| false;
	if let Err(e) = ctx.browser.clear_chat_history(check_disconnect).await {
		warn!(req_id = %item.req_id, error = %e, "clear_chat_history failed before dispatch");
	}

	let (monitor, _signal_tx) = DisconnectMonitor::new(
		item.req_id.clone(),
		ctx.cancellation.clone(),
		move || client_gone_probe(),
		|| false,
	);

	let input = PipelineInput {
		req_id: item.req_id.clone(),
		request: item.request.clone(),
		monitor: monitor.clone(),
	};

	let result = pipeline::run(ctx, input).await;

	let was_streaming = item.request.stream;
	match result {
		Ok(PipelineOutcome::Stream(handle)) => {
			let completion = handle.completion.clone();
			let monitor_for_wait = monitor.clone();
			let timeout = Duration::from_millis(ctx.config.response_completion_timeout_ms) + Duration::from_secs(60);

			// Hand the handle to the HTTP layer now; the client starts
			// draining `handle.rx` immediately instead of blocking behind
			// this wait. Everything below just holds the processing lock
			// until the producer finishes (or times out), it no longer
			// gates delivery.
			item.complete(Ok(PipelineOutcome::Stream(handle)));

			let stream_finished = Arc::new(AtomicBool::new(false));
			let stream_finished_for_poll = stream_finished.clone();
			let completion_for_poll = completion.clone();
			tokio::spawn(async move {
				enhanced_poll_until(
					move || monitor_for_wait.is_disconnected(),
					move || stream_finished_for_poll.load(Ordering::SeqCst),
					move || completion_for_poll.notify_one(),
				)
				.await;
			});

			let timed_out = tokio::time::timeout(timeout, completion.notified()).await.is_err();
			stream_finished.store(true, Ordering::SeqCst);
			if timed_out {
				warn!(req_id = %item.req_id, "stream did not complete within response-completion budget");
			} else if !monitor.is_disconnected() {
				verify_submit_disabled(ctx).await;
			}
		},
		other => {
			item.complete(other);
		},
	}

	ctx.drain_side_channel().await;
	pacing.last_completed_at = Some(Instant::now());
	pacing.last_was_streaming = was_streaming;
}

/// §4.3 "verify the submit button is disabled". The browser contract (§4.5)
/// doesn't itemize a standalone button-state probe, so this approximates it
/// with the page-readiness signal already exposed by C6.
async fn verify_submit_disabled(ctx: &Arc<WorkerContext>) {
	let deadline = Instant::now() + SUBMIT_VERIFY_TIMEOUT;
	while Instant::now() < deadline {
		if ctx.browser.is_page_ready() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc as StdArc;
	use std::sync::atomic::{AtomicBool, Ordering};

	use super::*;
	use crate::browser::NullBrowserController;
	use crate::config::RuntimeConfig;
	use crate::types::{ChatCompletionRequest, ChatMessage, MessageContent, Role, Strng};

	fn build_request(stream: bool) -> ChatCompletionRequest {
		ChatCompletionRequest {
			model: Strng::from("studio-default"),
			messages: vec![ChatMessage {
				role: Role::User,
				content: MessageContent::Text("hi".to_string()),
			}],
			stream,
			temperature: 1.0,
			max_output_tokens: 100,
			top_p: 0.95,
			stop: None,
			reasoning_effort: None,
			tools: None,
		}
	}

	#[tokio::test]
	async fn mark_cancelled_flips_flag_on_matching_queued_item() {
		let queue = RequestQueue::new();
		let (item, rx) = QueuedItem::new(Strng::from("r-target"), build_request(false), StdArc::new(|| false));
		queue.push(item).await;

		assert!(queue.mark_cancelled(&Strng::from("r-target")).await);
		assert!(!queue.mark_cancelled(&Strng::from("r-other")).await);

		queue.cleanup_pass().await;
		let result = rx.await.unwrap();
		assert!(matches!(result, Err(PipelineError::ClientGone)));
	}

	#[tokio::test]
	async fn cleanup_pass_drops_disconnected_items() {
		let queue = RequestQueue::new();
		let gone = StdArc::new(AtomicBool::new(true));
		let gone2 = gone.clone();
		let (item, rx) = QueuedItem::new(Strng::from("r1"), build_request(false), StdArc::new(move || gone2.load(Ordering::SeqCst)));
		queue.push(item).await;
		queue.cleanup_pass().await;
		let result = rx.await.unwrap();
		assert!(matches!(result, Err(PipelineError::ClientGone)));
	}

	#[tokio::test]
	async fn full_loop_completes_non_streaming_request() {
		let ctx = WorkerContext::new_with_side_channel(Arc::new(NullBrowserController::with_response("hi there")), Arc::new(RuntimeConfig::default()), false);
		let queue = RequestQueue::new();
		let (item, rx) = QueuedItem::new(Strng::from("r2"), build_request(false), StdArc::new(|| false));
		queue.push(item).await;

		let shutdown = Arc::new(Notify::new());
		let shutdown_for_loop = shutdown.clone();
		let ctx_for_loop = ctx.clone();
		let queue_for_loop = queue.clone();
		let handle = tokio::spawn(async move {
			run_worker_loop(ctx_for_loop, queue_for_loop, async move { shutdown_for_loop.notified().await }).await;
		});

		let result = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
		match result {
			Ok(PipelineOutcome::Complete(v)) => assert_eq!(v["choices"][0]["message"]["content"], "hi there"),
			other => panic!("unexpected result: {:?}", matches!(other, Ok(_))),
		}
		shutdown.notify_one();
		let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
	}

	/// The result future must resolve to a `Stream` handle before any frame is
	/// even produced; previously it only resolved after the whole stream had
	/// finished, which deadlocked once the producer blocked on a full
	/// channel that nothing was draining yet.
	#[tokio::test]
	async fn streaming_result_is_delivered_before_production_finishes() {
		use crate::types::{DecodedFrame, SideChannelEvent};

		let ctx = WorkerContext::new_with_side_channel(Arc::new(NullBrowserController::default()), Arc::new(RuntimeConfig::default()), true);
		let queue = RequestQueue::new();
		let (item, rx) = QueuedItem::new(Strng::from("r3"), build_request(true), StdArc::new(|| false));
		queue.push(item).await;

		let shutdown = Arc::new(Notify::new());
		let shutdown_for_loop = shutdown.clone();
		let ctx_for_loop = ctx.clone();
		let queue_for_loop = queue.clone();
		let worker = tokio::spawn(async move {
			run_worker_loop(ctx_for_loop, queue_for_loop, async move { shutdown_for_loop.notified().await }).await;
		});

		// No frame has been pushed yet; under the old behaviour this would
		// hang until the stream had already finished.
		let mut handle = match tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap() {
			Ok(PipelineOutcome::Stream(handle)) => handle,
			other => panic!("expected Stream outcome: {:?}", matches!(other, Ok(_))),
		};

		ctx.side_channel_tx
			.send(SideChannelEvent::Frame(DecodedFrame {
				reason: String::new(),
				body: "partial".to_string(),
				function: vec![],
				done: false,
			}))
			.await
			.unwrap();
		let first_line = tokio::time::timeout(Duration::from_secs(2), handle.rx.recv()).await.unwrap().unwrap();
		assert!(first_line.contains("partial"));

		ctx.side_channel_tx
			.send(SideChannelEvent::Frame(DecodedFrame {
				reason: String::new(),
				body: "partial and done".to_string(),
				function: vec![],
				done: true,
			}))
			.await
			.unwrap();
		while handle.rx.recv().await.is_some() {}

		shutdown.notify_one();
		let _ = tokio::time::timeout(Duration::from_secs(1), worker).await;
	}
}
