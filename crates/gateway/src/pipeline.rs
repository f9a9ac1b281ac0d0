//! C7 Request Pipeline (§4.2): the hardest subsystem. Given a request already
//! sitting behind the processing lock, drives model resolution, prompt
//! submission, and response multiplexing end to end, completing its result
//! exactly once with either a response or a typed `PipelineError`.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::abort::{ErrorContext, should_treat_as_success};
use crate::browser::{AdjustParams, BrowserController, CheckDisconnect, PreparedImage, prepare_prompt};
use crate::context::WorkerContext;
use crate::disconnect::DisconnectMonitor;
use crate::error::PipelineError;
use crate::sse;
use crate::types::{ChatCompletionRequest, PipelineOutcome, PipelineResult, SideChannelEvent, StreamHandle, Strng};

const SIDE_CHANNEL_IDLE_CEILING: u32 = 300;
const SIDE_CHANNEL_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DOM_SCRAPE_CHUNK_LEN: usize = 5;
const DOM_SCRAPE_CHUNK_DELAY: Duration = Duration::from_millis(30);

/// What C7 needs from whoever dequeued the request: the id, the parsed body,
/// and a disconnect monitor already wired to that request's transport.
pub struct PipelineInput {
	pub req_id: Strng,
	pub request: Arc<ChatCompletionRequest>,
	pub monitor: Arc<DisconnectMonitor>,
}

/// Runs every phase of §4.2.1, returning as soon as `result` can be decided.
/// For streaming requests this returns once the first frame is ready to go
/// out; the remainder of the response is produced by a spawned task writing
/// into the returned `StreamHandle`.
pub async fn run(ctx: &Arc<WorkerContext>, input: PipelineInput) -> PipelineResult {
	let PipelineInput { req_id, request, monitor } = input;

	// Phase 1: register.
	ctx.cancellation.register(req_id.clone());
	ctx.mark_in_flight(req_id.clone());
	let _cleanup = RegistrationGuard {
		ctx: ctx.clone(),
		req_id: req_id.clone(),
	};

	// Phase 2: pre-connect probe.
	if monitor.check_once().await {
		return Err(PipelineError::ClientGone);
	}

	// Phase 4: background disconnect watchdog (§4.2.2). Runs independently
	// of the checkpoints below so a disconnect mid-browser-interaction still
	// triggers `stop_generation` promptly instead of waiting for the next
	// `check_once` call.
	let watchdog = DisconnectWatchdog::spawn(ctx, &req_id, monitor.clone());

	let disconnected_flag = monitor.clone();
	let check: CheckDisconnect = &move |_stage: &str| disconnected_flag.is_disconnected();

	// Phase 5: page readiness.
	if !ctx.browser.is_page_ready() {
		return Err(PipelineError::ServiceUnavailable { retry_after_secs: 30 });
	}

	// Phase 6: model resolution.
	{
		let _guard = ctx.model_switching_lock.lock().await;
		let mut current = ctx.current_model_id.lock().await;
		let needs_switch = current.as_ref() != Some(&request.model);
		if needs_switch {
			if let Err(e) = ctx.browser.switch_model(&request.model, check).await {
				warn!(req_id = %req_id, model = %request.model, error = %e, "model switch failed");
				return Err(PipelineError::ModelUnavailable(request.model.to_string()));
			}
			*current = Some(request.model.clone());
			drop(current);
			// Phase 7: param cache reconciliation, model actually switched.
			ctx.params_cache.lock().await.clear();
		} else {
			drop(current);
			let stale = {
				let cache = ctx.params_cache.lock().await;
				cache.last_model_id.as_ref() != Some(&request.model)
			};
			if stale {
				ctx.params_cache.lock().await.clear();
			}
		}
	}

	if monitor.check_once().await {
		return Err(PipelineError::ClientGone);
	}

	// Phase 8: prompt preparation.
	let (system_text, transcript, image_urls) = prepare_prompt(&request);
	let images: Vec<PreparedImage> = image_urls
		.iter()
		.enumerate()
		.map(|(i, url)| PreparedImage {
			filename: format!("image_{i}"),
			data: url.as_bytes().to_vec(),
		})
		.collect();

	// Phase 9: system instructions, then parameter adjustment.
	if let Some(text) = system_text.as_deref() {
		if let Err(e) = ctx.browser.set_system_instructions(text, check).await {
			return Err(PipelineError::Internal(anyhow::anyhow!("set_system_instructions: {e}")));
		}
	}
	if monitor.check_once().await {
		return Err(PipelineError::ClientGone);
	}

	let params = AdjustParams {
		temperature: request.temperature,
		max_output_tokens: request.max_output_tokens,
		top_p: request.top_p,
		stop_sequences: request.stop.clone(),
		tools_panel_expanded: request.tools.is_some(),
		url_context: false,
		thinking_budget: None,
		google_search: false,
	};
	{
		let mut cache = ctx.params_cache.lock().await;
		if !cache.matches(&request.model, &request) {
			if let Err(e) = ctx.browser.adjust_parameters(&params, &mut cache, &request.model, check).await {
				warn!(req_id = %req_id, error = %e, "adjust_parameters failed, cache cleared");
				cache.clear();
			}
		}
	}

	if monitor.check_once().await {
		return Err(PipelineError::ClientGone);
	}

	// Phase 10: submit.
	if let Err(e) = ctx.browser.submit_prompt(&transcript, &images, check).await {
		return Err(PipelineError::Internal(anyhow::anyhow!("submit_prompt: {e}")));
	}

	let skip_stop = Arc::new(Notify::new());
	let skip_stop_wait = {
		let n = skip_stop.clone();
		Box::pin(async move { n.notified().await })
	};
	let browser_for_skip = ctx.browser.clone();
	let skip_check_flag = monitor.clone();
	let skip_task = tokio::spawn(async move {
		let check: CheckDisconnect = &move |_s: &str| skip_check_flag.is_disconnected();
		browser_for_skip.continuously_handle_skip_button(skip_stop_wait, check).await;
	});

	// Phase 11: response phase. Streaming hands the watchdog's abort handle
	// to the spawned producer task, which outlives this function; the
	// non-streaming path lets `watchdog` drop at the end of `run`, aborting
	// it once the response is fully built.
	let outcome = if request.stream {
		start_streaming_response(ctx, &req_id, &request, monitor.clone(), transcript, watchdog.into_abort_handle()).await
	} else {
		run_to_completion(ctx.as_ref(), &req_id, &request, &monitor, transcript, check).await
	};

	// Phase 12: cleanup (skip-button monitor, 2s budget).
	skip_stop.notify_one();
	if tokio::time::timeout(Duration::from_secs(2), skip_task).await.is_err() {
		warn!(req_id = %req_id, "skip-button monitor did not stop within 2s budget");
	}

	outcome
}

struct RegistrationGuard {
	ctx: Arc<WorkerContext>,
	req_id: Strng,
}

impl Drop for RegistrationGuard {
	fn drop(&mut self) {
		self.ctx.cancellation.unregister(&self.req_id);
		self.ctx.unmark_in_flight(&self.req_id);
	}
}

/// Owns the background `DisconnectMonitor::run_until` task that invokes
/// `stop_generation` the moment a disconnect is detected (§4.2.2), rather
/// than waiting for the pipeline's own checkpoints to notice. Aborted on
/// `Drop` for the non-streaming path; for streaming, ownership passes to the
/// producer task via `into_abort_handle` so it keeps running for the life of
/// the stream instead of stopping the instant `run` returns the handle.
struct DisconnectWatchdog(Option<tokio::task::AbortHandle>);

impl DisconnectWatchdog {
	fn spawn(ctx: &Arc<WorkerContext>, req_id: &Strng, monitor: Arc<DisconnectMonitor>) -> Self {
		let browser = ctx.browser.clone();
		let req_id = req_id.clone();
		let handle = tokio::spawn(async move {
			monitor
				.run_until(std::future::pending(), move || {
					let browser = browser.clone();
					let req_id = req_id.clone();
					tokio::spawn(async move {
						invoke_stop_generation(browser.as_ref(), &req_id).await;
					});
				})
				.await;
		});
		DisconnectWatchdog(Some(handle.abort_handle()))
	}

	fn into_abort_handle(mut self) -> tokio::task::AbortHandle {
		self.0.take().expect("watchdog abort handle already taken")
	}
}

impl Drop for DisconnectWatchdog {
	fn drop(&mut self) {
		if let Some(handle) = self.0.take() {
			handle.abort();
		}
	}
}

async fn invoke_stop_generation(browser: &dyn BrowserController, req_id: &Strng) {
	let always_gone = |_stage: &str| true;
	let check: CheckDisconnect = &always_gone;
	browser.stop_generation(check).await;
	debug!(req_id = %req_id, "stop_generation invoked after disconnect detected");
}

#[derive(Default, Clone)]
struct Cursors {
	reason: String,
	body: String,
}

fn deltas(cursors: &mut Cursors, frame: &crate::types::DecodedFrame) -> (String, String) {
	let d_reason = frame.reason.strip_prefix(cursors.reason.as_str()).unwrap_or(&frame.reason).to_string();
	let d_body = frame.body.strip_prefix(cursors.body.as_str()).unwrap_or(&frame.body).to_string();
	cursors.reason = frame.reason.clone();
	cursors.body = frame.body.clone();
	(d_reason, d_body)
}

/// Non-streaming path: accumulates frames synchronously until `done`, then
/// builds the single JSON body (§4.2.3 "same loop accumulates ... one JSON body").
async fn run_to_completion(
	ctx: &WorkerContext,
	req_id: &Strng,
	request: &ChatCompletionRequest,
	monitor: &Arc<DisconnectMonitor>,
	transcript: String,
	check: CheckDisconnect<'_>,
) -> PipelineResult {
	if ctx.side_channel_enabled {
		let mut idle_polls = 0u32;
		let mut any_data = false;
		let mut cursors = Cursors::default();
		loop {
			if monitor.check_once().await {
				return Err(PipelineError::ClientGone);
			}
			let frame = {
				let mut rx = ctx.side_channel_rx.lock().await;
				rx.try_recv().ok()
			};
			match frame {
				Some(SideChannelEvent::Frame(frame)) => {
					idle_polls = 0;
					any_data = true;
					let (_d_reason, _d_body) = deltas(&mut cursors, &frame);
					if frame.done {
						let id = format!("chatcmpl-{req_id}");
						let created = 0;
						return Ok(PipelineOutcome::Complete(sse::non_streaming_response(
							&id,
							created,
							&request.model,
							&frame.body,
							&frame.reason,
							&frame.function,
							&transcript,
						)));
					}
				},
				Some(SideChannelEvent::RateLimit { source, path }) => {
					debug!(req_id = %req_id, source, path, "rate-limit signal observed mid-pipeline");
				},
				None => {
					idle_polls += 1;
					if idle_polls > SIDE_CHANNEL_IDLE_CEILING {
						if !any_data {
							return Err(PipelineError::UpstreamTimeout);
						}
						warn!(req_id = %req_id, "side-channel idle past ceiling with partial data, awaiting natural close");
					}
					tokio::time::sleep(SIDE_CHANNEL_POLL_INTERVAL).await;
				},
			}
		}
	} else {
		let text = match ctx.browser.get_response(check).await {
			Ok(t) => t,
			Err(e) => return Err(classify_browser_error(&e)),
		};
		let id = format!("chatcmpl-{req_id}");
		Ok(PipelineOutcome::Complete(sse::non_streaming_response(
			&id,
			0,
			&request.model,
			&text,
			"",
			&[],
			&transcript,
		)))
	}
}

/// Streaming path: returns immediately with a `StreamHandle`; a spawned task
/// drives the side-channel (or DOM-scrape) loop and writes SSE lines into it.
async fn start_streaming_response(
	ctx: &Arc<WorkerContext>,
	req_id: &Strng,
	request: &ChatCompletionRequest,
	monitor: Arc<DisconnectMonitor>,
	transcript: String,
	watchdog: tokio::task::AbortHandle,
) -> PipelineResult {
	let (tx, rx) = mpsc::channel::<String>(64);
	let completion = Arc::new(Notify::new());
	let completion_for_task = completion.clone();
	let req_id = req_id.clone();
	let model = request.model.clone();
	let side_channel_enabled = ctx.side_channel_enabled;
	let browser = ctx.browser.clone();

	if side_channel_enabled {
		let ctx_for_task = ctx.clone();
		tokio::spawn(stream_side_channel(ctx_for_task, tx, completion_for_task, monitor, req_id, model, transcript, watchdog));
	} else {
		tokio::spawn(stream_dom_scrape(browser, tx, completion_for_task, monitor, req_id, model, transcript, watchdog));
	}

	Ok(PipelineOutcome::Stream(StreamHandle { rx, completion }))
}

async fn stream_side_channel(
	ctx: Arc<WorkerContext>,
	tx: mpsc::Sender<String>,
	completion: Arc<Notify>,
	monitor: Arc<DisconnectMonitor>,
	req_id: Strng,
	model: Strng,
	transcript: String,
	watchdog: tokio::task::AbortHandle,
) {
	let id = format!("chatcmpl-{req_id}");
	let mut cursors = Cursors::default();
	let mut idle_polls = 0u32;
	let mut any_data = false;

	loop {
		if monitor.check_once().await {
			break;
		}
		let frame = {
			let mut rx = ctx.side_channel_rx.lock().await;
			rx.try_recv().ok()
		};
		match frame {
			Some(SideChannelEvent::Frame(frame)) => {
				idle_polls = 0;
				any_data = true;
				let (d_reason, d_body) = deltas(&mut cursors, &frame);
				if !d_reason.is_empty() {
					let chunk = sse::reasoning_delta_chunk(&id, 0, &model, &d_reason);
					if tx.send(sse::format_sse_line(&chunk)).await.is_err() {
						break;
					}
				}
				if !d_body.is_empty() {
					let chunk = sse::content_delta_chunk(&id, 0, &model, &d_body);
					if tx.send(sse::format_sse_line(&chunk)).await.is_err() {
						break;
					}
				}
				if frame.done {
					if !frame.function.is_empty() {
						let chunk = sse::tool_calls_chunk(&id, 0, &model, &frame.function);
						let _ = tx.send(sse::format_sse_line(&chunk)).await;
					} else {
						let chunk = sse::stop_chunk(&id, 0, &model);
						let _ = tx.send(sse::format_sse_line(&chunk)).await;
					}
					let usage = sse::usage_chunk(&id, 0, &model, &transcript, &frame.body);
					let _ = tx.send(sse::format_sse_line(&usage)).await;
					let _ = tx.send(sse::DONE.to_string()).await;
					break;
				}
			},
			Some(SideChannelEvent::RateLimit { source, path }) => {
				debug!(req_id = %req_id, source, path, "rate-limit signal observed mid-stream");
			},
			None => {
				idle_polls += 1;
				if idle_polls > SIDE_CHANNEL_IDLE_CEILING {
					if !any_data {
						let _ = tx
							.send(sse::format_sse_line(&serde_json::json!({"done": true, "reason": "internal_timeout"})))
							.await;
						break;
					}
					warn!(req_id = %req_id, "side-channel stream idle past ceiling with partial data");
				}
				tokio::time::sleep(SIDE_CHANNEL_POLL_INTERVAL).await;
			},
		}
	}
	completion.notify_one();
	watchdog.abort();
}

async fn stream_dom_scrape(
	browser: Arc<dyn crate::browser::BrowserController>,
	tx: mpsc::Sender<String>,
	completion: Arc<Notify>,
	monitor: Arc<DisconnectMonitor>,
	req_id: Strng,
	model: Strng,
	transcript: String,
	watchdog: tokio::task::AbortHandle,
) {
	let id = format!("chatcmpl-{req_id}");
	let disconnected_flag = monitor.clone();
	let check: CheckDisconnect = &move |_s: &str| disconnected_flag.is_disconnected();
	let text = match browser.get_response(check).await {
		Ok(t) => t,
		Err(e) => {
			let err = classify_browser_error(&e);
			let _ = tx
				.send(sse::format_sse_line(&serde_json::json!({"error": {"message": err.to_string()}})))
				.await;
			completion.notify_one();
			watchdog.abort();
			return;
		},
	};

	let chars: Vec<char> = text.chars().collect();
	for window in chars.chunks(DOM_SCRAPE_CHUNK_LEN) {
		if monitor.check_once().await {
			break;
		}
		let piece: String = window.iter().collect();
		let chunk = sse::content_delta_chunk(&id, 0, &model, &piece);
		if tx.send(sse::format_sse_line(&chunk)).await.is_err() {
			break;
		}
		tokio::time::sleep(DOM_SCRAPE_CHUNK_DELAY).await;
	}
	let stop = sse::stop_chunk(&id, 0, &model);
	let _ = tx.send(sse::format_sse_line(&stop)).await;
	let usage = sse::usage_chunk(&id, 0, &model, &transcript, &text);
	let _ = tx.send(sse::format_sse_line(&usage)).await;
	let _ = tx.send(sse::DONE.to_string()).await;
	completion.notify_one();
	watchdog.abort();
}

/// Maps a browser-contract failure through the C9 classifier (§4.6): an
/// abort/disconnect is a successful pause (499, not a 500).
fn classify_browser_error(err: &crate::browser::BrowserError) -> PipelineError {
	let message = err.to_string();
	let ctx = ErrorContext::default();
	if should_treat_as_success(&message, &ctx) {
		PipelineError::ClientGone
	} else {
		PipelineError::Internal(anyhow::anyhow!(message))
	}
}

pub fn status_for(err: &PipelineError) -> StatusCode {
	err.status()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::browser::NullBrowserController;
	use crate::config::RuntimeConfig;
	use crate::types::{ChatMessage, MessageContent, Role};

	fn build_request(model: &str, stream: bool) -> ChatCompletionRequest {
		ChatCompletionRequest {
			model: Strng::from(model),
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

	fn never_disconnected() -> (Arc<DisconnectMonitor>, mpsc::Sender<crate::disconnect::TransportSignal>) {
		DisconnectMonitor::new(Strng::from("r1"), Arc::new(crate::cancel::CancellationRegistry::new()), || false, || false)
	}

	#[tokio::test]
	async fn non_streaming_dom_scrape_completes() {
		let ctx = WorkerContext::new_with_side_channel(
			Arc::new(NullBrowserController::with_response("hello world")),
			Arc::new(RuntimeConfig::default()),
			false,
		);
		let (monitor, _tx) = never_disconnected();
		let input = PipelineInput {
			req_id: Strng::from("r1"),
			request: Arc::new(build_request("studio-default", false)),
			monitor,
		};
		let result = run(&ctx, input).await.unwrap();
		match result {
			PipelineOutcome::Complete(v) => {
				assert_eq!(v["choices"][0]["message"]["content"], "hello world");
			},
			_ => panic!("expected Complete"),
		}
	}

	#[tokio::test]
	async fn streaming_dom_scrape_emits_done_sentinel() {
		let ctx = WorkerContext::new_with_side_channel(
			Arc::new(NullBrowserController::with_response("abcdefghij")),
			Arc::new(RuntimeConfig::default()),
			false,
		);
		let (monitor, _tx) = never_disconnected();
		let input = PipelineInput {
			req_id: Strng::from("r2"),
			request: Arc::new(build_request("studio-default", true)),
			monitor,
		};
		let result = run(&ctx, input).await.unwrap();
		match result {
			PipelineOutcome::Stream(mut handle) => {
				let mut lines = Vec::new();
				while let Some(line) = handle.rx.recv().await {
					lines.push(line);
				}
				assert_eq!(lines.last().unwrap(), sse::DONE);
			},
			_ => panic!("expected Stream"),
		}
	}

	#[tokio::test]
	async fn already_disconnected_client_fails_fast() {
		let ctx = WorkerContext::new_with_side_channel(Arc::new(NullBrowserController::default()), Arc::new(RuntimeConfig::default()), false);
		let (monitor, _tx) = DisconnectMonitor::new(Strng::from("r3"), Arc::new(crate::cancel::CancellationRegistry::new()), || true, || false);
		let input = PipelineInput {
			req_id: Strng::from("r3"),
			request: Arc::new(build_request("studio-default", false)),
			monitor,
		};
		let err = run(&ctx, input).await.unwrap_err();
		assert!(matches!(err, PipelineError::ClientGone));
	}

	/// A `BrowserController` that delegates everything to a `NullBrowserController`
	/// except `get_response` (delayed, to give the watchdog room to fire) and
	/// `stop_generation` (counted instead of a no-op).
	struct SlowTrackingBrowser {
		inner: NullBrowserController,
		stop_calls: Arc<std::sync::atomic::AtomicUsize>,
	}

	impl BrowserController for SlowTrackingBrowser {
		fn clear_chat_history<'a>(
			&'a self,
			check: crate::browser::CheckDisconnect<'a>,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::browser::BrowserError>> + Send + 'a>> {
			self.inner.clear_chat_history(check)
		}

		fn set_system_instructions<'a>(
			&'a self,
			text: &'a str,
			check: crate::browser::CheckDisconnect<'a>,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::browser::BrowserError>> + Send + 'a>> {
			self.inner.set_system_instructions(text, check)
		}

		fn adjust_parameters<'a>(
			&'a self,
			params: &'a crate::browser::AdjustParams,
			cache: &'a mut crate::types::ParamCache,
			model_id: &'a Strng,
			check: crate::browser::CheckDisconnect<'a>,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::browser::BrowserError>> + Send + 'a>> {
			self.inner.adjust_parameters(params, cache, model_id, check)
		}

		fn submit_prompt<'a>(
			&'a self,
			prompt: &'a str,
			images: &'a [crate::browser::PreparedImage],
			check: crate::browser::CheckDisconnect<'a>,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::browser::BrowserError>> + Send + 'a>> {
			self.inner.submit_prompt(prompt, images, check)
		}

		fn get_response<'a>(
			&'a self,
			check: crate::browser::CheckDisconnect<'a>,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, crate::browser::BrowserError>> + Send + 'a>> {
			Box::pin(async move {
				tokio::time::sleep(Duration::from_millis(200)).await;
				self.inner.get_response(check).await
			})
		}

		fn stop_generation<'a>(&'a self, _check: crate::browser::CheckDisconnect<'a>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
			let stop_calls = self.stop_calls.clone();
			Box::pin(async move {
				stop_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
			})
		}

		fn continuously_handle_skip_button<'a>(
			&'a self,
			stop: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>>,
			check: crate::browser::CheckDisconnect<'a>,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
			self.inner.continuously_handle_skip_button(stop, check)
		}

		fn switch_model<'a>(
			&'a self,
			model_id: &'a Strng,
			check: crate::browser::CheckDisconnect<'a>,
		) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), crate::browser::BrowserError>> + Send + 'a>> {
			self.inner.switch_model(model_id, check)
		}

		fn is_page_ready(&self) -> bool {
			self.inner.is_page_ready()
		}
	}

	#[tokio::test]
	async fn disconnect_watchdog_invokes_stop_generation_on_disconnect() {
		use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

		let stop_calls = Arc::new(AtomicUsize::new(0));
		let browser = Arc::new(SlowTrackingBrowser {
			inner: NullBrowserController::with_response("slow reply"),
			stop_calls: stop_calls.clone(),
		});
		let ctx = WorkerContext::new_with_side_channel(browser, Arc::new(RuntimeConfig::default()), false);

		let gone = Arc::new(AtomicBool::new(false));
		let gone_for_probe = gone.clone();
		let (monitor, _tx) = DisconnectMonitor::new(Strng::from("r5"), Arc::new(crate::cancel::CancellationRegistry::new()), move || gone_for_probe.load(Ordering::SeqCst), || false);

		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(20)).await;
			gone.store(true, Ordering::SeqCst);
		});

		let input = PipelineInput {
			req_id: Strng::from("r5"),
			request: Arc::new(build_request("studio-default", false)),
			monitor,
		};
		let _ = tokio::time::timeout(Duration::from_secs(2), run(&ctx, input)).await;

		assert!(stop_calls.load(Ordering::SeqCst) > 0);
	}

	#[tokio::test]
	async fn unready_page_fails_with_service_unavailable() {
		let browser = NullBrowserController::default();
		browser.page_ready.store(false, std::sync::atomic::Ordering::SeqCst);
		let ctx = WorkerContext::new_with_side_channel(Arc::new(browser), Arc::new(RuntimeConfig::default()), false);
		let (monitor, _tx) = never_disconnected();
		let input = PipelineInput {
			req_id: Strng::from("r4"),
			request: Arc::new(build_request("studio-default", false)),
			monitor,
		};
		let err = run(&ctx, input).await.unwrap_err();
		assert!(matches!(err, PipelineError::ServiceUnavailable { retry_after_secs: 30 }));
	}
}
