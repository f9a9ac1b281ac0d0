//! C6 Browser Controller: the opaque façade the pipeline drives. §4.5 fixes
//! only the contract (inputs, postcondition, failure mode); driving an actual
//! browser is out of scope here (§1), so this module defines the trait and a
//! `NullBrowserController` test double that satisfies it deterministically.

use std::future::Future;
use std::pin::Pin;

use crate::types::{ChatCompletionRequest, ParamCache, Strng};

pub type CheckDisconnect<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
	#[error("clear_chat_history failed after {attempts} attempts: {reason}")]
	ClearHistoryFailed { attempts: u32, reason: String },
	#[error("selector interaction failed: {0}")]
	SelectorFailure(String),
	#[error("submit verification failed: {0}")]
	SubmitVerifyFailed(String),
	#[error("response element did not attach within the timeout")]
	ResponseAttachTimeout,
	#[error("response text did not stabilize across consecutive snapshots")]
	ResponseStabilityTimeout,
	#[error("client disconnected mid-operation")]
	ClientDisconnected,
}

/// One already-uploaded image reference, in message order (§4.2.1 step 8).
#[derive(Debug, Clone)]
pub struct PreparedImage {
	pub filename: String,
	pub data: Vec<u8>,
}

/// Merged parameter set C7 hands to `adjust_parameters` (§4.2.1 step 9).
#[derive(Debug, Clone)]
pub struct AdjustParams {
	pub temperature: f32,
	pub max_output_tokens: u32,
	pub top_p: f32,
	pub stop_sequences: Option<Vec<String>>,
	pub tools_panel_expanded: bool,
	pub url_context: bool,
	pub thinking_budget: Option<u32>,
	pub google_search: bool,
}

/// The opaque façade (§4.5). Every method takes a `check_disconnect` callback
/// so long-running interactions can bail out early.
pub trait BrowserController: Send + Sync {
	fn clear_chat_history<'a>(&'a self, check: CheckDisconnect<'a>) -> BoxFuture<'a, Result<(), BrowserError>>;

	fn set_system_instructions<'a>(
		&'a self,
		text: &'a str,
		check: CheckDisconnect<'a>,
	) -> BoxFuture<'a, Result<(), BrowserError>>;

	fn adjust_parameters<'a>(
		&'a self,
		params: &'a AdjustParams,
		cache: &'a mut ParamCache,
		model_id: &'a Strng,
		check: CheckDisconnect<'a>,
	) -> BoxFuture<'a, Result<(), BrowserError>>;

	fn submit_prompt<'a>(
		&'a self,
		prompt: &'a str,
		images: &'a [PreparedImage],
		check: CheckDisconnect<'a>,
	) -> BoxFuture<'a, Result<(), BrowserError>>;

	fn get_response<'a>(&'a self, check: CheckDisconnect<'a>) -> BoxFuture<'a, Result<String, BrowserError>>;

	fn stop_generation<'a>(&'a self, check: CheckDisconnect<'a>) -> BoxFuture<'a, ()>;

	fn continuously_handle_skip_button<'a>(
		&'a self,
		stop: BoxFuture<'a, ()>,
		check: CheckDisconnect<'a>,
	) -> BoxFuture<'a, ()>;

	/// Switches the live page model; used by C7's model-resolution phase
	/// (§4.2.1 step 6). Not itemized in the §4.5 table but implied by
	/// "page parameters match" needing a current model to adjust against.
	fn switch_model<'a>(&'a self, model_id: &'a Strng, check: CheckDisconnect<'a>) -> BoxFuture<'a, Result<(), BrowserError>>;

	fn is_page_ready(&self) -> bool;
}

/// Deterministic double satisfying the §4.5 contract without a live browser:
/// `submit_prompt` records the request, `get_response` echoes a canned reply
/// built from the last prepared prompt.
pub struct NullBrowserController {
	pub canned_response: String,
	pub page_ready: std::sync::atomic::AtomicBool,
}

impl Default for NullBrowserController {
	fn default() -> Self {
		NullBrowserController {
			canned_response: "ok".to_string(),
			page_ready: std::sync::atomic::AtomicBool::new(true),
		}
	}
}

impl NullBrowserController {
	pub fn with_response(text: impl Into<String>) -> Self {
		NullBrowserController {
			canned_response: text.into(),
			..Default::default()
		}
	}
}

impl BrowserController for NullBrowserController {
	fn clear_chat_history<'a>(&'a self, _check: CheckDisconnect<'a>) -> BoxFuture<'a, Result<(), BrowserError>> {
		Box::pin(async { Ok(()) })
	}

	fn set_system_instructions<'a>(
		&'a self,
		_text: &'a str,
		_check: CheckDisconnect<'a>,
	) -> BoxFuture<'a, Result<(), BrowserError>> {
		Box::pin(async { Ok(()) })
	}

	fn adjust_parameters<'a>(
		&'a self,
		params: &'a AdjustParams,
		cache: &'a mut ParamCache,
		model_id: &'a Strng,
		_check: CheckDisconnect<'a>,
	) -> BoxFuture<'a, Result<(), BrowserError>> {
		Box::pin(async move {
			cache.last_model_id = Some(model_id.clone());
			cache.temperature = Some(params.temperature);
			cache.max_output_tokens = Some(params.max_output_tokens);
			cache.top_p = Some(params.top_p);
			cache.stop_sequences = params.stop_sequences.clone();
			Ok(())
		})
	}

	fn submit_prompt<'a>(
		&'a self,
		_prompt: &'a str,
		_images: &'a [PreparedImage],
		_check: CheckDisconnect<'a>,
	) -> BoxFuture<'a, Result<(), BrowserError>> {
		Box::pin(async { Ok(()) })
	}

	fn get_response<'a>(&'a self, _check: CheckDisconnect<'a>) -> BoxFuture<'a, Result<String, BrowserError>> {
		Box::pin(async move { Ok(self.canned_response.clone()) })
	}

	fn stop_generation<'a>(&'a self, _check: CheckDisconnect<'a>) -> BoxFuture<'a, ()> {
		Box::pin(async {})
	}

	fn continuously_handle_skip_button<'a>(&'a self, stop: BoxFuture<'a, ()>, _check: CheckDisconnect<'a>) -> BoxFuture<'a, ()> {
		Box::pin(async move {
			stop.await;
		})
	}

	fn switch_model<'a>(&'a self, _model_id: &'a Strng, _check: CheckDisconnect<'a>) -> BoxFuture<'a, Result<(), BrowserError>> {
		Box::pin(async { Ok(()) })
	}

	fn is_page_ready(&self) -> bool {
		self.page_ready.load(std::sync::atomic::Ordering::SeqCst)
	}
}

/// Separates system messages from the transcript and renders the remainder
/// as role-prefixed lines, inlining image tokens at the end of their
/// bearing message (§4.2.1 step 8).
pub fn prepare_prompt(req: &ChatCompletionRequest) -> (Option<String>, String, Vec<String>) {
	let mut system_text = Vec::new();
	let mut lines = Vec::new();
	let mut image_urls = Vec::new();

	for message in &req.messages {
		use crate::types::{ContentPart, MessageContent, Role};
		let mut text_parts = Vec::new();
		let mut message_images = Vec::new();
		match &message.content {
			MessageContent::Text(t) => text_parts.push(t.clone()),
			MessageContent::Parts(parts) => {
				for part in parts {
					match part {
						ContentPart::Text { text } => text_parts.push(text.clone()),
						ContentPart::Image { image_url } => message_images.push(image_url.url.clone()),
					}
				}
			},
		}
		let body = text_parts.join("\n");
		match message.role {
			Role::System => system_text.push(body),
			Role::User => {
				let mut line = format!("用户: {body}");
				for i in 0..message_images.len() {
					line.push_str(&format!(" [image_{}]", image_urls.len() + i));
				}
				lines.push(line);
				image_urls.extend(message_images);
			},
			Role::Assistant => lines.push(format!("助手: {body}")),
			Role::Tool => lines.push(format!("助手: {body}")),
		}
	}

	let system = if system_text.is_empty() {
		None
	} else {
		Some(system_text.join("\n\n"))
	};
	(system, lines.join("\n"), image_urls)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{ChatMessage, MessageContent, Role};

	fn always_connected(_stage: &str) -> bool {
		false
	}

	#[tokio::test]
	async fn null_controller_echoes_canned_response() {
		let browser = NullBrowserController::with_response("hello there");
		let check: CheckDisconnect = &always_connected;
		let text = browser.get_response(check).await.unwrap();
		assert_eq!(text, "hello there");
	}

	#[tokio::test]
	async fn null_controller_adjust_parameters_updates_cache() {
		let browser = NullBrowserController::default();
		let mut cache = ParamCache::default();
		let model = Strng::from("m1");
		let params = AdjustParams {
			temperature: 0.7,
			max_output_tokens: 2048,
			top_p: 0.9,
			stop_sequences: None,
			tools_panel_expanded: false,
			url_context: false,
			thinking_budget: None,
			google_search: false,
		};
		let check: CheckDisconnect = &always_connected;
		browser.adjust_parameters(&params, &mut cache, &model, check).await.unwrap();
		assert_eq!(cache.temperature, Some(0.7));
		assert_eq!(cache.last_model_id, Some(model));
	}

	#[test]
	fn prepare_prompt_splits_system_and_prefixes_roles() {
		let req = ChatCompletionRequest {
			model: Strng::from("m"),
			stream: false,
			temperature: 1.0,
			max_output_tokens: 100,
			top_p: 0.95,
			stop: None,
			reasoning_effort: None,
			tools: None,
			messages: vec![
				ChatMessage {
					role: Role::System,
					content: MessageContent::Text("be nice".to_string()),
				},
				ChatMessage {
					role: Role::User,
					content: MessageContent::Text("hi".to_string()),
				},
				ChatMessage {
					role: Role::Assistant,
					content: MessageContent::Text("hello".to_string()),
				},
			],
		};
		let (system, transcript, images) = prepare_prompt(&req);
		assert_eq!(system.as_deref(), Some("be nice"));
		assert!(transcript.contains("用户: hi"));
		assert!(transcript.contains("助手: hello"));
		assert!(images.is_empty());
	}
}
