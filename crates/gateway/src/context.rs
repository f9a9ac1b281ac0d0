//! §9 redesign: the source's ad-hoc process-global singletons
//! (`server.page_instance`, `server.current_http_requests`, the param cache,
//! the cancellation registry) collapse into one explicit value passed by
//! reference. Every lock named in §5 "Shared mutable state" lives here.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use crate::browser::BrowserController;
use crate::cancel::CancellationRegistry;
use crate::config::RuntimeConfig;
use crate::types::{ParamCache, SideChannelEvent, Strng};

/// One worker process's state: one browser session, one MITM side-channel,
/// one processing lock. Everything C7/C8 touch hangs off this.
pub struct WorkerContext {
	pub browser: Arc<dyn BrowserController>,
	pub cancellation: Arc<CancellationRegistry>,
	pub config: Arc<RuntimeConfig>,
	/// `stream_port != 0` (§4.2.3): when false, the pipeline falls back to
	/// DOM-scrape mode instead of draining the MITM side-channel.
	pub side_channel_enabled: bool,

	/// `processing_lock` (§5): held across the full C7 invocation, making
	/// per-worker requests serial.
	pub processing_lock: Mutex<()>,
	/// `model_switching_lock` (§5): short critical section around C6's model switch.
	pub model_switching_lock: Mutex<()>,
	/// `params_cache_lock` (§5): held across each parameter adjustment.
	pub params_cache: Mutex<ParamCache>,
	/// The model currently believed to be live on the page; rolled back on a
	/// failed switch (§4.2.1 step 6).
	pub current_model_id: Mutex<Option<Strng>>,

	/// `current_http_requests` (§5): in this port, just the set of req_ids
	/// with a live pipeline invocation, consulted by `/v1/cancel`.
	pub in_flight: std::sync::Mutex<HashMap<Strng, ()>>,

	/// C4's side-channel queue (§4.1, §4.2.3). Single-consumer: only ever
	/// drained while `processing_lock` is held, so one `Mutex<Receiver>` is
	/// enough even though multiple tasks can reach it.
	pub side_channel_rx: Mutex<mpsc::Receiver<SideChannelEvent>>,
	pub side_channel_tx: mpsc::Sender<SideChannelEvent>,

	pub request_count: std::sync::atomic::AtomicU64,
}

impl WorkerContext {
	pub fn new(browser: Arc<dyn BrowserController>, config: Arc<RuntimeConfig>) -> Arc<Self> {
		Self::new_with_side_channel(browser, config, true)
	}

	pub fn new_with_side_channel(browser: Arc<dyn BrowserController>, config: Arc<RuntimeConfig>, side_channel_enabled: bool) -> Arc<Self> {
		let (tx, rx) = mpsc::channel(256);
		Arc::new(WorkerContext {
			browser,
			cancellation: Arc::new(CancellationRegistry::new()),
			config,
			side_channel_enabled,
			processing_lock: Mutex::new(()),
			model_switching_lock: Mutex::new(()),
			params_cache: Mutex::new(ParamCache::default()),
			current_model_id: Mutex::new(None),
			in_flight: std::sync::Mutex::new(HashMap::new()),
			side_channel_rx: Mutex::new(rx),
			side_channel_tx: tx,
			request_count: std::sync::atomic::AtomicU64::new(0),
		})
	}

	pub fn mark_in_flight(&self, req_id: Strng) {
		self.in_flight.lock().expect("in_flight poisoned").insert(req_id, ());
	}

	pub fn unmark_in_flight(&self, req_id: &Strng) {
		self.in_flight.lock().expect("in_flight poisoned").remove(req_id);
	}

	pub fn is_in_flight(&self, req_id: &Strng) -> bool {
		self.in_flight.lock().expect("in_flight poisoned").contains_key(req_id)
	}

	/// Drains whatever is left on the side-channel without blocking, per §4.3
	/// "always drain the MITM side-channel queue after each request to
	/// prevent cross-request bleed".
	pub async fn drain_side_channel(&self) {
		let mut rx = self.side_channel_rx.lock().await;
		while rx.try_recv().is_ok() {}
	}
}
