//! C5 Disconnect Detector: four independent "client is gone" signals polled
//! on a 50ms cadence with a heartbeat every 20 polls (§4.2.2). Axum doesn't
//! expose ASGI-style typed disconnect messages, so the channel signal is
//! represented as a small enum the HTTP layer can push onto when it notices
//! one (body abort keywords, a `http.disconnect`-equivalent hangup); the
//! other three signals (transport probe, transport-closing flags, C13) are
//! polled directly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cancel::CancellationRegistry;
use crate::types::Strng;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const HEARTBEAT_EVERY_N_POLLS: u32 = 20;

/// Heuristic body-content check mirroring the ASGI "body contains
/// abort|cancel|stop" disconnect signal, gated in its own module since it is
/// a narrow textual heuristic rather than a structural transport fact (§9).
pub mod cherry_studio {
	const BODY_ABORT_KEYWORDS: &[&str] = &["abort", "cancel", "stop"];

	pub fn body_signals_disconnect(body: &str) -> bool {
		let lower = body.to_lowercase();
		BODY_ABORT_KEYWORDS.iter().any(|kw| lower.contains(kw))
	}
}

#[derive(Debug, Clone)]
pub enum TransportSignal {
	HttpDisconnect,
	WebsocketDisconnect,
	WebsocketClose,
	EmptyBodyMoreFalse,
	BodyAbortKeyword,
}

impl TransportSignal {
	pub fn means_gone(&self) -> bool {
		true
	}
}

pub struct DisconnectMonitor {
	req_id: Strng,
	cancellation: Arc<CancellationRegistry>,
	transport_probe: Box<dyn Fn() -> bool + Send + Sync>,
	transport_closing: Box<dyn Fn() -> bool + Send + Sync>,
	signal_rx: tokio::sync::Mutex<mpsc::Receiver<TransportSignal>>,
	disconnected: Arc<AtomicBool>,
}

impl DisconnectMonitor {
	pub fn new(
		req_id: Strng,
		cancellation: Arc<CancellationRegistry>,
		transport_probe: impl Fn() -> bool + Send + Sync + 'static,
		transport_closing: impl Fn() -> bool + Send + Sync + 'static,
	) -> (Arc<Self>, mpsc::Sender<TransportSignal>) {
		let (tx, rx) = mpsc::channel(8);
		let monitor = Arc::new(DisconnectMonitor {
			req_id,
			cancellation,
			transport_probe: Box::new(transport_probe),
			transport_closing: Box::new(transport_closing),
			signal_rx: tokio::sync::Mutex::new(rx),
			disconnected: Arc::new(AtomicBool::new(false)),
		});
		(monitor, tx)
	}

	pub fn is_disconnected(&self) -> bool {
		self.disconnected.load(Ordering::SeqCst)
	}

	/// Probes all four signals once, synchronously. Used both by the
	/// background poll loop and by ad-hoc checkpoints inside the pipeline
	/// (§4.2.1 step 2, step 9's per-stage checks).
	pub async fn check_once(&self) -> bool {
		if self.disconnected.load(Ordering::SeqCst) {
			return true;
		}
		if (self.transport_probe)() {
			self.mark_disconnected("transport probe");
			return true;
		}
		if (self.transport_closing)() {
			self.mark_disconnected("transport closing flag");
			return true;
		}
		if self.cancellation.is_cancelled(&self.req_id) {
			self.mark_disconnected("cancellation registry");
			return true;
		}
		let mut rx = self.signal_rx.lock().await;
		if let Ok(signal) = rx.try_recv() {
			self.mark_disconnected(&format!("transport signal {signal:?}"));
			return true;
		}
		false
	}

	fn mark_disconnected(&self, why: &str) {
		if !self.disconnected.swap(true, Ordering::SeqCst) {
			debug!(req_id = %self.req_id, why, "client disconnect detected");
		}
	}

	/// Runs the 50ms poll loop until either disconnect is detected (invoking
	/// `on_detect` once) or `stop` resolves, whichever comes first.
	pub async fn run_until(self: Arc<Self>, stop: impl std::future::Future<Output = ()>, on_detect: impl FnOnce() + Send + 'static) {
		let mut polls: u32 = 0;
		let poll_loop = async {
			loop {
				if self.check_once().await {
					on_detect();
					break;
				}
				polls += 1;
				if polls % HEARTBEAT_EVERY_N_POLLS == 0 {
					debug!(req_id = %self.req_id, polls, "disconnect monitor heartbeat");
				}
				tokio::time::sleep(POLL_INTERVAL).await;
			}
		};
		tokio::select! {
			_ = poll_loop => {},
			_ = stop => {
				debug!(req_id = %self.req_id, "disconnect monitor stopped");
			},
		}
	}
}

/// Enhanced 300ms-poll monitor used by C8 around the post-dispatch stream
/// wait (§4.3): same transport probe, coarser cadence, sets `on_early` once.
pub async fn enhanced_poll_until<F>(probe: F, mut should_stop: impl FnMut() -> bool, on_early: impl FnOnce())
where
	F: Fn() -> bool,
{
	loop {
		if should_stop() {
			return;
		}
		if probe() {
			on_early();
			return;
		}
		tokio::time::sleep(Duration::from_millis(300)).await;
	}
}

pub fn log_stop_generation_error(req_id: &Strng, err: &anyhow::Error) {
	warn!(%req_id, error = %err, "stop_generation failed during disconnect cleanup");
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[tokio::test]
	async fn check_once_detects_transport_probe() {
		let cancellation = Arc::new(CancellationRegistry::new());
		let (monitor, _tx) = DisconnectMonitor::new(Strng::from("r1"), cancellation, || true, || false);
		assert!(monitor.check_once().await);
		assert!(monitor.is_disconnected());
	}

	#[tokio::test]
	async fn check_once_detects_cancellation_registry() {
		let cancellation = Arc::new(CancellationRegistry::new());
		let id = Strng::from("r2");
		cancellation.register(id.clone());
		cancellation.cancel(&id);
		let (monitor, _tx) = DisconnectMonitor::new(id, cancellation, || false, || false);
		assert!(monitor.check_once().await);
	}

	#[tokio::test]
	async fn check_once_detects_pushed_transport_signal() {
		let cancellation = Arc::new(CancellationRegistry::new());
		let (monitor, tx) = DisconnectMonitor::new(Strng::from("r3"), cancellation, || false, || false);
		tx.send(TransportSignal::HttpDisconnect).await.unwrap();
		assert!(monitor.check_once().await);
	}

	#[tokio::test]
	async fn connected_client_never_trips() {
		let cancellation = Arc::new(CancellationRegistry::new());
		let (monitor, _tx) = DisconnectMonitor::new(Strng::from("r4"), cancellation, || false, || false);
		assert!(!monitor.check_once().await);
	}

	#[test]
	fn cherry_studio_body_keyword_detection() {
		assert!(cherry_studio::body_signals_disconnect("please abort this"));
		assert!(cherry_studio::body_signals_disconnect("STOP now"));
		assert!(!cherry_studio::body_signals_disconnect("continue normally"));
	}

	#[tokio::test]
	async fn run_until_invokes_on_detect_once() {
		let cancellation = Arc::new(CancellationRegistry::new());
		let (monitor, _tx) = DisconnectMonitor::new(Strng::from("r5"), cancellation, || true, || false);
		let calls = Arc::new(AtomicUsize::new(0));
		let calls2 = calls.clone();
		monitor
			.run_until(std::future::pending(), move || {
				calls2.fetch_add(1, Ordering::SeqCst);
			})
			.await;
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}
}
