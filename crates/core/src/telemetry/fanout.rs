//! C14 Log Fan-out: broadcasts formatted log records to any number of live
//! subscribers (e.g. an admin-UI log tail) without monkey-patching stdout.
//!
//! A `tracing_subscriber::Layer` that formats each event once and broadcasts
//! it over a `tokio::sync::broadcast` channel; no CEL field filtering, just a
//! plain broadcast of one formatted line per event.

use std::fmt::Write as _;

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Cloneable handle to the fan-out. `subscribe()` yields a fresh receiver;
/// slow/disconnected subscribers never block log producers (lagged messages are dropped).
#[derive(Clone)]
pub struct LogFanout {
	tx: broadcast::Sender<String>,
}

impl LogFanout {
	pub fn new(capacity: usize) -> Self {
		let (tx, _) = broadcast::channel(capacity);
		LogFanout { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<String> {
		self.tx.subscribe()
	}

	pub fn layer(&self) -> FanoutLayer {
		FanoutLayer { tx: self.tx.clone() }
	}
}

pub struct FanoutLayer {
	tx: broadcast::Sender<String>,
}

struct MessageVisitor {
	message: String,
	fields: String,
}

impl Visit for MessageVisitor {
	fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
		if field.name() == "message" {
			let _ = write!(self.message, "{value:?}");
		} else {
			let _ = write!(self.fields, " {}={:?}", field.name(), value);
		}
	}
}

impl<S: Subscriber> Layer<S> for FanoutLayer {
	fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
		// Cheap short-circuit: no subscribers, don't bother formatting.
		if self.tx.receiver_count() == 0 {
			return;
		}
		let mut visitor = MessageVisitor {
			message: String::new(),
			fields: String::new(),
		};
		event.record(&mut visitor);
		let level = level_str(*event.metadata().level());
		let target = event.metadata().target();
		let line = format!("{level} {target}: {}{}", visitor.message, visitor.fields);
		// Best-effort: a full channel (no receivers) just means the log isn't live-tailed.
		let _ = self.tx.send(line);
	}
}

fn level_str(level: Level) -> &'static str {
	match level {
		Level::TRACE => "TRACE",
		Level::DEBUG => "DEBUG",
		Level::INFO => "INFO",
		Level::WARN => "WARN",
		Level::ERROR => "ERROR",
	}
}
