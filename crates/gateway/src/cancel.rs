//! C13 Cancellation Registry: a process-wide set of in-flight request IDs
//! that an external `POST /v1/cancel/{req_id}` can mark cancelled (§3, §4.2.2).

use std::collections::HashSet;
use std::sync::Mutex;

use crate::types::Strng;

#[derive(Default)]
pub struct CancellationRegistry {
	inner: Mutex<HashSet<Strng>>,
}

impl CancellationRegistry {
	pub fn new() -> Self {
		CancellationRegistry::default()
	}

	/// Called when a request is dequeued and begins running. A no-op: a
	/// fresh req_id can't already be in the set, and a request cancelled
	/// while still queued must stay cancelled once it's dequeued, not have
	/// its mark wiped here.
	pub fn register(&self, _req_id: Strng) {}

	pub fn unregister(&self, req_id: &Strng) {
		self.inner.lock().expect("cancellation registry poisoned").remove(req_id);
	}

	/// Marks `req_id` cancelled; returns whether it was actually registered
	/// as in-flight. A cancel for an unknown or already-finished id is a
	/// harmless no-op from the caller's point of view.
	pub fn cancel(&self, req_id: &Strng) -> bool {
		self.inner.lock().expect("cancellation registry poisoned").insert(req_id.clone())
	}

	pub fn is_cancelled(&self, req_id: &Strng) -> bool {
		self.inner.lock().expect("cancellation registry poisoned").contains(req_id)
	}
}
