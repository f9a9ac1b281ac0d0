//! C12 Rate-Limit Registry: a `(worker, model) -> expiry` quarantine map with
//! lazy, read-time eviction (§4.4).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use crate::types::Strng;

pub struct RateLimitRegistry {
	recovery: Duration,
	entries: Mutex<HashMap<(Strng, Strng), SystemTime>>,
}

impl RateLimitRegistry {
	pub fn new(recovery_hours: u64) -> Self {
		RateLimitRegistry {
			recovery: Duration::from_secs(recovery_hours.max(1) * 3600),
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Idempotent: re-marking an already-quarantined `(worker, model)` pair
	/// just refreshes its expiry.
	pub fn mark(&self, worker: Strng, model: Strng) {
		let expiry = SystemTime::now() + self.recovery;
		self.entries.lock().expect("rate-limit registry poisoned").insert((worker, model), expiry);
	}

	/// Evicts the pair if it has lazily expired and returns whether it is
	/// still quarantined.
	pub fn is_rate_limited(&self, worker: &Strng, model: &Strng) -> bool {
		let mut entries = self.entries.lock().expect("rate-limit registry poisoned");
		let key = (worker.clone(), model.clone());
		match entries.get(&key) {
			Some(expiry) if *expiry > SystemTime::now() => true,
			Some(_) => {
				entries.remove(&key);
				false
			},
			None => false,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mark_then_check_is_rate_limited() {
		let reg = RateLimitRegistry::new(6);
		let worker = Strng::from("w1");
		let model = Strng::from("m1");
		assert!(!reg.is_rate_limited(&worker, &model));
		reg.mark(worker.clone(), model.clone());
		assert!(reg.is_rate_limited(&worker, &model));
	}

	#[test]
	fn expired_entry_is_lazily_evicted() {
		let reg = RateLimitRegistry::new(6);
		let worker = Strng::from("w1");
		let model = Strng::from("m1");
		reg.entries
			.lock()
			.unwrap()
			.insert((worker.clone(), model.clone()), SystemTime::now() - Duration::from_secs(1));
		assert!(!reg.is_rate_limited(&worker, &model));
		assert!(reg.entries.lock().unwrap().is_empty());
	}
}
