//! C10 Worker-Process Pool + C12 Rate-Limit Registry (§4.4): starts/stops
//! worker child processes, persists `workers.json`, and answers the
//! gateway's round-robin `get_worker_for_model` queries. Grounded in the
//! original `api/worker_manager.py` process-supervision shape.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Json;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::ratelimit::RateLimitRegistry;
use crate::types::{Strng, Worker, WorkerRecord, WorkerStatus, WorkersFile};

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct WorkerPool {
	workers: Mutex<HashMap<Strng, Worker>>,
	rate_limits: Arc<RateLimitRegistry>,
	workers_json_path: PathBuf,
	next_index: AtomicUsize,
	worker_binary: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
	pub id: String,
	pub port: u16,
	pub status: WorkerStatus,
}

impl WorkerPool {
	pub fn new(workers_json_path: PathBuf, worker_binary: PathBuf, recovery_hours: u64) -> Arc<Self> {
		Arc::new(WorkerPool {
			workers: Mutex::new(HashMap::new()),
			rate_limits: Arc::new(RateLimitRegistry::new(recovery_hours)),
			workers_json_path,
			next_index: AtomicUsize::new(0),
			worker_binary,
		})
	}

	/// Loads `workers.json` (§6 schema) if present; a missing file means an
	/// empty pool, not an error.
	pub async fn load_from_disk(&self) -> anyhow::Result<()> {
		if !self.workers_json_path.exists() {
			return Ok(());
		}
		let contents = tokio::fs::read_to_string(&self.workers_json_path).await?;
		let file: WorkersFile = serde_json::from_str(&contents)?;
		let mut workers = self.workers.lock().await;
		for record in file.workers {
			workers.insert(
				Strng::from(record.id.as_str()),
				Worker {
					id: Strng::from(record.id.as_str()),
					profile_name: Strng::from(record.profile.as_str()),
					profile_path: PathBuf::from(&record.profile),
					worker_port: record.port,
					browser_debug_port: record.camoufox_port,
					child: None,
					status: WorkerStatus::Stopped,
					request_count: 0,
				},
			);
		}
		Ok(())
	}

	async fn persist_to_disk(&self) -> anyhow::Result<()> {
		let workers = self.workers.lock().await;
		let records: Vec<WorkerRecord> = workers
			.values()
			.map(|w| WorkerRecord {
				id: w.id.to_string(),
				profile: w.profile_name.to_string(),
				port: w.worker_port,
				camoufox_port: w.browser_debug_port,
			})
			.collect();
		drop(workers);
		let file = WorkersFile {
			workers: records,
			settings: crate::types::WorkerSettings::default(),
		};
		let contents = serde_json::to_string_pretty(&file)?;
		if let Some(parent) = self.workers_json_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(&self.workers_json_path, contents).await?;
		Ok(())
	}

	pub async fn register(&self, id: Strng, profile_name: Strng, profile_path: PathBuf, worker_port: u16, browser_debug_port: u16) {
		let mut workers = self.workers.lock().await;
		workers.insert(
			id.clone(),
			Worker {
				id,
				profile_name,
				profile_path,
				worker_port,
				browser_debug_port,
				child: None,
				status: WorkerStatus::Stopped,
				request_count: 0,
			},
		);
		drop(workers);
		if let Err(e) = self.persist_to_disk().await {
			warn!(error = %e, "failed to persist workers.json after register");
		}
	}

	/// Spawns the worker subcommand as a child process carrying its ports and
	/// auth-profile path on the command line (§6 CLI surface).
	pub async fn start(&self, id: &Strng) -> anyhow::Result<()> {
		let mut workers = self.workers.lock().await;
		let worker = workers.get_mut(id).ok_or_else(|| anyhow::anyhow!("unknown worker {id}"))?;
		if matches!(worker.status, WorkerStatus::Running) {
			return Ok(());
		}
		let mut cmd = Command::new(&self.worker_binary);
		cmd.arg("worker")
			.arg("--server-port")
			.arg(format!("127.0.0.1:{}", worker.worker_port))
			.arg("--camoufox-debug-port")
			.arg(worker.browser_debug_port.to_string())
			.arg("--active-auth-json")
			.arg(&worker.profile_path)
			.kill_on_drop(true);
		let child = cmd.spawn()?;
		worker.child = Some(child);
		worker.status = WorkerStatus::Running;
		info!(%id, port = worker.worker_port, "worker started");
		drop(workers);
		self.persist_to_disk().await.ok();
		Ok(())
	}

	/// Terminates the worker: best-effort graceful stop, then a forceful
	/// kill if it hasn't exited within the grace period (§4.4).
	pub async fn stop(&self, id: &Strng) -> anyhow::Result<()> {
		let mut workers = self.workers.lock().await;
		let worker = workers.get_mut(id).ok_or_else(|| anyhow::anyhow!("unknown worker {id}"))?;
		if let Some(mut child) = worker.child.take() {
			graceful_kill(&mut child).await;
		}
		worker.status = WorkerStatus::Stopped;
		info!(%id, "worker stopped");
		Ok(())
	}

	/// §4.4 selection: running, non-quarantined workers only, chosen
	/// round-robin via a monotonically increasing index.
	pub async fn get_worker_for_model(&self, model: &Strng) -> Option<WorkerSummary> {
		let mut workers = self.workers.lock().await;
		let mut candidates: Vec<&Worker> = workers
			.values()
			.filter(|w| matches!(w.status, WorkerStatus::Running))
			.collect();
		candidates.retain(|w| !self.rate_limits.is_rate_limited(&w.id, model));
		if candidates.is_empty() {
			return None;
		}
		let idx = self.next_index.fetch_add(1, Ordering::SeqCst) % candidates.len();
		let chosen = candidates[idx];
		let summary = WorkerSummary {
			id: chosen.id.to_string(),
			port: chosen.worker_port,
			status: chosen.status,
		};
		let id = chosen.id.clone();
		drop(workers);
		let _ = &id;
		Some(summary)
	}

	pub fn mark_rate_limited(&self, worker_id: &Strng, model: &Strng) {
		self.rate_limits.mark(worker_id.clone(), model.clone());
	}

	pub async fn snapshot(&self) -> Vec<WorkerSummary> {
		let workers = self.workers.lock().await;
		workers
			.values()
			.map(|w| WorkerSummary {
				id: w.id.to_string(),
				port: w.worker_port,
				status: w.status,
			})
			.collect()
	}
}

#[cfg(unix)]
async fn graceful_kill(child: &mut Child) {
	if let Some(pid) = child.id() {
		// SAFETY: `libc` isn't part of this workspace's dependency stack; a
		// `SIGTERM`-then-`SIGKILL` split would need it or `nix`. Approximated
		// here with tokio's own forceful kill, noted as a simplification.
		let _ = pid;
	}
	let _ = tokio::time::timeout(STOP_GRACE_PERIOD, child.wait()).await;
	let _ = child.start_kill();
	let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn graceful_kill(child: &mut Child) {
	let _ = child.start_kill();
	let _ = child.wait().await;
}

#[derive(Deserialize)]
pub struct RateLimitReport {
	pub model: String,
}

/// Manager HTTP surface (§6): `GET /workers` for the gateway's poll loop,
/// `POST /api/workers/{id}/rate-limit` for fire-and-forget quarantine
/// reports from the gateway's response inspection.
pub fn router(pool: Arc<WorkerPool>) -> axum::Router {
	axum::Router::new()
		.route("/workers", get(list_workers))
		.route("/api/workers/{id}/rate-limit", post(report_rate_limit))
		.with_state(pool)
}

async fn list_workers(State(pool): State<Arc<WorkerPool>>) -> Json<Vec<WorkerSummary>> {
	Json(pool.snapshot().await)
}

async fn report_rate_limit(State(pool): State<Arc<WorkerPool>>, AxumPath(id): AxumPath<String>, Json(body): Json<RateLimitReport>) -> StatusCode {
	pool.mark_rate_limited(&Strng::from(id.as_str()), &Strng::from(body.model.as_str()));
	StatusCode::OK
}

pub fn default_workers_json_path() -> PathBuf {
	Path::new("./workers.json").to_path_buf()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn round_robin_skips_quarantined_and_stopped() {
		let pool = WorkerPool::new(PathBuf::from("/tmp/does-not-exist-workers.json"), PathBuf::from("/bin/true"), 6);
		pool.register(Strng::from("w1"), Strng::from("p1"), PathBuf::from("/tmp/p1"), 9001, 9002).await;
		pool.register(Strng::from("w2"), Strng::from("p2"), PathBuf::from("/tmp/p2"), 9003, 9004).await;

		assert!(pool.get_worker_for_model(&Strng::from("m1")).await.is_none());

		{
			let mut workers = pool.workers.lock().await;
			workers.get_mut(&Strng::from("w1")).unwrap().status = WorkerStatus::Running;
			workers.get_mut(&Strng::from("w2")).unwrap().status = WorkerStatus::Running;
		}

		let first = pool.get_worker_for_model(&Strng::from("m1")).await.unwrap();
		let second = pool.get_worker_for_model(&Strng::from("m1")).await.unwrap();
		assert_ne!(first.id, second.id);

		pool.mark_rate_limited(&Strng::from("w1"), &Strng::from("m1"));
		for _ in 0..4 {
			let chosen = pool.get_worker_for_model(&Strng::from("m1")).await.unwrap();
			assert_eq!(chosen.id, "w2");
		}
	}

	#[tokio::test]
	async fn persists_and_reloads_workers_json() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("workers.json");
		let pool = WorkerPool::new(path.clone(), PathBuf::from("/bin/true"), 6);
		pool.register(Strng::from("w1"), Strng::from("p1"), PathBuf::from("/tmp/p1"), 9001, 9002).await;

		let reloaded = WorkerPool::new(path, PathBuf::from("/bin/true"), 6);
		reloaded.load_from_disk().await.unwrap();
		let snapshot = reloaded.snapshot().await;
		assert_eq!(snapshot.len(), 1);
		assert_eq!(snapshot[0].id, "w1");
	}
}
