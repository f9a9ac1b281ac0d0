//! §10.3 configuration: a typed `Config` assembled from CLI flags with
//! environment-variable and file fallbacks, env-first-then-yaml: read
//! `*_ENV` vars before falling back to a parsed file.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
	std::env::var(key)
		.ok()
		.and_then(|v| v.parse().ok())
		.unwrap_or(default)
}

/// Flags accepted by the `worker` subcommand, mirroring the reference
/// manager's launch command line (§6): `--headless|--debug|--virtual-display`,
/// `--server-port`, `--camoufox-debug-port`, `--stream-port`,
/// `--active-auth-json`, optional `--internal-camoufox-proxy`, `--helper`.
#[derive(clap::Args, Debug, Clone)]
pub struct WorkerArgs {
	/// Bind address for this worker's OpenAI-shaped HTTP endpoint.
	#[arg(long, default_value = "127.0.0.1:0")]
	pub server_port: SocketAddr,

	/// Port the browser's remote-debugging protocol listens on. Opaque to
	/// this crate (consumed by the browser controller, out of scope per §1).
	#[arg(long, default_value_t = 0)]
	pub camoufox_debug_port: u16,

	/// MITM proxy port the browser is configured to route through.
	/// `0` disables the side-channel; the pipeline falls back to DOM-scrape mode.
	#[arg(long, default_value_t = 8765)]
	pub stream_port: u16,

	/// Auth profile JSON consumed at boot (§6: only `active/` is read, one
	/// file max).
	#[arg(long)]
	pub active_auth_json: Option<PathBuf>,

	#[arg(long)]
	pub headless: bool,
	#[arg(long)]
	pub debug: bool,
	#[arg(long)]
	pub virtual_display: bool,
	#[arg(long)]
	pub internal_camoufox_proxy: Option<String>,
	#[arg(long)]
	pub helper: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GatewayArgs {
	/// Gateway bind port (§10.3 default 2048, matching the reference
	/// `argparse` default).
	#[arg(long, default_value_t = 2048)]
	pub port: u16,

	/// Base URL of the worker manager whose `/workers` the gateway polls.
	#[arg(long, default_value = "http://127.0.0.1:7900")]
	pub manager_base_url: String,

	/// How long a fetched worker list is cached before the next poll (§4.4).
	#[arg(long, default_value_t = 5)]
	pub worker_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
	/// Hostnames (or `*.`-prefixed suffix patterns) the MITM proxy inspects;
	/// every other CONNECT target gets a transparent relay (§4.1).
	pub sniff_domains: Vec<String>,
	/// Directory the cert authority persists its root and leaf materials under (§3).
	pub cert_store_dir: PathBuf,
	/// `RESPONSE_COMPLETION_TIMEOUT`, an open question in the source resolved
	/// here as a config knob with a conservative 120s default (§9).
	pub response_completion_timeout_ms: u64,
	/// Rate-limit quarantine recovery window, default 6h (§4.4/§3).
	pub rate_limit_recovery_hours: u64,
	/// Upstream proxy (HTTP or SOCKS) the connector dials origins through, if any (C2).
	pub upstream_proxy: Option<String>,
	pub log_format: LogFormat,
	pub log_filter: String,
	pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	Plain,
	Json,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			sniff_domains: vec!["*.studio.example.com".to_string()],
			cert_store_dir: PathBuf::from("./certs"),
			response_completion_timeout_ms: 120_000,
			rate_limit_recovery_hours: 6,
			upstream_proxy: None,
			log_format: LogFormat::Plain,
			log_filter: "info".to_string(),
			log_file: None,
		}
	}
}

impl RuntimeConfig {
	/// Loads a YAML file if given, then overlays env-var overrides: env beats
	/// file beats default.
	pub fn load(file: Option<&PathBuf>) -> anyhow::Result<RuntimeConfig> {
		let mut cfg = match file {
			Some(path) => {
				let contents = std::fs::read_to_string(path)
					.map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
				serde_yaml::from_str(&contents)?
			},
			None => RuntimeConfig::default(),
		};
		if let Ok(v) = std::env::var("BRIDGE_CERT_STORE_DIR") {
			cfg.cert_store_dir = PathBuf::from(v);
		}
		cfg.response_completion_timeout_ms =
			env_or("BRIDGE_RESPONSE_COMPLETION_TIMEOUT_MS", cfg.response_completion_timeout_ms);
		cfg.rate_limit_recovery_hours =
			env_or("BRIDGE_RATE_LIMIT_RECOVERY_HOURS", cfg.rate_limit_recovery_hours);
		if let Ok(v) = std::env::var("BRIDGE_LOG_FILTER") {
			cfg.log_filter = v;
		}
		Ok(cfg)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_has_sane_timeout() {
		let cfg = RuntimeConfig::default();
		assert_eq!(cfg.response_completion_timeout_ms, 120_000);
		assert_eq!(cfg.rate_limit_recovery_hours, 6);
	}

	#[test]
	fn load_with_no_file_uses_defaults() {
		let cfg = RuntimeConfig::load(None).unwrap();
		assert_eq!(cfg.cert_store_dir, PathBuf::from("./certs"));
	}
}
