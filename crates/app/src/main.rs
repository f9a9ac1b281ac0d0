// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bridge_core::signal::Shutdown;
use bridge_core::telemetry;
use bridge_gateway::browser::NullBrowserController;
use bridge_gateway::cert::{self, CertAuthority};
use bridge_gateway::config::{self, GatewayArgs, RuntimeConfig, WorkerArgs};
use bridge_gateway::context::WorkerContext;
use bridge_gateway::gatewayproxy::{self, GatewayProxy};
use bridge_gateway::http::{self, AppState};
use bridge_gateway::mitm::MitmProxy;
use bridge_gateway::pool::{self, WorkerPool};
use bridge_gateway::queue::{self, RequestQueue};
use bridge_gateway::upstream::UpstreamConnector;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// YAML config file overlaid with env-var overrides (§10.3).
	#[arg(long, value_name = "file")]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Runs one browser-backed worker: the OpenAI-shaped HTTP surface, the
	/// serialized request queue, and (if `--stream-port` is nonzero) the MITM
	/// side-channel.
	Worker(WorkerArgs),
	/// Runs the worker-pool manager and the front gateway's round-robin proxy.
	Gateway(GatewayArgs),
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let runtime_cfg = RuntimeConfig::load(args.config.as_ref())?;

	let log_format = match runtime_cfg.log_format {
		config::LogFormat::Plain => telemetry::LogFormat::Plain,
		config::LogFormat::Json => telemetry::LogFormat::Json,
	};
	let _log_guard = telemetry::setup_logging(telemetry::Config {
		filter: runtime_cfg.log_filter.clone(),
		format: log_format,
		file: runtime_cfg.log_file.clone(),
	});

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			match args.command {
				Command::Worker(worker_args) => run_worker(worker_args, runtime_cfg).await,
				Command::Gateway(gateway_args) => run_gateway(gateway_args, runtime_cfg).await,
			}
		})
}

/// Links a `bridge_core::signal::Shutdown` (SIGINT/SIGTERM) to a
/// `CancellationToken` so every long-running future in this binary can share
/// one cancellation signal without needing its own `Shutdown` waiter.
fn link_shutdown() -> CancellationToken {
	let token = CancellationToken::new();
	let shutdown = Shutdown::new();
	let wait = shutdown.wait();
	let token_for_signal = token.clone();
	tokio::spawn(async move {
		wait.await;
		token_for_signal.cancel();
	});
	token
}

async fn run_worker(args: WorkerArgs, runtime_cfg: RuntimeConfig) -> anyhow::Result<()> {
	let config = Arc::new(runtime_cfg);
	let token = link_shutdown();

	// The real browser controller is out of scope (§1); `NullBrowserController`
	// stands in until one is wired in.
	let browser = Arc::new(NullBrowserController::default());
	let side_channel_enabled = args.stream_port != 0;
	let ctx = WorkerContext::new_with_side_channel(browser, config.clone(), side_channel_enabled);

	if side_channel_enabled {
		cert::install_crypto_provider();
		let certs = Arc::new(CertAuthority::load_or_generate(&config.cert_store_dir)?);
		let connector = Arc::new(UpstreamConnector::new(config.upstream_proxy.as_deref())?);
		let mitm = Arc::new(MitmProxy::new(certs, connector, config.sniff_domains.clone()));
		let listener = TcpListener::bind(("127.0.0.1", args.stream_port)).await?;
		let side_channel_tx = ctx.side_channel_tx.clone();
		tokio::spawn(async move {
			if let Err(e) = mitm.serve(listener, side_channel_tx).await {
				error!(error = %e, "mitm proxy stopped");
			}
		});
	}

	let queue = RequestQueue::new();
	let queue_ctx = ctx.clone();
	let queue_for_loop = queue.clone();
	let queue_token = token.clone();
	let queue_handle = tokio::spawn(async move {
		queue::run_worker_loop(queue_ctx, queue_for_loop, queue_token.cancelled_owned()).await;
	});

	let state = AppState { ctx, queue };
	let router = http::router(state);
	let listener = TcpListener::bind(args.server_port).await?;
	info!(addr = %args.server_port, stream_port = args.stream_port, "worker listening");
	axum::serve(listener, router).with_graceful_shutdown(token.cancelled_owned()).await?;

	let _ = queue_handle.await;
	Ok(())
}

async fn run_gateway(args: GatewayArgs, runtime_cfg: RuntimeConfig) -> anyhow::Result<()> {
	let token = link_shutdown();

	let workers_json_path = pool::default_workers_json_path();
	let worker_binary = std::env::current_exe()?;
	let worker_pool = WorkerPool::new(workers_json_path, worker_binary, runtime_cfg.rate_limit_recovery_hours);
	worker_pool.load_from_disk().await?;

	let manager_url = url::Url::parse(&args.manager_base_url)?;
	let manager_port = manager_url.port().unwrap_or(7900);
	let manager_listener = TcpListener::bind(("127.0.0.1", manager_port)).await?;
	let manager_router = pool::router(worker_pool.clone());
	let manager_token = token.clone();
	tokio::spawn(async move {
		if let Err(e) = axum::serve(manager_listener, manager_router).with_graceful_shutdown(manager_token.cancelled_owned()).await {
			error!(error = %e, "worker manager stopped");
		}
	});
	info!(port = manager_port, "worker manager listening");

	let proxy = GatewayProxy::new(args.manager_base_url.clone(), Duration::from_secs(args.worker_cache_ttl_secs))?;
	let gateway_router = axum::Router::new()
		.route("/v1/chat/completions", axum::routing::post(gatewayproxy::forward_chat_completions))
		.with_state(proxy);
	let gateway_listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
	info!(port = args.port, manager_base_url = %args.manager_base_url, "gateway listening");
	axum::serve(gateway_listener, gateway_router).with_graceful_shutdown(token.cancelled_owned()).await?;
	Ok(())
}
