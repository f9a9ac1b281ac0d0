use std::sync::LazyLock;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod fanout;

pub static APPLICATION_START_TIME: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Output format for the process-wide log writer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
	#[default]
	Plain,
	Json,
}

pub struct Config {
	pub filter: String,
	pub format: LogFormat,
	pub file: Option<std::path::PathBuf>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			filter: "info".to_string(),
			format: LogFormat::default(),
			file: None,
		}
	}
}

/// Installs the global tracing subscriber: env-filtered console output, an optional
/// rotating file writer, and the C14 fan-out layer that live log viewers subscribe to.
///
/// Returns the fan-out handle (clone to subscribe) and, if file logging was configured,
/// a worker guard that must be held for the lifetime of the process.
pub fn setup_logging(cfg: Config) -> (fanout::LogFanout, Option<tracing_appender::non_blocking::WorkerGuard>) {
	let _ = *APPLICATION_START_TIME;
	let filter = EnvFilter::try_new(&cfg.filter).unwrap_or_else(|_| EnvFilter::new("info"));
	let fanout = fanout::LogFanout::new(256);

	let registry = tracing_subscriber::registry()
		.with(filter)
		.with(fanout.layer());

	let mut guard = None;
	match &cfg.file {
		Some(path) => {
			let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
			let name = path
				.file_name()
				.and_then(|n| n.to_str())
				.unwrap_or("app.log");
			let appender = tracing_appender::rolling::daily(dir, name);
			let (nb, g) = tracing_appender::non_blocking(appender);
			guard = Some(g);
			match cfg.format {
				LogFormat::Json => registry
					.with(tracing_subscriber::fmt::layer().json().with_writer(nb).with_ansi(false))
					.init(),
				LogFormat::Plain => registry
					.with(tracing_subscriber::fmt::layer().with_writer(nb).with_ansi(false))
					.init(),
			}
		},
		None => match cfg.format {
			LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
			LogFormat::Plain => registry.with(tracing_subscriber::fmt::layer()).init(),
		},
	}

	(fanout, guard)
}

pub type LogSubscription = broadcast::Receiver<String>;
