use std::fmt::{Display, Formatter};
use std::{env, fmt};

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
	pub rust_version: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: BUILD_VERSION.to_string(),
			rust_version: rustc_version_runtime().unwrap_or_else(|| "unknown".to_string()),
		}
	}
}

fn rustc_version_runtime() -> Option<String> {
	env::var("BRIDGE_RUSTC_VERSION").ok()
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", RustVersion:\"{}\"}}",
			self.version, self.rust_version
		)
	}
}
