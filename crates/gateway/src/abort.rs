//! C9 Abort Classifier: maps an error message (plus whatever context the
//! caller has on hand) onto `{user_abort, client_disconnect, other}` so the
//! pipeline can decide whether to surface a real 500 or swallow the failure
//! as expected teardown (§4.6). Grounded verbatim on the original
//! `api/abort_detector.py` keyword lists; only the language changed.

const ABORT_PATTERNS: &[&str] = &[
	"signal is aborted without reason",
	"aborterror",
	"operation was aborted",
	"request aborted",
	"connection aborted",
	"stream aborted",
	"cancelled",
	"interrupted",
	"cherry studio abort",
	"electron app closed",
	"renderer process terminated",
	"main process abort",
	"ipc communication failed",
	"response paused",
	"stream terminated by user",
	"client requested abort",
	"abort controller signal",
	"fetch operation aborted",
	"clicked stop button",
	"aborted by user",
	"stop button clicked",
	"user_cancelled",
	"streaming_failed",
	"task aborted",
	"command execution timed out",
	"the operation was aborted",
	"fetch aborted",
	"client closed request",
	"client disconnected during",
	"http disconnect",
	"connection reset by peer",
	"broken pipe",
];

const DISCONNECT_PATTERNS: &[&str] = &[
	"client disconnected",
	"connection reset",
	"broken pipe",
	"connection lost",
	"peer closed",
	"socket closed",
	"connection aborted",
	"connection closed",
	"disconnected",
	"network error",
	"failed to fetch",
	"connection refused",
	"timeout",
	"connection timeout",
	"stream closed",
	"sse disconnected",
	"websocket closed",
];

/// Known chat-client User-Agent substrings that get the benefit of the doubt
/// when their error message carries an abort-ish keyword (§9 "Cherry Studio
/// special handling").
const KNOWN_ABORT_TOLERANT_CLIENTS: &[&str] = &["sillytavern", "cherry-studio", "chatbox", "kilocode"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	UserAbort,
	ClientDisconnect,
	Other,
}

impl StopReason {
	pub fn as_str(&self) -> &'static str {
		match self {
			StopReason::UserAbort => "user_abort",
			StopReason::ClientDisconnect => "client_disconnect",
			StopReason::Other => "other",
		}
	}
}

/// Extra signals available at the call site that a bare error string
/// doesn't carry: an HTTP status code, and the client's User-Agent header.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext<'a> {
	pub status_code: Option<u16>,
	pub user_agent: Option<&'a str>,
	pub is_abort_error_type: bool,
}

pub fn is_abort_error(message: &str, ctx: &ErrorContext) -> bool {
	if message == "Request was aborted." {
		return true;
	}
	let lower = message.to_lowercase();
	if ABORT_PATTERNS.iter().any(|p| lower.contains(p)) {
		return true;
	}
	if ctx.is_abort_error_type {
		return true;
	}
	if ctx.status_code == Some(499) {
		return true;
	}
	if let Some(ua) = ctx.user_agent {
		let ua_lower = ua.to_lowercase();
		if KNOWN_ABORT_TOLERANT_CLIENTS.iter().any(|c| ua_lower.contains(c)) {
			let tolerant_keywords = ["abort", "cancel", "stop", "interrupt"];
			if tolerant_keywords.iter().any(|kw| lower.contains(kw)) {
				return true;
			}
		}
	}
	false
}

pub fn is_client_disconnect_error(message: &str) -> bool {
	let lower = message.to_lowercase();
	DISCONNECT_PATTERNS.iter().any(|p| lower.contains(p))
}

pub fn classify_stop_reason(message: &str, ctx: &ErrorContext) -> StopReason {
	if is_abort_error(message, ctx) {
		StopReason::UserAbort
	} else if is_client_disconnect_error(message) {
		StopReason::ClientDisconnect
	} else {
		StopReason::Other
	}
}

pub fn should_treat_as_success(message: &str, ctx: &ErrorContext) -> bool {
	matches!(
		classify_stop_reason(message, ctx),
		StopReason::UserAbort | StopReason::ClientDisconnect
	)
}
