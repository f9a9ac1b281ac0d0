//! C4 MITM Proxy: terminates client CONNECT tunnels, transparently relays
//! non-matching hosts, and split-inspects matching ones so C3 can decode the
//! vendor's streaming payload without disturbing the bytes the browser sees
//! (§4.1). Grounded in the original `proxy/server.py`'s `_relay_with_inspection`
//! shape, rewritten against `tokio_rustls` instead of `asyncio.start_tls`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bridge_core::copy::{ConnectionResult, TcpStreamSplitter, copy_bidirectional};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cert::CertAuthority;
use crate::decoder;
use crate::types::SideChannelEvent;
use crate::upstream::UpstreamConnector;

const READ_CHUNK: usize = 8192;

pub struct MitmProxy {
	certs: Arc<CertAuthority>,
	connector: Arc<UpstreamConnector>,
	sniff_domains: Vec<String>,
}

impl MitmProxy {
	pub fn new(certs: Arc<CertAuthority>, connector: Arc<UpstreamConnector>, sniff_domains: Vec<String>) -> Self {
		MitmProxy {
			certs,
			connector,
			sniff_domains,
		}
	}

	/// Accepts connections on `listener` until it errors out, spawning one
	/// task per tunnel.
	pub async fn serve(
		self: Arc<Self>,
		listener: TcpListener,
		side_channel: mpsc::Sender<SideChannelEvent>,
	) -> anyhow::Result<()> {
		loop {
			let (stream, peer) = listener.accept().await?;
			let this = self.clone();
			let tx = side_channel.clone();
			tokio::spawn(async move {
				if let Err(e) = this.handle_connection(stream, tx).await {
					debug!(%peer, error = %e, "mitm connection ended");
				}
			});
		}
	}

	async fn handle_connection(
		&self,
		mut client: TcpStream,
		side_channel: mpsc::Sender<SideChannelEvent>,
	) -> anyhow::Result<()> {
		let Some((host, port)) = read_connect_target(&mut client).await? else {
			return Ok(());
		};

		client
			.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
			.await?;
		drain_initial_bytes(&mut client).await;

		if !should_intercept(&host, &self.sniff_domains) {
			let origin = self.connector.dial_tcp(&host, port).await?;
			let stats = ConnectionResult::default();
			copy_bidirectional(TcpStreamSplitter(client), TcpStreamSplitter(origin), &stats).await?;
			return Ok(());
		}

		let server_cfg = self.certs.server_config_for(&host)?;
		let acceptor = tokio_rustls::TlsAcceptor::from(server_cfg);
		let client_tls = acceptor.accept(client).await?;
		let origin_tls = self.connector.dial_tls(&host, port, &["http/1.1"]).await?;

		split_inspect_relay(client_tls, origin_tls, host, side_channel).await
	}
}

/// Reads the first request line off `stream`. Returns `None` (dropping the
/// connection) for anything but `CONNECT host:port` (§4.1).
async fn read_connect_target(stream: &mut TcpStream) -> anyhow::Result<Option<(String, u16)>> {
	let mut buf = Vec::with_capacity(256);
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await?;
		if n == 0 {
			return Ok(None);
		}
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n") || buf.len() > 8192 {
			break;
		}
	}
	let line = String::from_utf8_lossy(&buf);
	let mut parts = line.trim().split_whitespace();
	let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
		return Ok(None);
	};
	if method != "CONNECT" {
		return Ok(None);
	}
	let Some((host, port_str)) = target.rsplit_once(':') else {
		return Ok(None);
	};
	let Ok(port) = port_str.parse::<u16>() else {
		return Ok(None);
	};
	Ok(Some((host.to_string(), port)))
}

/// Consumes whatever stray bytes the client sends right after the CONNECT
/// reply, before the TLS handshake or transparent relay begins. Bounded so a
/// browser that jumps straight to its handshake doesn't stall us.
async fn drain_initial_bytes(stream: &mut TcpStream) {
	let mut buf = [0u8; READ_CHUNK];
	let _ = tokio::time::timeout(std::time::Duration::from_millis(20), stream.read(&mut buf)).await;
}

fn should_intercept(host: &str, sniff_domains: &[String]) -> bool {
	sniff_domains.iter().any(|pattern| {
		if let Some(suffix) = pattern.strip_prefix("*.") {
			host == suffix || host.ends_with(&format!(".{suffix}"))
		} else {
			host == pattern
		}
	})
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
	haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_benign_teardown(e: &std::io::Error) -> bool {
	matches!(
		e.kind(),
		std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::UnexpectedEof
	) || e.to_string().contains("APPLICATION_DATA_AFTER_CLOSE_NOTIFY")
}

/// Two concurrent tasks shovel bytes in each direction; the client→origin
/// side only peeks at request lines, the origin→client side hands flagged
/// response bodies to C3 (§4.1).
async fn split_inspect_relay(
	client: tokio_rustls::server::TlsStream<TcpStream>,
	origin: tokio_rustls::client::TlsStream<TcpStream>,
	host: String,
	side_channel: mpsc::Sender<SideChannelEvent>,
) -> anyhow::Result<()> {
	let (mut client_r, mut client_w) = tokio::io::split(client);
	let (mut origin_r, mut origin_w) = tokio::io::split(origin);
	let inspect_response = Arc::new(AtomicBool::new(false));

	let upstream_task = {
		let inspect_response = inspect_response.clone();
		let side_channel = side_channel.clone();
		let host = host.clone();
		async move {
			let mut buf = Vec::new();
			let mut chunk = vec![0u8; READ_CHUNK];
			loop {
				let n = match client_r.read(&mut chunk).await {
					Ok(0) => break,
					Ok(n) => n,
					Err(e) => {
						if !is_benign_teardown(&e) {
							error!(%host, error = %e, "mitm upstream read error");
						}
						break;
					},
				};
				buf.extend_from_slice(&chunk[..n]);

				let forward_result = if let Some(term) = find(&buf, b"\r\n\r\n") {
					let header_end = term + 4;
					let request_line = buf[..header_end]
						.split(|&b| b == b'\n')
						.next()
						.map(|l| String::from_utf8_lossy(l).trim().to_string())
						.unwrap_or_default();
					let path = request_line
						.split_whitespace()
						.nth(1)
						.unwrap_or("")
						.to_string();

					if path.contains("jserror") {
						inspect_response.store(false, Ordering::SeqCst);
						let lower = path.to_lowercase();
						if lower.contains("quota") || lower.contains("limit") || lower.contains("exceeded") {
							let _ = side_channel
								.send(SideChannelEvent::RateLimit {
									source: "jserror".to_string(),
									path: path.clone(),
								})
								.await;
						}
					} else if path.contains("GenerateContent") {
						inspect_response.store(true, Ordering::SeqCst);
					} else {
						inspect_response.store(false, Ordering::SeqCst);
					}
					let result = origin_w.write_all(&buf).await;
					buf.clear();
					result
				} else {
					let result = origin_w.write_all(&chunk[..n]).await;
					buf.clear();
					result
				};
				if let Err(e) = forward_result {
					if !is_benign_teardown(&e) {
						error!(%host, error = %e, "mitm upstream write error");
					}
					break;
				}
			}
			let _ = origin_w.shutdown().await;
		}
	};

	let downstream_task = async move {
		let mut buf = Vec::new();
		let mut chunk = vec![0u8; READ_CHUNK];
		loop {
			let n = match origin_r.read(&mut chunk).await {
				Ok(0) => break,
				Ok(n) => n,
				Err(e) => {
					if !is_benign_teardown(&e) {
						error!(%host, error = %e, "mitm downstream read error");
					}
					break;
				},
			};
			buf.extend_from_slice(&chunk[..n]);

			if inspect_response.load(Ordering::SeqCst) {
				if let Some(term) = find(&buf, b"\r\n\r\n") {
					let body = &buf[term + 4..];
					let frame = decoder::decode_response(body);
					let _ = side_channel.send(SideChannelEvent::Frame(frame)).await;
				}
			}

			if let Err(e) = client_w.write_all(&chunk[..n]).await {
				if !is_benign_teardown(&e) {
					error!(%host, error = %e, "mitm downstream write error");
				}
				break;
			}
			if find(&buf, b"0\r\n\r\n").is_some() {
				buf.clear();
			}
		}
		let _ = client_w.shutdown().await;
	};

	tokio::join!(upstream_task, downstream_task);
	debug!(%host, "mitm inspect relay closed");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn suffix_matching_honors_wildcard_prefix() {
		let domains = vec!["*.studio.example.com".to_string(), "exact.example.com".to_string()];
		assert!(should_intercept("foo.studio.example.com", &domains));
		assert!(should_intercept("studio.example.com", &domains));
		assert!(should_intercept("exact.example.com", &domains));
		assert!(!should_intercept("other.example.com", &domains));
	}

	#[test]
	fn find_locates_terminator() {
		assert_eq!(find(b"abc\r\n\r\ndef", b"\r\n\r\n"), Some(3));
		assert_eq!(find(b"no terminator here", b"\r\n\r\n"), None);
	}
}
