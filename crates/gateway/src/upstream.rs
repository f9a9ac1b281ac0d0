//! C2 Upstream Connector: TCP/TLS dial to an origin, optionally tunnelled
//! through an HTTP CONNECT or SOCKS5 proxy (§4.1 step 3, §2).

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

#[derive(Debug, Clone)]
enum ProxyKind {
	Http(String),
	Socks5(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
	#[error("failed to resolve {0}")]
	Resolve(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("proxy CONNECT to {0} rejected: {1}")]
	ProxyRejected(String, String),
	#[error("SOCKS5 handshake failed: {0}")]
	Socks5(String),
	#[error("tls handshake failed: {0}")]
	Tls(#[from] tokio_rustls::rustls::Error),
	#[error("invalid upstream proxy url: {0}")]
	InvalidProxy(String),
}

pub struct UpstreamConnector {
	proxy: Option<ProxyKind>,
	tls_connector: tokio_rustls::TlsConnector,
}

impl UpstreamConnector {
	pub fn new(proxy_url: Option<&str>) -> Result<Self, ConnectError> {
		let proxy = match proxy_url {
			None => None,
			Some(url) => Some(parse_proxy(url)?),
		};
		let mut roots = tokio_rustls::rustls::RootCertStore::empty();
		roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
		let tls_config = tokio_rustls::rustls::ClientConfig::builder()
			.with_root_certificates(roots)
			.with_no_client_auth();
		Ok(UpstreamConnector {
			proxy,
			tls_connector: tokio_rustls::TlsConnector::from(Arc::new(tls_config)),
		})
	}

	/// Dials a plain TCP connection to `host:port`, through the configured
	/// proxy if any.
	pub async fn dial_tcp(&self, host: &str, port: u16) -> Result<TcpStream, ConnectError> {
		match &self.proxy {
			None => {
				let addr = format!("{host}:{port}");
				TcpStream::connect(&addr)
					.await
					.map_err(|e| ConnectError::Io(e))
			},
			Some(ProxyKind::Http(proxy_addr)) => connect_via_http_proxy(proxy_addr, host, port).await,
			Some(ProxyKind::Socks5(proxy_addr)) => connect_via_socks5(proxy_addr, host, port).await,
		}
	}

	/// Dials `host:port` and layers TLS on top, offering only the given ALPN
	/// protocols (§4.1 step 3: "offer ALPN http/1.1 only").
	pub async fn dial_tls(
		&self,
		host: &str,
		port: u16,
		alpn: &[&str],
	) -> Result<TlsStream<TcpStream>, ConnectError> {
		let tcp = self.dial_tcp(host, port).await?;
		let mut config = (*self.tls_connector.config()).clone();
		config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
		let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
		let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(host.to_string())
			.map_err(|_| ConnectError::InvalidProxy(format!("invalid server name {host}")))?;
		Ok(connector.connect(server_name, tcp).await?)
	}
}

fn parse_proxy(url: &str) -> Result<ProxyKind, ConnectError> {
	if let Some(rest) = url.strip_prefix("http://") {
		Ok(ProxyKind::Http(rest.to_string()))
	} else if let Some(rest) = url.strip_prefix("socks5://") {
		Ok(ProxyKind::Socks5(rest.to_string()))
	} else {
		Err(ConnectError::InvalidProxy(url.to_string()))
	}
}

async fn connect_via_http_proxy(
	proxy_addr: &str,
	host: &str,
	port: u16,
) -> Result<TcpStream, ConnectError> {
	let mut stream = TcpStream::connect(proxy_addr).await?;
	let req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
	stream.write_all(req.as_bytes()).await?;

	let mut buf = Vec::with_capacity(512);
	let mut byte = [0u8; 1];
	loop {
		let n = stream.read(&mut byte).await?;
		if n == 0 {
			return Err(ConnectError::ProxyRejected(
				proxy_addr.to_string(),
				"connection closed before headers completed".to_string(),
			));
		}
		buf.push(byte[0]);
		if buf.ends_with(b"\r\n\r\n") {
			break;
		}
	}
	let status_line = buf
		.split(|&b| b == b'\n')
		.next()
		.unwrap_or(&[])
		.to_vec();
	let status_line = String::from_utf8_lossy(&status_line);
	if !status_line.contains("200") {
		return Err(ConnectError::ProxyRejected(
			proxy_addr.to_string(),
			status_line.trim().to_string(),
		));
	}
	Ok(stream)
}

async fn connect_via_socks5(
	proxy_addr: &str,
	host: &str,
	port: u16,
) -> Result<TcpStream, ConnectError> {
	let mut stream = TcpStream::connect(proxy_addr).await?;
	// Greeting: version 5, one method, no-auth.
	stream.write_all(&[0x05, 0x01, 0x00]).await?;
	let mut resp = [0u8; 2];
	stream.read_exact(&mut resp).await?;
	if resp != [0x05, 0x00] {
		return Err(ConnectError::Socks5("server rejected no-auth method".to_string()));
	}

	// CONNECT request with a domain-name address type.
	let mut req = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
	req.extend_from_slice(host.as_bytes());
	req.extend_from_slice(&port.to_be_bytes());
	stream.write_all(&req).await?;

	let mut header = [0u8; 4];
	stream.read_exact(&mut header).await?;
	if header[1] != 0x00 {
		return Err(ConnectError::Socks5(format!("connect failed, code {}", header[1])));
	}
	let skip = match header[3] {
		0x01 => 4,
		0x03 => {
			let mut len = [0u8; 1];
			stream.read_exact(&mut len).await?;
			len[0] as usize
		},
		0x04 => 16,
		other => return Err(ConnectError::Socks5(format!("unknown address type {other}"))),
	};
	let mut discard = vec![0u8; skip + 2];
	stream.read_exact(&mut discard).await?;
	Ok(stream)
}
