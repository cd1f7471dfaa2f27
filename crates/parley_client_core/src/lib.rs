#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use parley_domain::UserId;
use parley_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use parley_protocol::{ClientEvent, Ping, ServerEvent, SetUserId, UserIdSet, version};
use quinn::{ClientConfig, Endpoint, TransportConfig, VarInt};
use tracing::{debug, info};

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientSessionConfig {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + registration.
	pub connect_timeout: Duration,
}

impl ClientSessionConfig {
	/// Parse a `parley://host[:port]` endpoint into `(host, port)`.
	pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ClientCoreError> {
		let e = parley_util::endpoint::ServerEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected parley://host:port): {msg}")))?;
		Ok((e.host, e.port))
	}

	/// Convenience: create a config from `parley://host:port`.
	pub fn from_endpoint(endpoint: &str) -> Result<Self, ClientCoreError> {
		let (host, port) = Self::parse_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			..Self::default()
		})
	}
}

impl Default for ClientSessionConfig {
	fn default() -> Self {
		Self {
			server_host: "localhost".to_string(),
			server_port: parley_util::endpoint::DEFAULT_PORT,
			server_addr: None,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client core operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected event ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// The server refused the request with a scoped error event.
	#[error("server error {code}: {message}")]
	Server { code: String, message: String },

	/// IO error.
	#[error("io error: {0}")]
	Io(String),
}

/// A registered or registering session over one QUIC connection.
///
/// Both halves of the conversation run on the single control stream; reads
/// and writes go through this handle.
pub struct ChatSession {
	conn: quinn::Connection,
	control_send: quinn::SendStream,
	control_recv: quinn::RecvStream,
	read_buf: BytesMut,
	max_frame_bytes: usize,
}

impl ChatSession {
	/// Connect to the server. No identity is attached yet; follow up with
	/// [`ChatSession::register`].
	pub async fn connect(cfg: ClientSessionConfig) -> Result<Self, ClientCoreError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;
		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientCoreError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs = hostport
					.to_socket_addrs()
					.map_err(|e| ClientCoreError::Connect(format!("failed to resolve {hostport}: {e}")))?;

				let addrs: Vec<SocketAddr> = addrs.collect();
				if addrs.is_empty() {
					return Err(ClientCoreError::Connect(format!(
						"DNS resolution returned no addresses for {hostport}"
					)));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientCoreError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientCoreError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (control_send, control_recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientCoreError::Io(format!("timeout opening control stream after {connect_timeout:?}")))?
			.map_err(|e| ClientCoreError::Io(format!("open_bi(control) failed: {e}")))?;

		Ok(Self {
			conn,
			control_send,
			control_recv,
			read_buf: BytesMut::with_capacity(16 * 1024),
			max_frame_bytes: cfg.max_frame_bytes,
		})
	}

	/// Bind an identity to this connection and wait for confirmation.
	///
	/// A `user-id-set` reply confirms the registration; an `error` event
	/// (bad credential) is surfaced as [`ClientCoreError::Server`].
	pub async fn register(&mut self, user_id: UserId, token: &str) -> Result<UserIdSet, ClientCoreError> {
		self.send(ClientEvent::SetUserId(SetUserId {
			user_id,
			token: token.to_string(),
		}))
		.await?;

		match self.next_event().await? {
			ServerEvent::UserIdSet(confirmed) => {
				debug!(user = %confirmed.user_id, connection_id = confirmed.connection_id, "registered");
				Ok(confirmed)
			}
			ServerEvent::Error(e) => Err(ClientCoreError::Server {
				code: e.code,
				message: e.message,
			}),
			other => Err(ClientCoreError::Protocol(format!("expected user-id-set, got {other:?}"))),
		}
	}

	/// Send one client event on the control stream.
	pub async fn send(&mut self, event: ClientEvent) -> Result<(), ClientCoreError> {
		let frame = encode_frame(&event, self.max_frame_bytes).map_err(ClientCoreError::Framing)?;
		self.control_send
			.write_all(&frame)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	/// Write pre-encoded bytes to the control stream, bypassing event
	/// encoding. Useful for protocol-level testing.
	pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), ClientCoreError> {
		self.control_send
			.write_all(frame)
			.await
			.map_err(|e| ClientCoreError::Io(e.to_string()))?;
		Ok(())
	}

	/// Read the next server event, blocking until one arrives.
	pub async fn next_event(&mut self) -> Result<ServerEvent, ClientCoreError> {
		let mut tmp = [0u8; 8192];

		loop {
			match try_decode_frame_from_buffer::<ServerEvent>(&mut self.read_buf, self.max_frame_bytes) {
				Ok(Some(ev)) => return Ok(ev),
				Ok(None) => {}
				Err(e) => return Err(ClientCoreError::Framing(e)),
			}

			let n = match self.control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					return Err(ClientCoreError::Protocol(
						"stream closed before receiving full event".to_string(),
					));
				}
				Err(e) => return Err(ClientCoreError::Io(e.to_string())),
			};

			self.read_buf.extend_from_slice(&tmp[..n]);
		}
	}

	/// Send a liveness probe and await the `pong` reply. Events queued ahead
	/// of the reply are skipped; use [`ChatSession::next_event`] directly when
	/// interleaved traffic matters.
	pub async fn ping(&mut self, client_unix_ms: i64) -> Result<i64, ClientCoreError> {
		self.send(ClientEvent::Ping(Ping { client_unix_ms })).await?;

		loop {
			match self.next_event().await? {
				ServerEvent::Pong(p) => return Ok(p.server_unix_ms),
				other => debug!(event = ?other, "skipping event while waiting for pong"),
			}
		}
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(quinn::VarInt::from_u32(code), reason.as_bytes());
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().context("parse wildcard addr")?;
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![version::ALPN.to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(64));
	transport.max_concurrent_uni_streams(VarInt::from_u32(64));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientSessionConfig::default();
		assert_eq!(cfg.server_host, "localhost");
		assert_eq!(cfg.server_port, parley_util::endpoint::DEFAULT_PORT);
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn from_endpoint_fills_host_and_port() {
		let cfg = ClientSessionConfig::from_endpoint("parley://127.0.0.1:4420").unwrap();
		assert_eq!(cfg.server_host, "127.0.0.1");
		assert_eq!(cfg.server_port, 4420);
	}
}
