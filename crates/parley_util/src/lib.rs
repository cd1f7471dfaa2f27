#![forbid(unsafe_code)]

pub mod secret {
	use core::fmt;

	/// Credential material that must never reach logs or serialized output.
	#[derive(Clone, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

	impl serde::Serialize for SecretString {
		fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
		where
			S: serde::Serializer,
		{
			serializer.serialize_str("")
		}
	}

	impl<'de> serde::Deserialize<'de> for SecretString {
		fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
		where
			D: serde::Deserializer<'de>,
		{
			let s = String::deserialize(deserializer)?;
			Ok(SecretString::new(s))
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn debug_and_display_redact() {
			let s = SecretString::new("hunter2");
			assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
			assert_eq!(s.to_string(), "<redacted>");
			assert_eq!(s.expose(), "hunter2");
		}
	}
}

pub mod endpoint {
	use std::net::SocketAddr;

	/// Default server port when an endpoint omits one.
	pub const DEFAULT_PORT: u16 = 4415;

	/// Parsed `parley://host:port` endpoint.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct ServerEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl ServerEndpoint {
		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		/// Parse an endpoint string in the form `parley://host[:port]`.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected parley://host:port)".to_string());
			}

			let rest = s
				.strip_prefix("parley://")
				.ok_or_else(|| format!("invalid endpoint (expected parley://host:port): {s}"))?;

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected parley://host:port without path/query/fragment): {s}"
				));
			}

			let (host, port) = match rest.rsplit_once(':') {
				// Unbracketed IPv6 has colons but no port separator we can trust.
				Some((host, _)) if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) => {
					return Err(format!(
						"invalid endpoint host (IPv6 must be bracketed like parley://[::1]:4415): {s}"
					));
				}
				Some((host, port_str)) => {
					let port: u16 = port_str
						.trim()
						.parse()
						.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;
					(host.trim(), port)
				}
				None => (rest.trim(), DEFAULT_PORT),
			};

			if host.is_empty() {
				return Err(format!("invalid endpoint host (expected parley://host:port): {s}"));
			}
			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}
	}

	/// Validate `parley://host[:port]`.
	pub fn validate_endpoint(s: &str) -> Result<(), String> {
		let _ = ServerEndpoint::parse(s)?;
		Ok(())
	}

}
