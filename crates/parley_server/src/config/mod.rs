#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_util::secret::SecretString;
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for identity tokens. Registration is refused without it.
	pub auth_hmac_secret: Option<SecretString>,
	/// Command rate limiting: per-connection burst size.
	pub command_rate_limit_per_conn_burst: u32,
	/// Command rate limiting: per-connection requests per minute.
	pub command_rate_limit_per_conn_per_minute: u32,
	/// Command rate limiting: per-conversation burst size.
	pub command_rate_limit_per_conversation_burst: u32,
	/// Command rate limiting: per-conversation requests per minute.
	pub command_rate_limit_per_conversation_per_minute: u32,
	/// Positive membership cache TTL.
	pub membership_cache_ttl: Duration,
	/// Per-subscriber broadcast queue capacity.
	pub subscriber_queue_capacity: usize,
	/// Per-connection outbound event queue capacity.
	pub outbound_queue_capacity: usize,
	/// QUIC keep-alive probe interval.
	pub keep_alive_interval: Duration,
	/// QUIC idle timeout; silence past this tears the connection down.
	pub idle_timeout: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			command_rate_limit_per_conn_burst: 20,
			command_rate_limit_per_conn_per_minute: 120,
			command_rate_limit_per_conversation_burst: 10,
			command_rate_limit_per_conversation_per_minute: 60,
			membership_cache_ttl: Duration::from_secs(30),
			subscriber_queue_capacity: 1024,
			outbound_queue_capacity: 1024,
			keep_alive_interval: Duration::from_secs(10),
			idle_timeout: Duration::from_secs(30),
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:). In-memory store when unset.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	command_rate_limit_per_conn_burst: Option<u32>,
	command_rate_limit_per_conn_per_minute: Option<u32>,
	command_rate_limit_per_conversation_burst: Option<u32>,
	command_rate_limit_per_conversation_per_minute: Option<u32>,
	membership_cache_ttl_secs: Option<u64>,
	subscriber_queue_capacity: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	keep_alive_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				command_rate_limit_per_conn_burst: file
					.server
					.command_rate_limit_per_conn_burst
					.unwrap_or(defaults.command_rate_limit_per_conn_burst),
				command_rate_limit_per_conn_per_minute: file
					.server
					.command_rate_limit_per_conn_per_minute
					.unwrap_or(defaults.command_rate_limit_per_conn_per_minute),
				command_rate_limit_per_conversation_burst: file
					.server
					.command_rate_limit_per_conversation_burst
					.unwrap_or(defaults.command_rate_limit_per_conversation_burst),
				command_rate_limit_per_conversation_per_minute: file
					.server
					.command_rate_limit_per_conversation_per_minute
					.unwrap_or(defaults.command_rate_limit_per_conversation_per_minute),
				membership_cache_ttl: file
					.server
					.membership_cache_ttl_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.membership_cache_ttl),
				subscriber_queue_capacity: file
					.server
					.subscriber_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(defaults.subscriber_queue_capacity),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				keep_alive_interval: file
					.server
					.keep_alive_secs
					.filter(|s| *s > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.keep_alive_interval),
				idle_timeout: file
					.server
					.idle_timeout_secs
					.filter(|s| *s > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.idle_timeout),
			},
			persistence: PersistenceSettings {
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_SERVER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_SERVER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_SERVER_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_COMMAND_RATE_LIMIT_PER_CONN_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.command_rate_limit_per_conn_burst = burst;
		info!(burst, "server config: command_rate_limit_per_conn_burst overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_COMMAND_RATE_LIMIT_PER_CONN_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.command_rate_limit_per_conn_per_minute = rate;
		info!(
			rate,
			"server config: command_rate_limit_per_conn_per_minute overridden by env"
		);
	}

	if let Ok(v) = std::env::var("PARLEY_COMMAND_RATE_LIMIT_PER_CONVERSATION_BURST")
		&& let Ok(burst) = v.trim().parse::<u32>()
	{
		cfg.server.command_rate_limit_per_conversation_burst = burst;
		info!(
			burst,
			"server config: command_rate_limit_per_conversation_burst overridden by env"
		);
	}

	if let Ok(v) = std::env::var("PARLEY_COMMAND_RATE_LIMIT_PER_CONVERSATION_PER_MINUTE")
		&& let Ok(rate) = v.trim().parse::<u32>()
	{
		cfg.server.command_rate_limit_per_conversation_per_minute = rate;
		info!(
			rate,
			"server config: command_rate_limit_per_conversation_per_minute overridden by env"
		);
	}

	if let Ok(v) = std::env::var("PARLEY_MEMBERSHIP_CACHE_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.membership_cache_ttl = Duration::from_secs(secs);
		info!(secs, "server config: membership_cache_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_KEEP_ALIVE_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.keep_alive_interval = Duration::from_secs(secs);
		info!(secs, "server config: keep_alive_interval overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_IDLE_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.server.idle_timeout = Duration::from_secs(secs);
		info!(secs, "server config: idle_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_yields_defaults() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.server.command_rate_limit_per_conn_burst, 20);
		assert_eq!(cfg.server.membership_cache_ttl, Duration::from_secs(30));
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(cfg.persistence.database_url.is_none());
	}

	#[test]
	fn blank_strings_are_treated_as_unset() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			auth_hmac_secret = "  "
			metrics_bind = ""

			[persistence]
			database_url = " "
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(cfg.server.metrics_bind.is_none());
		assert!(cfg.persistence.database_url.is_none());
	}

	#[test]
	fn file_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			auth_hmac_secret = "s3cret"
			membership_cache_ttl_secs = 5
			idle_timeout_secs = 60

			[persistence]
			database_url = "sqlite:/tmp/parley.db"
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.auth_hmac_secret.unwrap().expose(), "s3cret");
		assert_eq!(cfg.server.membership_cache_ttl, Duration::from_secs(5));
		assert_eq!(cfg.server.idle_timeout, Duration::from_secs(60));
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite:/tmp/parley.db"));
	}
}
