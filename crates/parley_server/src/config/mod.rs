#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_domain::RoomName;
use serde::Deserialize;
use tracing::info;

use crate::server::coordinator::CoordinatorSettings;

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

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// TCP bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Database URL (sqlite:). Absent means in-memory, non-durable.
	pub database_url: Option<String>,
	/// Channel every first login and evacuation falls back to.
	pub default_channel: RoomName,
	/// Window within which an author may edit their own message.
	pub edit_window: Duration,
	/// Messages returned in a room history sync.
	pub history_limit: usize,
	/// Per-connection outbound event queue depth.
	pub outbox_capacity: usize,
}

impl ServerConfig {
	pub fn coordinator_settings(&self) -> CoordinatorSettings {
		CoordinatorSettings {
			default_channel: self.default_channel.clone(),
			edit_window: self.edit_window,
			history_limit: self.history_limit,
			outbox_capacity: self.outbox_capacity,
		}
	}
}

impl Default for ServerConfig {
	fn default() -> Self {
		let settings = CoordinatorSettings::default();
		Self {
			bind: "127.0.0.1:9090".to_string(),
			metrics_bind: None,
			database_url: None,
			default_channel: settings.default_channel,
			edit_window: settings.edit_window,
			history_limit: settings.history_limit,
			outbox_capacity: settings.outbox_capacity,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	bind: Option<String>,
	metrics_bind: Option<String>,
	database_url: Option<String>,
	default_channel: Option<String>,
	edit_window_secs: Option<u64>,
	history_limit: Option<usize>,
	outbox_capacity: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let mut cfg = ServerConfig::default();

		if let Some(bind) = file.bind.filter(|s| !s.trim().is_empty()) {
			cfg.bind = bind;
		}
		cfg.metrics_bind = file.metrics_bind.filter(|s| !s.trim().is_empty());
		cfg.database_url = file.database_url.filter(|s| !s.trim().is_empty());
		if let Some(name) = file.default_channel.filter(|s| !s.trim().is_empty()) {
			cfg.default_channel = RoomName::channel(&name).with_context(|| format!("default_channel {name:?}"))?;
		}
		if let Some(secs) = file.edit_window_secs {
			cfg.edit_window = Duration::from_secs(secs);
		}
		if let Some(limit) = file.history_limit.filter(|l| *l > 0) {
			cfg.history_limit = limit;
		}
		if let Some(capacity) = file.outbox_capacity.filter(|c| *c > 0) {
			cfg.outbox_capacity = capacity;
		}

		Ok(cfg)
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
	if let Ok(v) = std::env::var("PARLEY_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bind = v;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.database_url = Some(v);
			info!("server config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_DEFAULT_CHANNEL") {
		match RoomName::channel(v.trim()) {
			Ok(room) => {
				cfg.default_channel = room;
				info!("server config: default_channel overridden by env");
			}
			Err(e) => tracing::warn!(error = %e, "PARLEY_DEFAULT_CHANNEL is not a valid channel name; ignored"),
		}
	}

	if let Ok(v) = std::env::var("PARLEY_EDIT_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.edit_window = Duration::from_secs(secs);
		info!(secs, "server config: edit_window overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_HISTORY_LIMIT")
		&& let Ok(limit) = v.trim().parse::<usize>()
		&& limit > 0
	{
		cfg.history_limit = limit;
		info!(limit, "server config: history_limit overridden by env");
	}

	if let Ok(v) = std::env::var("PARLEY_OUTBOX_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.outbox_capacity = capacity;
		info!(capacity, "server config: outbox_capacity overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_sane() {
		let cfg = ServerConfig::default();
		assert_eq!(cfg.bind, "127.0.0.1:9090");
		assert_eq!(cfg.default_channel.as_str(), "#general");
		assert_eq!(cfg.edit_window, Duration::from_secs(24 * 60 * 60));
		assert_eq!(cfg.history_limit, 100);
	}

	#[test]
	fn file_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r##"
			bind = "0.0.0.0:7000"
			default_channel = "#lobby"
			edit_window_secs = 60
			history_limit = 10
			"##,
		)
		.unwrap();
		let cfg = ServerConfig::from_file(file).unwrap();
		assert_eq!(cfg.bind, "0.0.0.0:7000");
		assert_eq!(cfg.default_channel.as_str(), "#lobby");
		assert_eq!(cfg.edit_window, Duration::from_secs(60));
		assert_eq!(cfg.history_limit, 10);
	}

	#[test]
	fn invalid_default_channel_is_rejected() {
		let file: FileConfig = toml::from_str(r#"default_channel = "dm:a:b""#).unwrap();
		assert!(ServerConfig::from_file(file).is_err());
	}
}
