//! Peer configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// TOML syntax or schema error.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// Error reading a configuration file.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path to the file that failed to read.
		path: PathBuf,
		/// The underlying I/O error.
		error: std::io::Error,
	},

	/// A value is out of its allowed range.
	#[error("invalid value for {field}: {reason}")]
	Invalid {
		/// Offending field.
		field: &'static str,
		/// Why the value was rejected.
		reason: &'static str,
	},
}

/// Tunables of one peer.
///
/// ```toml
/// default_timeout_ms = 30000
/// prefetch = 64
/// channel_pool_size = 8
/// cache_sweep_interval_ms = 300000
/// drain_timeout_ms = 10000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerConfig {
	/// Deadline applied to calls whose context has none.
	pub default_timeout_ms: u64,
	/// Maximum number of concurrently running handlers per inbox.
	pub prefetch: usize,
	/// Maximum number of outbound transport channels.
	pub channel_pool_size: usize,
	/// Interval of the remote catalog cache sweep.
	pub cache_sweep_interval_ms: u64,
	/// How long a graceful close waits for in-flight work.
	pub drain_timeout_ms: u64,
}

impl Default for PeerConfig {
	fn default() -> Self {
		Self {
			default_timeout_ms: 30_000,
			prefetch: 64,
			channel_pool_size: 8,
			cache_sweep_interval_ms: 5 * 60 * 1000,
			drain_timeout_ms: 10_000,
		}
	}
}

impl PeerConfig {
	/// Parses a TOML document; missing fields keep their defaults.
	pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(source)?;
		config.validate()
	}

	/// Reads and parses a TOML file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let source = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::from_toml_str(&source)
	}

	fn validate(self) -> Result<Self, ConfigError> {
		if self.prefetch == 0 {
			return Err(ConfigError::Invalid {
				field: "prefetch",
				reason: "must be at least 1",
			});
		}
		if self.channel_pool_size == 0 {
			return Err(ConfigError::Invalid {
				field: "channel_pool_size",
				reason: "must be at least 1",
			});
		}
		if self.cache_sweep_interval_ms == 0 {
			return Err(ConfigError::Invalid {
				field: "cache_sweep_interval_ms",
				reason: "must be positive",
			});
		}
		Ok(self)
	}

	/// Sets the default call timeout.
	#[must_use]
	pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
		self.default_timeout_ms = millis(timeout);
		self
	}

	/// Sets the handler prefetch.
	#[must_use]
	pub fn with_prefetch(mut self, prefetch: usize) -> Self {
		self.prefetch = prefetch.max(1);
		self
	}

	/// Sets the channel pool size.
	#[must_use]
	pub fn with_channel_pool_size(mut self, size: usize) -> Self {
		self.channel_pool_size = size.max(1);
		self
	}

	/// Sets the cache sweep interval.
	#[must_use]
	pub fn with_cache_sweep_interval(mut self, interval: Duration) -> Self {
		self.cache_sweep_interval_ms = millis(interval).max(1);
		self
	}

	/// Sets the drain timeout.
	#[must_use]
	pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
		self.drain_timeout_ms = millis(timeout);
		self
	}

	/// Default call timeout.
	#[must_use]
	pub fn default_timeout(&self) -> Duration {
		Duration::from_millis(self.default_timeout_ms)
	}

	/// Cache sweep interval.
	#[must_use]
	pub fn cache_sweep_interval(&self) -> Duration {
		Duration::from_millis(self.cache_sweep_interval_ms)
	}

	/// Drain timeout.
	#[must_use]
	pub fn drain_timeout(&self) -> Duration {
		Duration::from_millis(self.drain_timeout_ms)
	}
}

fn millis(duration: Duration) -> u64 {
	u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn empty_document_yields_defaults() {
		assert_eq!(PeerConfig::from_toml_str("").unwrap(), PeerConfig::default());
	}

	#[test]
	fn fields_override_defaults() {
		let config = PeerConfig::from_toml_str("prefetch = 4\ndefault_timeout_ms = 250\n").unwrap();
		assert_eq!(config.prefetch, 4);
		assert_eq!(config.default_timeout(), Duration::from_millis(250));
		assert_eq!(config.channel_pool_size, 8);
	}

	#[test]
	fn rejects_unknown_fields_and_zero_prefetch() {
		assert!(matches!(PeerConfig::from_toml_str("prefech = 4"), Err(ConfigError::Toml(_))));
		assert!(matches!(
			PeerConfig::from_toml_str("prefetch = 0"),
			Err(ConfigError::Invalid { field: "prefetch", .. })
		));
	}
}
