use crate::wallet::WalletSyncError;

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the synchronizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Number of blocks requested per download batch
	pub batch_size: u64,
	/// How often the downloader polls the remote tip once caught up
	pub poll_interval_ms: u64,
	/// Delay between download completion and the proactive scan
	pub scan_delay_ms: u64,
	/// Block delta above which local data is considered stale
	pub staleness_tolerance: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			batch_size: 100,
			poll_interval_ms: 75_000,
			scan_delay_ms: 1_000,
			staleness_tolerance: 10,
		}
	}
}

impl SyncConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn scan_delay(&self) -> Duration {
		Duration::from_millis(self.scan_delay_ms)
	}

	/// Load a configuration from a JSON file. Missing fields take their default values.
	pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, WalletSyncError> {
		let content = std::fs::read_to_string(path.as_ref())?;
		let config: SyncConfig = serde_json::from_str(&content).map_err(|e| {
			WalletSyncError::ConfigError(format!(
				"Failed to parse {}: {}",
				path.as_ref().display(),
				e
			))
		})?;
		config.validate()?;
		Ok(config)
	}

	/// Reject values the synchronizer cannot run with.
	pub fn validate(&self) -> Result<(), WalletSyncError> {
		if self.batch_size == 0 {
			return Err(WalletSyncError::ConfigError(
				"batch_size must be greater than zero".to_string(),
			));
		}
		if self.poll_interval_ms == 0 {
			return Err(WalletSyncError::ConfigError(
				"poll_interval_ms must be greater than zero".to_string(),
			));
		}
		Ok(())
	}
}
