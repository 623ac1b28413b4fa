use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Height of a block on the remote chain.
pub type BlockHeight = u64;

/// Sentinel start height meaning "unknown, let the wallet backend pick".
pub const UNKNOWN_HEIGHT: BlockHeight = BlockHeight::MAX;

/// Index of a wallet account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub u32);

impl AccountId {
	/// The account used whenever a caller does not name one.
	pub const FIRST: AccountId = AccountId(0);
}

impl Default for AccountId {
	fn default() -> Self {
		Self::FIRST
	}
}

impl std::fmt::Display for AccountId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "account#{}", self.0)
	}
}

/// Size-reduced block as delivered by the downloader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactBlock {
	pub height: BlockHeight,
	/// Hex encoded block hash
	pub hash: String,
	/// Opaque compact payload handed to the processor
	pub data: Vec<u8>,
}

/// A wallet transaction as exposed by the transaction repository.
///
/// Equality is structural; the transaction monitor relies on it to collapse repeated emissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
	/// Hex encoded transaction id
	pub id: String,
	/// Height at which the transaction was mined, `None` while unmined
	pub mined_height: Option<BlockHeight>,
	/// Net value in zatoshi, negative for outgoing transfers
	pub value: i64,
	pub memo: Option<String>,
	pub block_time: Option<DateTime<Utc>>,
}

/// Balance snapshot published by the wallet backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
	/// Total balance in zatoshi, including unconfirmed change
	pub total: u64,
	/// Spendable balance in zatoshi
	pub available: u64,
}

/// Lifecycle stage of an outbound transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActiveTransactionState {
	/// Built locally, not yet handed to the network
	Created,
	/// Submitted to the network, awaiting confirmation
	Submitted,
	/// Mined at the given height
	Confirmed(BlockHeight),
	/// Cancelled before submission
	Cancelled,
	/// Could not be built or submitted
	Failed(String),
}

/// An outbound transaction tracked by the transaction-lifecycle manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTransaction {
	pub id: String,
	pub amount: u64,
	pub to_address: String,
	pub memo: Option<String>,
	pub from_account: AccountId,
	pub state: ActiveTransactionState,
	pub created_at: DateTime<Utc>,
}

impl ActiveTransaction {
	/// Whether the transaction has left the device.
	pub fn is_submitted(&self) -> bool {
		matches!(
			self.state,
			ActiveTransactionState::Submitted | ActiveTransactionState::Confirmed(_)
		)
	}
}

/// Request to spend funds from one of the wallet's accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
	/// Amount in zatoshi, always positive
	pub amount: u64,
	pub to_address: String,
	pub memo: Option<String>,
	pub from_account: AccountId,
}

/// Kind of a validated address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
	Shielded,
	Transparent,
}

/// Coarse status of the synchronizer, published as a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
	/// Not started, or shut down
	#[default]
	Stopped,
	/// Resolving persisted state and initializing the wallet backend
	Initializing,
	/// Downloading and processing blocks
	Syncing,
	/// Download finished and the proactive scan completed
	Synced,
}

/// Error types for the wallet synchronizer
#[derive(Debug, thiserror::Error)]
pub enum WalletSyncError {
	#[error("Synchronizer has already been started")]
	AlreadyStarted,

	#[error("Synchronizer has not been started")]
	NotStarted,

	#[error("Synchronizer is not running")]
	NotRunning,

	#[error("Synchronizer must be started from within a Tokio runtime")]
	NoRuntime,

	#[error("Invalid amount: {0} (must be greater than zero)")]
	InvalidAmount(u64),

	#[error("Failed to resolve sync state")]
	ResolutionFailed(#[source] Box<WalletSyncError>),

	#[error("Storage error: {0}")]
	StorageError(String),

	#[error("Download error: {0}")]
	DownloadError(String),

	#[error("Processing error: {0}")]
	ProcessingError(String),

	#[error("Wallet backend error: {0}")]
	BackendError(String),

	#[error("Transaction error: {0}")]
	TransactionError(String),

	#[error("Address error: {0}")]
	AddressError(String),

	#[error("Task `{task}` failed")]
	TaskFailed {
		task: &'static str,
		#[source]
		source: Box<WalletSyncError>,
	},

	#[error("Task `{task}` panicked: {message}")]
	TaskPanicked { task: &'static str, message: String },

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Config error: {0}")]
	ConfigError(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn task_failure_keeps_its_cause() {
		use std::error::Error;

		let err = WalletSyncError::TaskFailed {
			task: "downloader",
			source: Box::new(WalletSyncError::DownloadError("connection reset".into())),
		};
		assert_eq!(err.to_string(), "Task `downloader` failed");
		let cause = err.source().expect("wrapped cause");
		assert_eq!(cause.to_string(), "Download error: connection reset");
	}

	#[test]
	fn submitted_transactions() {
		let mut tx = ActiveTransaction {
			id: "ab".into(),
			amount: 1,
			to_address: "zs1".into(),
			memo: None,
			from_account: AccountId::FIRST,
			state: ActiveTransactionState::Created,
			created_at: Utc::now(),
		};
		assert!(!tx.is_submitted());
		tx.state = ActiveTransactionState::Submitted;
		assert!(tx.is_submitted());
		tx.state = ActiveTransactionState::Confirmed(10);
		assert!(tx.is_submitted());
		tx.state = ActiveTransactionState::Cancelled;
		assert!(!tx.is_submitted());
	}
}
