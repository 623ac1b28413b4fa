//! Contracts the synchronizer requires of the components it drives.
//!
//! The synchronizer never owns the resources behind these traits. Implementations are shared as
//! `Arc<dyn Trait>` and may be used by other parts of the application at the same time.
//!
//! Methods documented as *blocking* perform store or network reads synchronously. The
//! synchronizer only ever calls them from Tokio's blocking pool.

use crate::wallet::{
	AccountId, ActiveTransaction, AddressType, BlockHeight, CompactBlock, SendRequest,
	WalletBalance, WalletSyncError, WalletTransaction,
};

use futures_util::stream::BoxStream;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stream of downloaded compact blocks, ending when the download is cancelled or fails.
pub type BlockStream = BoxStream<'static, Result<CompactBlock, WalletSyncError>>;

/// Fetches compact blocks from a remote node
#[async_trait::async_trait]
pub trait CompactBlockDownloader: Send + Sync {
	/// Begin downloading from `start_height` in batches of `batch_size`, polling the remote tip
	/// every `poll_interval` once caught up.
	fn start(
		&self,
		cancel: CancellationToken,
		start_height: BlockHeight,
		batch_size: u64,
		poll_interval: Duration,
	) -> BlockStream;

	/// Download progress in percent, `0..=100`.
	fn progress(&self) -> BoxStream<'static, u8>;

	/// Stop downloading. Resolves once no further blocks will be emitted.
	async fn stop(&self) -> Result<(), WalletSyncError>;

	/// Latest height known to the remote node. Blocking.
	fn latest_remote_height(&self) -> Result<BlockHeight, WalletSyncError>;
}

/// Persists downloaded blocks and scans them for wallet activity
#[async_trait::async_trait]
pub trait CompactBlockProcessor: Send + Sync {
	/// Consume the block stream until it ends or fails.
	async fn process_blocks(&self, blocks: BlockStream) -> Result<(), WalletSyncError>;

	/// Run one scan pass over everything persisted so far.
	async fn scan_blocks(&self) -> Result<(), WalletSyncError>;

	/// Whether the indexed-data store exists. Blocking.
	fn indexed_store_exists(&self) -> Result<bool, WalletSyncError>;

	/// Whether the raw block cache exists. Blocking.
	fn cache_store_exists(&self) -> Result<bool, WalletSyncError>;

	/// Highest height fully processed into the indexed store. Blocking.
	fn last_processed_height(&self) -> Result<BlockHeight, WalletSyncError>;

	/// Highest height present in the raw cache, `0` when empty. Blocking.
	fn cache_latest_height(&self) -> Result<BlockHeight, WalletSyncError>;
}

/// Queryable and streamable view of the wallet's transactions
#[async_trait::async_trait]
pub trait TransactionRepository: Send + Sync {
	/// Run the repository's own refresh loop until `cancel` fires.
	async fn start(&self, cancel: CancellationToken) -> Result<(), WalletSyncError>;

	/// Stop the refresh loop. Resolves once pending writes have landed.
	async fn stop(&self) -> Result<(), WalletSyncError>;

	/// Current transaction list followed by every later change.
	fn all_transactions(&self) -> BoxStream<'static, Vec<WalletTransaction>>;

	/// Whether the indexed store has been initialized for this wallet. Blocking.
	fn is_initialized(&self) -> Result<bool, WalletSyncError>;

	/// Highest height scanned for wallet activity. Blocking.
	fn last_scanned_height(&self) -> Result<BlockHeight, WalletSyncError>;
}

/// Tracks outbound transactions until they are confirmed
#[async_trait::async_trait]
pub trait ActiveTransactionManager: Send + Sync {
	/// Run the manager's own loop until cancelled.
	async fn start(&self) -> Result<(), WalletSyncError>;

	/// Stop the manager. Resolves once its state is persisted.
	async fn stop(&self) -> Result<(), WalletSyncError>;

	/// Every state change of every active transaction.
	fn subscribe(&self) -> BoxStream<'static, ActiveTransaction>;

	async fn send_to_address(
		&self,
		request: SendRequest,
	) -> Result<ActiveTransaction, WalletSyncError>;

	/// Cancel a transaction. Returns `false` if it was already submitted.
	async fn cancel(&self, transaction: &ActiveTransaction) -> Result<bool, WalletSyncError>;
}

/// Holds key material and derives addresses and balances
#[async_trait::async_trait]
pub trait WalletBackend: Send + Sync {
	/// One-time initialization. Returns the height downloading should start from, adjusted from
	/// `start_height` when given, or chosen by the backend otherwise.
	async fn initialize(
		&self,
		start_height: Option<BlockHeight>,
	) -> Result<BlockHeight, WalletSyncError>;

	async fn get_address(&self, account: AccountId) -> Result<String, WalletSyncError>;

	/// Current balance followed by every recomputed balance.
	fn balance(&self) -> BoxStream<'static, WalletBalance>;

	/// Recompute the balance and publish it on the balance stream.
	async fn send_balance_info(&self) -> Result<(), WalletSyncError>;

	async fn validate_address(&self, address: &str) -> Result<AddressType, WalletSyncError>;
}
