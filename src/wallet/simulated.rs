//! In-memory collaborators backed by a simulated chain.
//!
//! These implement every collaborator trait the synchronizer drives, keep all of their state in
//! memory, and count the calls made to them. The demo binary runs against them, and the unit
//! tests use them to observe what the synchronizer did.

use crate::wallet::address::WalletAddress;
use crate::wallet::sync::collaborators::{
	ActiveTransactionManager, BlockStream, CompactBlockDownloader, CompactBlockProcessor,
	TransactionRepository, WalletBackend,
};
use crate::wallet::{
	AccountId, ActiveTransaction, ActiveTransactionState, AddressType, BlockHeight,
	CompactBlock, SendRequest, UNKNOWN_HEIGHT, WalletBalance, WalletSyncError, WalletTransaction,
};

use chrono::Utc;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Heights the simulated backend may start from are multiples of this.
pub const CHECKPOINT_INTERVAL: BlockHeight = 100;

/// Every this many blocks the simulated chain pays the wallet.
const DEFAULT_RELEVANT_EVERY: u64 = 25;

/// Amount received in every wallet-relevant block.
const SIMULATED_PAYMENT: i64 = 10_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected<E>(slot: &Mutex<Option<String>>, error: E) -> Result<(), WalletSyncError>
where
	E: FnOnce(String) -> WalletSyncError,
{
	match lock(slot).clone() {
		Some(message) => Err(error(message)),
		None => Ok(()),
	}
}

struct ChainState {
	tip: BlockHeight,
	birthday: BlockHeight,
	relevant_every: u64,
}

/// Shared view of a simulated remote chain
#[derive(Clone)]
pub struct SimulatedChain {
	state: Arc<Mutex<ChainState>>,
}

impl SimulatedChain {
	pub fn new(tip: BlockHeight, birthday: BlockHeight) -> Self {
		Self {
			state: Arc::new(Mutex::new(ChainState {
				tip,
				birthday,
				relevant_every: DEFAULT_RELEVANT_EVERY,
			})),
		}
	}

	/// Make every `every`-th block pay the wallet, `0` for none.
	pub fn with_relevant_every(self, every: u64) -> Self {
		lock(&self.state).relevant_every = every;
		self
	}

	pub fn tip(&self) -> BlockHeight {
		lock(&self.state).tip
	}

	pub fn birthday(&self) -> BlockHeight {
		lock(&self.state).birthday
	}

	/// Mine `blocks` new blocks.
	pub fn advance(&self, blocks: u64) {
		let mut state = lock(&self.state);
		state.tip += blocks;
		debug!("Simulated chain advanced to {}", state.tip);
	}

	pub fn is_relevant(&self, height: BlockHeight) -> bool {
		let every = lock(&self.state).relevant_every;
		every > 0 && height % every == 0
	}

	pub fn block(&self, height: BlockHeight) -> CompactBlock {
		let mut hash = [0u8; 32];
		hash[..8].copy_from_slice(&height.to_be_bytes());
		hash[8..16].copy_from_slice(&height.wrapping_mul(0x9e37_79b9_7f4a_7c15).to_le_bytes());
		CompactBlock {
			height,
			hash: hex::encode(hash),
			data: height.to_le_bytes().to_vec(),
		}
	}
}

struct DownloadCursor {
	chain: SimulatedChain,
	cancel: CancellationToken,
	progress: watch::Sender<u8>,
	first: BlockHeight,
	next: BlockHeight,
	batch_size: u64,
	poll_interval: Duration,
	pending: VecDeque<CompactBlock>,
	fail_at: Option<BlockHeight>,
}

impl DownloadCursor {
	fn publish_progress(&self, fetched_to: BlockHeight, tip: BlockHeight) {
		let percent = if tip < self.first || fetched_to >= tip {
			100
		} else {
			let total = tip - self.first + 1;
			let done = fetched_to.saturating_sub(self.first) + 1;
			(done * 100 / total).min(99) as u8
		};
		self.progress.send_replace(percent);
	}

	async fn next_block(&mut self) -> Option<Result<CompactBlock, WalletSyncError>> {
		loop {
			if self.cancel.is_cancelled() {
				return None;
			}
			if let Some(block) = self.pending.pop_front() {
				if Some(block.height) == self.fail_at {
					return Some(Err(WalletSyncError::DownloadError(format!(
						"lost connection while fetching block {}",
						block.height
					))));
				}
				return Some(Ok(block));
			}

			let tip = self.chain.tip();
			if self.next <= tip {
				let end = (self.next + self.batch_size - 1).min(tip);
				self.pending
					.extend((self.next..=end).map(|height| self.chain.block(height)));
				debug!("Fetched batch {}..={} (tip {})", self.next, end, tip);
				self.next = end + 1;
				self.publish_progress(end, tip);
				continue;
			}

			self.publish_progress(tip, tip);
			tokio::select! {
				_ = self.cancel.cancelled() => return None,
				_ = tokio::time::sleep(self.poll_interval) => {}
			}
		}
	}
}

/// Downloader serving blocks from a [`SimulatedChain`]
pub struct SimulatedDownloader {
	chain: SimulatedChain,
	progress: watch::Sender<u8>,
	active: Mutex<Option<CancellationToken>>,
	start_heights: Mutex<Vec<BlockHeight>>,
	stop_calls: AtomicUsize,
	fail_at: Mutex<Option<BlockHeight>>,
	remote_failure: Mutex<Option<String>>,
}

impl SimulatedDownloader {
	pub fn new(chain: SimulatedChain) -> Self {
		Self {
			chain,
			progress: watch::Sender::new(0),
			active: Mutex::new(None),
			start_heights: Mutex::new(Vec::new()),
			stop_calls: AtomicUsize::new(0),
			fail_at: Mutex::new(None),
			remote_failure: Mutex::new(None),
		}
	}

	/// Heights every download was started from.
	pub fn start_heights(&self) -> Vec<BlockHeight> {
		lock(&self.start_heights).clone()
	}

	pub fn stop_calls(&self) -> usize {
		self.stop_calls.load(Ordering::SeqCst)
	}

	/// Make the block stream fail when it reaches `height`.
	pub fn fail_at(&self, height: BlockHeight) {
		*lock(&self.fail_at) = Some(height);
	}

	pub fn fail_remote_height(&self, message: &str) {
		*lock(&self.remote_failure) = Some(message.to_string());
	}
}

#[async_trait::async_trait]
impl CompactBlockDownloader for SimulatedDownloader {
	fn start(
		&self,
		cancel: CancellationToken,
		start_height: BlockHeight,
		batch_size: u64,
		poll_interval: Duration,
	) -> BlockStream {
		info!("Starting simulated download from height {}", start_height);
		lock(&self.start_heights).push(start_height);

		let cancel = cancel.child_token();
		*lock(&self.active) = Some(cancel.clone());

		let cursor = DownloadCursor {
			chain: self.chain.clone(),
			cancel,
			progress: self.progress.clone(),
			first: start_height,
			next: start_height,
			batch_size: batch_size.max(1),
			poll_interval,
			pending: VecDeque::new(),
			fail_at: *lock(&self.fail_at),
		};

		stream::unfold(cursor, |mut cursor| async move {
			let block = cursor.next_block().await?;
			Some((block, cursor))
		})
		.boxed()
	}

	fn progress(&self) -> BoxStream<'static, u8> {
		WatchStream::new(self.progress.subscribe()).boxed()
	}

	async fn stop(&self) -> Result<(), WalletSyncError> {
		self.stop_calls.fetch_add(1, Ordering::SeqCst);
		if let Some(cancel) = lock(&self.active).take() {
			cancel.cancel();
		}
		Ok(())
	}

	fn latest_remote_height(&self) -> Result<BlockHeight, WalletSyncError> {
		injected(&self.remote_failure, WalletSyncError::DownloadError)?;
		Ok(self.chain.tip())
	}
}

#[derive(Default)]
struct Stores {
	indexed_exists: bool,
	cache_exists: bool,
	last_processed: BlockHeight,
	cache_latest: BlockHeight,
	cache: BTreeMap<BlockHeight, CompactBlock>,
}

/// Processor keeping its cache and index in memory
pub struct SimulatedProcessor {
	chain: SimulatedChain,
	repository: Arc<SimulatedRepository>,
	stores: Mutex<Stores>,
	scan_calls: AtomicUsize,
	read_failure: Mutex<Option<String>>,
	scan_failure: Mutex<Option<String>>,
}

impl SimulatedProcessor {
	pub fn new(chain: SimulatedChain, repository: Arc<SimulatedRepository>) -> Self {
		Self {
			chain,
			repository,
			stores: Mutex::new(Stores::default()),
			scan_calls: AtomicUsize::new(0),
			read_failure: Mutex::new(None),
			scan_failure: Mutex::new(None),
		}
	}

	pub fn set_stores(&self, indexed_exists: bool, cache_exists: bool) {
		let mut stores = lock(&self.stores);
		stores.indexed_exists = indexed_exists;
		stores.cache_exists = cache_exists;
	}

	pub fn set_last_processed_height(&self, height: BlockHeight) {
		lock(&self.stores).last_processed = height;
	}

	pub fn set_cache_latest_height(&self, height: BlockHeight) {
		lock(&self.stores).cache_latest = height;
	}

	pub fn scan_calls(&self) -> usize {
		self.scan_calls.load(Ordering::SeqCst)
	}

	/// Number of blocks held in the cache.
	pub fn cached_blocks(&self) -> usize {
		lock(&self.stores).cache.len()
	}

	/// Make every blocking store read fail.
	pub fn fail_reads(&self, message: &str) {
		*lock(&self.read_failure) = Some(message.to_string());
	}

	pub fn fail_scans(&self, message: &str) {
		*lock(&self.scan_failure) = Some(message.to_string());
	}

	fn read<T>(&self, f: impl FnOnce(&Stores) -> T) -> Result<T, WalletSyncError> {
		injected(&self.read_failure, WalletSyncError::StorageError)?;
		Ok(f(&lock(&self.stores)))
	}
}

#[async_trait::async_trait]
impl CompactBlockProcessor for SimulatedProcessor {
	async fn process_blocks(&self, mut blocks: BlockStream) -> Result<(), WalletSyncError> {
		while let Some(block) = blocks.next().await {
			let block = block?;
			let mut stores = lock(&self.stores);
			stores.cache_exists = true;
			stores.indexed_exists = true;
			stores.cache_latest = stores.cache_latest.max(block.height);
			stores.last_processed = stores.last_processed.max(block.height);
			stores.cache.insert(block.height, block);
		}
		debug!("Block stream ended");
		Ok(())
	}

	async fn scan_blocks(&self) -> Result<(), WalletSyncError> {
		self.scan_calls.fetch_add(1, Ordering::SeqCst);
		injected(&self.scan_failure, WalletSyncError::ProcessingError)?;

		let scanned_from = self.repository.last_scanned();
		let (found, scanned_to) = {
			let stores = lock(&self.stores);
			let found: Vec<WalletTransaction> = stores
				.cache
				.range(scanned_from.saturating_add(1)..)
				.filter(|(height, _)| self.chain.is_relevant(**height))
				.map(|(height, block)| WalletTransaction {
					id: block.hash.clone(),
					mined_height: Some(*height),
					value: SIMULATED_PAYMENT,
					memo: None,
					block_time: Some(Utc::now()),
				})
				.collect();
			let scanned_to = stores.cache.keys().next_back().copied().unwrap_or(scanned_from);
			(found, scanned_to)
		};

		info!(
			"Scanned blocks {}..={}, found {} wallet transactions",
			scanned_from.saturating_add(1),
			scanned_to,
			found.len()
		);
		self.repository.record_scan(found, scanned_to);
		Ok(())
	}

	fn indexed_store_exists(&self) -> Result<bool, WalletSyncError> {
		self.read(|stores| stores.indexed_exists)
	}

	fn cache_store_exists(&self) -> Result<bool, WalletSyncError> {
		self.read(|stores| stores.cache_exists)
	}

	fn last_processed_height(&self) -> Result<BlockHeight, WalletSyncError> {
		self.read(|stores| stores.last_processed)
	}

	fn cache_latest_height(&self) -> Result<BlockHeight, WalletSyncError> {
		self.read(|stores| stores.cache_latest)
	}
}

/// Transaction repository holding the wallet's transactions in a watch channel
pub struct SimulatedRepository {
	transactions: watch::Sender<Vec<WalletTransaction>>,
	initialized: AtomicBool,
	last_scanned: AtomicU64,
	start_calls: AtomicUsize,
	stop_calls: AtomicUsize,
}

impl Default for SimulatedRepository {
	fn default() -> Self {
		Self::new()
	}
}

impl SimulatedRepository {
	pub fn new() -> Self {
		Self {
			transactions: watch::Sender::new(Vec::new()),
			initialized: AtomicBool::new(false),
			last_scanned: AtomicU64::new(0),
			start_calls: AtomicUsize::new(0),
			stop_calls: AtomicUsize::new(0),
		}
	}

	pub fn set_initialized(&self, initialized: bool) {
		self.initialized.store(initialized, Ordering::SeqCst);
	}

	pub fn set_last_scanned_height(&self, height: BlockHeight) {
		self.last_scanned.store(height, Ordering::SeqCst);
	}

	pub fn last_scanned(&self) -> BlockHeight {
		self.last_scanned.load(Ordering::SeqCst)
	}

	/// Replace the transaction list, notifying subscribers even if it is unchanged.
	pub fn publish(&self, transactions: Vec<WalletTransaction>) {
		self.transactions.send_replace(transactions);
	}

	pub fn transactions(&self) -> Vec<WalletTransaction> {
		self.transactions.borrow().clone()
	}

	/// Append transactions found by a scan and advance the scanned height.
	pub fn record_scan(&self, found: Vec<WalletTransaction>, scanned_to: BlockHeight) {
		self.last_scanned.fetch_max(scanned_to, Ordering::SeqCst);
		self.transactions.send_modify(|transactions| transactions.extend(found));
	}

	pub fn start_calls(&self) -> usize {
		self.start_calls.load(Ordering::SeqCst)
	}

	pub fn stop_calls(&self) -> usize {
		self.stop_calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl TransactionRepository for SimulatedRepository {
	async fn start(&self, cancel: CancellationToken) -> Result<(), WalletSyncError> {
		self.start_calls.fetch_add(1, Ordering::SeqCst);
		cancel.cancelled().await;
		Ok(())
	}

	async fn stop(&self) -> Result<(), WalletSyncError> {
		self.stop_calls.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	fn all_transactions(&self) -> BoxStream<'static, Vec<WalletTransaction>> {
		WatchStream::new(self.transactions.subscribe()).boxed()
	}

	fn is_initialized(&self) -> Result<bool, WalletSyncError> {
		Ok(self.initialized.load(Ordering::SeqCst))
	}

	fn last_scanned_height(&self) -> Result<BlockHeight, WalletSyncError> {
		Ok(self.last_scanned())
	}
}

/// Transaction-lifecycle manager that never submits on its own; see [`Self::submit`]
pub struct SimulatedTransactionManager {
	updates: broadcast::Sender<ActiveTransaction>,
	transactions: Mutex<HashMap<String, ActiveTransaction>>,
	shutdown: CancellationToken,
	stop_failure: Mutex<Option<String>>,
	start_calls: AtomicUsize,
	stop_calls: AtomicUsize,
}

impl Default for SimulatedTransactionManager {
	fn default() -> Self {
		Self::new()
	}
}

impl SimulatedTransactionManager {
	pub fn new() -> Self {
		let (updates, _) = broadcast::channel(64);
		Self {
			updates,
			transactions: Mutex::new(HashMap::new()),
			shutdown: CancellationToken::new(),
			stop_failure: Mutex::new(None),
			start_calls: AtomicUsize::new(0),
			stop_calls: AtomicUsize::new(0),
		}
	}

	fn update(
		&self,
		id: &str,
		f: impl FnOnce(&mut ActiveTransaction),
	) -> Result<ActiveTransaction, WalletSyncError> {
		let updated = {
			let mut transactions = lock(&self.transactions);
			let transaction = transactions.get_mut(id).ok_or_else(|| {
				WalletSyncError::TransactionError(format!("Unknown transaction {}", id))
			})?;
			f(transaction);
			transaction.clone()
		};
		let _ = self.updates.send(updated.clone());
		Ok(updated)
	}

	/// Hand a created transaction to the (simulated) network.
	pub fn submit(&self, id: &str) -> Result<ActiveTransaction, WalletSyncError> {
		self.update(id, |transaction| {
			if transaction.state == ActiveTransactionState::Created {
				transaction.state = ActiveTransactionState::Submitted;
			}
		})
	}

	/// Make the manager's loop fail when it is stopped.
	pub fn fail_start_on_stop(&self, message: &str) {
		*lock(&self.stop_failure) = Some(message.to_string());
	}

	pub fn start_calls(&self) -> usize {
		self.start_calls.load(Ordering::SeqCst)
	}

	pub fn stop_calls(&self) -> usize {
		self.stop_calls.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl ActiveTransactionManager for SimulatedTransactionManager {
	async fn start(&self) -> Result<(), WalletSyncError> {
		self.start_calls.fetch_add(1, Ordering::SeqCst);
		self.shutdown.cancelled().await;
		injected(&self.stop_failure, WalletSyncError::TransactionError)
	}

	async fn stop(&self) -> Result<(), WalletSyncError> {
		self.stop_calls.fetch_add(1, Ordering::SeqCst);
		self.shutdown.cancel();
		// let the manager's loop observe the shutdown before acknowledging
		tokio::task::yield_now().await;
		Ok(())
	}

	fn subscribe(&self) -> BoxStream<'static, ActiveTransaction> {
		BroadcastStream::new(self.updates.subscribe())
			.filter_map(|update| async move { update.ok() })
			.boxed()
	}

	async fn send_to_address(
		&self,
		request: SendRequest,
	) -> Result<ActiveTransaction, WalletSyncError> {
		let mut id = [0u8; 32];
		rand::rng().fill(&mut id);

		let transaction = ActiveTransaction {
			id: hex::encode(id),
			amount: request.amount,
			to_address: request.to_address,
			memo: request.memo,
			from_account: request.from_account,
			state: ActiveTransactionState::Created,
			created_at: Utc::now(),
		};
		lock(&self.transactions).insert(transaction.id.clone(), transaction.clone());
		let _ = self.updates.send(transaction.clone());
		info!("Created transaction {}", transaction.id);
		Ok(transaction)
	}

	async fn cancel(&self, transaction: &ActiveTransaction) -> Result<bool, WalletSyncError> {
		let mut cancelled = false;
		self.update(&transaction.id, |current| {
			if current.state == ActiveTransactionState::Created {
				current.state = ActiveTransactionState::Cancelled;
				cancelled = true;
			}
		})?;
		Ok(cancelled)
	}
}

/// Wallet backend deriving addresses from a random seed and balances from the repository
pub struct SimulatedBackend {
	chain: SimulatedChain,
	repository: Arc<SimulatedRepository>,
	seed: [u8; 32],
	network: Option<String>,
	balance: watch::Sender<WalletBalance>,
	initialize_calls: Mutex<Vec<Option<BlockHeight>>>,
	refreshes: AtomicUsize,
	refresh_failure: Mutex<Option<String>>,
}

impl SimulatedBackend {
	pub fn new(chain: SimulatedChain, repository: Arc<SimulatedRepository>) -> Self {
		let mut seed = [0u8; 32];
		rand::rng().fill(&mut seed);
		Self {
			chain,
			repository,
			seed,
			network: Some("test".to_string()),
			balance: watch::Sender::new(WalletBalance::default()),
			initialize_calls: Mutex::new(Vec::new()),
			refreshes: AtomicUsize::new(0),
			refresh_failure: Mutex::new(None),
		}
	}

	/// Arguments of every `initialize` call.
	pub fn initialize_calls(&self) -> Vec<Option<BlockHeight>> {
		lock(&self.initialize_calls).clone()
	}

	pub fn balance_refreshes(&self) -> usize {
		self.refreshes.load(Ordering::SeqCst)
	}

	pub fn current_balance(&self) -> WalletBalance {
		*self.balance.borrow()
	}

	pub fn fail_balance_refresh(&self, message: &str) {
		*lock(&self.refresh_failure) = Some(message.to_string());
	}

	fn checkpoint_at_or_below(&self, height: BlockHeight) -> BlockHeight {
		let height = height.min(self.chain.tip());
		(height - height % CHECKPOINT_INTERVAL).max(self.chain.birthday())
	}
}

#[async_trait::async_trait]
impl WalletBackend for SimulatedBackend {
	async fn initialize(
		&self,
		start_height: Option<BlockHeight>,
	) -> Result<BlockHeight, WalletSyncError> {
		lock(&self.initialize_calls).push(start_height);
		let height = match start_height {
			None => self.chain.birthday(),
			Some(UNKNOWN_HEIGHT) => self.checkpoint_at_or_below(self.chain.tip()),
			Some(height) => self.checkpoint_at_or_below(height),
		};
		self.repository.set_initialized(true);
		info!("Initialized wallet, starting at height {}", height);
		Ok(height)
	}

	async fn get_address(&self, account: AccountId) -> Result<String, WalletSyncError> {
		let mut data = self.seed.to_vec();
		data.extend_from_slice(&account.0.to_le_bytes());
		WalletAddress {
			kind: AddressType::Shielded,
			network: self.network.clone(),
			data,
		}
		.encode()
		.map_err(|e| WalletSyncError::AddressError(e.to_string()))
	}

	fn balance(&self) -> BoxStream<'static, WalletBalance> {
		WatchStream::new(self.balance.subscribe()).boxed()
	}

	async fn send_balance_info(&self) -> Result<(), WalletSyncError> {
		self.refreshes.fetch_add(1, Ordering::SeqCst);
		injected(&self.refresh_failure, WalletSyncError::BackendError)?;

		let transactions = self.repository.transactions();
		let total: i64 = transactions.iter().map(|tx| tx.value).sum();
		let available: i64 = transactions
			.iter()
			.filter(|tx| tx.mined_height.is_some())
			.map(|tx| tx.value)
			.sum();
		let balance = WalletBalance {
			total: total.max(0) as u64,
			available: available.max(0) as u64,
		};
		debug!("Publishing balance {:?}", balance);
		self.balance.send_replace(balance);
		Ok(())
	}

	async fn validate_address(&self, address: &str) -> Result<AddressType, WalletSyncError> {
		WalletAddress::decode(address)
			.map(|address| address.kind)
			.map_err(|e| WalletSyncError::AddressError(e.to_string()))
	}
}
