//! Wallet synchronizer and integration point for all sync components.
//!
//! This module defines the `WalletSynchronizer`, which owns the lifecycle of a sync run. It
//! resolves where the previous run left off, initializes the wallet backend when needed, and then
//! keeps a fixed set of sibling tasks alive for the rest of the run:
//!
//! - the block processor consuming the download stream (inside the lifecycle task itself)
//! - the progress monitor, requesting a scan once the download catches up
//! - the transaction monitor, refreshing the balance when the transaction list changes
//! - the transaction repository's and transaction manager's own loops
//!
//! Every task runs in one [`TaskGroup`]. A failing task never takes its siblings down; its error
//! is routed to the synchronizer's error handling, which either lets the registered listener
//! recover from it or stops the whole run and retains the failure.

use crate::wallet::sync::{
    collaborators::{
        ActiveTransactionManager, CompactBlockDownloader, CompactBlockProcessor,
        TransactionRepository, WalletBackend,
    },
    config::SyncConfig,
    error_handler::{ErrorHandler, ErrorListener, FailureOutcome},
    progress_monitor::ProgressMonitor,
    state::{StateResolver, SyncState},
    task_group::{FailureHandler, TaskGroup},
    transaction_monitor::TransactionMonitor,
};
use crate::wallet::{
    AccountId, ActiveTransaction, AddressType, BlockHeight, SendRequest, SyncStatus,
    WalletBalance, WalletSyncError, WalletTransaction,
};

use futures_util::FutureExt;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The components a synchronizer drives.
///
/// They are shared, not owned: stopping the synchronizer stops their work but leaves the values
/// usable by whoever else holds them.
#[derive(Clone)]
pub struct SyncCollaborators {
    pub downloader: Arc<dyn CompactBlockDownloader>,
    pub processor: Arc<dyn CompactBlockProcessor>,
    pub repository: Arc<dyn TransactionRepository>,
    pub transactions: Arc<dyn ActiveTransactionManager>,
    pub backend: Arc<dyn WalletBackend>,
}

/// Outcome of the state resolution performed by `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Snapshot {
    Pending,
    Resolved(SyncState),
    Failed,
}

struct SynchronizerInner {
    downloader: Arc<dyn CompactBlockDownloader>,
    processor: Arc<dyn CompactBlockProcessor>,
    repository: Arc<dyn TransactionRepository>,
    transactions: Arc<dyn ActiveTransactionManager>,
    backend: Arc<dyn WalletBackend>,
    config: SyncConfig,

    /// Created by the one and only `start()`.
    lifecycle: OnceLock<TaskGroup>,
    initial_state: watch::Sender<Snapshot>,
    status: watch::Sender<SyncStatus>,
    stopped: AtomicBool,
    errors: ErrorHandler,
}

/// Keeps a light wallet synchronized with the chain.
///
/// A synchronizer is started at most once. After [`stop`](Self::stop), or after an unrecovered
/// failure, a new instance has to be built to synchronize again.
#[derive(Clone)]
pub struct WalletSynchronizer {
    inner: Arc<SynchronizerInner>,
}

impl WalletSynchronizer {
    pub fn new(collaborators: SyncCollaborators, config: SyncConfig) -> Self {
        let SyncCollaborators {
            downloader,
            processor,
            repository,
            transactions,
            backend,
        } = collaborators;

        Self {
            inner: Arc::new(SynchronizerInner {
                downloader,
                processor,
                repository,
                transactions,
                backend,
                config,
                lifecycle: OnceLock::new(),
                initial_state: watch::Sender::new(Snapshot::Pending),
                status: watch::Sender::new(SyncStatus::Stopped),
                stopped: AtomicBool::new(false),
                errors: ErrorHandler::new(),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Start synchronizing as a child of `parent`.
    ///
    /// Must be called from within a Tokio runtime. Cancelling `parent` tears the run down, but
    /// failures inside the run never propagate to it. Fails with
    /// [`WalletSyncError::AlreadyStarted`] on every call after the first.
    pub fn start(&self, parent: &CancellationToken) -> Result<&Self, WalletSyncError> {
        if self.inner.lifecycle.get().is_some() {
            return Err(WalletSyncError::AlreadyStarted);
        }
        tokio::runtime::Handle::try_current().map_err(|_| WalletSyncError::NoRuntime)?;

        let weak = Arc::downgrade(&self.inner);
        let on_failure: FailureHandler = Arc::new(move |failure: WalletSyncError| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.on_failure(failure).await,
                    None => warn!("Synchronizer dropped before handling failure: {}", failure),
                }
            }
            .boxed()
        });

        let tasks = TaskGroup::new(parent, on_failure);
        self.inner
            .lifecycle
            .set(tasks.clone())
            .map_err(|_| WalletSyncError::AlreadyStarted)?;

        self.inner.errors.clear();
        self.inner.status.send_replace(SyncStatus::Initializing);
        info!("Starting wallet synchronizer");

        let inner = self.inner.clone();
        let lifecycle = tasks.clone();
        tasks.spawn("lifecycle", async move { inner.run(lifecycle).await });

        // parent cancellation shuts the collaborators down like an explicit stop
        let weak = Arc::downgrade(&self.inner);
        tasks.on_cancelled(async move {
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.stop().await {
                    warn!("Failed to stop after cancellation: {}", e);
                }
            }
        });

        Ok(self)
    }

    /// Stop every collaborator, then cancel all supervised tasks.
    ///
    /// Only the first call performs the shutdown; later calls return immediately. Calling it
    /// before [`start`](Self::start) is an error.
    pub async fn stop(&self) -> Result<(), WalletSyncError> {
        self.inner.stop().await
    }

    /// Wait until the run has been stopped and every supervised task has exited.
    pub async fn closed(&self) -> Result<(), WalletSyncError> {
        let tasks = self
            .inner
            .lifecycle
            .get()
            .ok_or(WalletSyncError::NotStarted)?;
        tasks.closed().await;
        Ok(())
    }

    /// Outbound transactions, as their state changes.
    pub fn active_transactions(&self) -> BoxStream<'static, ActiveTransaction> {
        self.inner.transactions.subscribe()
    }

    pub fn all_transactions(&self) -> BoxStream<'static, Vec<WalletTransaction>> {
        self.inner.repository.all_transactions()
    }

    /// Download progress in percent.
    pub fn progress(&self) -> BoxStream<'static, u8> {
        self.inner.downloader.progress()
    }

    pub fn balance(&self) -> BoxStream<'static, WalletBalance> {
        self.inner.backend.balance()
    }

    /// Current status followed by every change.
    pub fn status(&self) -> BoxStream<'static, SyncStatus> {
        WatchStream::new(self.inner.status.subscribe()).boxed()
    }

    /// Whether local data lags the remote tip by more than the configured tolerance.
    pub async fn is_stale(&self) -> Result<bool, WalletSyncError> {
        let downloader = self.inner.downloader.clone();
        let processor = self.inner.processor.clone();
        let (remote, local) = tokio::task::spawn_blocking(move || {
            Ok::<_, WalletSyncError>((
                downloader.latest_remote_height()?,
                processor.last_processed_height()?,
            ))
        })
        .await
        .map_err(|e| WalletSyncError::TaskPanicked {
            task: "staleness-check",
            message: e.to_string(),
        })??;

        let behind = remote.saturating_sub(local);
        debug!(remote, local, behind, "Checked staleness");
        Ok(behind > self.inner.config.staleness_tolerance)
    }

    /// Whether this run started without usable persisted state.
    ///
    /// Answers from the state resolved at start, waiting for the resolution if it is still in
    /// progress. Later changes to the stores do not affect the answer. Fails with
    /// [`WalletSyncError::NotRunning`] if the resolution failed or the run ended before it
    /// finished.
    pub async fn is_first_run(&self) -> Result<bool, WalletSyncError> {
        let tasks = self
            .inner
            .lifecycle
            .get()
            .ok_or(WalletSyncError::NotStarted)?;
        let token = tasks.token();
        let mut resolution = self.inner.initial_state.subscribe();

        tokio::select! {
            biased;
            snapshot = resolution.wait_for(|snapshot| *snapshot != Snapshot::Pending) => {
                let snapshot = snapshot.map_err(|_| WalletSyncError::NotRunning)?;
                match *snapshot {
                    Snapshot::Resolved(state) => Ok(state.is_first_run()),
                    Snapshot::Pending | Snapshot::Failed => Err(WalletSyncError::NotRunning),
                }
            }
            _ = token.cancelled() => Err(WalletSyncError::NotRunning),
        }
    }

    /// Address of `account`, or of the first account.
    pub async fn get_address(&self, account: Option<AccountId>) -> Result<String, WalletSyncError> {
        self.ensure_running()?;
        self.inner
            .backend
            .get_address(account.unwrap_or_default())
            .await
    }

    pub async fn send_to_address(
        &self,
        amount: u64,
        to_address: &str,
        memo: Option<String>,
        from_account: Option<AccountId>,
    ) -> Result<ActiveTransaction, WalletSyncError> {
        self.ensure_running()?;
        if amount == 0 {
            return Err(WalletSyncError::InvalidAmount(amount));
        }

        let request = SendRequest {
            amount,
            to_address: to_address.to_string(),
            memo,
            from_account: from_account.unwrap_or_default(),
        };
        info!(
            "Sending {} zatoshi from {} to {}",
            request.amount, request.from_account, request.to_address
        );
        self.inner.transactions.send_to_address(request).await
    }

    /// Cancel a send. Returns `false` if the transaction was already submitted.
    pub async fn cancel_send(&self, transaction: &ActiveTransaction) -> Result<bool, WalletSyncError> {
        self.ensure_running()?;
        let cancelled = self.inner.transactions.cancel(transaction).await?;
        info!(id = %transaction.id, cancelled, "Cancel requested");
        Ok(cancelled)
    }

    pub async fn validate_address(&self, address: &str) -> Result<AddressType, WalletSyncError> {
        self.inner.backend.validate_address(address).await
    }

    /// Register, replace or remove the error listener.
    ///
    /// If the run was already shut down by a failure, the new listener is invoked with it
    /// immediately.
    pub fn set_error_listener(&self, listener: Option<ErrorListener>) {
        self.inner.errors.set_listener(listener);
    }

    /// The failure that shut the run down, if any.
    pub fn failure(&self) -> Option<Arc<WalletSyncError>> {
        self.inner.errors.failure()
    }

    fn ensure_running(&self) -> Result<(), WalletSyncError> {
        let tasks = self
            .inner
            .lifecycle
            .get()
            .ok_or(WalletSyncError::NotStarted)?;
        if self.inner.stopped.load(Ordering::SeqCst) || tasks.is_cancelled() {
            return Err(WalletSyncError::NotRunning);
        }
        Ok(())
    }
}

impl SynchronizerInner {
    /// Body of the lifecycle task.
    async fn run(self: Arc<Self>, tasks: TaskGroup) -> Result<(), WalletSyncError> {
        let resolver = StateResolver::new(self.processor.clone(), self.repository.clone());
        let resolved = tokio::task::spawn_blocking(move || resolver.resolve())
            .await
            .map_err(|e| WalletSyncError::TaskPanicked {
                task: "state-resolver",
                message: e.to_string(),
            })
            .and_then(|resolved| resolved);
        let state = match resolved {
            Ok(state) => state,
            Err(e) => {
                self.initial_state.send_replace(Snapshot::Failed);
                return Err(e);
            }
        };
        self.initial_state.send_replace(Snapshot::Resolved(state));

        let start_height = match state {
            SyncState::FirstRun => {
                info!("No usable wallet state, initializing from scratch");
                self.backend.initialize(None).await?
            }
            SyncState::CacheOnly { start_height } => {
                info!("Found cached blocks up to {}, initializing wallet", start_height);
                self.backend.initialize(Some(start_height)).await?
            }
            SyncState::ReadyToProcess { start_height } => start_height,
        };

        self.run_sync(&tasks, start_height).await
    }

    async fn run_sync(
        self: &Arc<Self>,
        tasks: &TaskGroup,
        start_height: BlockHeight,
    ) -> Result<(), WalletSyncError> {
        info!("Synchronizing from height {}", start_height);
        let blocks = self.downloader.start(
            tasks.token(),
            start_height,
            self.config.batch_size,
            self.config.poll_interval(),
        );
        self.status.send_replace(SyncStatus::Syncing);

        let progress = ProgressMonitor::new(
            self.downloader.progress(),
            self.processor.clone(),
            self.config.scan_delay(),
        );
        let inner = self.clone();
        tasks.spawn("progress-monitor", async move {
            if progress.run().await? {
                inner.status.send_if_modified(|status| {
                    let caught_up = *status == SyncStatus::Syncing;
                    if caught_up {
                        *status = SyncStatus::Synced;
                    }
                    caught_up
                });
            }
            Ok(())
        });

        let monitor =
            TransactionMonitor::new(self.repository.all_transactions(), self.backend.clone());
        tasks.spawn("transaction-monitor", async move {
            monitor.run().await.map(|_| ())
        });

        let manager = self.transactions.clone();
        tasks.spawn("transaction-manager", async move { manager.start().await });

        let repository = self.repository.clone();
        let token = tasks.token();
        tasks.spawn("transaction-repository", async move {
            repository.start(token).await
        });

        self.processor.process_blocks(blocks).await?;
        info!("Block stream ended");
        Ok(())
    }

    async fn on_failure(&self, failure: WalletSyncError) {
        // collaborators may error out of their loops while being stopped
        if self.stopped.load(Ordering::SeqCst) {
            debug!("Ignoring failure after stop: {}", failure);
            return;
        }

        match self.errors.consult(&failure) {
            FailureOutcome::Recovered => {}
            FailureOutcome::Unrecovered => {
                if let Err(e) = self.stop().await {
                    warn!("Failed to stop after unrecovered failure: {}", e);
                }
                self.errors.retain(failure);
            }
        }
    }

    async fn stop(&self) -> Result<(), WalletSyncError> {
        let tasks = self.lifecycle.get().ok_or(WalletSyncError::NotStarted)?;
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Synchronizer already stopped");
            return Ok(());
        }

        info!("Stopping wallet synchronizer");
        if let Err(e) = self.downloader.stop().await {
            warn!("Failed to stop downloader: {}", e);
        }
        if let Err(e) = self.repository.stop().await {
            warn!("Failed to stop transaction repository: {}", e);
        }
        if let Err(e) = self.transactions.stop().await {
            warn!("Failed to stop transaction manager: {}", e);
        }

        tasks.cancel();
        self.status.send_replace(SyncStatus::Stopped);
        info!("Wallet synchronizer stopped");
        Ok(())
    }
}
