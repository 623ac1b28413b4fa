//! Cold-start classification.
//!
//! On every start the synchronizer has to work out where a previous run left off. The raw block
//! cache and the indexed store are written by different components and may disagree after an
//! abrupt shutdown, so the resolver reads both and reduces them to a single [`SyncState`].

use crate::wallet::sync::collaborators::{CompactBlockProcessor, TransactionRepository};
use crate::wallet::{BlockHeight, WalletSyncError};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Where synchronization resumes, resolved once per start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Nothing usable has been persisted.
    FirstRun,
    /// Blocks are cached but have never been indexed.
    ///
    /// `start_height` is the last cached height, or [`UNKNOWN_HEIGHT`](crate::wallet::UNKNOWN_HEIGHT).
    CacheOnly { start_height: BlockHeight },
    /// The indexed store is initialized; downloading resumes from `start_height`.
    ReadyToProcess { start_height: BlockHeight },
}

impl SyncState {
    pub fn is_first_run(&self) -> bool {
        matches!(self, SyncState::FirstRun)
    }
}

/// Reads persisted state through the processor and repository
pub struct StateResolver {
    processor: Arc<dyn CompactBlockProcessor>,
    repository: Arc<dyn TransactionRepository>,
}

impl StateResolver {
    pub fn new(
        processor: Arc<dyn CompactBlockProcessor>,
        repository: Arc<dyn TransactionRepository>,
    ) -> Self {
        Self {
            processor,
            repository,
        }
    }

    /// Classify the persisted state.
    ///
    /// Performs blocking reads only; run it on the blocking pool. Any failed read aborts the
    /// resolution without retrying.
    pub fn resolve(&self) -> Result<SyncState, WalletSyncError> {
        self.classify()
            .map_err(|e| WalletSyncError::ResolutionFailed(Box::new(e)))
    }

    fn classify(&self) -> Result<SyncState, WalletSyncError> {
        let indexed_exists = self.processor.indexed_store_exists()?;
        let cache_exists = self.processor.cache_store_exists()?;
        debug!(indexed_exists, cache_exists, "Inspecting persisted stores");

        let state = match (indexed_exists, cache_exists) {
            (false, false) => SyncState::FirstRun,
            (false, true) => {
                let cached_height = self.processor.cache_latest_height()?;
                if cached_height == 0 {
                    SyncState::FirstRun
                } else {
                    SyncState::CacheOnly {
                        start_height: cached_height,
                    }
                }
            }
            (true, _) => {
                let initialized = self.repository.is_initialized()?;
                // The two stores are written independently and can drift apart.
                let start_height = self
                    .processor
                    .last_processed_height()?
                    .max(self.repository.last_scanned_height()?);
                if initialized {
                    SyncState::ReadyToProcess { start_height }
                } else {
                    SyncState::FirstRun
                }
            }
        };

        info!("Resolved sync state: {:?}", state);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::simulated::{SimulatedChain, SimulatedProcessor, SimulatedRepository};

    fn stores() -> (Arc<SimulatedProcessor>, Arc<SimulatedRepository>) {
        let chain = SimulatedChain::new(1_000, 500);
        let repository = Arc::new(SimulatedRepository::new());
        let processor = Arc::new(SimulatedProcessor::new(chain, repository.clone()));
        (processor, repository)
    }

    fn resolve(processor: &Arc<SimulatedProcessor>, repository: &Arc<SimulatedRepository>) -> SyncState {
        StateResolver::new(processor.clone(), repository.clone())
            .resolve()
            .unwrap()
    }

    #[test]
    fn no_stores_is_first_run() {
        let (processor, repository) = stores();
        assert_eq!(resolve(&processor, &repository), SyncState::FirstRun);
    }

    #[test]
    fn empty_cache_is_first_run() {
        let (processor, repository) = stores();
        processor.set_stores(false, true);
        processor.set_cache_latest_height(0);
        assert_eq!(resolve(&processor, &repository), SyncState::FirstRun);
    }

    #[test]
    fn populated_cache_resumes_from_cache() {
        let (processor, repository) = stores();
        processor.set_stores(false, true);
        processor.set_cache_latest_height(640);
        assert_eq!(
            resolve(&processor, &repository),
            SyncState::CacheOnly { start_height: 640 }
        );
    }

    #[test]
    fn uninitialized_index_is_first_run() {
        let (processor, repository) = stores();
        processor.set_stores(true, true);
        processor.set_last_processed_height(700);
        repository.set_initialized(false);
        assert_eq!(resolve(&processor, &repository), SyncState::FirstRun);
    }

    #[test]
    fn ready_uses_processor_height_when_ahead() {
        let (processor, repository) = stores();
        processor.set_stores(true, true);
        processor.set_last_processed_height(720);
        repository.set_initialized(true);
        repository.set_last_scanned_height(710);
        assert_eq!(
            resolve(&processor, &repository),
            SyncState::ReadyToProcess { start_height: 720 }
        );
    }

    #[test]
    fn ready_uses_repository_height_when_ahead() {
        let (processor, repository) = stores();
        processor.set_stores(true, false);
        processor.set_last_processed_height(690);
        repository.set_initialized(true);
        repository.set_last_scanned_height(705);
        assert_eq!(
            resolve(&processor, &repository),
            SyncState::ReadyToProcess { start_height: 705 }
        );
    }

    #[test]
    fn failed_read_is_a_resolution_failure() {
        let (processor, repository) = stores();
        processor.fail_reads("disk unavailable");
        let err = StateResolver::new(processor, repository)
            .resolve()
            .unwrap_err();
        match err {
            WalletSyncError::ResolutionFailed(cause) => {
                assert!(matches!(*cause, WalletSyncError::StorageError(_)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
