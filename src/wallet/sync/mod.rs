//! Wallet Synchronization Module
//!
//! This module keeps a light wallet synchronized with the chain. It is composed of several
//! submodules, each responsible for a specific aspect of the sync process:
//!
//! - `orchestrator`: The `WalletSynchronizer`, owning the lifecycle of a sync run and the public API.
//! - `state`: Decides where a run resumes from, based on what previous runs persisted.
//! - `task_group`: Supervised, isolated task execution with cooperative cancellation.
//! - `error_handler`: Routes task failures to the registered listener and retains fatal ones.
//! - `progress_monitor`: Requests a scan once the block download has caught up.
//! - `transaction_monitor`: Refreshes the balance when the wallet's transactions change.
//! - `collaborators`: The traits the synchronizer drives (downloader, processor, repositories, backend).
//! - `config`: Tunables for a sync run.

/// External components driven by the synchronizer
pub mod collaborators;
/// Sync run configuration
pub mod config;
/// Failure routing and retention
pub mod error_handler;
/// Main coordinator for the wallet sync process
pub mod orchestrator;
/// Proactive scan trigger
pub mod progress_monitor;
/// Resumption state resolution
pub mod state;
/// Supervised task execution
pub mod task_group;
/// Balance refresh on transaction changes
pub mod transaction_monitor;

pub use collaborators::*;
pub use config::SyncConfig;
pub use error_handler::ErrorListener;
pub use orchestrator::*;
pub use state::SyncState;
