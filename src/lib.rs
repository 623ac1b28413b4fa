pub mod utils;
pub mod wallet;

pub use wallet::sync::{SyncCollaborators, SyncConfig, WalletSynchronizer};
pub use wallet::{SyncStatus, WalletSyncError};
