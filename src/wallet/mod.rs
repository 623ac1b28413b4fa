pub mod address;
pub mod simulated;
pub mod sync;
pub mod types;

pub use sync::WalletSynchronizer;
pub use types::*;
