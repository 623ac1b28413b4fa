//!
//! Utility module for the light wallet.
//!
//! Re-exports formatting helpers and other utility functions for use throughout the codebase.
/// Utility functions for formatting and display
pub mod index;

pub use index::{ZATOSHI_DECIMALS, format_token_amount};
