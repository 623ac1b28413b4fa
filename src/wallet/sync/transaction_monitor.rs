use crate::wallet::sync::collaborators::WalletBackend;
use crate::wallet::{WalletSyncError, WalletTransaction};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use tracing::{debug, info};

/// Refreshes the balance whenever the wallet's transaction list changes.
///
/// Repositories may re-emit an unchanged list (for example after every poll), so consecutive
/// equal lists are collapsed before the backend is asked to recompute.
pub struct TransactionMonitor {
	transactions: BoxStream<'static, Vec<WalletTransaction>>,
	backend: Arc<dyn WalletBackend>,
}

impl TransactionMonitor {
	pub fn new(
		transactions: BoxStream<'static, Vec<WalletTransaction>>,
		backend: Arc<dyn WalletBackend>,
	) -> Self {
		Self {
			transactions,
			backend,
		}
	}

	/// Run until the transaction stream ends. Returns the number of balance refreshes requested.
	pub async fn run(mut self) -> Result<usize, WalletSyncError> {
		let mut last: Option<Vec<WalletTransaction>> = None;
		let mut refreshes = 0;

		while let Some(transactions) = self.transactions.next().await {
			if last.as_ref() == Some(&transactions) {
				debug!("Transaction list unchanged, skipping balance refresh");
				continue;
			}

			info!(
				"Transaction list changed ({} transactions), refreshing balance",
				transactions.len()
			);
			self.backend.send_balance_info().await?;
			refreshes += 1;
			last = Some(transactions);
		}

		debug!("Transaction stream ended after {} balance refreshes", refreshes);
		Ok(refreshes)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::wallet::simulated::{SimulatedBackend, SimulatedChain, SimulatedRepository};

	fn tx(id: &str, value: i64) -> WalletTransaction {
		WalletTransaction {
			id: id.to_string(),
			mined_height: Some(10),
			value,
			memo: None,
			block_time: None,
		}
	}

	fn backend() -> Arc<SimulatedBackend> {
		Arc::new(SimulatedBackend::new(
			SimulatedChain::new(100, 0),
			Arc::new(SimulatedRepository::new()),
		))
	}

	#[tokio::test]
	async fn refreshes_once_per_distinct_list() {
		let backend = backend();
		let a = tx("aa", 5_000);
		let b = tx("bb", -1_000);
		let emissions = vec![vec![a.clone()], vec![a.clone()], vec![a, b]];

		let monitor =
			TransactionMonitor::new(futures_util::stream::iter(emissions).boxed(), backend.clone());
		assert_eq!(monitor.run().await.unwrap(), 2);
		assert_eq!(backend.balance_refreshes(), 2);
	}

	#[tokio::test]
	async fn reverting_to_an_earlier_list_counts_as_a_change() {
		let backend = backend();
		let a = vec![tx("aa", 5_000)];
		let empty = Vec::new();
		let emissions = vec![empty.clone(), a, empty];

		let monitor =
			TransactionMonitor::new(futures_util::stream::iter(emissions).boxed(), backend.clone());
		assert_eq!(monitor.run().await.unwrap(), 3);
	}

	#[tokio::test]
	async fn backend_failure_stops_the_monitor() {
		let backend = backend();
		backend.fail_balance_refresh("keys locked");
		let monitor = TransactionMonitor::new(
			futures_util::stream::iter(vec![vec![tx("aa", 1)]]).boxed(),
			backend.clone(),
		);
		assert!(matches!(
			monitor.run().await,
			Err(WalletSyncError::BackendError(_))
		));
	}
}
