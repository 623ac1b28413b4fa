use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, filter::Directive};

use light_wallet_sync::utils::{ZATOSHI_DECIMALS, format_token_amount};
use light_wallet_sync::wallet::simulated::{
	SimulatedBackend, SimulatedChain, SimulatedDownloader, SimulatedProcessor,
	SimulatedRepository, SimulatedTransactionManager,
};
use light_wallet_sync::wallet::sync::{SyncCollaborators, SyncConfig, WalletSynchronizer};
use light_wallet_sync::wallet::{SyncStatus, WalletSyncError};

/// Path of an optional JSON configuration file
const CONFIG_ENV: &str = "WALLET_SYNC_CONFIG";

#[tokio::main(flavor = "current_thread")]
async fn main() {
	let mut filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
	match "light_wallet_sync=debug".parse::<Directive>() {
		Ok(directive) => filter = filter.add_directive(directive),
		Err(e) => eprintln!("Ignoring invalid log directive: {}", e),
	}
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let config = match std::env::var(CONFIG_ENV) {
		Ok(path) => match SyncConfig::from_json_file(&path) {
			Ok(config) => config,
			Err(e) => {
				error!("Failed to load configuration from {}: {}", path, e);
				return;
			}
		},
		Err(_) => SyncConfig::default(),
	};
	info!("Starting wallet sync with {:?}", config);

	let chain = SimulatedChain::new(2_500, 2_000);
	let repository = Arc::new(SimulatedRepository::new());
	let synchronizer = WalletSynchronizer::new(
		SyncCollaborators {
			downloader: Arc::new(SimulatedDownloader::new(chain.clone())),
			processor: Arc::new(SimulatedProcessor::new(chain.clone(), repository.clone())),
			repository: repository.clone(),
			transactions: Arc::new(SimulatedTransactionManager::new()),
			backend: Arc::new(SimulatedBackend::new(chain, repository)),
		},
		config,
	);

	synchronizer.set_error_listener(Some(Arc::new(|failure: &WalletSyncError| {
		error!("Wallet sync failed: {}", failure);
		false
	})));

	let shutdown = CancellationToken::new();
	if let Err(e) = synchronizer.start(&shutdown) {
		error!("Failed to start wallet sync: {}", e);
		return;
	}

	let mut balance = synchronizer.balance();
	tokio::spawn(async move {
		while let Some(balance) = balance.next().await {
			info!(
				"Balance: {} available of {} total",
				format_token_amount(balance.available, ZATOSHI_DECIMALS),
				format_token_amount(balance.total, ZATOSHI_DECIMALS),
			);
		}
	});

	let address = match synchronizer.get_address(None).await {
		Ok(address) => address,
		Err(e) => {
			error!("Failed to derive wallet address: {}", e);
			return;
		}
	};
	info!("Wallet address: {}", address);

	let mut statuses = synchronizer.status();
	let synced = tokio::select! {
		status = async {
			while let Some(status) = statuses.next().await {
				if matches!(status, SyncStatus::Synced | SyncStatus::Stopped) {
					return status;
				}
			}
			SyncStatus::Stopped
		} => status == SyncStatus::Synced,
		_ = tokio::signal::ctrl_c() => {
			info!("Interrupted");
			false
		}
	};

	if synced {
		match synchronizer.is_stale().await {
			Ok(stale) => info!("Wallet synchronized (stale: {})", stale),
			Err(e) => warn!("Staleness check failed: {}", e),
		}
		send_and_cancel(&synchronizer, &address).await;
	}

	if let Err(e) = synchronizer.stop().await {
		error!("Failed to stop wallet sync: {}", e);
	}
	if let Err(e) = synchronizer.closed().await {
		error!("Failed to wait for shutdown: {}", e);
	}
	if let Some(failure) = synchronizer.failure() {
		error!("Wallet sync ended with failure: {}", failure);
	}
}

/// Create a send to our own address and cancel it before it is submitted.
async fn send_and_cancel(synchronizer: &WalletSynchronizer, address: &str) {
	let amount = 10u64.pow(ZATOSHI_DECIMALS) / 2;
	let transaction = match synchronizer
		.send_to_address(amount, address, Some("self transfer".to_string()), None)
		.await
	{
		Ok(transaction) => transaction,
		Err(e) => {
			error!("Failed to create transaction: {}", e);
			return;
		}
	};
	info!(
		"Created transaction {} for {}",
		transaction.id,
		format_token_amount(transaction.amount, ZATOSHI_DECIMALS)
	);

	match synchronizer.cancel_send(&transaction).await {
		Ok(true) => info!("Cancelled transaction {}", transaction.id),
		Ok(false) => info!("Transaction {} was already submitted", transaction.id),
		Err(e) => error!("Failed to cancel transaction: {}", e),
	}
}
