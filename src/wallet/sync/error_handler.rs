//! Central failure handling for a sync run.
//!
//! Every uncaught failure of every supervised task ends up here. The handler logs the failure
//! with its full cause chain, asks the registered [`ErrorListener`] whether it recovered, and
//! keeps the failure around when it did not, so that listeners registered later still learn
//! about it.

use crate::wallet::WalletSyncError;

use std::error::Error;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

/// Callback consulted on every failure. Returns `true` when the failure has been recovered from
/// and synchronization should carry on.
pub type ErrorListener = Arc<dyn Fn(&WalletSyncError) -> bool + Send + Sync>;

/// What the listener decided about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
	Recovered,
	Unrecovered,
}

#[derive(Default)]
struct ErrorState {
	listener: Option<ErrorListener>,
	failure: Option<Arc<WalletSyncError>>,
}

/// Listener registration and the retained-failure slot
#[derive(Default)]
pub struct ErrorHandler {
	state: Mutex<ErrorState>,
}

impl ErrorHandler {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, ErrorState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Replace the listener.
	///
	/// If a failure is already retained, the new listener is invoked with it immediately. Its
	/// answer is ignored: a retained failure has already shut the run down.
	pub fn set_listener(&self, listener: Option<ErrorListener>) {
		let retained = {
			let mut state = self.state();
			state.listener = listener.clone();
			state.failure.clone()
		};

		if let (Some(listener), Some(failure)) = (listener, retained) {
			info!("Replaying retained failure to newly registered error listener");
			listener(&failure);
		}
	}

	#[cfg(test)]
	fn has_listener(&self) -> bool {
		self.state().listener.is_some()
	}

	/// The retained failure, if the run was shut down by one.
	pub fn failure(&self) -> Option<Arc<WalletSyncError>> {
		self.state().failure.clone()
	}

	pub fn clear(&self) {
		self.state().failure = None;
	}

	/// Keep `failure` unless an earlier one is already retained. Returns the retained failure.
	pub fn retain(&self, failure: WalletSyncError) -> Arc<WalletSyncError> {
		self.state()
			.failure
			.get_or_insert_with(|| Arc::new(failure))
			.clone()
	}

	/// Log `failure` and ask the listener whether it recovered.
	pub fn consult(&self, failure: &WalletSyncError) -> FailureOutcome {
		log_failure(failure);

		let listener = self.state().listener.clone();
		match listener {
			Some(listener) if listener(failure) => {
				info!("Error listener recovered from failure, continuing");
				FailureOutcome::Recovered
			}
			Some(_) => {
				warn!("Error listener did not recover from failure");
				FailureOutcome::Unrecovered
			}
			None => {
				warn!("No error listener registered");
				FailureOutcome::Unrecovered
			}
		}
	}
}

fn log_failure(failure: &WalletSyncError) {
	error!("Synchronizer failure: {}", failure);
	let mut source = failure.source();
	while let Some(cause) = source {
		error!("  caused by: {}", cause);
		source = cause.source();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	fn counting_listener(answer: bool) -> (ErrorListener, Arc<AtomicUsize>) {
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let listener: ErrorListener = Arc::new(move |_: &WalletSyncError| {
			counter.fetch_add(1, Ordering::SeqCst);
			answer
		});
		(listener, calls)
	}

	fn failure() -> WalletSyncError {
		WalletSyncError::TaskFailed {
			task: "processor",
			source: Box::new(WalletSyncError::ProcessingError("bad block".into())),
		}
	}

	#[test]
	fn no_listener_is_unrecovered() {
		let handler = ErrorHandler::new();
		assert_eq!(handler.consult(&failure()), FailureOutcome::Unrecovered);
	}

	#[test]
	fn listener_decides_the_outcome() {
		let handler = ErrorHandler::new();
		let (listener, calls) = counting_listener(true);
		handler.set_listener(Some(listener));
		assert_eq!(handler.consult(&failure()), FailureOutcome::Recovered);

		let (listener, _) = counting_listener(false);
		handler.set_listener(Some(listener));
		assert_eq!(handler.consult(&failure()), FailureOutcome::Unrecovered);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn late_listener_receives_retained_failure() {
		let handler = ErrorHandler::new();
		handler.retain(failure());

		let (listener, calls) = counting_listener(true);
		handler.set_listener(Some(listener));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		// replay does not clear the slot
		assert!(handler.failure().is_some());
	}

	#[test]
	fn listener_without_retained_failure_is_not_invoked() {
		let handler = ErrorHandler::new();
		let (listener, calls) = counting_listener(false);
		handler.set_listener(Some(listener));
		assert_eq!(calls.load(Ordering::SeqCst), 0);
		assert!(handler.has_listener());

		handler.set_listener(None);
		assert!(!handler.has_listener());
	}

	#[test]
	fn first_failure_wins() {
		let handler = ErrorHandler::new();
		handler.retain(failure());
		let retained = handler.retain(WalletSyncError::NotRunning);
		assert!(matches!(&*retained, WalletSyncError::TaskFailed { task: "processor", .. }));
	}

	#[test]
	fn clear_empties_the_slot() {
		let handler = ErrorHandler::new();
		handler.retain(failure());
		handler.clear();
		assert!(handler.failure().is_none());
	}
}
