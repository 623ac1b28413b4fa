//! Supervised task group.
//!
//! Every long-running part of a sync run is spawned through a [`TaskGroup`]. Tasks share one
//! cancellation scope but are otherwise isolated: when a task fails or panics its error is handed
//! to the group's failure handler, and its siblings keep running. Only cancelling the group tears
//! every task down together.

use crate::wallet::WalletSyncError;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Receives the failure of any task in the group.
pub type FailureHandler = Arc<dyn Fn(WalletSyncError) -> BoxFuture<'static, ()> + Send + Sync>;

/// A set of sibling tasks sharing one cancellation scope
#[derive(Clone)]
pub struct TaskGroup {
	token: CancellationToken,
	tracker: TaskTracker,
	on_failure: FailureHandler,
}

impl TaskGroup {
	/// Create a group whose scope is a child of `parent`.
	///
	/// Cancelling `parent` cancels the group, but a failure inside the group never reaches
	/// `parent`.
	pub fn new(parent: &CancellationToken, on_failure: FailureHandler) -> Self {
		Self {
			token: parent.child_token(),
			tracker: TaskTracker::new(),
			on_failure,
		}
	}

	/// The group's cancellation scope, for collaborators that take a token.
	pub fn token(&self) -> CancellationToken {
		self.token.clone()
	}

	pub fn is_cancelled(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Spawn a named task into the group.
	///
	/// The task is dropped at its next suspension point once the group is cancelled. Tasks
	/// spawned after cancellation never run.
	pub fn spawn<F>(&self, name: &'static str, task: F)
	where
		F: Future<Output = Result<(), WalletSyncError>> + Send + 'static,
	{
		let token = self.token.clone();
		let on_failure = self.on_failure.clone();

		self.tracker.spawn(async move {
			let outcome = tokio::select! {
				biased;
				_ = token.cancelled() => {
					debug!(task = name, "Task cancelled");
					return;
				}
				outcome = AssertUnwindSafe(task).catch_unwind() => outcome,
			};

			let failure = match outcome {
				Ok(Ok(())) => {
					debug!(task = name, "Task finished");
					return;
				}
				Ok(Err(e)) => WalletSyncError::TaskFailed {
					task: name,
					source: Box::new(e),
				},
				Err(panic) => {
					warn!(task = name, "Task panicked");
					WalletSyncError::TaskPanicked {
						task: name,
						message: panic_message(panic),
					}
				}
			};

			on_failure(failure).await;
		});
	}

	/// Run `task` once the group is cancelled, whether directly or through its parent.
	///
	/// [`closed`](Self::closed) waits for it like any other task.
	pub fn on_cancelled<F>(&self, task: F)
	where
		F: Future<Output = ()> + Send + 'static,
	{
		let token = self.token.clone();
		self.tracker.spawn(async move {
			token.cancelled().await;
			task.await;
		});
	}

	/// Cancel every task in the group. No task spawned afterwards will run.
	pub fn cancel(&self) {
		self.token.cancel();
		self.tracker.close();
	}

	/// Wait until the group is cancelled and all of its tasks have exited.
	pub async fn closed(&self) {
		self.token.cancelled().await;
		// cancelled through the parent scope
		self.tracker.close();
		self.tracker.wait().await;
	}

	#[cfg(test)]
	fn len(&self) -> usize {
		self.tracker.len()
	}

	#[cfg(test)]
	fn is_empty(&self) -> bool {
		self.tracker.is_empty()
	}
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
	match panic.downcast::<String>() {
		Ok(message) => *message,
		Err(panic) => match panic.downcast::<&str>() {
			Ok(message) => message.to_string(),
			Err(_) => "unknown panic payload".to_string(),
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::time::Duration;
	use tokio::sync::mpsc;

	fn recording_group(
		parent: &CancellationToken,
	) -> (TaskGroup, mpsc::UnboundedReceiver<String>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let handler: FailureHandler = Arc::new(move |e: WalletSyncError| {
			let _ = tx.send(e.to_string());
			async {}.boxed()
		});
		(TaskGroup::new(parent, handler), rx)
	}

	#[tokio::test(start_paused = true)]
	async fn failing_task_does_not_cancel_siblings() {
		let parent = CancellationToken::new();
		let (group, mut failures) = recording_group(&parent);
		let sibling_finished = Arc::new(AtomicBool::new(false));

		group.spawn("failing", async {
			Err(WalletSyncError::DownloadError("boom".into()))
		});
		let flag = sibling_finished.clone();
		group.spawn("sibling", async move {
			tokio::time::sleep(Duration::from_secs(5)).await;
			flag.store(true, Ordering::SeqCst);
			Ok(())
		});

		tokio::time::sleep(Duration::from_secs(10)).await;
		assert!(sibling_finished.load(Ordering::SeqCst));
		assert!(!group.is_cancelled());
		assert!(!parent.is_cancelled());
		assert_eq!(failures.try_recv().unwrap(), "Task `failing` failed");
		assert!(failures.try_recv().is_err());
	}

	#[tokio::test]
	async fn panics_are_reported_with_their_message() {
		let parent = CancellationToken::new();
		let (group, mut failures) = recording_group(&parent);

		group.spawn("panicking", async {
			if true {
				panic!("intentionally panic");
			}
			Ok(())
		});

		let message = failures.recv().await.unwrap();
		assert_eq!(message, "Task `panicking` panicked: intentionally panic");
	}

	#[tokio::test(start_paused = true)]
	async fn parent_cancellation_stops_all_tasks() {
		let parent = CancellationToken::new();
		let (group, mut failures) = recording_group(&parent);

		for name in ["first", "second"] {
			group.spawn(name, async {
				futures_util::future::pending::<()>().await;
				Ok(())
			});
		}
		tokio::task::yield_now().await;
		assert_eq!(group.len(), 2);

		parent.cancel();
		group.closed().await;
		assert!(group.is_empty());
		assert!(failures.try_recv().is_err());
	}

	#[tokio::test]
	async fn cancellation_hook_runs_before_closed_returns() {
		let parent = CancellationToken::new();
		let (group, _failures) = recording_group(&parent);
		let hooked = Arc::new(AtomicBool::new(false));

		let flag = hooked.clone();
		group.on_cancelled(async move {
			tokio::task::yield_now().await;
			flag.store(true, Ordering::SeqCst);
		});
		tokio::task::yield_now().await;
		assert!(!hooked.load(Ordering::SeqCst));

		parent.cancel();
		group.closed().await;
		assert!(hooked.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn tasks_spawned_after_cancel_never_run() {
		let parent = CancellationToken::new();
		let (group, _) = recording_group(&parent);
		group.cancel();

		let ran = Arc::new(AtomicBool::new(false));
		let flag = ran.clone();
		group.spawn("late", async move {
			flag.store(true, Ordering::SeqCst);
			Ok(())
		});
		group.closed().await;
		assert!(!ran.load(Ordering::SeqCst));
	}
}
