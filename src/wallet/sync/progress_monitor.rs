//! Proactive scan trigger.
//!
//! The processor scans on its own schedule. When the download catches up with the remote tip the
//! wallet would otherwise wait for that schedule before the balance reflects the new blocks, so
//! the `ProgressMonitor` watches download progress and requests one scan as soon as it reaches
//! 100%.

use crate::wallet::WalletSyncError;
use crate::wallet::sync::collaborators::CompactBlockProcessor;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Progress value at which the download is complete.
pub const DOWNLOAD_COMPLETE: u8 = 100;

/// Log progress every this many percent.
const LOG_STEP: u8 = 10;

/// Fire-once scan trigger driven by download progress
pub struct ProgressMonitor {
    progress: BoxStream<'static, u8>,
    processor: Arc<dyn CompactBlockProcessor>,
    scan_delay: Duration,
}

impl ProgressMonitor {
    pub fn new(
        progress: BoxStream<'static, u8>,
        processor: Arc<dyn CompactBlockProcessor>,
        scan_delay: Duration,
    ) -> Self {
        Self {
            progress,
            processor,
            scan_delay,
        }
    }

    /// Consume progress until the download completes, then scan once.
    ///
    /// Returns `true` if the scan ran, `false` if the progress stream ended first.
    pub async fn run(mut self) -> Result<bool, WalletSyncError> {
        let mut next_log = 0u8;

        while let Some(progress) = self.progress.next().await {
            if progress >= next_log {
                info!("Download progress: {}%", progress.min(DOWNLOAD_COMPLETE));
                next_log = progress.saturating_add(LOG_STEP);
            }

            if progress >= DOWNLOAD_COMPLETE {
                debug!(
                    "Download complete, scanning in {} ms",
                    self.scan_delay.as_millis()
                );
                tokio::time::sleep(self.scan_delay).await;
                self.processor.scan_blocks().await?;
                info!("Proactive scan finished");
                return Ok(true);
            }
        }

        debug!("Progress stream ended before the download completed");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::simulated::{SimulatedChain, SimulatedProcessor, SimulatedRepository};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn processor() -> Arc<SimulatedProcessor> {
        let chain = SimulatedChain::new(100, 0);
        Arc::new(SimulatedProcessor::new(
            chain,
            Arc::new(SimulatedRepository::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn scans_once_after_delay() {
        let processor = processor();
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = ProgressMonitor::new(
            UnboundedReceiverStream::new(rx).boxed(),
            processor.clone(),
            Duration::from_millis(1_000),
        );
        let handle = tokio::spawn(monitor.run());

        for value in [0, 40, 99] {
            tx.send(value).unwrap();
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(processor.scan_calls(), 0);

        tx.send(100).unwrap();
        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(processor.scan_calls(), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(processor.scan_calls(), 1);

        // later completions are ignored
        let _ = tx.send(100);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(processor.scan_calls(), 1);
        assert!(handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn incomplete_download_never_scans() {
        let processor = processor();
        let monitor = ProgressMonitor::new(
            futures_util::stream::iter([10u8, 50, 90]).boxed(),
            processor.clone(),
            Duration::ZERO,
        );
        assert!(!monitor.run().await.unwrap());
        assert_eq!(processor.scan_calls(), 0);
    }

    #[tokio::test]
    async fn scan_failure_is_returned() {
        let processor = processor();
        processor.fail_scans("scan aborted");
        let monitor = ProgressMonitor::new(
            futures_util::stream::iter([100u8]).boxed(),
            processor.clone(),
            Duration::ZERO,
        );
        assert!(matches!(
            monitor.run().await,
            Err(WalletSyncError::ProcessingError(_))
        ));
    }
}
