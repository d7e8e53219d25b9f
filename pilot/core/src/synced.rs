use std::sync::Arc;
use tokio::sync::watch;

/// Publishes that a loop has completed its first full sync.
#[derive(Clone, Debug)]
pub struct SyncedTx(Arc<watch::Sender<bool>>);

/// Observes whether a loop has completed its first full sync.
#[derive(Clone, Debug)]
pub struct Synced(watch::Receiver<bool>);

// === impl SyncedTx ===

impl Default for SyncedTx {
    fn default() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }
}

impl SyncedTx {
    /// Marks the loop as synced, returning false if it already was.
    pub fn mark(&self) -> bool {
        self.0.send_if_modified(|synced| {
            if *synced {
                return false;
            }
            *synced = true;
            true
        })
    }

    pub fn is_synced(&self) -> bool {
        *self.0.borrow()
    }

    pub fn subscribe(&self) -> Synced {
        Synced(self.0.subscribe())
    }
}

// === impl Synced ===

impl Synced {
    /// A handle that is synced from the start, for loops with no initial
    /// state to load.
    pub fn ready() -> Self {
        Self(watch::channel(true).1)
    }

    pub fn is_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Completes once the loop is synced.
    ///
    /// If the publishing loop goes away without syncing, this never completes;
    /// callers bound it with a timeout.
    pub async fn wait(mut self) {
        if self.0.wait_for(|synced| *synced).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[tokio::test]
    async fn wait_completes_after_mark() {
        let tx = SyncedTx::default();
        let synced = tx.subscribe();
        assert!(!synced.is_synced());
        assert!(synced.clone().wait().now_or_never().is_none());

        assert!(tx.mark());
        assert!(!tx.mark());
        assert!(synced.is_synced());
        synced.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wait_pends_when_publisher_is_dropped() {
        let tx = SyncedTx::default();
        let synced = tx.subscribe();
        drop(tx);
        let res = tokio::time::timeout(std::time::Duration::from_secs(1), synced.wait()).await;
        assert!(res.is_err(), "wait must not complete without a sync");
    }
}
