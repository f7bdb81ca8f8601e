//! Discovery watcher: membership snapshots in, diff events out.

use courier_core::ClusterDiffEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::{DiscoveryError, Result};
use crate::source::MembershipSource;
use crate::tracker::MembershipTracker;

/// Capacity of the diff event channel.
const EVENT_BUFFER: usize = 16;

/// Watches a [`MembershipSource`] and emits one [`ClusterDiffEvent`] per snapshot.
///
/// The event stream ends when [`close`](Self::close) is called or the
/// observation loop exits (a source error is fatal and is not retried).
/// After `close`, diffs still buffered in the stream are discarded.
pub struct DiscoveryWatcher {
    source: Mutex<Option<Box<dyn MembershipSource>>>,
    tx: Mutex<Option<mpsc::Sender<ClusterDiffEvent>>>,
    rx: Mutex<Option<mpsc::Receiver<ClusterDiffEvent>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DiscoveryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryWatcher").finish_non_exhaustive()
    }
}

impl DiscoveryWatcher {
    /// Create a watcher over `source`. Nothing runs until [`start`](Self::start).
    pub fn new(source: impl MembershipSource) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            source: Mutex::new(Some(Box::new(source))),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the observation loop.
    ///
    /// Only the first call has an effect; later calls return
    /// [`DiscoveryError::AlreadyStarted`].
    pub fn start(&self) -> Result<()> {
        let (Some(source), Some(tx)) = (self.source.lock().take(), self.tx.lock().take()) else {
            return Err(DiscoveryError::AlreadyStarted);
        };
        let handle = tokio::spawn(run(source, tx, self.cancel.clone()));
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Take the diff event stream. Returns `None` after the first call.
    pub fn events(&self) -> Option<DiffEvents> {
        self.rx.lock().take().map(|rx| DiffEvents {
            rx,
            cancel: self.cancel.clone(),
        })
    }

    /// Stop observation and end the event stream. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
        // never started: drop the sender so the stream still terminates
        drop(self.tx.lock().take());
        drop(self.source.lock().take());
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the observation loop to exit.
    pub async fn join(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Diff events from a [`DiscoveryWatcher`].
pub struct DiffEvents {
    rx: mpsc::Receiver<ClusterDiffEvent>,
    cancel: CancellationToken,
}

impl DiffEvents {
    /// Next diff, or `None` once the watcher is closed or its loop has exited.
    pub async fn recv(&mut self) -> Option<ClusterDiffEvent> {
        let event = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            event = self.rx.recv() => event,
        };
        if event.is_none() {
            self.rx.close();
        }
        event
    }
}

impl Drop for DiscoveryWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    mut source: Box<dyn MembershipSource>,
    tx: mpsc::Sender<ClusterDiffEvent>,
    cancel: CancellationToken,
) {
    let mut tracker = MembershipTracker::new();
    info!("discovery watcher started");

    loop {
        let instances = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = source.watch() => match result {
                Ok(instances) => instances,
                Err(e) => {
                    error!(error = %e, "membership watch failed, stopping discovery watcher");
                    break;
                }
            },
        };

        let diff = tracker.update(&instances);
        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            members = tracker.current().len(),
            "membership snapshot"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = tx.send(diff) => if sent.is_err() {
                debug!("diff consumer gone");
                break;
            },
        }
    }

    info!("discovery watcher stopped");
}
