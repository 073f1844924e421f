//! Watcher: observes multiple children concurrently and funnels "exited"
//! events onto a single restart channel.

use crate::process::SupervisedProcess;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

/// A child that exited, as reported to the Supervisor's watch loop.
pub struct RestartSignal {
    pub name: String,
}

struct WatchEntry {
    stop_tx: Option<oneshot::Sender<()>>,
    /// Fires once the watched child has actually finished: a `Stop(name)`
    /// completion strictly happens-after the child has ended.
    done_rx: Option<oneshot::Receiver<()>>,
}

/// Watches a set of [`SupervisedProcess`] handles, at most one entry per
/// name, and publishes at most one event per observed exit onto a shared
/// queue.
pub struct Watcher {
    entries: Arc<Mutex<HashMap<String, WatchEntry>>>,
    restart_tx: mpsc::UnboundedSender<RestartSignal>,
    restart_rx: Mutex<mpsc::UnboundedReceiver<RestartSignal>>,
}

impl Watcher {
    pub fn new() -> Self {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        Watcher {
            entries: Arc::new(Mutex::new(HashMap::new())),
            restart_tx,
            restart_rx: Mutex::new(restart_rx),
        }
    }

    /// Starts observing `process` under `name`. If an entry already exists
    /// for `name`, logs a warning and returns without touching it.
    pub async fn add(&self, name: String, process: Arc<dyn SupervisedProcess>) {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&name) {
            warn!(%name, "a watcher for this process already exists");
            return;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        entries.insert(
            name.clone(),
            WatchEntry {
                stop_tx: Some(stop_tx),
                done_rx: Some(done_rx),
            },
        );
        drop(entries);

        let restart_tx = self.restart_tx.clone();
        let entries_for_task = self.entries.clone();
        let waiter_name = name.clone();

        tokio::spawn(async move {
            info!(name = %waiter_name, "starting watcher");
            let wait_fut = process.wait();
            tokio::pin!(wait_fut);

            tokio::select! {
                result = &mut wait_fut => {
                    match result {
                        Ok(outcome) => info!(name = %waiter_name, success = outcome.success, "process exited"),
                        Err(error) => warn!(name = %waiter_name, %error, "error waiting on process"),
                    }
                    let _ = done_tx.send(());
                    entries_for_task.lock().await.remove(&waiter_name);
                    let _ = restart_tx.send(RestartSignal { name: waiter_name });
                }
                _ = &mut stop_rx => {
                    // Cancelled: drain the exit out-of-band, report done, no restart.
                    let _ = wait_fut.await;
                    let _ = done_tx.send(());
                    entries_for_task.lock().await.remove(&waiter_name);
                }
            }
        });
    }

    /// Cancels the pending observation of `name`, if any. Returns a
    /// completion receiver that resolves once the child has actually ended.
    pub async fn stop(&self, name: &str) -> Option<oneshot::Receiver<()>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(name)?;
        let stop_tx = entry.stop_tx.take()?;
        let done_rx = entry.done_rx.take();
        info!(%name, "stopping watcher");
        let _ = stop_tx.send(());
        done_rx
    }

    /// Pulls the next restart event. `None` once every sender has dropped
    /// (the Watcher itself, in practice this never happens before shutdown).
    pub async fn next_event(&self) -> Option<RestartSignal> {
        self.restart_rx.lock().await.recv().await
    }
}

impl Default for Watcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeProcess;
    use crate::process::ProcessSpec;
    use std::path::PathBuf;

    fn spec() -> ProcessSpec {
        ProcessSpec::new(std::path::Path::new("/tmp/s"), "a", PathBuf::from("/bin/true"), vec![])
    }

    #[tokio::test]
    async fn exit_produces_exactly_one_event() {
        let watcher = Watcher::new();
        let process = Arc::new(FakeProcess::new(10));
        process.start(&spec()).await.unwrap();
        watcher.add("a".to_string(), process.clone()).await;

        process.kill_externally(Some(1)).await;
        let event = watcher.next_event().await.unwrap();
        assert_eq!(event.name, "a");
    }

    #[tokio::test]
    async fn stop_suppresses_restart_event() {
        let watcher = Watcher::new();
        let process = Arc::new(FakeProcess::new(11));
        process.start(&spec()).await.unwrap();
        watcher.add("a".to_string(), process.clone()).await;

        let done = watcher.stop("a").await.expect("entry exists");
        process.graceful_stop().unwrap();
        done.await.unwrap();

        // No restart signal should ever arrive for this name.
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), watcher.next_event()).await;
        assert!(result.is_err(), "expected no restart event after Stop");
    }

    #[tokio::test]
    async fn duplicate_add_is_ignored() {
        let watcher = Watcher::new();
        let process = Arc::new(FakeProcess::new(12));
        process.start(&spec()).await.unwrap();
        watcher.add("a".to_string(), process.clone()).await;
        watcher.add("a".to_string(), process.clone()).await;

        {
            let entries = watcher.entries.lock().await;
            assert_eq!(entries.len(), 1);
        }
    }
}
