//! Single-slot collapsing queue for MEMORY.md updates.
//!
//! Only the latest turn matters: if a new digest arrives for an agent
//! while another update is running, it overwrites that agent's pending
//! slot. One drainer task serves all slots.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::memory_md::{MemoryMdUpdater, TurnDigest};
use crate::paths::MemoryRoot;

#[derive(Default)]
pub struct UpdateQueue {
    /// agent key → latest pending digest.
    slots: Mutex<HashMap<String, TurnDigest>>,
    notify: Notify,
}

impl UpdateQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue (or replace) the pending update for `agent_key`.
    pub fn submit(&self, agent_key: &str, digest: TurnDigest) {
        let replaced = {
            let mut slots = self.slots.lock();
            slots.insert(agent_key.to_string(), digest).is_some()
        };
        if replaced {
            tracing::debug!(agent_key, "collapsed pending MEMORY.md update");
        }
        self.notify.notify_one();
    }

    fn take_any(&self) -> Option<(String, TurnDigest)> {
        let mut slots = self.slots.lock();
        let key = slots.keys().next().cloned()?;
        let digest = slots.remove(&key)?;
        Some((key, digest))
    }

    /// Number of pending slots (tests / diagnostics).
    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }

    /// Drain slots until cancelled. Each update failure is logged and the
    /// loop continues.
    pub async fn run_drainer(
        self: Arc<Self>,
        updater: Arc<MemoryMdUpdater>,
        root: MemoryRoot,
        cancel: CancellationToken,
    ) {
        loop {
            while let Some((key, digest)) = self.take_any() {
                if let Err(e) = updater.update_from_turn(&root, &digest).await {
                    tracing::warn!(agent_key = %key, error = %e, "MEMORY.md update failed");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.notify.notified() => {}
            }
        }
    }
}
