//! Signal assignment for refresh workers
//!
//! Each worker holds at most one claimed signal. A worker asking for work
//! gets the stalest known signal that no other worker has claimed and whose
//! data source no other worker is currently reading, so two workers never
//! hit the same remote endpoint at once.
//!
//! The claim table sits behind one mutex that is held only for the pick and
//! release bookkeeping, never across a fetch.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::CacheManager;
use crate::types::Signal;

/// Hands out signals to workers and tracks their claims
pub struct WorkerScheduler {
    manager: Arc<CacheManager>,
    claims: Mutex<Vec<Option<Signal>>>,
}

impl WorkerScheduler {
    /// Create a scheduler for `workers` workers with ids `0..workers`
    pub fn new(manager: Arc<CacheManager>, workers: usize) -> Self {
        Self {
            manager,
            claims: Mutex::new(vec![None; workers]),
        }
    }

    /// Number of worker slots
    pub fn worker_count(&self) -> usize {
        self.claims.lock().len()
    }

    /// The manager whose signals are scheduled
    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Claim the next signal waiting for removal
    ///
    /// Only worker 0 performs removals; other ids always get `None`. The
    /// signal is claimed so no other worker starts refreshing it meanwhile.
    /// While another worker still holds it, `None` is returned and the
    /// removal waits for a later round.
    pub fn next_pending_removal(&self, worker_id: usize) -> Option<Signal> {
        if worker_id != 0 {
            return None;
        }
        let signal = self.manager.next_pending_removal()?;
        let mut claims = self.claims.lock();
        let held_elsewhere = claims
            .iter()
            .enumerate()
            .any(|(id, claim)| id != worker_id && claim.as_ref() == Some(&signal));
        if held_elsewhere {
            tracing::debug!(signal = %signal, "Removal deferred, signal is being refreshed");
            return None;
        }
        let slot = claims.get_mut(worker_id)?;
        *slot = Some(signal.clone());
        Some(signal)
    }

    /// Claim the stalest signal free for `worker_id`
    ///
    /// Skips signals waiting for removal, signals claimed by another worker
    /// and signals sharing a data source with another worker's claim. Any
    /// previous claim of this worker is replaced.
    pub fn claim_next(&self, worker_id: usize) -> Option<Signal> {
        let removing = self.manager.signals_to_remove();
        let mut candidates = self.manager.signals_with_staleness();
        candidates.retain(|c| !removing.contains(&c.signal));
        candidates.sort_by_key(|c| c.last_attempt);

        let mut claims = self.claims.lock();
        if worker_id >= claims.len() {
            tracing::warn!(worker_id, "Unknown worker id");
            return None;
        }
        claims[worker_id] = None;

        let chosen = candidates.into_iter().map(|c| c.signal).find(|candidate| {
            !claims.iter().flatten().any(|claimed| {
                claimed == candidate || claimed.data_source == candidate.data_source
            })
        })?;
        claims[worker_id] = Some(chosen.clone());
        Some(chosen)
    }

    /// Drop the claim of `worker_id`
    pub fn release(&self, worker_id: usize) {
        if let Some(slot) = self.claims.lock().get_mut(worker_id) {
            *slot = None;
        }
    }

    /// Current claim of every worker, indexed by worker id
    pub fn worker_signals(&self) -> Vec<Option<Signal>> {
        self.claims.lock().clone()
    }
}
