use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Registry of in-flight cancellation tokens keyed by essay id. Entries are
/// inserted when a step starts and removed by the paired guard on every exit
/// path, so a later cancel for a finished essay is a no-op instead of
/// poisoning a reused id. Generations guard against a stale drop removing a
/// newer registration for the same essay.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tasks: DashMap<String, (CancellationToken, u64)>,
    seq: AtomicU64,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for the essay. A stale token left by a previous
    /// run of the same essay is cancelled and replaced.
    pub fn register(&self, essay_id: &str) -> (CancellationToken, RegistryGuard<'_>) {
        let token = CancellationToken::new();
        let generation = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Some((stale, _)) =
            self.tasks.insert(essay_id.to_string(), (token.clone(), generation))
        {
            stale.cancel();
        }
        let guard =
            RegistryGuard { registry: self, essay_id: essay_id.to_string(), generation };
        (token, guard)
    }

    /// Abort whatever is running for the essay. Returns false when nothing
    /// is registered under the id.
    pub fn cancel(&self, essay_id: &str) -> bool {
        match self.tasks.get(essay_id) {
            Some(entry) => {
                entry.value().0.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, essay_id: &str) -> bool {
        self.tasks.contains_key(essay_id)
    }

    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    fn release(&self, essay_id: &str, generation: u64) {
        self.tasks.remove_if(essay_id, |_, (_, current)| *current == generation);
    }
}

/// Removes the registration on drop, which covers success, failure and
/// cancellation alike.
#[derive(Debug)]
pub struct RegistryGuard<'a> {
    registry: &'a CancelRegistry,
    essay_id: String,
    generation: u64,
}

impl Drop for RegistryGuard<'_> {
    fn drop(&mut self) {
        self.registry.release(&self.essay_id, self.generation);
    }
}
