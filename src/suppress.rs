use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Paths the executor is currently mutating locally. Watcher events for
/// these paths (and anything beneath them) are echoes of our own work
/// and must be discarded. Entries expire after a quiescence window so
/// trailing modify events are swallowed too.
#[derive(Clone, Default)]
pub struct SuppressionSet {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

/// Far-future hold used while a mutation is still in flight.
const HOLD: Duration = Duration::from_secs(60 * 60);

impl SuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a path suppressed until explicitly released.
    pub fn hold(&self, path: &str) {
        self.entries
            .lock()
            .insert(path.to_string(), Instant::now() + HOLD);
    }

    /// Re-arms the entry to expire after the quiescence window instead
    /// of holding forever. Called when the local mutation completes.
    pub fn release_after(&self, path: &str, quiescence: Duration) {
        self.entries
            .lock()
            .insert(path.to_string(), Instant::now() + quiescence);
    }

    /// True if `path` equals or lives beneath any live entry. Expired
    /// entries are purged on the way through.
    pub fn is_suppressed(&self, path: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, expiry| *expiry > now);
        entries
            .keys()
            .any(|held| path == held || path.starts_with(&format!("{held}/")))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
