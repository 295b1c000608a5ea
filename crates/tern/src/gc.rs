//! # Garbage Collector
//!
//! Pure reference counting. The export table decides *when* an entry is
//! reclaimed (no peer counts, no pins, not a root); the collector performs the
//! reclamation and keeps the books.
//!
//! There is no cycle detection across the network. A cycle that spans peers
//! is broken when one of the sessions holding it is torn down, because teardown
//! zeroes every count that peer contributed.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::broadcast;

use crate::exports::Exported;
use crate::handles::ObjectId;

const EVENT_CAPACITY: usize = 1024;

/// A snapshot of collector activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Entries reclaimed since the table was created.
    pub reclaimed: u64,
    /// Entries currently in the table, roots included.
    pub live: usize,
}

pub struct Collector {
    reclaimed: AtomicU64,
    events: broadcast::Sender<ObjectId>,
}

impl Collector {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            reclaimed: AtomicU64::new(0),
            events,
        }
    }

    /// Drops the runtime's strong handle on a removed entry.
    ///
    /// Must be called without the export table lock held: dropping a forwarded
    /// proxy re-enters its own session.
    pub(crate) fn reclaim(&self, id: ObjectId, target: Exported) {
        let kind = match &target {
            Exported::Object(o) => o.type_name().to_string(),
            Exported::Proxy(_) => "proxy".to_string(),
        };
        drop(target);
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(object = %id, %kind, "reclaimed exported object");
        let _ = self.events.send(id);
    }

    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Receives the id of every entry reclaimed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ObjectId> {
        self.events.subscribe()
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}
