//! Quarantine for freed chunks.
//!
//! A freed chunk stays poisoned and out of circulation until enough newer
//! frees push it out. Frees land in a per-thread batch first; a full batch is
//! spliced into the global FIFO in one lock acquisition, and the global queue
//! evicts its oldest entries once it exceeds its byte budget.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// One quarantined chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantineEntry {
    /// Allocator block, handed back on recycle.
    pub block: usize,
    /// User pointer the chunk was freed through.
    pub user: usize,
    /// Bytes of the block held out of circulation.
    pub size: usize,
}

/// Per-thread staging area. Owned by exactly one thread.
#[derive(Debug, Default)]
pub struct QuarantineBatch {
    entries: Vec<QuarantineEntry>,
    bytes: usize,
}

impl QuarantineBatch {
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
struct GlobalQuarantine {
    queue: VecDeque<QuarantineEntry>,
    bytes: usize,
}

#[derive(Debug)]
pub struct QuarantineQueue {
    max_bytes: usize,
    batch_limit: usize,
    global: Mutex<GlobalQuarantine>,
}

impl QuarantineQueue {
    #[must_use]
    pub fn new(quarantine_size: usize, thread_quarantine_size: usize) -> Self {
        Self {
            max_bytes: quarantine_size,
            batch_limit: thread_quarantine_size.min(quarantine_size),
            global: Mutex::new(GlobalQuarantine::default()),
        }
    }

    #[must_use]
    pub const fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Quarantines `entry`. Returns the entries that fell out of the queue;
    /// the caller recycles them.
    #[must_use]
    pub fn put(&self, batch: &mut QuarantineBatch, entry: QuarantineEntry) -> Vec<QuarantineEntry> {
        if self.max_bytes == 0 {
            return vec![entry];
        }
        batch.entries.push(entry);
        batch.bytes += entry.size;
        if batch.bytes > self.batch_limit {
            self.splice(batch)
        } else {
            Vec::new()
        }
    }

    /// Moves whatever `batch` holds into the global queue.
    #[must_use]
    pub fn drain(&self, batch: &mut QuarantineBatch) -> Vec<QuarantineEntry> {
        if batch.is_empty() {
            return Vec::new();
        }
        self.splice(batch)
    }

    /// Empties the global queue.
    #[must_use]
    pub fn purge(&self) -> Vec<QuarantineEntry> {
        let mut global = self.global.lock();
        global.bytes = 0;
        global.queue.drain(..).collect()
    }

    #[must_use]
    pub fn bytes(&self) -> usize {
        self.global.lock().bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.global.lock().queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn splice(&self, batch: &mut QuarantineBatch) -> Vec<QuarantineEntry> {
        let mut evicted = Vec::new();
        let mut global = self.global.lock();
        global.queue.extend(batch.entries.drain(..));
        global.bytes += std::mem::take(&mut batch.bytes);
        while global.bytes > self.max_bytes {
            let Some(oldest) = global.queue.pop_front() else {
                break;
            };
            global.bytes -= oldest.size;
            evicted.push(oldest);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(block: usize, size: usize) -> QuarantineEntry {
        QuarantineEntry {
            block,
            user: block + 16,
            size,
        }
    }

    #[test]
    fn batch_is_spliced_once_full() {
        let quarantine = QuarantineQueue::new(1000, 100);
        let mut batch = QuarantineBatch::default();
        assert!(quarantine.put(&mut batch, entry(1, 60)).is_empty());
        assert_eq!(quarantine.len(), 0);
        assert!(quarantine.put(&mut batch, entry(2, 60)).is_empty());
        assert!(batch.is_empty());
        assert_eq!(quarantine.len(), 2);
        assert_eq!(quarantine.bytes(), 120);
    }

    #[test]
    fn evicts_oldest_first() {
        let quarantine = QuarantineQueue::new(250, 1);
        let mut batch = QuarantineBatch::default();
        let mut evicted = Vec::new();
        for block in 1..=5 {
            evicted.extend(quarantine.put(&mut batch, entry(block, 100)));
        }
        let blocks: Vec<_> = evicted.iter().map(|e| e.block).collect();
        assert_eq!(blocks, vec![1, 2, 3]);
        assert_eq!(quarantine.bytes(), 200);
        assert_eq!(quarantine.len(), 2);
    }

    #[test]
    fn batch_limit_is_capped_by_global_budget() {
        let quarantine = QuarantineQueue::new(50, 1 << 20);
        let mut batch = QuarantineBatch::default();
        let evicted = quarantine.put(&mut batch, entry(1, 60));
        assert_eq!(evicted, vec![entry(1, 60)]);
        assert_eq!(quarantine.bytes(), 0);
    }

    #[test]
    fn zero_budget_recycles_immediately() {
        let quarantine = QuarantineQueue::new(0, 0);
        let mut batch = QuarantineBatch::default();
        assert_eq!(quarantine.put(&mut batch, entry(7, 8)), vec![entry(7, 8)]);
        assert!(batch.is_empty());
        assert!(quarantine.is_empty());
    }

    #[test]
    fn drain_and_purge() {
        let quarantine = QuarantineQueue::new(1000, 500);
        let mut batch = QuarantineBatch::default();
        assert!(quarantine.put(&mut batch, entry(1, 10)).is_empty());
        assert!(quarantine.put(&mut batch, entry(2, 10)).is_empty());
        assert_eq!(batch.len(), 2);
        assert!(quarantine.drain(&mut batch).is_empty());
        assert_eq!(batch.bytes(), 0);
        assert_eq!(quarantine.len(), 2);
        let purged = quarantine.purge();
        assert_eq!(purged, vec![entry(1, 10), entry(2, 10)]);
        assert_eq!(quarantine.bytes(), 0);
    }
}
