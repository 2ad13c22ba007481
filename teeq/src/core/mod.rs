use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};

use crossbeam_utils::Backoff;
use serde_derive::{Deserialize, Serialize};

use crate::errors::QueueError;
use crate::reader::RecordReader;
use crate::writer::RecordWriter;

pub const DEFAULT_CHUNK_CAPACITY: usize = 100;
pub const DEFAULT_CONSUMERS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Slots per chunk. A chunk is the unit of allocation and reclamation.
    pub chunk_capacity: usize,
    /// Number of readers every record is delivered to.
    pub consumers: usize,
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            consumers: DEFAULT_CONSUMERS,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.chunk_capacity == 0 {
            return Err(QueueError::Config("chunk_capacity must be at least 1".to_string()));
        }
        if self.consumers == 0 {
            return Err(QueueError::Config("consumers must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// One-shot readiness signal. Starts closed, opens once, never closes again.
pub(crate) struct Gate {
    open: AtomicBool,
    // Number of threads parked on `ready`.
    parked: Mutex<usize>,
    ready: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Gate {
        Gate {
            open: AtomicBool::new(false),
            parked: Mutex::new(0),
            ready: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn open(&self) {
        // Storing under the lock keeps a waiter from missing the wakeup
        // between its last check and parking on the condvar.
        let parked = {
            let parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
            self.open.store(true, Ordering::Release);
            *parked
        };
        if parked > 0 {
            self.ready.notify_all();
        }
    }

    pub(crate) fn wait(&self) {
        let backoff = Backoff::new();
        while !self.is_open() {
            if backoff.is_completed() {
                let mut parked = self.parked.lock().unwrap_or_else(PoisonError::into_inner);
                while !self.is_open() {
                    *parked += 1;
                    parked = self.ready.wait(parked).unwrap_or_else(PoisonError::into_inner);
                    *parked -= 1;
                }
                return;
            }
            backoff.snooze();
        }
    }
}

pub(crate) enum Entry {
    Record(Vec<u8>),
    EndOfStream,
}

pub(crate) struct Slot {
    entry: OnceLock<Entry>,
    gate: Gate,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            entry: OnceLock::new(),
            gate: Gate::new(),
        }
    }

    /// Only the writer calls this, and only while the gate is still closed.
    pub(crate) fn put(&self, entry: Entry) {
        let fresh = self.entry.set(entry).is_ok();
        debug_assert!(fresh, "slot written twice");
    }

    pub(crate) fn publish(&self) {
        self.gate.open();
    }

    pub(crate) fn is_published(&self) -> bool {
        self.gate.is_open()
    }

    /// Blocks until the writer publishes this slot.
    pub(crate) fn wait(&self) -> &Entry {
        self.gate.wait();
        match self.entry.get() {
            Some(entry) => entry,
            None => unreachable!("slot published without an entry"),
        }
    }
}

pub(crate) struct Chunk {
    id: usize,
    slots: Box<[Slot]>,
    // Records written so far. The end-of-stream marker is not counted.
    tail: AtomicUsize,
    next: OnceLock<Arc<Chunk>>,
    readers_left: AtomicUsize,
    shared: Arc<Shared>,
}

impl Chunk {
    pub(crate) fn allocate(id: usize, shared: &Arc<Shared>) -> Result<Arc<Chunk>, QueueError> {
        let capacity = shared.chunk_capacity;
        #[cfg(test)]
        {
            if let Some(limit) = shared.allocation_limit {
                if shared.stats.allocated.load(Ordering::Relaxed) >= limit {
                    return Err(QueueError::Allocation { chunk_id: id, capacity });
                }
            }
        }
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| QueueError::Allocation { chunk_id: id, capacity })?;
        slots.extend((0..capacity).map(|_| Slot::new()));

        shared.stats.on_allocated();
        tracing::trace!(chunk = id, capacity, "allocated chunk");
        Ok(Arc::new(Chunk {
            id,
            slots: slots.into_boxed_slice(),
            tail: AtomicUsize::new(0),
            next: OnceLock::new(),
            readers_left: AtomicUsize::new(shared.readers),
            shared: Arc::clone(shared),
        }))
    }

    #[inline]
    pub(crate) fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.slots[index]
    }

    #[inline]
    pub(crate) fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_tail(&self, tail: usize) {
        self.tail.store(tail, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next(&self) -> Option<&Arc<Chunk>> {
        self.next.get()
    }

    pub(crate) fn link(&self, next: Arc<Chunk>) {
        let fresh = self.next.set(next).is_ok();
        debug_assert!(fresh, "chunk linked twice");
    }

    /// Gives up one reader's share of the chunk. Returns true for the reader
    /// whose release brings the share count to zero; that reader reclaims it.
    pub(crate) fn release_reader(&self) -> bool {
        let previous = self.readers_left.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "chunk {} released more times than it has readers", self.id);
        previous == 1
    }

    pub(crate) fn readers_left(&self) -> usize {
        self.readers_left.load(Ordering::Acquire)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        self.shared.stats.on_dropped();
        // Unlink successors one at a time so a long chain cannot recurse.
        let mut next = self.next.take();
        while let Some(chunk) = next {
            match Arc::try_unwrap(chunk) {
                Ok(mut chunk) => next = chunk.next.take(),
                Err(_) => break,
            }
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("capacity", &self.capacity())
            .field("tail", &self.tail())
            .field("readers_left", &self.readers_left())
            .field("linked", &self.next().is_some())
            .finish()
    }
}

#[derive(Default, Debug)]
pub(crate) struct QueueStats {
    allocated: AtomicUsize,
    reclaimed: AtomicUsize,
    dropped: AtomicUsize,
    peak_live: AtomicUsize,
    published: AtomicU64,
}

impl QueueStats {
    fn on_allocated(&self) {
        let allocated = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
        let live = allocated.saturating_sub(self.dropped.load(Ordering::Relaxed));
        self.peak_live.fetch_max(live, Ordering::Relaxed);
    }

    fn on_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_reclaimed(&self) {
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        let allocated = self.allocated.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        StatsSnapshot {
            chunks_allocated: allocated,
            chunks_reclaimed: self.reclaimed.load(Ordering::Relaxed),
            chunks_dropped: dropped,
            live_chunks: allocated.saturating_sub(dropped),
            peak_live_chunks: self.peak_live.load(Ordering::Relaxed),
            records_published: self.published.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub chunks_allocated: usize,
    /// Chunks every reader has passed.
    pub chunks_reclaimed: usize,
    /// Chunks whose memory has actually been released.
    pub chunks_dropped: usize,
    pub live_chunks: usize,
    pub peak_live_chunks: usize,
    pub records_published: u64,
}

/// State shared by the writer, the readers and every chunk.
pub(crate) struct Shared {
    exhausted: AtomicBool,
    pub(crate) readers: usize,
    pub(crate) chunk_capacity: usize,
    pub(crate) stats: QueueStats,
    // Chunks allowed before allocation starts failing.
    #[cfg(test)]
    pub(crate) allocation_limit: Option<usize>,
}

impl Shared {
    fn new(cfg: &QueueConfig) -> Shared {
        Shared {
            exhausted: AtomicBool::new(false),
            readers: cfg.consumers,
            chunk_capacity: cfg.chunk_capacity,
            stats: QueueStats::default(),
            #[cfg(test)]
            allocation_limit: None,
        }
    }

    #[inline]
    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub(crate) fn set_exhausted(&self) {
        self.exhausted.store(true, Ordering::Release);
    }
}

/// Read-only view of a queue, usable from any thread.
#[derive(Clone)]
pub struct QueueMonitor {
    shared: Arc<Shared>,
}

impl QueueMonitor {
    pub(crate) fn new(shared: Arc<Shared>) -> QueueMonitor {
        QueueMonitor { shared }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// True once the writer has closed the stream.
    pub fn is_exhausted(&self) -> bool {
        self.shared.is_exhausted()
    }

    pub fn chunk_capacity(&self) -> usize {
        self.shared.chunk_capacity
    }

    pub fn readers(&self) -> usize {
        self.shared.readers
    }
}

impl fmt::Debug for QueueMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueMonitor")
            .field("exhausted", &self.is_exhausted())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builds an empty queue with one writer and `cfg.consumers` readers, all
/// positioned at the first slot of the head chunk.
pub fn queue(cfg: &QueueConfig) -> Result<(RecordWriter, Vec<RecordReader>), QueueError> {
    cfg.validate()?;
    build(Shared::new(cfg), cfg)
}

/// Like [`queue`], but chunk allocation fails once `limit` chunks exist.
#[cfg(test)]
pub(crate) fn queue_with_allocation_limit(
    cfg: &QueueConfig,
    limit: usize,
) -> Result<(RecordWriter, Vec<RecordReader>), QueueError> {
    cfg.validate()?;
    let mut shared = Shared::new(cfg);
    shared.allocation_limit = Some(limit);
    build(shared, cfg)
}

fn build(
    shared: Shared,
    cfg: &QueueConfig,
) -> Result<(RecordWriter, Vec<RecordReader>), QueueError> {
    let shared = Arc::new(shared);
    let head = Chunk::allocate(0, &shared)?;
    let readers = (0..cfg.consumers)
        .map(|id| RecordReader::new(id, Arc::clone(&head), Arc::clone(&shared)))
        .collect();
    Ok((RecordWriter::new(head, shared), readers))
}
