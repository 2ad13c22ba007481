use std::fmt;
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::core::{Chunk, Entry, QueueMonitor, Shared};
use crate::sink::RecordSink;

/// Outcome of draining one reader into a sink.
#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub sink: String,
    /// Records the sink accepted.
    pub written: u64,
    /// Records the sink rejected, plus a failed final flush.
    pub failures: u64,
    /// The first error the sink returned, if any.
    pub first_error: Option<String>,
}

/// One consumer of a queue. Walks the chunk chain from the head at its own
/// pace and gives up its share of each chunk as it leaves it.
pub struct RecordReader {
    id: usize,
    // None once the reader has seen the end of the stream.
    chunk: Option<Arc<Chunk>>,
    index: usize,
    consumed: u64,
    shared: Arc<Shared>,
}

impl RecordReader {
    pub(crate) fn new(id: usize, head: Arc<Chunk>, shared: Arc<Shared>) -> RecordReader {
        RecordReader {
            id,
            chunk: Some(head),
            index: 0,
            consumed: 0,
            shared,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Records handed out so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// True when the writer has closed the stream and this reader has already
    /// consumed every record in it.
    pub fn is_drained(&self) -> bool {
        match self.chunk {
            None => true,
            Some(ref chunk) => {
                self.shared.is_exhausted()
                    && chunk.next().is_none()
                    && self.index >= chunk.tail()
            }
        }
    }

    /// Waits for the next record and hands it to `f`. Returns `None` once the
    /// stream has ended.
    pub fn read<F, R>(&mut self, f: F) -> Option<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        if self.is_drained() {
            self.finish();
            return None;
        }
        let result = {
            let chunk = self.chunk.as_ref()?;
            match chunk.slot(self.index).wait() {
                Entry::Record(record) => Some(f(record.as_slice())),
                Entry::EndOfStream => None,
            }
        };
        match result {
            Some(value) => {
                self.consumed += 1;
                self.advance();
                Some(value)
            }
            None => {
                self.finish();
                None
            }
        }
    }

    /// Feeds every remaining record to `sink`, then flushes it.
    ///
    /// A record the sink rejects is skipped; the walk carries on so the other
    /// readers and chunk reclamation are unaffected. Only the first failure
    /// is logged at `warn`, so a closed pipe does not flood stderr.
    pub fn drain<S: RecordSink + ?Sized>(&mut self, sink: &mut S) -> DrainReport {
        let mut report = DrainReport {
            sink: sink.name().to_string(),
            ..DrainReport::default()
        };
        loop {
            let sequence = self.consumed;
            match self.read(|record| sink.apply(record)) {
                None => break,
                Some(Ok(())) => report.written += 1,
                Some(Err(e)) => {
                    report.failures += 1;
                    if report.first_error.is_none() {
                        warn!(
                            sink = %report.sink,
                            sequence,
                            error = %e,
                            "failed to write record, skipping it"
                        );
                        report.first_error = Some(e.to_string());
                    } else {
                        debug!(sink = %report.sink, sequence, error = %e, "skipping record");
                    }
                }
            }
        }
        if let Err(e) = sink.flush() {
            report.failures += 1;
            warn!(sink = %report.sink, error = %e, "failed to flush sink");
            report.first_error.get_or_insert_with(|| e.to_string());
        }
        if report.failures > 1 {
            warn!(sink = %report.sink, failures = report.failures, "records skipped");
        }
        debug!(
            reader = self.id,
            sink = %report.sink,
            written = report.written,
            failures = report.failures,
            "reader drained"
        );
        report
    }

    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor::new(Arc::clone(&self.shared))
    }

    fn advance(&mut self) {
        let capacity = self.shared.chunk_capacity;
        if self.index + 1 < capacity {
            self.index += 1;
            return;
        }
        let finished = match self.chunk.take() {
            Some(chunk) => chunk,
            None => return,
        };
        // The writer links the successor before publishing the last slot.
        let next = match finished.next() {
            Some(next) => Arc::clone(next),
            None => unreachable!("chunk {} published its last slot unlinked", finished.id()),
        };
        self.release(&finished);
        drop(finished);
        self.chunk = Some(next);
        self.index = 0;
    }

    fn finish(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.release(&chunk);
        }
    }

    fn release(&self, chunk: &Chunk) {
        if chunk.release_reader() {
            self.shared.stats.on_reclaimed();
            trace!(reader = self.id, chunk = chunk.id(), "last reader out, reclaiming chunk");
        } else {
            trace!(reader = self.id, chunk = chunk.id(), "chunk half drained");
        }
    }
}

impl Drop for RecordReader {
    fn drop(&mut self) {
        // Only the current chunk's share is given back: chunks further along
        // are freed through reference counting once the other readers pass,
        // but stay out of the reclaim count.
        self.finish();
    }
}

impl fmt::Debug for RecordReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordReader")
            .field("id", &self.id)
            .field("chunk", &self.chunk)
            .field("index", &self.index)
            .field("consumed", &self.consumed)
            .finish()
    }
}
