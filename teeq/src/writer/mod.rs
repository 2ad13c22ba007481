use std::fmt;
use std::io::BufRead;
use std::mem;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::{Chunk, Entry, QueueMonitor, Shared};
use crate::errors::QueueError;

/// The single producer of a queue.
///
/// Every slot starts out with its gate closed, so the slot after the one
/// being written is always locked before the current one is published and a
/// reader can never run ahead into an unpopulated slot.
pub struct RecordWriter {
    chunk: Arc<Chunk>,
    index: usize,
    next_chunk_id: usize,
    sequence: u64,
    closed: bool,
    shared: Arc<Shared>,
}

impl RecordWriter {
    pub(crate) fn new(head: Arc<Chunk>, shared: Arc<Shared>) -> RecordWriter {
        RecordWriter {
            next_chunk_id: head.id() + 1,
            chunk: head,
            index: 0,
            sequence: 0,
            closed: false,
            shared,
        }
    }

    /// Appends a record and makes it visible to every reader. Returns the
    /// record's position in the stream, starting at 0.
    pub fn push(&mut self, record: Vec<u8>) -> Result<u64, QueueError> {
        if self.closed {
            return Err(QueueError::Closed);
        }
        let index = self.index;
        // Allocate the successor up front: a failed allocation must leave
        // nothing half-published.
        let successor = if index + 1 == self.chunk.capacity() {
            Some(Chunk::allocate(self.next_chunk_id, &self.shared)?)
        } else {
            None
        };

        let slot = self.chunk.slot(index);
        debug_assert!(!slot.is_published());
        slot.put(Entry::Record(record));
        self.chunk.set_tail(index + 1);

        match successor {
            Some(next) => {
                // Linked before the last slot opens, so a reader leaving this
                // chunk always finds its successor.
                self.chunk.link(Arc::clone(&next));
                self.next_chunk_id += 1;
                self.index = 0;
                let previous = mem::replace(&mut self.chunk, next);
                previous.slot(index).publish();
            }
            None => {
                self.index += 1;
                self.chunk.slot(index).publish();
            }
        }

        self.shared.stats.on_published();
        let sequence = self.sequence;
        self.sequence += 1;
        Ok(sequence)
    }

    /// Terminates the stream: the current slot is published empty and the
    /// exhaustion flag is raised. Calling it again does nothing.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let slot = self.chunk.slot(self.index);
        slot.put(Entry::EndOfStream);
        slot.publish();
        self.shared.set_exhausted();
        debug!(
            records = self.sequence,
            chunks = self.next_chunk_id,
            "input exhausted, stream closed"
        );
    }

    /// Reads `\n`-delimited records from `input` until end of stream, then
    /// closes the queue. Delimiters are kept and bytes pass through as-is.
    /// On a read error the stream is still closed, so readers drain what was
    /// published and stop.
    pub fn pump<R: BufRead>(&mut self, mut input: R) -> Result<u64, QueueError> {
        let result = loop {
            let mut record = Vec::new();
            match input.read_until(b'\n', &mut record) {
                Ok(0) => break Ok(self.sequence),
                Ok(_) => {
                    if let Err(e) = self.push(record) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(QueueError::Input(e)),
            }
        };
        if let Err(ref e) = result {
            warn!(published = self.sequence, error = %e, "producer stopped early");
        }
        self.close();
        result
    }

    /// Records pushed so far.
    pub fn written(&self) -> u64 {
        self.sequence
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor::new(Arc::clone(&self.shared))
    }
}

impl Drop for RecordWriter {
    fn drop(&mut self) {
        // Readers block on the next gate forever unless someone closes it.
        self.close();
    }
}

impl fmt::Debug for RecordWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordWriter")
            .field("chunk", &self.chunk)
            .field("index", &self.index)
            .field("written", &self.sequence)
            .field("closed", &self.closed)
            .finish()
    }
}
