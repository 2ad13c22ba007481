use std::io;
use std::path::PathBuf;

use thiserror::Error;

// Queue corruption (double reclaim, a gate opened over an empty slot) is a
// defect and panics; it never shows up here.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid queue configuration: {0}")]
    Config(String),

    #[error("failed to allocate chunk {chunk_id} ({capacity} slots)")]
    Allocation { chunk_id: usize, capacity: usize },

    #[error("the queue has already been closed")]
    Closed,

    #[error("failed to read input: {0}")]
    Input(#[source] io::Error),

    #[error("failed to open destination {}: {source}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("worker thread '{0}' panicked")]
    Worker(String),
}
