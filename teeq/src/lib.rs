mod core;
mod errors;
pub mod pipeline;
pub mod reader;
pub mod sink;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{queue, QueueConfig, QueueMonitor, StatsSnapshot};
pub use crate::errors::QueueError;

pub const DEFAULT_CHUNK_CAPACITY: usize = crate::core::DEFAULT_CHUNK_CAPACITY;
pub const DEFAULT_CONSUMERS: usize = crate::core::DEFAULT_CONSUMERS;
