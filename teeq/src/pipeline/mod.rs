use std::io::BufRead;
use std::thread::{self, ScopedJoinHandle};

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::{queue, QueueConfig, StatsSnapshot};
use crate::errors::QueueError;
use crate::reader::DrainReport;
use crate::sink::{BoxedSink, SinkConfig};

#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeeConfig {
    pub queue: QueueConfig,
    pub sink: SinkConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeeReport {
    /// Records the producer published.
    pub produced: u64,
    /// One entry per sink, in the order the sinks were given.
    pub consumers: Vec<DrainReport>,
    pub stats: StatsSnapshot,
}

impl TeeReport {
    pub fn failures(&self) -> u64 {
        self.consumers.iter().map(|report| report.failures).sum()
    }
}

/// Duplicates one input stream into every sink, each on its own thread.
pub struct Tee {
    cfg: TeeConfig,
}

impl Tee {
    pub fn new(cfg: TeeConfig) -> Tee {
        Tee { cfg }
    }

    pub fn config(&self) -> &TeeConfig {
        &self.cfg
    }

    /// Runs the producer and one consumer per sink to completion.
    ///
    /// The queue gets exactly one reader per sink, whatever
    /// `queue.consumers` says. A producer error is returned only after every
    /// consumer has drained what was published before it.
    pub fn run<R>(&self, input: R, sinks: Vec<BoxedSink>) -> Result<TeeReport, QueueError>
    where
        R: BufRead + Send,
    {
        let cfg = QueueConfig {
            consumers: sinks.len(),
            ..self.cfg.queue.clone()
        };
        let (writer, readers) = queue(&cfg)?;
        let monitor = writer.monitor();
        debug!(
            chunk_capacity = cfg.chunk_capacity,
            consumers = cfg.consumers,
            "starting tee"
        );

        let (produced, consumers) = thread::scope(move |scope| -> Result<_, QueueError> {
            // Owned here so that an early return drops, and thereby closes,
            // the writer before the scope joins the consumers.
            let mut writer = writer;
            let mut handles = Vec::with_capacity(readers.len());
            for (mut reader, mut sink) in readers.into_iter().zip(sinks) {
                let handle = thread::Builder::new()
                    .name(format!("tee-{}", sink.name()))
                    .spawn_scoped(scope, move || reader.drain(&mut sink))
                    .map_err(QueueError::Spawn)?;
                handles.push(handle);
            }
            let producer = thread::Builder::new()
                .name("tee-producer".to_string())
                .spawn_scoped(scope, move || writer.pump(input))
                .map_err(QueueError::Spawn)?;

            let produced = join(producer)?;
            let mut consumers = Vec::with_capacity(handles.len());
            for handle in handles {
                consumers.push(join(handle)?);
            }
            Ok((produced, consumers))
        })?;

        let produced = produced?;
        let report = TeeReport {
            produced,
            consumers,
            stats: monitor.stats(),
        };
        info!(
            produced = report.produced,
            failures = report.failures(),
            chunks = report.stats.chunks_allocated,
            peak_live_chunks = report.stats.peak_live_chunks,
            "tee finished"
        );
        Ok(report)
    }
}

fn join<T>(handle: ScopedJoinHandle<'_, T>) -> Result<T, QueueError> {
    let name = handle.thread().name().unwrap_or("tee-worker").to_string();
    handle.join().map_err(|_| QueueError::Worker(name))
}
