use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::errors::QueueError;

pub const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub buffer_capacity: usize,
    /// Flush after every record instead of when the buffer fills.
    pub flush_each_record: bool,
}

impl Default for SinkConfig {
    fn default() -> SinkConfig {
        SinkConfig {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            flush_each_record: false,
        }
    }
}

/// The side effect a reader applies to each record it consumes.
pub trait RecordSink {
    fn name(&self) -> &str;

    fn apply(&mut self, record: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

pub type BoxedSink = Box<dyn RecordSink + Send>;

impl<S: RecordSink + ?Sized> RecordSink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn apply(&mut self, record: &[u8]) -> io::Result<()> {
        (**self).apply(record)
    }

    fn flush(&mut self) -> io::Result<()> {
        (**self).flush()
    }
}

/// Buffered sink over any writer.
pub struct WriteSink<W: Write> {
    name: String,
    writer: BufWriter<W>,
    flush_each_record: bool,
}

impl<W: Write> WriteSink<W> {
    pub fn new(name: &str, inner: W, cfg: &SinkConfig) -> WriteSink<W> {
        WriteSink {
            name: name.to_string(),
            writer: BufWriter::with_capacity(cfg.buffer_capacity, inner),
            flush_each_record: cfg.flush_each_record,
        }
    }

    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

impl WriteSink<io::Stdout> {
    /// The echo sink.
    pub fn stdout(cfg: &SinkConfig) -> WriteSink<io::Stdout> {
        WriteSink::new("echo", io::stdout(), cfg)
    }
}

impl WriteSink<File> {
    /// The persist sink. The destination is opened for reading and writing,
    /// created if missing and truncated.
    pub fn persist(path: &Path, cfg: &SinkConfig) -> Result<WriteSink<File>, QueueError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|source| QueueError::Destination {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(WriteSink::new("persist", file, cfg))
    }
}

impl<W: Write> RecordSink for WriteSink<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&mut self, record: &[u8]) -> io::Result<()> {
        self.writer.write_all(record)?;
        if self.flush_each_record {
            self.writer.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
