use std::error::Error;
use std::io::{self, Cursor};
use std::thread;
use std::time::{Duration, Instant};

use clap::{self, Parser};
use tracing_subscriber::EnvFilter;

use teeq::pipeline::{Tee, TeeConfig, TeeReport};
use teeq::sink::{BoxedSink, RecordSink, WriteSink};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    #[clap(long = "records", default_value = "1000000")]
    records: usize,
    /// Bytes per record, newline included.
    #[clap(long = "record-size", default_value = "32")]
    record_size: usize,
    /// Per-record delay applied to the second consumer only.
    #[clap(long = "delay-us", default_value = "0")]
    delay_us: u64,
    #[clap(long = "chunk-capacity")]
    chunk_capacity: Option<usize>,
}

/// Discards records after an optional fixed delay.
struct DelayedSink {
    inner: WriteSink<io::Sink>,
    delay: Duration,
}

impl RecordSink for DelayedSink {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn apply(&mut self, record: &[u8]) -> io::Result<()> {
        if self.delay > Duration::from_micros(0) {
            thread::sleep(self.delay);
        }
        self.inner.apply(record)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: TeeConfig = match opts.config {
        Some(ref path) => confy::load_path(path)?,
        None => TeeConfig::default(),
    };
    if let Some(chunk_capacity) = opts.chunk_capacity {
        cfg.queue.chunk_capacity = chunk_capacity;
    }
    run(cfg, &opts)
}

fn synthetic_input(records: usize, record_size: usize) -> Vec<u8> {
    let record_size = record_size.max(2);
    let mut input = Vec::with_capacity(records * record_size);
    for i in 0..records {
        let digits = i.to_string();
        let mut line = digits.into_bytes();
        line.resize(record_size - 1, b'.');
        line.push(b'\n');
        input.extend_from_slice(&line);
    }
    input
}

fn run(cfg: TeeConfig, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let input = synthetic_input(opts.records, opts.record_size);
    println!(
        "[Bench] {} records of {} bytes, chunk capacity {}, delay {}us on the second consumer",
        opts.records, opts.record_size, cfg.queue.chunk_capacity, opts.delay_us
    );

    let sinks: Vec<BoxedSink> = vec![
        Box::new(DelayedSink {
            inner: WriteSink::new("fast", io::sink(), &cfg.sink),
            delay: Duration::from_micros(0),
        }),
        Box::new(DelayedSink {
            inner: WriteSink::new("delayed", io::sink(), &cfg.sink),
            delay: Duration::from_micros(opts.delay_us),
        }),
    ];

    let start = Instant::now();
    let report = Tee::new(cfg).run(Cursor::new(input), sinks)?;
    let duration = start.elapsed();
    print_report(&report, duration);
    Ok(())
}

fn print_report(report: &TeeReport, duration: Duration) {
    let millis = duration.as_millis().max(1) as f64;
    let iops = ((report.produced as f64) / millis) * 1_000f64;
    println!(
        "\n{:#?}K records/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    for consumer in &report.consumers {
        println!(
            "[Bench] {}: {} written, {} failed",
            consumer.sink, consumer.written, consumer.failures
        );
    }
    println!(
        "[Bench] chunks allocated: {}, reclaimed: {}, peak live: {}",
        report.stats.chunks_allocated, report.stats.chunks_reclaimed, report.stats.peak_live_chunks
    );
}
