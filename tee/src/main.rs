use std::error::Error;
use std::io::{self, BufReader};
use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use teeq::pipeline::{Tee, TeeConfig};
use teeq::sink::{BoxedSink, WriteSink};

#[derive(clap::Parser)]
#[clap(about = "Copy standard input to standard output and to a file")]
struct Opts {
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    /// Records per chunk; overrides the config file.
    #[clap(long = "chunk-capacity")]
    chunk_capacity: Option<usize>,
    /// Flush both outputs after every record.
    #[clap(long = "flush-each-record")]
    flush_each_record: bool,
    /// File receiving the persisted copy. Truncated on start.
    destination: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    run(&opts).map_err(|e| {
        error!("{}", e);
        e
    })
}

fn load_config(opts: &Opts) -> Result<TeeConfig, Box<dyn Error>> {
    let mut cfg: TeeConfig = match opts.config {
        Some(ref path) => confy::load_path(path)?,
        None => TeeConfig::default(),
    };
    if let Some(chunk_capacity) = opts.chunk_capacity {
        cfg.queue.chunk_capacity = chunk_capacity;
    }
    if opts.flush_each_record {
        cfg.sink.flush_each_record = true;
    }
    cfg.queue.validate()?;
    Ok(cfg)
}

fn run(opts: &Opts) -> Result<(), Box<dyn Error>> {
    let cfg = load_config(opts)?;
    debug!("{:?}", &cfg);

    // Opened before any thread starts: a bad destination must leave stdout
    // untouched.
    let persist = WriteSink::persist(&opts.destination, &cfg.sink)?;
    let echo = WriteSink::stdout(&cfg.sink);
    let sinks: Vec<BoxedSink> = vec![Box::new(echo), Box::new(persist)];

    let report = Tee::new(cfg).run(BufReader::new(io::stdin()), sinks)?;
    if report.failures() > 0 {
        return Err(format!(
            "{} record(s) could not be written ({})",
            report.failures(),
            report
                .consumers
                .iter()
                .filter(|c| c.failures > 0)
                .map(|c| match c.first_error {
                    Some(ref first) => format!("{}: {}, first: {}", c.sink, c.failures, first),
                    None => format!("{}: {}", c.sink, c.failures),
                })
                .collect::<Vec<_>>()
                .join(", ")
        )
        .into());
    }
    Ok(())
}
