use std::error::Error;
use std::time::{Duration, Instant};

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use recordbuf::core::ShmemConfig;
use recordbuf::reader::{ReaderConfig, RecordReader};
use recordbuf::RecordBufError;

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "recordbuf-reader.toml")]
    config: String,
    /// Overrides `seconds` from the config file.
    #[clap(long)]
    seconds: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
struct ReaderBenchConfig {
    shmem: ShmemConfig,
    /// How long to keep scanning.
    seconds: u64,
}

impl Default for ReaderBenchConfig {
    fn default() -> Self {
        ReaderBenchConfig {
            shmem: ShmemConfig::default(),
            seconds: 10,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: ReaderBenchConfig = confy::load_path(&opts.config)?;
    if let Some(seconds) = opts.seconds {
        cfg.seconds = seconds;
    }
    let reader = RecordReader::new(&ReaderConfig {
        shmem: cfg.shmem.clone(),
    })?;
    run(&reader, Duration::from_secs(cfg.seconds))?;
    reader.close();
    Ok(())
}

#[derive(Default)]
struct ReaderContext {
    consistent: usize,
    torn: usize,
    scans: usize,
}

impl ReaderContext {
    fn record(&mut self, payload: &[u8]) {
        let mut words = payload.chunks(4);
        let first = words.next();
        if words.all(|w| Some(w) == first) {
            self.consistent += 1;
        } else {
            self.torn += 1;
        }
    }

    fn seen(&self) -> usize {
        self.consistent + self.torn
    }
}

fn run(reader: &RecordReader, duration: Duration) -> Result<(), Box<dyn Error>> {
    let start = Instant::now();
    let ctx = &mut ReaderContext::default();

    while start.elapsed() < duration {
        match reader.for_each(|_key, payload| ctx.record(payload)) {
            Ok(()) => {}
            Err(RecordBufError::Closing) => {
                info!(scans = ctx.scans, "signalled, stopping");
                break;
            }
            Err(e) => return Err(Box::new(e)),
        }
        ctx.scans += 1;
        if ctx.scans % 10_000 == 0 {
            eprint!("\rTotal {} records ({} torn)", ctx.seen(), ctx.torn);
        }
    }

    let elapsed = start.elapsed();
    let ops = (ctx.seen() as f64) / elapsed.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K records read/s. Scans: {}, consistent: {}, torn: {}. Total time: {:#?}",
        (ops / 1000f64) as u64,
        ctx.scans,
        ctx.consistent,
        ctx.torn,
        elapsed
    );
    Ok(())
}
