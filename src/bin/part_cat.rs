use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use part_stream::{
    FileFetcher, RequestedRange, SegmentStream, StreamConfig,
};

#[derive(Parser, Debug)]
#[clap(name = "part-cat")]
#[clap(
    about = "Print a byte range of an object stored as ordered part files",
    long_about = None
)]
struct Cli {
    /// Part files, in order
    #[clap(required = true)]
    parts: Vec<PathBuf>,

    /// First byte to print (inclusive)
    #[clap(long)]
    start: Option<u64>,

    /// Last byte to print (inclusive)
    #[clap(long)]
    end: Option<u64>,

    /// JSON stream config
    #[clap(long)]
    config: Option<PathBuf>,

    /// Read and write timeout in seconds
    #[clap(long)]
    timeout: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => StreamConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => StreamConfig::default().with_label("part-cat"),
    };
    if let Some(secs) = cli.timeout {
        let timeout = Duration::from_secs(secs);
        config = config.with_timeouts(timeout, timeout);
    }

    let segments = FileFetcher::segments(&cli.parts)?;
    let stream = SegmentStream::new(
        segments,
        RequestedRange::new(cli.start, cli.end),
        FileFetcher,
        config,
    )?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let copied = io::copy(&mut &stream, &mut out)?;
    out.flush()?;

    log::info!("part-cat: wrote {} of {} bytes", copied, stream.len());
    stream.close();
    Ok(())
}
