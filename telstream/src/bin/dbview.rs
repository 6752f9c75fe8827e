//! Attaches to a channel and reports observations and blocks as they arrive.
//!
//! # Usage
//!
//! ```sh
//! telstream-dbview -k dada
//! telstream-dbview -k dada --reader --observations 1
//! ```
//!
//! As a viewer (default) the writer never waits for this process; with
//! `--reader` every block is consumed.

use std::time::Duration;

use clap::Parser;

use telstream::header::AsciiHeader;
use telstream::ipc::{ChannelKey, RingBufferChannel, RingError, Role, Timeout};

const POLL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "telstream-dbview", version, about = "Report blocks arriving in a ring buffer channel")]
struct Cli {
    /// Channel key (hexadecimal)
    #[arg(short, long, default_value = "dada")]
    key: ChannelKey,

    /// Consume blocks as a reader instead of viewing
    #[arg(short, long)]
    reader: bool,

    /// Exit after this many observations
    #[arg(short, long)]
    observations: Option<u64>,

    /// Print every block rather than one line per observation
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    telstream::init_tracing();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("telstream-dbview: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), RingError> {
    let mut channel = RingBufferChannel::new(cli.key);
    channel.connect()?;
    channel.lock(if cli.reader { Role::Reader } else { Role::Viewer })?;

    let mut seen = 0;
    let mut last: Option<Vec<u8>> = None;
    while cli.observations.is_none_or(|n| seen < n) {
        let raw = match channel.read_header(Timeout::from(POLL)) {
            Ok(raw) => raw,
            Err(RingError::Timeout { .. }) => continue,
            Err(e) => return Err(e),
        };
        // A viewer sees the previous header until the next one is written.
        if !cli.reader && last.as_ref() == Some(&raw) {
            std::thread::sleep(POLL);
            continue;
        }
        match AsciiHeader::load_from_bytes(&raw) {
            Ok(header) => eprintln!(
                "telstream-dbview: observation UTC_START={} RESOLUTION={}",
                header.get_str("UTC_START").unwrap_or("?"),
                header.get_str("RESOLUTION").unwrap_or("?")
            ),
            Err(e) => eprintln!("telstream-dbview: unreadable header: {e}"),
        }

        let (blocks, bytes) = view_observation(&mut channel, cli.verbose)?;
        eprintln!("telstream-dbview: end of observation, {blocks} blocks, {bytes} bytes");
        seen += 1;
        last = Some(raw);
    }

    channel.unlock()?;
    channel.disconnect()
}

fn view_observation(channel: &mut RingBufferChannel, verbose: bool) -> Result<(u64, u64), RingError> {
    let (mut blocks, mut bytes) = (0, 0);
    loop {
        let block = match channel.open_read_block(Timeout::from(POLL)) {
            Ok(Some(block)) => block,
            Ok(None) => return Ok((blocks, bytes)),
            Err(RingError::Timeout { .. }) => continue,
            Err(e) => return Err(e),
        };
        blocks += 1;
        bytes += block.len() as u64;
        let intact = block.is_intact();
        if verbose {
            eprintln!(
                "telstream-dbview: block {} {} bytes{}",
                block.id(),
                block.len(),
                if intact { "" } else { " (overwritten while viewed)" }
            );
        }
        channel.close_read_block(block)?;
    }
}
