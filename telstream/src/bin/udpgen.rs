//! Paced UDP packet generator for exercising the receivers.
//!
//! # Usage
//!
//! ```sh
//! telstream-udpgen config.txt --duration 10
//! telstream-udpgen config.txt --suffix _1 --rate 200 --packets 100000 --stream-stop
//! ```
//!
//! The destination and packet format come from the configuration
//! (`DATA_HOST{suffix}`, `DATA_PORT{suffix}`, `PKT_FORMAT{suffix}`); the rate
//! defaults to the data rate implied by `NCHAN NBIT NPOL NDIM TSAMP`.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::Parser;

use telstream::format::PacketFormat;
use telstream::generate::{GenerateError, PacedSender, SendBudget, UdpTarget};
use telstream::header::AsciiHeader;
use telstream::net::Endpoint;
use telstream::receive::{ObservationParams, StreamEndpoint};

#[derive(Parser)]
#[command(name = "telstream-udpgen", version, about = "Send paced test packets to a receiver")]
struct Cli {
    /// Observation configuration (ASCII header)
    config: PathBuf,

    /// Key suffix selecting the sub-stream, e.g. `_0`
    #[arg(long, default_value = "")]
    suffix: String,

    /// Override the destination host
    #[arg(long)]
    host: Option<String>,

    /// Override the destination port
    #[arg(short, long)]
    port: Option<u16>,

    /// Payload rate in MB/s
    #[arg(short, long)]
    rate: Option<f64>,

    /// Seconds to transmit
    #[arg(short, long)]
    duration: Option<f64>,

    /// Packets to transmit
    #[arg(short = 'n', long)]
    packets: Option<u64>,

    /// First sequence number
    #[arg(long, default_value_t = 0)]
    start_seq: u64,

    /// Finish with the end-of-stream marker
    #[arg(long)]
    stream_stop: bool,
}

fn main() {
    telstream::init_tracing();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("telstream-udpgen: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), GenerateError> {
    let header = AsciiHeader::load_from_file(&cli.config)?;
    let mut format = PacketFormat::from_config(&header, &cli.suffix)?;
    format.prepare(&header, &cli.suffix)?;

    let dest = match (cli.host, cli.port) {
        (Some(host), Some(port)) => Endpoint::resolve(&host, port)?,
        (host, port) => {
            let stream = StreamEndpoint::from_header(&header, &cli.suffix)?;
            let host = host.unwrap_or(stream.host);
            Endpoint::resolve(&host, port.unwrap_or(stream.port))?
        }
    };

    let bytes_per_second = match cli.rate {
        Some(mb) => mb * 1e6,
        None => ObservationParams::from_header(&header)?.bytes_per_second(),
    };

    let budget = SendBudget {
        packets: cli.packets,
        duration: cli.duration.map(|s| Duration::from_secs_f64(s.max(0.0))),
    };

    let mut sender = PacedSender::new(UdpTarget::open(dest)?, format, bytes_per_second)?
        .starting_at(cli.start_seq);
    eprintln!(
        "telstream-udpgen: sending to {dest} at {:.1} MB/s",
        bytes_per_second / 1e6
    );
    let summary = sender.run(budget, &AtomicBool::new(false))?;
    if cli.stream_stop {
        sender.send_stream_stop()?;
    }
    eprintln!("telstream-udpgen: {summary}");
    Ok(())
}
