//! Dual-stream UDP receiver merging two sub-streams into one channel.
//!
//! # Usage
//!
//! ```sh
//! telstream-udpmergedb -k dada config.txt
//! ```
//!
//! Sub-stream `_0` fills the first half of every block and `_1` the second.
//! Each is configured by `DATA_HOST_p`, `DATA_PORT_p` and optionally
//! `DATA_MCAST_p` and `PKT_FORMAT_p`.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;

use telstream::control::server::{ControlServer, DEFAULT_CONTROL_PORT};
use telstream::control::{CommandTarget, ControlMessage};
use telstream::header::AsciiHeader;
use telstream::ipc::{ChannelKey, RingBufferChannel, Role};
use telstream::net::Endpoint;
use telstream::receive::{MergeConfig, MergeReceiver, ReceiveError};
use telstream::stats::RateMeter;

#[derive(Parser)]
#[command(
    name = "telstream-udpmergedb",
    version,
    about = "Receive two UDP sub-streams into the halves of each ring buffer block"
)]
struct Cli {
    /// Observation configuration (ASCII header)
    config: PathBuf,

    /// Channel key (hexadecimal)
    #[arg(short, long, default_value = "dada")]
    key: ChannelKey,

    /// Control interface to listen on
    #[arg(long, default_value = "0.0.0.0")]
    control_host: String,

    /// Control port
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Start an observation without waiting for a command
    #[arg(short, long)]
    start: bool,

    /// Kernel receive buffer per sub-stream in bytes
    #[arg(long)]
    kernel_buffer: Option<usize>,

    /// Bytes of next-block payload each worker may stage (at most half a block)
    #[arg(long)]
    overflow: Option<usize>,

    /// Seconds to wait for a lagging sub-stream before stopping
    #[arg(long)]
    stall_timeout: Option<f64>,

    /// Halves a packet may jump ahead before the stream counts as broken
    #[arg(long)]
    max_block_skip: Option<u64>,

    /// Zero each block when it is opened
    #[arg(long)]
    zero_fill: bool,

    /// Seconds between rate reports (0 disables them)
    #[arg(long, default_value_t = 1)]
    report_interval: u64,
}

fn main() {
    telstream::init_tracing();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("telstream-udpmergedb: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), ReceiveError> {
    let header = AsciiHeader::load_from_file(&cli.config)?;
    let mut config = MergeConfig::from_header(&header)?;
    if let Some(bytes) = cli.kernel_buffer {
        config.kernel_buffer = bytes;
    }
    if let Some(bytes) = cli.overflow {
        config.overflow_capacity = Some(bytes);
    }
    if let Some(secs) = cli.stall_timeout {
        config.stall_timeout = Some(Duration::from_secs_f64(secs.max(0.0)));
    }
    if let Some(halves) = cli.max_block_skip {
        config.max_block_skip = halves;
    }
    config.zero_fill |= cli.zero_fill;

    let sockets = [
        config.streams[0].open_socket(config.kernel_buffer)?,
        config.streams[1].open_socket(config.kernel_buffer)?,
    ];
    let mut channel = RingBufferChannel::new(cli.key);
    channel.connect()?;
    channel.lock(Role::Writer)?;

    let receiver = MergeReceiver::new(channel, sockets, header)?.with_settings(&config);
    let control = receiver.control();
    let server = ControlServer::bind(Endpoint::resolve(&cli.control_host, cli.control_port)?)?;
    eprintln!(
        "telstream-udpmergedb: {} + {} -> {}, control on {}",
        config.streams[0].port,
        config.streams[1].port,
        cli.key,
        server.local_addr()?
    );
    let server = server.spawn(control.clone())?;

    if cli.start {
        control.deliver(ControlMessage::Start(AsciiHeader::new()))?;
    }

    let receiver = receiver.spawn()?;
    let [s0, s1] = receiver.stats();
    let mut meters = [RateMeter::new(s0), RateMeter::new(s1)];
    while !receiver.is_finished() {
        thread::sleep(Duration::from_millis(100));
        if cli.report_interval > 0
            && meters[0].elapsed() >= Duration::from_secs(cli.report_interval)
        {
            let (d0, r0) = meters[0].sample(s0);
            let (d1, r1) = meters[1].sample(s1);
            eprintln!("telstream-udpmergedb: [0] {r0:.1} MB/s, {d0}");
            eprintln!("telstream-udpmergedb: [1] {r1:.1} MB/s, {d1}");
        }
    }

    let result = receiver.join();
    server.shutdown();
    eprintln!("telstream-udpmergedb: stopped");
    result
}
