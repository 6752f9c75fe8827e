//! Single-stream UDP receiver writing into a ring buffer channel.
//!
//! # Usage
//!
//! ```sh
//! telstream-udpdb -k dada config.txt
//! echo "COMMAND START" | nc localhost 32132
//! ```
//!
//! Observations start and stop on control commands; `QUIT` ends the process.
//! With `--start` the first observation begins immediately.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use telstream::control::server::{ControlServer, DEFAULT_CONTROL_PORT};
use telstream::control::{CommandTarget, ControlMessage};
use telstream::header::AsciiHeader;
use telstream::ipc::{ChannelKey, RingBufferChannel, Role};
use telstream::net::Endpoint;
use telstream::receive::{ReceiveError, ReceiverConfig, StreamReceiver};
use telstream::stats::RateMeter;

#[derive(Parser)]
#[command(name = "telstream-udpdb", version, about = "Receive one UDP stream into a ring buffer channel")]
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

    /// Kernel receive buffer in bytes
    #[arg(long)]
    kernel_buffer: Option<usize>,

    /// Blocks a packet may jump ahead before the stream counts as broken
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
        eprintln!("telstream-udpdb: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), ReceiveError> {
    let header = AsciiHeader::load_from_file(&cli.config)?;
    let mut config = ReceiverConfig::from_header(&header)?;
    if let Some(bytes) = cli.kernel_buffer {
        config.kernel_buffer = bytes;
    }
    if let Some(blocks) = cli.max_block_skip {
        config.max_block_skip = blocks;
    }
    config.zero_fill |= cli.zero_fill;

    let socket = config.open_socket()?;
    let mut channel = RingBufferChannel::new(cli.key);
    channel.connect()?;
    channel.lock(Role::Writer)?;

    let receiver = StreamReceiver::new(channel, socket, header)?.with_settings(&config);
    let control = receiver.control();
    let server = ControlServer::bind(Endpoint::resolve(&cli.control_host, cli.control_port)?)?;
    eprintln!(
        "telstream-udpdb: {} -> {}, control on {}",
        config.stream.port,
        cli.key,
        server.local_addr()?
    );
    let server = server.spawn(Arc::clone(&control))?;

    if cli.start {
        control.deliver(ControlMessage::Start(AsciiHeader::new()))?;
    }

    let receiver = receiver.spawn()?;
    let mut meter = RateMeter::new(receiver.stats());
    while !receiver.is_finished() {
        thread::sleep(Duration::from_millis(100));
        if cli.report_interval > 0 && meter.elapsed() >= Duration::from_secs(cli.report_interval) {
            let (delta, rate) = meter.sample(receiver.stats());
            eprintln!("telstream-udpdb: {rate:.1} MB/s, {delta}");
        }
    }

    let result = receiver.join();
    server.shutdown();
    eprintln!("telstream-udpdb: stopped");
    result
}
