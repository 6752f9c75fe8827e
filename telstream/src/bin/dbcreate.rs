//! Creates or destroys a ring buffer channel.
//!
//! # Usage
//!
//! ```sh
//! telstream-dbcreate -k dada -n 8 -b 1048576 -r 1
//! telstream-dbcreate -k dada --destroy
//! ```
//!
//! The channel outlives this process; other tools attach to it by key.

use clap::Parser;

use telstream::ipc::{ChannelCreator, ChannelGeometry, ChannelKey, RingError, channel};

#[derive(Parser)]
#[command(name = "telstream-dbcreate", version, about = "Create or destroy a ring buffer channel")]
struct Cli {
    /// Channel key (hexadecimal)
    #[arg(short, long, default_value = "dada")]
    key: ChannelKey,

    /// Number of data blocks
    #[arg(short, long, default_value_t = ChannelGeometry::default().nbufs)]
    nbufs: u64,

    /// Data block size in bytes
    #[arg(short, long, default_value_t = ChannelGeometry::default().bufsz)]
    bufsz: u64,

    /// Consuming reader slots
    #[arg(short = 'r', long, default_value_t = ChannelGeometry::default().nreaders)]
    nreaders: u32,

    /// Number of header blocks
    #[arg(long, default_value_t = ChannelGeometry::default().hdr_nbufs)]
    hdr_nbufs: u64,

    /// Header block size in bytes
    #[arg(long, default_value_t = ChannelGeometry::default().hdr_bufsz)]
    hdr_bufsz: u64,

    /// Initial block resolution in bytes
    #[arg(long, default_value_t = ChannelGeometry::default().resolution)]
    resolution: u64,

    /// Remove the channel instead of creating it
    #[arg(short, long)]
    destroy: bool,
}

fn main() {
    telstream::init_tracing();
    if let Err(e) = run(Cli::parse()) {
        eprintln!("telstream-dbcreate: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), RingError> {
    if cli.destroy {
        channel::destroy(cli.key)?;
        eprintln!("telstream-dbcreate: destroyed {}", cli.key);
        return Ok(());
    }

    let geometry = ChannelGeometry {
        nbufs: cli.nbufs,
        bufsz: cli.bufsz,
        nreaders: cli.nreaders,
        hdr_nbufs: cli.hdr_nbufs,
        hdr_bufsz: cli.hdr_bufsz,
        resolution: cli.resolution,
    };
    ChannelCreator::create(cli.key, geometry)?.persist();
    eprintln!(
        "telstream-dbcreate: created {} ({} x {} bytes, {} reader(s))",
        cli.key, geometry.nbufs, geometry.bufsz, geometry.nreaders
    );
    Ok(())
}
