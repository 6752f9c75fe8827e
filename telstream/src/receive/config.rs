//! Receiver configuration read from the observation header.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{TimeDelta, Utc};

use super::ReceiveError;
use crate::format::{PacketFormat, SampleGeometry, UTC_FORMAT};
use crate::header::{AsciiHeader, HeaderError};
use crate::net::{Endpoint, UdpSocket};
use crate::trace::{info, warn};

/// Kernel receive buffer requested by the single-stream receiver.
pub const DEFAULT_KERNEL_BUFFER: usize = 32 * 1024 * 1024;

/// Kernel receive buffer requested per sub-stream by the merge receiver.
pub const DEFAULT_MERGE_KERNEL_BUFFER: usize = 64 * 1024 * 1024;

/// Blocks a single packet may skip ahead before the stream counts as broken.
pub const DEFAULT_MAX_BLOCK_SKIP: u64 = 64;

/// Lead time in seconds given to a generated `UTC_START`.
const START_LEAD_SECS: i64 = 2;

/// Where one UDP stream arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub host: String,
    pub port: u16,
    /// Multicast group to join, if the stream is multicast.
    pub mcast: Option<Ipv4Addr>,
}

impl StreamEndpoint {
    /// Reads `DATA_HOST{suffix}`, `DATA_PORT{suffix}` and optional
    /// `DATA_MCAST{suffix}`.
    ///
    /// # Errors
    ///
    /// Missing or unparsable keys.
    pub fn from_header(header: &AsciiHeader, suffix: &str) -> Result<Self, HeaderError> {
        Ok(Self {
            host: header.get(&format!("DATA_HOST{suffix}"))?,
            port: header.get(&format!("DATA_PORT{suffix}"))?,
            mcast: header.get_opt(&format!("DATA_MCAST{suffix}"))?,
        })
    }

    /// Binds the socket, joins the multicast group if any, and requests a
    /// kernel receive buffer of `kernel_buffer` bytes.
    ///
    /// # Errors
    ///
    /// Name resolution, bind or group join failure.
    pub fn open_socket(&self, kernel_buffer: usize) -> io::Result<UdpSocket> {
        let socket = match self.mcast {
            Some(group) => {
                let interface = Endpoint::resolve(&self.host, self.port)?
                    .ipv4()
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                UdpSocket::open_multicast(group, interface, self.port)?
            }
            None => UdpSocket::open(Endpoint::resolve(&self.host, self.port)?)?,
        };

        match socket.resize_kernel_buffer(kernel_buffer) {
            Ok(granted) if granted < kernel_buffer => {
                warn!(requested = kernel_buffer, granted, "kernel receive buffer clamped");
            }
            Ok(granted) => info!(granted, "kernel receive buffer set"),
            Err(e) => warn!(error = %e, "kernel receive buffer not resized"),
        }
        info!(local = ?socket.local_addr().ok(), mcast = ?self.mcast, "stream socket open");
        Ok(socket)
    }
}

/// Observation parameters every receiver needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationParams {
    pub geometry: SampleGeometry,
    /// Sample interval in µs.
    pub tsamp: f64,
    /// Bandwidth in MHz.
    pub bw: f64,
}

impl ObservationParams {
    /// Reads `NCHAN NBIT NPOL NDIM TSAMP BW`.
    ///
    /// # Errors
    ///
    /// Missing or unparsable keys, or a non-positive sample interval.
    pub fn from_header(header: &AsciiHeader) -> Result<Self, ReceiveError> {
        let params = Self {
            geometry: SampleGeometry::from_header(header)?,
            tsamp: header.get("TSAMP")?,
            bw: header.get("BW")?,
        };
        if params.tsamp <= 0.0 {
            return Err(HeaderError::Parse {
                key: "TSAMP".to_string(),
                value: params.tsamp.to_string(),
            }
            .into());
        }
        Ok(params)
    }

    /// Expected data rate of the stream.
    #[must_use]
    pub fn bytes_per_second(&self) -> f64 {
        self.geometry.bits_per_sample() as f64 / 8.0 * 1e6 / self.tsamp
    }
}

/// Configuration of a single-stream receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverConfig {
    pub observation: ObservationParams,
    pub stream: StreamEndpoint,
    pub kernel_buffer: usize,
    /// Blocks one packet may jump ahead before a stream gap is fatal.
    pub max_block_skip: u64,
    /// Zero each block when it is opened.
    pub zero_fill: bool,
}

impl ReceiverConfig {
    /// Reads the observation and `DATA_*` keys; tunables take their defaults.
    ///
    /// # Errors
    ///
    /// Missing or unparsable keys.
    pub fn from_header(header: &AsciiHeader) -> Result<Self, ReceiveError> {
        Ok(Self {
            observation: ObservationParams::from_header(header)?,
            stream: StreamEndpoint::from_header(header, "")?,
            kernel_buffer: DEFAULT_KERNEL_BUFFER,
            max_block_skip: DEFAULT_MAX_BLOCK_SKIP,
            zero_fill: false,
        })
    }

    /// Opens the configured stream socket.
    ///
    /// # Errors
    ///
    /// See [`StreamEndpoint::open_socket`].
    pub fn open_socket(&self) -> io::Result<UdpSocket> {
        self.stream.open_socket(self.kernel_buffer)
    }
}

/// Configuration of the dual-stream merge receiver.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    pub observation: ObservationParams,
    /// Sub-streams `_0` and `_1`.
    pub streams: [StreamEndpoint; 2],
    pub kernel_buffer: usize,
    /// Bytes of next-block payload each worker may stage; `None` means one
    /// half block, and larger values are capped at one half block.
    pub overflow_capacity: Option<usize>,
    /// How long the coordinator waits on a block that is not filling before
    /// giving up. `None` waits forever.
    pub stall_timeout: Option<Duration>,
    /// Halves one packet may jump ahead before a stream gap is fatal.
    pub max_block_skip: u64,
    pub zero_fill: bool,
}

impl MergeConfig {
    /// Reads the observation keys plus `DATA_HOST_0/1`, `DATA_PORT_0/1` and
    /// optional `DATA_MCAST_0/1`.
    ///
    /// # Errors
    ///
    /// Missing or unparsable keys.
    pub fn from_header(header: &AsciiHeader) -> Result<Self, ReceiveError> {
        Ok(Self {
            observation: ObservationParams::from_header(header)?,
            streams: [
                StreamEndpoint::from_header(header, "_0")?,
                StreamEndpoint::from_header(header, "_1")?,
            ],
            kernel_buffer: DEFAULT_MERGE_KERNEL_BUFFER,
            overflow_capacity: None,
            stall_timeout: None,
            max_block_skip: DEFAULT_MAX_BLOCK_SKIP,
            zero_fill: false,
        })
    }
}

/// Builds the header written at observation start.
///
/// `config` is overridden by the START fields. `UTC_START` defaults to two
/// seconds from now and `OBS_OFFSET` to zero; `RESOLUTION` is the block
/// granularity the receiver will use.
#[must_use]
pub fn observation_header(config: &AsciiHeader, start: &AsciiHeader, resolution: u64) -> AsciiHeader {
    let mut header = config.clone();
    header.merge(start);
    header.del("COMMAND");
    if !header.contains("UTC_START") {
        let utc_start = (Utc::now() + TimeDelta::seconds(START_LEAD_SECS)).format(UTC_FORMAT).to_string();
        info!(%utc_start, "generated UTC_START");
        header.set("UTC_START", utc_start);
    }
    if !header.contains("OBS_OFFSET") {
        header.set("OBS_OFFSET", 0);
    }
    header.set("RESOLUTION", resolution);
    header
}

/// Checks that `bufsz` splits evenly into `parts` regions of whole packets.
///
/// # Errors
///
/// [`ReceiveError::Geometry`] otherwise.
pub fn check_block_geometry(
    bufsz: usize,
    parts: usize,
    format: &PacketFormat,
) -> Result<(), ReceiveError> {
    let resolution = format.get_resolution() as usize;
    if parts == 0 || bufsz % parts != 0 || (bufsz / parts) % resolution != 0 {
        return Err(ReceiveError::Geometry {
            reason: format!(
                "block of {bufsz} bytes does not split into {parts} part(s) of whole {resolution} byte units"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatKind;

    const CONFIG: &str = "\
NCHAN 1
NBIT 8
NPOL 2
NDIM 2
TSAMP 0.025
BW 40
DATA_HOST any
DATA_PORT 4001
DATA_HOST_0 127.0.0.1
DATA_PORT_0 4010
DATA_HOST_1 127.0.0.1
DATA_PORT_1 4011
DATA_MCAST_1 239.1.2.3
";

    #[test]
    fn test_receiver_config() {
        let header = AsciiHeader::load_from_str(CONFIG).unwrap();
        let config = ReceiverConfig::from_header(&header).unwrap();
        assert_eq!(config.stream.host, "any");
        assert_eq!(config.stream.port, 4001);
        assert_eq!(config.stream.mcast, None);
        assert_eq!(config.kernel_buffer, DEFAULT_KERNEL_BUFFER);
        // 4 bytes per sample at 40 MHz
        assert!((config.observation.bytes_per_second() - 160e6).abs() < 1.0);
    }

    #[test]
    fn test_merge_config() {
        let header = AsciiHeader::load_from_str(CONFIG).unwrap();
        let config = MergeConfig::from_header(&header).unwrap();
        assert_eq!(config.streams[0].port, 4010);
        assert_eq!(config.streams[1].mcast, Some(Ipv4Addr::new(239, 1, 2, 3)));
        assert_eq!(config.stall_timeout, None);
        assert_eq!(config.kernel_buffer, DEFAULT_MERGE_KERNEL_BUFFER);
    }

    #[test]
    fn test_missing_key() {
        let header = AsciiHeader::load_from_str("NCHAN 1\n").unwrap();
        assert!(matches!(
            ReceiverConfig::from_header(&header),
            Err(ReceiveError::Format(_) | ReceiveError::Header(_))
        ));
    }

    #[test]
    fn test_observation_header_defaults() {
        let config = AsciiHeader::load_from_str(CONFIG).unwrap();
        let start = AsciiHeader::load_from_str("SOURCE J0437\nTSAMP 0.05\n").unwrap();
        let header = observation_header(&config, &start, 8192);

        assert_eq!(header.get_str("SOURCE"), Some("J0437"));
        assert_eq!(header.get::<f64>("TSAMP").unwrap(), 0.05);
        assert_eq!(header.get::<u64>("OBS_OFFSET").unwrap(), 0);
        assert_eq!(header.get::<u64>("RESOLUTION").unwrap(), 8192);
        let utc = header.get_str("UTC_START").unwrap();
        assert!(crate::format::parse_utc(utc).is_ok());
    }

    #[test]
    fn test_observation_header_keeps_given_start() {
        let config = AsciiHeader::load_from_str(CONFIG).unwrap();
        let start = AsciiHeader::load_from_str("UTC_START 2024-03-01-12:00:00\nOBS_OFFSET 512\n")
            .unwrap();
        let header = observation_header(&config, &start, 4096);
        assert_eq!(header.get_str("UTC_START"), Some("2024-03-01-12:00:00"));
        assert_eq!(header.get::<u64>("OBS_OFFSET").unwrap(), 512);
    }

    #[test]
    fn test_block_geometry() {
        let format = PacketFormat::new(FormatKind::simple(8, 4096));
        assert!(check_block_geometry(1 << 20, 1, &format).is_ok());
        assert!(check_block_geometry(2 << 20, 2, &format).is_ok());
        assert!(check_block_geometry(4096, 2, &format).is_err());
        assert!(check_block_geometry(6144, 1, &format).is_err());
    }
}
