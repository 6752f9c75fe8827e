//! Packet formats: wire packet to stream byte offset, and back.
//!
//! A [`PacketFormat`] hides all wire knowledge from the receivers. Decoding a
//! packet yields the byte offset of its payload in the logical stream; the
//! receiver then asks the format to copy the payload into place.
//!
//! ```text
//! packet ──decode_packet──> Decoded::Packet { byte_offset, payload_len }
//!                           │
//!                           └──insert_last_packet(packet, &mut block[..])
//! ```
//!
//! # Thread ownership
//!
//! Drift correction mutates per-stream state on every decode, so a
//! `PacketFormat` is [`Send`] but not [`Sync`]: each receive thread owns its
//! own instance and a shared `&PacketFormat` across threads does not compile.

pub mod drift;
pub mod layout;

use std::cell::Cell;
use std::marker::PhantomData;
use std::ops::Range;

use chrono::NaiveDateTime;

pub use drift::DriftCorrector;
pub use layout::FormatKind;

use crate::header::{AsciiHeader, HeaderError};
use crate::trace::{debug, info};

/// Format of `UTC_START` and other observation timestamps.
pub const UTC_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// Errors from packet decoding and format configuration.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("unknown packet format `{0}`")]
    UnknownFormat(String),
    #[error("invalid packet layout: {reason}")]
    Layout { reason: String },
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("packet of {len} bytes is shorter than the {expected} byte format")]
    ShortPacket { len: usize, expected: usize },
    #[error("unparsable timestamp `{value}`")]
    BadTime { value: String },
    #[error("sequence counter {raw} off by {remainder} from increment {seq_inc} after stream start")]
    Desynchronized { raw: u64, remainder: u64, seq_inc: u64 },
    #[error("sequence counter {raw} maps beyond the addressable stream")]
    OffsetOverflow { raw: u64 },
}

/// Outcome of decoding one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Payload belongs at `byte_offset` in the stream.
    Packet { byte_offset: u64, payload_len: usize },
    /// Packet predates the observation start.
    TooEarly,
    /// In-band end-of-stream marker.
    StreamStop,
}

/// Sample geometry of the observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleGeometry {
    pub nchan: u32,
    pub nbit: u32,
    pub npol: u32,
    pub ndim: u32,
}

impl Default for SampleGeometry {
    fn default() -> Self {
        Self {
            nchan: 1,
            nbit: 8,
            npol: 1,
            ndim: 1,
        }
    }
}

impl SampleGeometry {
    /// Reads `NCHAN`, `NBIT`, `NPOL` and `NDIM`.
    ///
    /// # Errors
    ///
    /// Missing or unparsable keys, or a zero dimension.
    pub fn from_header(header: &AsciiHeader) -> Result<Self, FormatError> {
        let geometry = Self {
            nchan: header.get("NCHAN")?,
            nbit: header.get("NBIT")?,
            npol: header.get("NPOL")?,
            ndim: header.get("NDIM")?,
        };
        if geometry.bits_per_sample() == 0 {
            return Err(FormatError::Layout {
                reason: format!("zero sample size in {geometry:?}"),
            });
        }
        Ok(geometry)
    }

    /// Bits in one time sample across all channels, polarisations and dimensions.
    #[must_use]
    pub const fn bits_per_sample(&self) -> u64 {
        self.nchan as u64 * self.npol as u64 * self.ndim as u64 * self.nbit as u64
    }
}

/// Parses a `YYYY-MM-DD-hh:mm:ss` UTC timestamp into Unix seconds.
///
/// # Errors
///
/// [`FormatError::BadTime`] if `value` does not match [`UTC_FORMAT`].
pub fn parse_utc(value: &str) -> Result<i64, FormatError> {
    NaiveDateTime::parse_from_str(value.trim(), UTC_FORMAT)
        .map(|t| t.and_utc().timestamp())
        .map_err(|_| FormatError::BadTime {
            value: value.to_string(),
        })
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Per-stream packet decoder and encoder.
pub struct PacketFormat {
    kind: FormatKind,
    geometry: SampleGeometry,
    drift: DriftCorrector,
    start_seq: u64,
    seq_to_byte: u64,
    last_payload: Option<Range<usize>>,
    _unsync: PhantomUnsync,
}

impl PacketFormat {
    #[must_use]
    pub fn new(kind: FormatKind) -> Self {
        Self {
            kind,
            geometry: SampleGeometry::default(),
            drift: DriftCorrector::new(kind.seq_inc()),
            start_seq: 0,
            seq_to_byte: kind.payload_size() as u64,
            last_payload: None,
            _unsync: PhantomData,
        }
    }

    /// Builds and configures the format named by `PKT_FORMAT{suffix}`
    /// (falling back to `PKT_FORMAT`, then `simple`).
    ///
    /// # Errors
    ///
    /// See [`FormatKind::from_config`] and [`configure`](Self::configure).
    pub fn from_config(config: &AsciiHeader, suffix: &str) -> Result<Self, FormatError> {
        let name = config
            .get_str(&format!("PKT_FORMAT{suffix}"))
            .or_else(|| config.get_str("PKT_FORMAT"))
            .unwrap_or("simple");
        let mut format = Self::new(FormatKind::from_config(name, config)?);
        format.configure(config, suffix)?;
        Ok(format)
    }

    /// Applies the observation configuration.
    ///
    /// # Errors
    ///
    /// Missing or unparsable geometry keys.
    pub fn configure(&mut self, config: &AsciiHeader, suffix: &str) -> Result<(), FormatError> {
        self.geometry = SampleGeometry::from_header(config)?;
        self.seq_to_byte = self.kind.payload_size() as u64;
        self.drift.set_seq_inc(self.kind.seq_inc());
        debug!(
            format = self.kind.name(),
            suffix,
            seq_inc = self.kind.seq_inc(),
            seq_to_byte = self.seq_to_byte,
            "configured packet format"
        );
        Ok(())
    }

    /// Applies run-time parameters of an observation about to start.
    ///
    /// Formats synchronised to a digitiser epoch compute the first sequence
    /// counter of the observation from `ADC_SYNC_TIME{suffix}` (or
    /// `ADC_SYNC_TIME`), `UTC_START` and `TSAMP` (µs); earlier packets decode
    /// as [`Decoded::TooEarly`]. Without a sync time every packet counts.
    ///
    /// # Errors
    ///
    /// Unparsable keys or timestamps, or a zero `ACC_LEN`.
    pub fn prepare(&mut self, header: &AsciiHeader, suffix: &str) -> Result<(), FormatError> {
        if let FormatKind::Bpsr { acc_len } = &mut self.kind
            && let Some(value) = header.get_opt::<u64>("ACC_LEN")?
        {
            if value == 0 {
                return Err(FormatError::Layout {
                    reason: "ACC_LEN must be non-zero".to_string(),
                });
            }
            *acc_len = value;
            self.drift.set_seq_inc(self.kind.seq_inc());
        }

        self.start_seq = 0;
        if self.kind.uses_sync_time() {
            let sync = match header.get_opt::<i64>(&format!("ADC_SYNC_TIME{suffix}"))? {
                Some(sync) => Some(sync),
                None => header.get_opt::<i64>("ADC_SYNC_TIME")?,
            };
            if let Some(sync) = sync {
                let utc_start = parse_utc(&header.get::<String>("UTC_START")?)?;
                let tsamp: f64 = header.get("TSAMP")?;
                let offset_seconds = (utc_start - sync) as f64;
                let offset_seq = ((offset_seconds * 1e6) / tsamp) as i64;
                self.start_seq = (offset_seq / 4).max(0) as u64;
            }
        }

        self.reset();
        info!(
            format = self.kind.name(),
            suffix,
            start_seq = self.start_seq,
            "prepared packet format"
        );
        Ok(())
    }

    /// Clears drift state and the last decoded packet.
    pub fn reset(&mut self) {
        self.drift.reset();
        self.last_payload = None;
    }

    /// Decodes one datagram.
    ///
    /// # Errors
    ///
    /// A packet shorter than the format, a counter that drifted after the
    /// stream started, or one whose byte offset does not fit in a `u64`.
    pub fn decode_packet(&mut self, packet: &[u8]) -> Result<Decoded, FormatError> {
        let expected = self.kind.packet_size();
        let Some(raw) = FormatKind::read_seq(packet).filter(|_| packet.len() >= expected) else {
            return Err(FormatError::ShortPacket {
                len: packet.len(),
                expected,
            });
        };

        if self.kind.has_stream_stop() && raw == layout::STREAM_STOP_SEQ {
            return Ok(Decoded::StreamStop);
        }
        if raw < self.start_seq {
            return Ok(Decoded::TooEarly);
        }

        let seq_no = self.drift.correct(raw - self.start_seq)?;
        let Ok(seq_no) = u64::try_from(seq_no) else {
            return Ok(Decoded::TooEarly);
        };

        let Some(byte_offset) = seq_no.checked_mul(self.seq_to_byte) else {
            return Err(FormatError::OffsetOverflow { raw });
        };

        let header_size = self.kind.header_size();
        let payload_len = self.kind.payload_size();
        self.last_payload = Some(header_size..header_size + payload_len);

        Ok(Decoded::Packet {
            byte_offset,
            payload_len,
        })
    }

    /// Copies the payload of the most recently decoded packet into `dest`.
    ///
    /// `packet` must be the buffer passed to the last
    /// [`decode_packet`](Self::decode_packet). Returns the bytes copied.
    pub fn insert_last_packet(&self, packet: &[u8], dest: &mut [u8]) -> usize {
        let Some(payload) = self
            .last_payload
            .clone()
            .and_then(|range| packet.get(range))
        else {
            return 0;
        };
        let n = payload.len().min(dest.len());
        dest[..n].copy_from_slice(&payload[..n]);
        n
    }

    /// Writes the header of the packet carrying sequence number `seq`.
    ///
    /// Inverse of [`decode_packet`](Self::decode_packet) for an aligned stream.
    /// Returns `false` if `buf` is smaller than the header.
    pub fn encode_header(&self, buf: &mut [u8], seq: u64) -> bool {
        let Some(header) = buf.get_mut(..self.kind.header_size()) else {
            return false;
        };
        header.fill(0);
        let raw = self.start_seq + seq * self.kind.seq_inc();
        FormatKind::write_seq(header, raw)
    }

    /// Writes the in-band end-of-stream marker, if the format has one.
    pub fn encode_stream_stop(&self, buf: &mut [u8]) -> bool {
        if !self.kind.has_stream_stop() {
            return false;
        }
        match buf.get_mut(..self.kind.header_size()) {
            Some(header) => {
                header.fill(0);
                FormatKind::write_seq(header, layout::STREAM_STOP_SEQ)
            }
            None => false,
        }
    }

    /// Fills the payload of packet `seq` with a deterministic test pattern.
    pub fn generate_signal(&self, seq: u64, payload: &mut [u8]) {
        let seed = seq.wrapping_mul(self.kind.payload_size() as u64);
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u64) as u8;
        }
    }

    #[must_use]
    pub const fn kind(&self) -> FormatKind {
        self.kind
    }

    #[must_use]
    pub const fn geometry(&self) -> SampleGeometry {
        self.geometry
    }

    #[must_use]
    pub const fn get_resolution(&self) -> u64 {
        self.kind.resolution()
    }

    #[must_use]
    pub const fn header_size(&self) -> usize {
        self.kind.header_size()
    }

    #[must_use]
    pub const fn payload_size(&self) -> usize {
        self.kind.payload_size()
    }

    #[must_use]
    pub const fn packet_size(&self) -> usize {
        self.kind.packet_size()
    }

    /// Stream bytes per sequence number step.
    #[must_use]
    pub const fn bytes_per_tick(&self) -> u64 {
        self.seq_to_byte
    }

    #[must_use]
    pub const fn start_seq(&self) -> u64 {
        self.start_seq
    }

    #[must_use]
    pub const fn drift(&self) -> &DriftCorrector {
        &self.drift
    }

    /// Number of time samples held in `nbytes` of stream.
    #[must_use]
    pub const fn get_samples_for_bytes(&self, nbytes: u64) -> u64 {
        (nbytes * 8) / self.geometry.bits_per_sample()
    }
}

impl std::fmt::Debug for PacketFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketFormat")
            .field("kind", &self.kind)
            .field("start_seq", &self.start_seq)
            .field("seq_to_byte", &self.seq_to_byte)
            .field("global_offset", &self.drift.global_offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AsciiHeader {
        AsciiHeader::load_from_str("NCHAN 1\nNBIT 8\nNPOL 2\nNDIM 2\nPKT_PAYLOAD_SIZE 4096\n")
            .unwrap()
    }

    fn packet(format: &PacketFormat, seq: u64) -> Vec<u8> {
        let mut buf = vec![0u8; format.packet_size()];
        assert!(format.encode_header(&mut buf, seq));
        let header_size = format.header_size();
        format.generate_signal(seq, &mut buf[header_size..]);
        buf
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut format = PacketFormat::from_config(&config(), "").unwrap();
        for seq in [0, 1, 7, 255, 256, 1 << 20] {
            let buf = packet(&format, seq);
            assert_eq!(
                format.decode_packet(&buf).unwrap(),
                Decoded::Packet {
                    byte_offset: seq * format.bytes_per_tick(),
                    payload_len: 4096
                }
            );
        }
    }

    #[test]
    fn test_round_trip_with_larger_increment() {
        let config = AsciiHeader::load_from_str(
            "NCHAN 1\nNBIT 8\nNPOL 1\nNDIM 1\nPKT_FORMAT caspsr\n",
        )
        .unwrap();
        let mut format = PacketFormat::from_config(&config, "").unwrap();
        let buf = packet(&format, 42);
        assert_eq!(
            format.decode_packet(&buf).unwrap(),
            Decoded::Packet {
                byte_offset: 42 * 8192,
                payload_len: 8192
            }
        );
    }

    #[test]
    fn test_insert_last_packet_copies_payload() {
        let mut format = PacketFormat::from_config(&config(), "").unwrap();
        let buf = packet(&format, 3);
        format.decode_packet(&buf).unwrap();
        let mut dest = vec![0u8; 4096];
        assert_eq!(format.insert_last_packet(&buf, &mut dest), 4096);
        assert_eq!(dest, &buf[8..]);
    }

    #[test]
    fn test_stream_stop_marker() {
        let mut format = PacketFormat::from_config(&config(), "").unwrap();
        let mut buf = vec![0u8; format.packet_size()];
        assert!(format.encode_stream_stop(&mut buf));
        assert_eq!(format.decode_packet(&buf).unwrap(), Decoded::StreamStop);
    }

    #[test]
    fn test_short_packet_rejected() {
        let mut format = PacketFormat::from_config(&config(), "").unwrap();
        assert!(matches!(
            format.decode_packet(&[0u8; 100]),
            Err(FormatError::ShortPacket { len: 100, expected: 4104 })
        ));
    }

    #[test]
    fn test_counter_beyond_stream_rejected() {
        let mut format = PacketFormat::from_config(&config(), "").unwrap();
        let mut buf = vec![0u8; format.packet_size()];
        assert!(FormatKind::write_seq(&mut buf, 1 << 60));
        assert!(matches!(
            format.decode_packet(&buf),
            Err(FormatError::OffsetOverflow { raw }) if raw == 1 << 60
        ));
    }

    #[test]
    fn test_prepare_rejects_zero_acc_len() {
        let config = AsciiHeader::load_from_str(
            "NCHAN 1024\nNBIT 8\nNPOL 2\nNDIM 2\nPKT_FORMAT bpsr\n",
        )
        .unwrap();
        let mut format = PacketFormat::from_config(&config, "").unwrap();
        let mut header = config.clone();
        header.set("ACC_LEN", 0);
        assert!(matches!(
            format.prepare(&header, ""),
            Err(FormatError::Layout { .. })
        ));
        assert_ne!(format.kind().seq_inc(), 0);
    }

    #[test]
    fn test_too_early_before_sync_start() {
        let config = AsciiHeader::load_from_str(
            "NCHAN 1024\nNBIT 8\nNPOL 2\nNDIM 2\nPKT_FORMAT bpsr\nACC_LEN 25\n",
        )
        .unwrap();
        let mut format = PacketFormat::from_config(&config, "").unwrap();

        let mut header = config.clone();
        header.set("ADC_SYNC_TIME", parse_utc("2024-03-01-12:00:00").unwrap());
        header.set("UTC_START", "2024-03-01-12:00:10");
        header.set("TSAMP", 64);
        format.prepare(&header, "").unwrap();

        // 10 s / 64 µs = 156250 samples -> 39062 counts
        assert_eq!(format.start_seq(), 39_062);

        let mut early = vec![0u8; format.packet_size()];
        FormatKind::write_seq(&mut early, 100);
        assert_eq!(format.decode_packet(&early).unwrap(), Decoded::TooEarly);

        let mut first = vec![0u8; format.packet_size()];
        FormatKind::write_seq(&mut first, 39_062);
        assert_eq!(
            format.decode_packet(&first).unwrap(),
            Decoded::Packet {
                byte_offset: 0,
                payload_len: 4096
            }
        );
    }

    #[test]
    fn test_caspsr_prefers_suffixed_sync_time() {
        let config =
            AsciiHeader::load_from_str("NCHAN 1\nNBIT 8\nNPOL 1\nNDIM 1\nPKT_FORMAT caspsr\n")
                .unwrap();
        let mut format = PacketFormat::from_config(&config, "_1").unwrap();
        let mut header = config.clone();
        header.set("ADC_SYNC_TIME", 0);
        header.set("ADC_SYNC_TIME_1", parse_utc("2024-03-01-12:00:00").unwrap());
        header.set("UTC_START", "2024-03-01-12:00:01");
        header.set("TSAMP", 1);
        format.prepare(&header, "_1").unwrap();
        assert_eq!(format.start_seq(), 250_000);
    }

    #[test]
    fn test_samples_for_bytes() {
        let format = PacketFormat::from_config(&config(), "").unwrap();
        assert_eq!(format.get_samples_for_bytes(4096), 1024);
    }

    #[test]
    fn test_parse_utc() {
        assert_eq!(parse_utc("1970-01-01-00:01:00").unwrap(), 60);
        assert!(matches!(
            parse_utc("yesterday"),
            Err(FormatError::BadTime { .. })
        ));
    }

    #[test]
    fn test_format_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<PacketFormat>();
    }
}
