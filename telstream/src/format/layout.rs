//! Wire layouts of the supported packet formats.
//!
//! Every layout carries a big-endian 64-bit sequence counter in the first
//! eight header bytes. They differ in header and payload size, in how far the
//! counter advances per packet, and in how the start of an observation is
//! located.
//!
//! | Format   | Header | Payload | `seq_inc`        | Stream end marker |
//! |----------|--------|---------|------------------|-------------------|
//! | `simple` | 8..    | any     | `PKT_SEQ_INC`    | `u64::MAX`        |
//! | `bpsr`   | 8      | 4096    | `512 × ACC_LEN`  | none              |
//! | `caspsr` | 16     | 8192    | 2048             | none              |

use super::FormatError;
use crate::header::AsciiHeader;

pub const SEQ_FIELD_SIZE: usize = 8;
pub const STREAM_STOP_SEQ: u64 = u64::MAX;

const BPSR_HEADER_SIZE: usize = 8;
const BPSR_PAYLOAD_SIZE: usize = 4096;
const BPSR_DEFAULT_ACC_LEN: u64 = 25;
const CASPSR_HEADER_SIZE: usize = 16;
const CASPSR_PAYLOAD_SIZE: usize = 8192;
const CASPSR_SEQ_INC: u64 = 2048;

/// Tagged format variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    /// Generic counter-per-packet format.
    Simple {
        header_size: usize,
        payload_size: usize,
        seq_inc: u64,
        resolution: u64,
    },
    /// Parkes BPSR backend.
    Bpsr { acc_len: u64 },
    /// Parkes CASPSR backend.
    Caspsr,
}

impl FormatKind {
    /// A `simple` layout with a unit counter increment.
    #[must_use]
    pub const fn simple(header_size: usize, payload_size: usize) -> Self {
        Self::Simple {
            header_size,
            payload_size,
            seq_inc: 1,
            resolution: payload_size as u64,
        }
    }

    /// Builds the variant named by `name`, reading layout keys from `config`.
    ///
    /// `simple` reads `PKT_HEADER_SIZE` (default 8), `PKT_PAYLOAD_SIZE`
    /// (default 4096), `PKT_SEQ_INC` (default 1) and `PKT_RESOLUTION`
    /// (default the payload size). `bpsr` reads `ACC_LEN` (default 25).
    ///
    /// # Errors
    ///
    /// Unknown name, unparsable keys, a zero `ACC_LEN`, or an inconsistent
    /// simple layout.
    pub fn from_config(name: &str, config: &AsciiHeader) -> Result<Self, FormatError> {
        match name.to_ascii_lowercase().as_str() {
            "simple" => {
                let header_size = config.get_opt("PKT_HEADER_SIZE")?.unwrap_or(SEQ_FIELD_SIZE);
                let payload_size = config.get_opt("PKT_PAYLOAD_SIZE")?.unwrap_or(4096);
                let seq_inc = config.get_opt("PKT_SEQ_INC")?.unwrap_or(1);
                let resolution = config
                    .get_opt("PKT_RESOLUTION")?
                    .unwrap_or(payload_size as u64);
                let kind = Self::Simple {
                    header_size,
                    payload_size,
                    seq_inc,
                    resolution,
                };
                kind.validate()?;
                Ok(kind)
            }
            "bpsr" => {
                let acc_len = config.get_opt("ACC_LEN")?.unwrap_or(BPSR_DEFAULT_ACC_LEN);
                if acc_len == 0 {
                    return Err(FormatError::Layout {
                        reason: "ACC_LEN must be non-zero".to_string(),
                    });
                }
                Ok(Self::Bpsr { acc_len })
            }
            "caspsr" => Ok(Self::Caspsr),
            _ => Err(FormatError::UnknownFormat(name.to_string())),
        }
    }

    fn validate(&self) -> Result<(), FormatError> {
        if self.header_size() < SEQ_FIELD_SIZE {
            return Err(FormatError::Layout {
                reason: format!(
                    "header of {} bytes cannot hold the sequence counter",
                    self.header_size()
                ),
            });
        }
        if self.payload_size() == 0 || self.seq_inc() == 0 {
            return Err(FormatError::Layout {
                reason: "payload size and sequence increment must be non-zero".to_string(),
            });
        }
        let resolution = self.resolution();
        if resolution == 0 || resolution % self.payload_size() as u64 != 0 {
            return Err(FormatError::Layout {
                reason: format!(
                    "resolution {resolution} must be a multiple of the payload size {}",
                    self.payload_size()
                ),
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Simple { .. } => "simple",
            Self::Bpsr { .. } => "bpsr",
            Self::Caspsr => "caspsr",
        }
    }

    #[must_use]
    pub const fn header_size(&self) -> usize {
        match self {
            Self::Simple { header_size, .. } => *header_size,
            Self::Bpsr { .. } => BPSR_HEADER_SIZE,
            Self::Caspsr => CASPSR_HEADER_SIZE,
        }
    }

    #[must_use]
    pub const fn payload_size(&self) -> usize {
        match self {
            Self::Simple { payload_size, .. } => *payload_size,
            Self::Bpsr { .. } => BPSR_PAYLOAD_SIZE,
            Self::Caspsr => CASPSR_PAYLOAD_SIZE,
        }
    }

    /// Datagram size on the wire.
    #[must_use]
    pub const fn packet_size(&self) -> usize {
        self.header_size() + self.payload_size()
    }

    /// Counter advance per packet.
    #[must_use]
    pub const fn seq_inc(&self) -> u64 {
        match self {
            Self::Simple { seq_inc, .. } => *seq_inc,
            Self::Bpsr { acc_len } => 512 * *acc_len,
            Self::Caspsr => CASPSR_SEQ_INC,
        }
    }

    /// Smallest unit a block boundary must align to.
    #[must_use]
    pub const fn resolution(&self) -> u64 {
        match self {
            Self::Simple { resolution, .. } => *resolution,
            Self::Bpsr { .. } => BPSR_PAYLOAD_SIZE as u64,
            Self::Caspsr => CASPSR_PAYLOAD_SIZE as u64,
        }
    }

    /// Whether the format marks the end of a stream in-band.
    #[must_use]
    pub const fn has_stream_stop(&self) -> bool {
        matches!(self, Self::Simple { .. })
    }

    /// Whether the observation start is derived from `ADC_SYNC_TIME`.
    #[must_use]
    pub const fn uses_sync_time(&self) -> bool {
        matches!(self, Self::Bpsr { .. } | Self::Caspsr)
    }

    pub(crate) fn read_seq(packet: &[u8]) -> Option<u64> {
        let field: [u8; SEQ_FIELD_SIZE] = packet.get(..SEQ_FIELD_SIZE)?.try_into().ok()?;
        Some(u64::from_be_bytes(field))
    }

    pub(crate) fn write_seq(buf: &mut [u8], seq: u64) -> bool {
        match buf.get_mut(..SEQ_FIELD_SIZE) {
            Some(field) => {
                field.copy_from_slice(&seq.to_be_bytes());
                true
            }
            None => false,
        }
    }
}
