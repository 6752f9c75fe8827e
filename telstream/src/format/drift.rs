//! Sequence counter alignment shared by every packet format.
//!
//! Digitisers count in units of `seq_inc` per packet, but the very first
//! counter value seen after a restart is not always aligned to that
//! increment. The corrector measures the misalignment on the first packet,
//! folds it into a signed `global_offset`, and from then on requires every
//! corrected counter to be an exact multiple of `seq_inc`.
//!
//! ```text
//! fixed = raw + global_offset
//! r     = fixed mod seq_inc
//! r == 0              -> aligned
//! fixed < seq_inc     -> global_offset -= r           (pull back to 0)
//! otherwise           -> global_offset += seq_inc - r (push to next boundary)
//! seq_no = fixed / seq_inc
//! ```

use super::FormatError;
use crate::trace::{error, warn};

#[derive(Debug, Clone)]
pub struct DriftCorrector {
    seq_inc: u64,
    global_offset: i64,
    started: bool,
}

impl DriftCorrector {
    #[must_use]
    pub const fn new(seq_inc: u64) -> Self {
        Self {
            seq_inc,
            global_offset: 0,
            started: false,
        }
    }

    #[must_use]
    pub const fn seq_inc(&self) -> u64 {
        self.seq_inc
    }

    /// Changes the increment; only meaningful before the stream starts.
    pub fn set_seq_inc(&mut self, seq_inc: u64) {
        self.seq_inc = seq_inc.max(1);
    }

    #[must_use]
    pub const fn global_offset(&self) -> i64 {
        self.global_offset
    }

    #[must_use]
    pub const fn started(&self) -> bool {
        self.started
    }

    /// Forgets the accumulated offset ahead of a new observation.
    pub fn reset(&mut self) {
        self.global_offset = 0;
        self.started = false;
    }

    /// Maps a raw counter to a packet sequence number.
    ///
    /// Negative results lie before the start of the stream.
    ///
    /// # Errors
    ///
    /// [`FormatError::Desynchronized`] if a counter is misaligned after the
    /// first packet.
    pub fn correct(&mut self, raw: u64) -> Result<i64, FormatError> {
        let seq_inc = i128::from(self.seq_inc);
        let mut fixed = i128::from(raw) + i128::from(self.global_offset);
        let remainder = fixed.rem_euclid(seq_inc);

        if remainder != 0 {
            if self.started {
                error!(
                    raw,
                    remainder = remainder as i64,
                    seq_inc = self.seq_inc,
                    "sequence counter drifted after stream start"
                );
                return Err(FormatError::Desynchronized {
                    raw,
                    remainder: remainder as u64,
                    seq_inc: self.seq_inc,
                });
            }

            let adjusted = if fixed < seq_inc {
                i128::from(self.global_offset) - remainder
            } else {
                i128::from(self.global_offset) + (seq_inc - remainder)
            };
            warn!(
                from = self.global_offset,
                to = adjusted as i64,
                raw,
                "adjusting global sequence offset"
            );
            self.global_offset = adjusted as i64;
            fixed = i128::from(raw) + adjusted;
        }

        self.started = true;
        let seq_no = fixed.div_euclid(seq_inc);
        i64::try_from(seq_no).map_err(|_| FormatError::Desynchronized {
            raw,
            remainder: 0,
            seq_inc: self.seq_inc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_counter_untouched() {
        let mut drift = DriftCorrector::new(2048);
        assert_eq!(drift.correct(2048 * 5).unwrap(), 5);
        assert_eq!(drift.global_offset(), 0);
        assert!(drift.started());
    }

    #[test]
    fn test_first_packet_pulled_back_to_zero() {
        let mut drift = DriftCorrector::new(10);
        assert_eq!(drift.correct(3).unwrap(), 0);
        assert_eq!(drift.global_offset(), -3);
        assert_eq!(drift.correct(13).unwrap(), 1);
        assert_eq!(drift.correct(103).unwrap(), 10);
    }

    #[test]
    fn test_first_packet_pushed_to_next_boundary() {
        let mut drift = DriftCorrector::new(10);
        assert_eq!(drift.correct(27).unwrap(), 3);
        assert_eq!(drift.global_offset(), 3);
        assert_eq!(drift.correct(37).unwrap(), 4);
    }

    #[test]
    fn test_constant_skew_converges_after_first_packet() {
        let seq_inc = 12_800;
        let skew = 517;
        let mut drift = DriftCorrector::new(seq_inc);
        drift.correct(seq_inc * 40 + skew).unwrap();
        let offset = drift.global_offset();

        for n in 41..200 {
            let raw = seq_inc * n + skew;
            let fixed = raw as i64 + drift.global_offset();
            assert_eq!(fixed % seq_inc as i64, 0);
            drift.correct(raw).unwrap();
            assert_eq!(drift.global_offset(), offset);
        }
    }

    #[test]
    fn test_drift_after_start_is_fatal() {
        let mut drift = DriftCorrector::new(10);
        drift.correct(20).unwrap();
        assert!(matches!(
            drift.correct(31),
            Err(FormatError::Desynchronized { raw: 31, remainder: 1, seq_inc: 10 })
        ));
    }

    #[test]
    fn test_reset_allows_new_alignment() {
        let mut drift = DriftCorrector::new(10);
        drift.correct(27).unwrap();
        drift.reset();
        assert!(!drift.started());
        assert_eq!(drift.correct(4).unwrap(), 0);
        assert_eq!(drift.global_offset(), -4);
    }
}
