//! Holding-register catalogue and word decoding for the spectrometer heads.
//!
//! Each optical head exposes its measurement through 16-bit holding registers.
//! Scalar quantities occupy one or two words; angles and spectrum values are
//! packed as two consecutive words forming one big-endian IEEE-754 single.
//! The catalogue here is fixed by the head firmware and shared by both
//! channels; only the bus slave address differs between them.

use thiserror::Error;

/// Holding register that starts a measurement when written.
pub const TRIGGER_REGISTER: u16 = 2;

/// Value written to [`TRIGGER_REGISTER`] to start a measurement.
pub const TRIGGER_VALUE: u16 = 1024;

/// Number of spectrum values one complete cycle yields.
pub const ORDINATE_LEN: usize = 255;

/// Total words across the five ordinate sub-reads (two per value).
pub const ORDINATE_WORDS: usize = 2 * ORDINATE_LEN;

/// Semantic identity of a decoded register field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Sensor integration time, raw units.
    IntegrationTime,
    /// Number of pixels in the spectrum.
    Length,
    /// Head inclination sampled before the exposure, degrees.
    PreInclination,
    /// Head inclination sampled after the exposure, degrees.
    PostInclination,
    /// One of the five spectrum sub-reads, in read order.
    Ordinate(usize),
}

/// One entry of the fixed read plan: a register address, the number of
/// 16-bit words to fetch from it, and what the words mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterField {
    /// Holding-register address on the head.
    pub address: u16,
    /// Words the response must carry.
    pub words: u16,
    /// What the payload decodes to.
    pub kind: FieldKind,
}

/// The fixed read plan, visited in this order after every trigger.
///
/// The spectrum is too large for a single bus transaction, so it is split
/// into five sub-reads at consecutive address blocks. The order is part of
/// the head's handshake and never changes, even after a failed cycle.
pub const READ_PLAN: [RegisterField; 9] = [
    RegisterField { address: 2006, words: 1, kind: FieldKind::IntegrationTime },
    RegisterField { address: 2010, words: 2, kind: FieldKind::Length },
    RegisterField { address: 2014, words: 2, kind: FieldKind::PreInclination },
    RegisterField { address: 2016, words: 2, kind: FieldKind::PostInclination },
    RegisterField { address: 2613, words: 124, kind: FieldKind::Ordinate(0) },
    RegisterField { address: 2737, words: 124, kind: FieldKind::Ordinate(1) },
    RegisterField { address: 2861, words: 124, kind: FieldKind::Ordinate(2) },
    RegisterField { address: 2985, words: 124, kind: FieldKind::Ordinate(3) },
    RegisterField { address: 3109, words: 14, kind: FieldKind::Ordinate(4) },
];

/// Malformed register payloads.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A response carried the wrong number of words for its field.
    #[error("register {address} returned {actual} words, expected {expected}")]
    WordCount {
        /// Register the read addressed.
        address: u16,
        /// Words the field requires.
        expected: usize,
        /// Words the response carried.
        actual: usize,
    },
    /// The assembled ordinate payload does not form the expected float pairs.
    #[error("ordinate payload holds {actual} words, expected {expected}")]
    OrdinatePayload {
        /// Words a complete spectrum requires.
        expected: usize,
        /// Words actually accumulated.
        actual: usize,
    },
    /// A finished cycle is missing a field it should have read.
    #[error("field {0} missing from completed cycle")]
    MissingField(&'static str),
}

fn check_len(field: RegisterField, words: &[u16]) -> Result<(), DecodeError> {
    if words.len() != field.words as usize {
        return Err(DecodeError::WordCount {
            address: field.address,
            expected: field.words as usize,
            actual: words.len(),
        });
    }
    Ok(())
}

/// Decode a raw unsigned scalar. Multi-word scalar fields carry the value in
/// the first word; the remainder is reserved by the firmware.
pub fn decode_scalar(field: RegisterField, words: &[u16]) -> Result<u16, DecodeError> {
    check_len(field, words)?;
    Ok(words[0])
}

/// Decode a two-word angle field as a big-endian IEEE-754 single.
pub fn decode_angle(field: RegisterField, words: &[u16]) -> Result<f32, DecodeError> {
    check_len(field, words)?;
    Ok(float32_from_words(words[0], words[1]))
}

/// Reinterpret two words as one float: `hi` carries the high-order half of
/// the big-endian bit pattern.
pub fn float32_from_words(hi: u16, lo: u16) -> f32 {
    f32::from_bits((u32::from(hi) << 16) | u32::from(lo))
}

/// Split a float into the two-word form the head serves it in.
pub fn float32_to_words(value: f32) -> (u16, u16) {
    let bits = value.to_bits();
    ((bits >> 16) as u16, (bits & 0xFFFF) as u16)
}

/// Decode the concatenation of all five ordinate sub-reads into the spectrum,
/// preserving order.
pub fn decode_ordinate(words: &[u16]) -> Result<Vec<f32>, DecodeError> {
    if words.len() != ORDINATE_WORDS {
        return Err(DecodeError::OrdinatePayload {
            expected: ORDINATE_WORDS,
            actual: words.len(),
        });
    }
    Ok(words
        .chunks_exact(2)
        .map(|pair| float32_from_words(pair[0], pair[1]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float32_round_trips_bit_pattern() {
        for value in [0.0f32, 1.0, -1.0, 3.5e-2, 1.234e6, f32::MIN_POSITIVE] {
            let (hi, lo) = float32_to_words(value);
            assert_eq!(float32_from_words(hi, lo).to_bits(), value.to_bits());
        }
        // 1.0f32 is 0x3F80_0000: high word 0x3F80, low word zero.
        assert_eq!(float32_from_words(0x3F80, 0x0000), 1.0);
    }

    #[test]
    fn read_plan_is_fixed_and_ascending() {
        let addresses: Vec<u16> = READ_PLAN.iter().map(|f| f.address).collect();
        assert_eq!(
            addresses,
            vec![2006, 2010, 2014, 2016, 2613, 2737, 2861, 2985, 3109]
        );
        assert!(addresses.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ordinate_sub_reads_cover_the_whole_spectrum() {
        let total: usize = READ_PLAN
            .iter()
            .filter(|f| matches!(f.kind, FieldKind::Ordinate(_)))
            .map(|f| f.words as usize)
            .sum();
        assert_eq!(total, ORDINATE_WORDS);
    }

    #[test]
    fn decode_ordinate_yields_255_values_in_order() {
        let mut words = Vec::with_capacity(ORDINATE_WORDS);
        for i in 0..ORDINATE_LEN {
            let (hi, lo) = float32_to_words(i as f32);
            words.push(hi);
            words.push(lo);
        }
        let decoded = decode_ordinate(&words).unwrap();
        assert_eq!(decoded.len(), ORDINATE_LEN);
        assert_eq!(decoded[0], 0.0);
        assert_eq!(decoded[254], 254.0);
    }

    #[test]
    fn decode_ordinate_rejects_short_payload() {
        let words = vec![0u16; ORDINATE_WORDS - 14];
        assert_eq!(
            decode_ordinate(&words),
            Err(DecodeError::OrdinatePayload {
                expected: ORDINATE_WORDS,
                actual: ORDINATE_WORDS - 14,
            })
        );
    }

    #[test]
    fn scalar_takes_first_word() {
        let field = READ_PLAN[1]; // length, two words
        assert_eq!(decode_scalar(field, &[255, 0]).unwrap(), 255);
    }

    #[test]
    fn word_count_mismatch_is_rejected() {
        let field = READ_PLAN[0]; // integration time, one word
        let err = decode_scalar(field, &[1, 2]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::WordCount {
                address: 2006,
                expected: 1,
                actual: 2,
            }
        );
    }

    #[test]
    fn angle_decodes_big_endian_pair() {
        let (hi, lo) = float32_to_words(-4.25);
        let field = READ_PLAN[2]; // pre-inclination
        assert_eq!(decode_angle(field, &[hi, lo]).unwrap(), -4.25);
    }
}
