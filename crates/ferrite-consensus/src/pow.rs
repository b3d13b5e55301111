//! Proof-of-work and chain-work arithmetic.

use crate::{BlockHeader, ChainParams, ConsensusError, ConsensusResult};
use num_bigint::BigUint;
use num_traits::{One, Zero};

/// Decode a compact target.
///
/// Returns `None` for negative or overflowing encodings.
pub fn compact_to_target(bits: u32) -> Option<BigUint> {
    let size = (bits >> 24) as usize;
    let word = bits & 0x007f_ffff;
    let negative = word != 0 && (bits & 0x0080_0000) != 0;
    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    if negative || overflow {
        return None;
    }
    Some(if size <= 3 {
        BigUint::from(word >> (8 * (3 - size)))
    } else {
        BigUint::from(word) << (8 * (size - 3))
    })
}

/// Encode a target in compact form.
pub fn target_to_compact(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let bytes = target.to_bytes_be();
    let mut size = bytes.len() as u32;
    let mut word: u32 = if bytes.len() <= 3 {
        let mut w = 0u32;
        for b in &bytes {
            w = (w << 8) | *b as u32;
        }
        w << (8 * (3 - bytes.len() as u32))
    } else {
        ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | bytes[2] as u32
    };
    // Keep the sign bit clear.
    if word & 0x0080_0000 != 0 {
        word >>= 8;
        size += 1;
    }
    (size << 24) | word
}

/// Work represented by a block with the given compact target:
/// `2^256 / (target + 1)`. Invalid or zero targets contribute no work.
pub fn block_proof(bits: u32) -> BigUint {
    match compact_to_target(bits) {
        Some(target) if !target.is_zero() => (BigUint::one() << 256u32) / (target + 1u32),
        _ => BigUint::zero(),
    }
}

/// Check that the header hash meets its target and the target is within
/// the network limit.
pub fn check_proof_of_work(header: &BlockHeader, params: &ChainParams) -> ConsensusResult<()> {
    if params.skip_pow {
        return Ok(());
    }
    let target = compact_to_target(header.bits)
        .filter(|t| !t.is_zero() && *t <= params.pow_limit())
        .ok_or(ConsensusError::BadDiffBits { bits: header.bits })?;

    let hash = header.hash();
    let mut be = *hash.as_bytes();
    be.reverse();
    if BigUint::from_bytes_be(&be) > target {
        return Err(ConsensusError::HighHash { hash });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_round_trip_known_values() {
        for bits in [0x1d00ffffu32, 0x207fffff, 0x1b0404cb] {
            let target = compact_to_target(bits).unwrap();
            assert_eq!(target_to_compact(&target), bits);
        }
    }

    #[test]
    fn test_negative_and_overflow_rejected() {
        assert!(compact_to_target(0x04923456).is_none());
        assert!(compact_to_target(0xff123456).is_none());
        assert_eq!(compact_to_target(0x01003456), Some(BigUint::zero()));
    }

    #[test]
    fn test_block_proof() {
        // Regtest limit: target is just below 2^255, so each block is worth 2.
        assert_eq!(block_proof(0x207fffff), BigUint::from(2u32));
        // Mainnet genesis difficulty.
        assert_eq!(block_proof(0x1d00ffff), BigUint::from(0x1_0001_0001u64));
        assert_eq!(block_proof(0), BigUint::zero());
    }

    #[test]
    fn test_genesis_pow() {
        let params = ChainParams::mainnet();
        check_proof_of_work(&params.genesis_block().header, &params).unwrap();

        let mut header = params.genesis_block().header;
        header.nonce = header.nonce.wrapping_add(1);
        assert!(matches!(
            check_proof_of_work(&header, &params),
            Err(ConsensusError::HighHash { .. })
        ));
    }

    #[test]
    fn test_target_above_limit_rejected() {
        let params = ChainParams::mainnet();
        let mut header = params.genesis_block().header;
        header.bits = 0x207fffff;
        assert!(matches!(
            check_proof_of_work(&header, &params),
            Err(ConsensusError::BadDiffBits { .. })
        ));
    }
}
