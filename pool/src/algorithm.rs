/// Proof-of-work algorithm registry
///
/// Holds the per-algorithm constants the pool needs to convert between
/// difficulties and 256-bit targets, plus the KawPoW epoch seed.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use sha3::{Digest, Keccak256};
use std::fmt;

use crate::config::ConfigError;

/// Fixed-point scale used when dividing a target by a fractional difficulty.
const DIFFICULTY_SCALE: u64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    KawPow,
}

impl Algorithm {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_lowercase().as_str() {
            "kawpow" => Ok(Algorithm::KawPow),
            other => Err(ConfigError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::KawPow => "kawpow",
        }
    }

    /// Target of a difficulty-1 share.
    pub fn diff1(&self) -> BigUint {
        match self {
            Algorithm::KawPow => BigUint::parse_bytes(
                b"00000000ff000000000000000000000000000000000000000000000000000000",
                16,
            )
            .unwrap_or_else(BigUint::zero),
        }
    }

    /// Factor applied to hash-derived difficulties before comparing them
    /// against client difficulties.
    pub fn multiplier(&self) -> f64 {
        match self {
            Algorithm::KawPow => 1.0,
        }
    }

    pub fn epoch_length(&self) -> u64 {
        match self {
            Algorithm::KawPow => 7500,
        }
    }

    /// Share target for a client difficulty: `diff1 / difficulty`.
    pub fn target_for_difficulty(&self, difficulty: f64) -> BigUint {
        let scaled = (difficulty * DIFFICULTY_SCALE as f64).round();
        if !scaled.is_finite() || scaled < 1.0 {
            return self.diff1() * DIFFICULTY_SCALE;
        }
        let scaled = BigUint::from(scaled as u128);
        (self.diff1() * DIFFICULTY_SCALE) / scaled
    }

    /// Share target rendered the way KawPoW miners expect it (64 hex chars).
    pub fn target_hex_for_difficulty(&self, difficulty: f64) -> String {
        format!("{:0>64}", self.target_for_difficulty(difficulty).to_str_radix(16))
    }

    /// Difficulty represented by a digest, already scaled by the multiplier.
    pub fn difficulty_for_hash(&self, hash: &BigUint) -> f64 {
        if hash.is_zero() {
            return f64::INFINITY;
        }
        let diff1 = self.diff1().to_f64().unwrap_or(f64::MAX);
        let hash = hash.to_f64().unwrap_or(f64::MAX);
        diff1 / hash * self.multiplier()
    }

    /// Network difficulty for a template target (hex, display order).
    pub fn difficulty_for_target_hex(&self, target_hex: &str) -> Option<f64> {
        let target = BigUint::parse_bytes(target_hex.trim_start_matches("0x").as_bytes(), 16)?;
        Some(self.difficulty_for_hash(&target))
    }

    /// KawPoW epoch seed: Keccak-256 iterated `height / epoch_length` times
    /// starting from 32 zero bytes.
    pub fn seed_hash(&self, height: u64) -> String {
        let epoch = height / self.epoch_length();
        let mut seed = [0u8; 32];
        for _ in 0..epoch {
            let digest: [u8; 32] = Keccak256::digest(seed).into();
            seed = digest;
        }
        hex::encode(seed)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parses a 64-char big-endian hex digest into an integer.
pub fn hash_to_biguint(hash_hex: &str) -> Option<BigUint> {
    let hex = hash_hex.trim_start_matches("0x");
    if hex.is_empty() {
        return None;
    }
    BigUint::parse_bytes(hex.as_bytes(), 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_algorithm_is_a_config_error() {
        assert!(Algorithm::from_name("kawpow").is_ok());
        assert!(Algorithm::from_name("KawPow").is_ok());
        assert!(matches!(
            Algorithm::from_name("scrypt"),
            Err(ConfigError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn difficulty_one_target_is_diff1() {
        let algo = Algorithm::KawPow;
        assert_eq!(algo.target_for_difficulty(1.0), algo.diff1());
        assert_eq!(
            algo.target_hex_for_difficulty(1.0),
            "00000000ff000000000000000000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn target_shrinks_as_difficulty_grows() {
        let algo = Algorithm::KawPow;
        let t1 = algo.target_for_difficulty(1.0);
        let t2 = algo.target_for_difficulty(2.0);
        let half = algo.target_for_difficulty(0.5);
        assert_eq!(t1.clone() / 2u32, t2);
        assert_eq!(t1 * 2u32, half);
    }

    #[test]
    fn hash_difficulty_round_trips_through_target() {
        let algo = Algorithm::KawPow;
        let target = algo.target_for_difficulty(16.0);
        let diff = algo.difficulty_for_hash(&target);
        assert!((diff - 16.0).abs() < 1e-6);
    }

    #[test]
    fn zero_hash_is_infinitely_hard() {
        assert!(Algorithm::KawPow.difficulty_for_hash(&BigUint::zero()).is_infinite());
    }

    #[test]
    fn seed_hash_epoch_zero_is_zero_bytes() {
        let algo = Algorithm::KawPow;
        assert_eq!(algo.seed_hash(0), "0".repeat(64));
        assert_eq!(algo.seed_hash(7499), "0".repeat(64));
        // Epoch 1 is keccak256 of 32 zero bytes.
        assert_eq!(
            algo.seed_hash(7500),
            "290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563"
        );
    }
}
