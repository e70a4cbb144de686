//! Ready-made checksums for [`Simulation::save`](crate::Simulation::save).
//!
//! Both helpers hash the codec encoding of the state, so two peers produce the
//! same value for the same state regardless of platform.
//!
//! ```
//! use rollback_netplay::checksum::compute_checksum;
//!
//! let a = compute_checksum(&(3_u32, "ship")).unwrap();
//! let b = compute_checksum(&(3_u32, "ship")).unwrap();
//! assert_eq!(a, b);
//! ```

use serde::Serialize;

use crate::network::codec::{encode, CodecError};
use crate::SimulationError;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0100_0000_01b3;

/// FNV-1a over the encoded state.
pub fn compute_checksum<T: Serialize>(state: &T) -> Result<u128, ChecksumError> {
    let bytes = encode(state)?;
    Ok(u128::from(fnv1a(&bytes)))
}

/// Fletcher-16 over the encoded state. Cheaper, with more collisions.
pub fn compute_checksum_fletcher16<T: Serialize>(state: &T) -> Result<u128, ChecksumError> {
    let bytes = encode(state)?;
    Ok(u128::from(fletcher16(&bytes)))
}

/// 64-bit FNV-1a.
#[inline]
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Fletcher-16 checksum.
#[inline]
#[must_use]
pub fn fletcher16(data: &[u8]) -> u16 {
    let mut sum1: u16 = 0;
    let mut sum2: u16 = 0;

    for &byte in data {
        sum1 = (sum1 + u16::from(byte)) % 255;
        sum2 = (sum2 + sum1) % 255;
    }

    (sum2 << 8) | sum1
}

/// The state could not be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumError {
    /// Encoding the state failed.
    SerializationFailed(String),
}

impl From<CodecError> for ChecksumError {
    fn from(err: CodecError) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

impl From<ChecksumError> for SimulationError {
    fn from(err: ChecksumError) -> Self {
        SimulationError::new(err.to_string())
    }
}

impl std::fmt::Display for ChecksumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationFailed(msg) => write!(f, "checksum failed: {msg}"),
        }
    }
}

impl std::error::Error for ChecksumError {}
