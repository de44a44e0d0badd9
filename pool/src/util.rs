//! Bitcoin-style serialization helpers shared by the block and transaction
//! builders.

use sha2::{Digest, Sha256};

pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

pub fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Decodes hex and flips the byte order (display <-> internal).
pub fn reverse_hex(hex_str: &str) -> Result<Vec<u8>, hex::FromHexError> {
    Ok(reversed(&hex::decode(hex_str)?))
}

/// CompactSize unsigned integer.
pub fn var_int(n: u64) -> Vec<u8> {
    match n {
        0..=0xfc => vec![n as u8],
        0xfd..=0xffff => {
            let mut out = vec![0xfd];
            out.extend_from_slice(&(n as u16).to_le_bytes());
            out
        }
        0x1_0000..=0xffff_ffff => {
            let mut out = vec![0xfe];
            out.extend_from_slice(&(n as u32).to_le_bytes());
            out
        }
        _ => {
            let mut out = vec![0xff];
            out.extend_from_slice(&n.to_le_bytes());
            out
        }
    }
}

/// Script push of raw data (direct push or OP_PUSHDATA1/2).
pub fn push_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 3);
    match data.len() {
        0..=0x4b => out.push(data.len() as u8),
        0x4c..=0xff => {
            out.push(0x4c);
            out.push(data.len() as u8);
        }
        len => {
            out.push(0x4d);
            out.extend_from_slice(&(len as u16).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

/// BIP34 block height push: minimal little-endian script number with room
/// for the sign bit, prefixed by its length.
pub fn serialize_height(height: u64) -> Vec<u8> {
    let bits = 64 - (height << 1).leading_zeros() as usize;
    let len = bits.div_ceil(8).max(1);
    let mut out = Vec::with_capacity(len + 1);
    out.push(len as u8);
    out.extend_from_slice(&height.to_le_bytes()[..len.min(8)]);
    out.resize(len + 1, 0);
    out
}
