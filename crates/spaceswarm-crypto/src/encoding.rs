//! z-base-32 text encoding for 32-byte keys.
//!
//! A 32-byte key encodes to exactly 52 characters. Anything else is rejected
//! on decode.

use crate::{CryptoError, ENCODED_KEY_LEN};

const ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

fn symbol_value(c: u8) -> Option<u8> {
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u8)
}

/// Encode arbitrary bytes as z-base-32 (no padding).
#[must_use]
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u16 = 0;
    let mut bits = 0u32;

    for &byte in data {
        buffer = (buffer << 8) | u16::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let idx = ((buffer >> bits) & 0x1f) as usize;
            out.push(ALPHABET[idx] as char);
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        let idx = ((buffer << (5 - bits)) & 0x1f) as usize;
        out.push(ALPHABET[idx] as char);
    }
    out
}

/// Decode z-base-32 text into bytes, dropping trailing pad bits.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyEncoding`] on characters outside the alphabet.
pub fn decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u16 = 0;
    let mut bits = 0u32;

    for c in text.bytes() {
        let value = symbol_value(c).ok_or(CryptoError::InvalidKeyEncoding)?;
        buffer = (buffer << 5) | u16::from(value);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Ok(out)
}

/// Encode a 32-byte key (52 characters).
#[must_use]
pub fn encode_key(key: &[u8; 32]) -> String {
    encode(key)
}

/// Decode a 52-character key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyEncoding`] if the text is not exactly 52
/// valid characters.
pub fn decode_key(text: &str) -> Result<[u8; 32], CryptoError> {
    if text.len() != ENCODED_KEY_LEN {
        return Err(CryptoError::InvalidKeyEncoding);
    }
    let bytes = decode(text)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyEncoding)
}
