//! Canonical array encoding shared by node records and proof wire bytes.
//!
//! An array is a bincode sequence with varint lengths:
//! `[element count][len_0][bytes_0]...[len_n][bytes_n]`. Decoding is strict:
//! trailing bytes and oversized lengths are rejected, so a given array has
//! exactly one valid encoding.

use crate::{Error, Result};
use bincode::Options;

/// Upper bound on any encoded array accepted by the decoder
pub const MAX_ENCODED_LEN: u64 = 1 << 20;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_little_endian()
        .with_limit(MAX_ENCODED_LEN)
        .reject_trailing_bytes()
}

/// Encode a list of byte strings
pub fn encode_array<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let slices: Vec<&[u8]> = items.iter().map(AsRef::as_ref).collect();
    // Serializing byte slices into a Vec cannot fail below the size limit.
    options().serialize(&slices).unwrap_or_default()
}

/// Decode a list of byte strings
pub fn decode_array(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    options()
        .deserialize(bytes)
        .map_err(|e| Error::Corruption(format!("malformed array encoding: {}", e)))
}
