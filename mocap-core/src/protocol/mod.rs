//! Wire protocol implementations.
//!
//! All functions are pure (no I/O): they decode byte slices handed over by the
//! socket layer and format request datagrams for it to send.
//!
//! # Example
//!
//! ```rust
//! use mocap_core::protocol::natnet::{self, MessageId};
//!
//! let request = natnet::create_keep_alive();
//! let header = natnet::parse_header(&request).unwrap();
//! assert_eq!(header.id, MessageId::KeepAlive);
//! assert_eq!(header.length, 0);
//! ```

pub mod natnet;

/// Helper function to extract a null-terminated C string from a fixed-size field
pub fn c_string(bytes: &[u8]) -> Option<String> {
    let null_pos = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..null_pos])
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Read a null-terminated UTF-8 string starting at `offset`.
///
/// Returns the string and the number of bytes it occupied, terminator included.
/// Unlike [`c_string`] the terminator is mandatory and the text is not trimmed.
pub fn read_cstr(buf: &[u8], offset: usize) -> Result<(String, usize), crate::ParseError> {
    let rest = buf.get(offset..).ok_or(crate::ParseError::TooShort {
        expected: offset,
        actual: buf.len(),
    })?;
    let null_pos = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(crate::ParseError::MissingTerminator { offset })?;
    let text = std::str::from_utf8(&rest[..null_pos])
        .map_err(|_| crate::ParseError::InvalidString)?
        .to_string();
    Ok((text, null_pos + 1))
}
