#![forbid(unsafe_code)]
//! Shared scalar types for the sendfs workspace.
//!
//! Holds the wire-format constants, the little-endian byte readers used by
//! the stream decoder, the `ParseError` taxonomy for format violations, and
//! the path-normalization helper shared by the decoder and the path map.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every send-stream begins with this literal prefix.
pub const SEND_STREAM_MAGIC: &[u8; 13] = b"btrfs-stream\0";

/// The only stream version this engine understands.
pub const SEND_STREAM_VERSION: u32 = 1;

/// Bytes in a command header: `length:u32, kind:u16, crc:u32`.
pub const COMMAND_HEADER_SIZE: usize = 10;

/// Bytes in an attribute header: `kind:u16, length:u16`.
pub const ATTRIBUTE_HEADER_SIZE: usize = 4;

/// A `(seconds, nanoseconds)` timestamp as encoded on the wire
/// (`u64` seconds followed by `u32` nanoseconds, both little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSpec {
    pub sec: u64,
    pub nsec: u32,
}

impl std::fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Millisecond precision is enough for test output; trailing zeros
        // are trimmed so `5.000` renders as `5`.
        let ms = self.nsec / 1_000_000;
        if ms == 0 {
            write!(f, "{}", self.sec)
        } else {
            let text = format!("{:03}", ms);
            write!(f, "{}.{}", self.sec, text.trim_end_matches('0'))
        }
    }
}

/// Errors raised while decoding the binary send-stream format.
///
/// All of these are fatal: the decoder aborts at the first violation and
/// no partial item sequence is returned to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("I/O while reading {context}: {detail}")]
    Io {
        context: &'static str,
        detail: String,
    },
    #[error("invalid stream magic: expected {expected:?}, got {actual:?}")]
    InvalidMagic {
        expected: &'static [u8],
        actual: Vec<u8>,
    },
    #[error("unsupported stream version: expected {expected}, got {actual}")]
    UnsupportedVersion { expected: u32, actual: u32 },
    #[error("truncated {context}: need {needed} bytes, got {actual}")]
    Truncated {
        context: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("unknown command kind {raw:#06x}")]
    UnknownCommand { raw: u16 },
    #[error("unknown attribute kind {raw:#06x} in {command} command")]
    UnknownAttribute { raw: u16, command: &'static str },
    #[error("attribute {attribute} occurs twice in {command} command")]
    DuplicateAttribute {
        command: &'static str,
        attribute: &'static str,
    },
    #[error("{command} command is missing required attribute {attribute}")]
    MissingAttribute {
        command: &'static str,
        attribute: &'static str,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Return `len` bytes of `data` starting at `offset`, or a truncation error.
pub fn ensure_slice<'a>(
    data: &'a [u8],
    offset: usize,
    len: usize,
    context: &'static str,
) -> Result<&'a [u8], ParseError> {
    let end = offset.checked_add(len).ok_or(ParseError::InvalidField {
        field: "offset",
        reason: "offset + length overflows",
    })?;
    if end > data.len() {
        return Err(ParseError::Truncated {
            context,
            needed: len,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

pub fn read_le_u16(data: &[u8], offset: usize, context: &'static str) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2, context)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_le_u32(data: &[u8], offset: usize, context: &'static str) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4, context)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_le_u64(data: &[u8], offset: usize, context: &'static str) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8, context)?;
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(raw))
}

pub fn read_fixed<const N: usize>(
    data: &[u8],
    offset: usize,
    context: &'static str,
) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N, context)?;
    let mut raw = [0_u8; N];
    raw.copy_from_slice(bytes);
    Ok(raw)
}

/// Lexically normalize a relative byte path, in the manner of
/// `os.path.normpath`: collapse `//`, drop `.` components, and resolve
/// `a/..` pairs. Leading `..` components are preserved (they will fail
/// path-map lookups later, which is the desired failure mode).
///
/// The empty path and `.` both normalize to `.` (the subvolume root).
#[must_use]
pub fn normalize_path(path: &[u8]) -> Vec<u8> {
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in path.split(|b| *b == b'/') {
        match part {
            b"" | b"." => {}
            b".." => {
                if matches!(parts.last(), Some(last) if *last != b"..") {
                    parts.pop();
                } else {
                    parts.push(part);
                }
            }
            _ => parts.push(part),
        }
    }
    if parts.is_empty() {
        return b".".to_vec();
    }
    parts.join(&b'/')
}

/// Split an already-relative path into normalized components.
/// Returns an empty vector for the root (`.`).
#[must_use]
pub fn split_path(path: &[u8]) -> Vec<Vec<u8>> {
    let normalized = normalize_path(path);
    if normalized == b"." {
        return Vec::new();
    }
    normalized
        .split(|b| *b == b'/')
        .map(<[u8]>::to_vec)
        .collect()
}

/// Render a byte path for human-readable errors and test output.
/// Non-UTF-8 bytes are escaped rather than dropped.
#[must_use]
pub fn display_path(path: &[u8]) -> String {
    String::from_utf8_lossy(path).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_le_helpers() {
        let bytes = [0x34, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0, "t").expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0, "t").expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 0, "t").expect("u64"), 0x90AB_CDEF_5678_1234);
    }

    #[test]
    fn read_past_end_is_truncated() {
        let err = read_le_u32(&[0, 1], 0, "header").unwrap_err();
        assert_eq!(
            err,
            ParseError::Truncated {
                context: "header",
                needed: 4,
                actual: 2,
            }
        );
    }

    #[test]
    fn normalize_collapses_dots_and_slashes() {
        assert_eq!(normalize_path(b"a//b/./c"), b"a/b/c".to_vec());
        assert_eq!(normalize_path(b"a/../b"), b"b".to_vec());
        assert_eq!(normalize_path(b"."), b".".to_vec());
        assert_eq!(normalize_path(b""), b".".to_vec());
        assert_eq!(normalize_path(b"a/b/.."), b"a".to_vec());
        // Leading `..` survives normalization.
        assert_eq!(normalize_path(b"../a"), b"../a".to_vec());
    }

    #[test]
    fn split_path_components() {
        assert!(split_path(b".").is_empty());
        assert_eq!(split_path(b"a/b"), vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(split_path(b"a/./b//"), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn timespec_render() {
        assert_eq!(TimeSpec { sec: 5, nsec: 0 }.to_string(), "5");
        assert_eq!(TimeSpec { sec: 5, nsec: 250_000_000 }.to_string(), "5.25");
        // Sub-millisecond precision is truncated, not rounded.
        assert_eq!(TimeSpec { sec: 5, nsec: 999_999_000 }.to_string(), "5.999");
    }
}
