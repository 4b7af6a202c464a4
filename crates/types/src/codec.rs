//! Centralized serialization and deserialization functions.
//!
//! Every internal record that is not a hand-laid byte key goes through
//! postcard here, with consistent error handling via snafu. Stream formats
//! (entry exports, substrate dumps) are sequences of length-prefixed
//! postcard frames written with [`write_frame`] and read with [`read_frame`].

use std::io::{self, Read, Write};

use serde::{Serialize, de::DeserializeOwned};
use snafu::{ResultExt, Snafu};

/// Upper bound on a single frame. Larger length prefixes indicate a corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Error type for codec operations.
#[derive(Debug, Snafu)]
pub enum CodecError {
    /// Encoding failed.
    #[snafu(display("Encoding failed: {source}"))]
    Encode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// Decoding failed.
    #[snafu(display("Decoding failed: {source}"))]
    Decode {
        /// The underlying postcard error.
        source: postcard::Error,
    },

    /// Reading or writing a frame failed.
    #[snafu(display("Frame I/O failed: {source}"))]
    FrameIo {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A frame header announced an implausible length.
    #[snafu(display("Frame length {len} exceeds maximum {MAX_FRAME_LEN}"))]
    FrameTooLarge {
        /// The announced length.
        len: usize,
    },
}

/// Encodes a value to bytes using postcard serialization.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).context(EncodeSnafu)
}

/// Decodes bytes to a value using postcard deserialization.
///
/// # Errors
///
/// Returns `CodecError::Decode` if deserialization fails.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).context(DecodeSnafu)
}

/// Writes one value as a `u32` big-endian length prefix followed by its postcard bytes.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails or `CodecError::FrameIo`
/// if the writer fails.
pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<(), CodecError> {
    let bytes = encode(value)?;
    if bytes.len() > MAX_FRAME_LEN {
        return FrameTooLargeSnafu { len: bytes.len() }.fail();
    }
    // Bounded by MAX_FRAME_LEN above, so the cast cannot truncate.
    let len = bytes.len() as u32;
    writer.write_all(&len.to_be_bytes()).context(FrameIoSnafu)?;
    writer.write_all(&bytes).context(FrameIoSnafu)
}

/// Reads the next frame written by [`write_frame`].
///
/// Returns `Ok(None)` on a clean end of stream (no bytes before the length prefix).
///
/// # Errors
///
/// Returns `CodecError::FrameIo` on a truncated stream, `CodecError::FrameTooLarge`
/// on an implausible prefix, or `CodecError::Decode` if the payload is malformed.
pub fn read_frame<T: DeserializeOwned, R: Read>(reader: &mut R) -> Result<Option<T>, CodecError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).context(FrameIoSnafu)?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof)).context(FrameIoSnafu);
        }
        filled += n;
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return FrameTooLargeSnafu { len }.fail();
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).context(FrameIoSnafu)?;
    decode(&payload).map(Some)
}
