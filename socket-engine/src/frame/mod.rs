//! Message framing over a raw byte stream.
//!
//! A [`Framing`] is chosen once per client or server and decides where one
//! frame ends. The algorithms live in [`reader`]; [`sender`] writes payloads
//! back out with a bounded timeout.

use std::fmt;

use crate::{
    error::{Result, SocketError},
    transport::Transport,
};

pub mod reader;
pub mod sender;

pub use sender::send_frame;

/// Chunk size used by the delimiter-based strategies.
pub const DELIMITED_CHUNK_SIZE: usize = 512;

/// Buffer size used by [`Framing::default`].
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// How a byte stream is cut into frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Read `buffer_size` chunks until a read comes back short; the frame is
    /// everything read in that cycle.
    BufferUntilIdle { buffer_size: usize },
    /// Collect exactly `length` bytes, reading `buffer_size` at a time.
    /// Bytes past `length` in the final read are dropped.
    FixedLength { buffer_size: usize, length: usize },
    /// Text between the first `start` and the following `end`.
    DelimitedBothEnds { start: Vec<u8>, end: Vec<u8> },
    /// Text before the first `end`.
    DelimitedEndOnly { end: Vec<u8> },
}

impl Default for Framing {
    fn default() -> Self {
        Framing::BufferUntilIdle {
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl Framing {
    /// Rejects parameters no read could ever satisfy.
    pub fn validate(&self) -> Result<()> {
        match self {
            Framing::BufferUntilIdle { buffer_size } => positive("buffer size", *buffer_size),
            Framing::FixedLength {
                buffer_size,
                length,
            } => {
                positive("buffer size", *buffer_size)?;
                positive("fixed length", *length)
            }
            Framing::DelimitedBothEnds { start, end } => {
                non_empty("start delimiter", start)?;
                non_empty("end delimiter", end)
            }
            Framing::DelimitedEndOnly { end } => non_empty("end delimiter", end),
        }
    }

    /// Reads one complete frame from `transport`.
    pub async fn read_frame(&self, transport: &dyn Transport) -> Result<Vec<u8>> {
        match self {
            Framing::BufferUntilIdle { buffer_size } => {
                reader::read_until_idle(transport, *buffer_size).await
            }
            Framing::FixedLength {
                buffer_size,
                length,
            } => reader::read_fixed_length(transport, *buffer_size, *length).await,
            Framing::DelimitedBothEnds { start, end } => {
                reader::read_between_delimiters(transport, start, end).await
            }
            Framing::DelimitedEndOnly { end } => {
                reader::read_until_delimiter(transport, end).await
            }
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::BufferUntilIdle { buffer_size } => {
                write!(f, "buffer-until-idle({buffer_size})")
            }
            Framing::FixedLength {
                buffer_size,
                length,
            } => write!(f, "fixed-length({buffer_size}, {length})"),
            Framing::DelimitedBothEnds { start, end } => write!(
                f,
                "delimited({:?} .. {:?})",
                decode_ascii(start),
                decode_ascii(end)
            ),
            Framing::DelimitedEndOnly { end } => {
                write!(f, "delimited(.. {:?})", decode_ascii(end))
            }
        }
    }
}

fn positive(what: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(SocketError::InvalidFraming(format!(
            "{what} must be greater than 0"
        )));
    }
    Ok(())
}

fn non_empty(what: &str, value: &[u8]) -> Result<()> {
    if value.is_empty() {
        return Err(SocketError::InvalidFraming(format!(
            "{what} can not be empty"
        )));
    }
    Ok(())
}

/// ASCII decoding: every byte outside 0..=0x7F becomes `?`.
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

/// ASCII encoding: every char outside ASCII becomes `?`.
pub fn encode_ascii(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}
