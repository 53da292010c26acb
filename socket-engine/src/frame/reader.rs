//! The four frame-reading algorithms.
//!
//! Each one reads fixed-size chunks and loops until its completion rule
//! holds. A zero-byte read (peer closed) ends every loop without an error and
//! returns whatever was collected so far, possibly nothing.
//!
//! The delimiter strategies scan each decoded chunk on its own. A delimiter
//! split across two reads is not recognised; the frame then either runs on
//! until a later chunk holds a whole delimiter or ends with the stream.

use tracing::trace;

use super::{decode_ascii, DELIMITED_CHUNK_SIZE};
use crate::{
    error::{Result, SocketError},
    transport::Transport,
};

fn ensure_readable(transport: &dyn Transport) -> Result<()> {
    if transport.can_read() {
        Ok(())
    } else {
        Err(SocketError::NotReadable)
    }
}

/// Concatenates reads until one returns fewer than `buffer_size` bytes.
pub async fn read_until_idle(transport: &dyn Transport, buffer_size: usize) -> Result<Vec<u8>> {
    ensure_readable(transport)?;

    let mut buffer = vec![0u8; buffer_size];
    let mut frame = Vec::new();
    loop {
        let read = transport.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        frame.extend_from_slice(&buffer[..read]);
        if read < buffer_size {
            break;
        }
    }
    Ok(frame)
}

/// Collects exactly `length` bytes. Anything the final read returns past
/// `length` is discarded rather than kept for the next frame.
pub async fn read_fixed_length(
    transport: &dyn Transport,
    buffer_size: usize,
    length: usize,
) -> Result<Vec<u8>> {
    ensure_readable(transport)?;

    let mut buffer = vec![0u8; buffer_size];
    let mut frame = Vec::with_capacity(length);
    while frame.len() < length {
        let read = transport.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let take = read.min(length - frame.len());
        if take < read {
            trace!(discarded = read - take, "fixed-length frame complete");
        }
        frame.extend_from_slice(&buffer[..take]);
    }
    Ok(frame)
}

/// Skips chunks until one contains `start`, then collects text up to the
/// next `end`. Neither delimiter is part of the frame.
pub async fn read_between_delimiters(
    transport: &dyn Transport,
    start: &[u8],
    end: &[u8],
) -> Result<Vec<u8>> {
    ensure_readable(transport)?;

    let start = decode_ascii(start);
    let end = decode_ascii(end);
    let mut buffer = vec![0u8; DELIMITED_CHUNK_SIZE];
    let mut frame = String::new();
    let mut opened = false;

    loop {
        let read = transport.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let chunk = decode_ascii(&buffer[..read]);

        let body = if opened {
            chunk.as_str()
        } else {
            match chunk.find(&start) {
                Some(at) => {
                    opened = true;
                    &chunk[at + start.len()..]
                }
                None => continue,
            }
        };

        if let Some(at) = body.find(&end) {
            frame.push_str(&body[..at]);
            break;
        }
        frame.push_str(body);
    }

    Ok(frame.into_bytes())
}

/// Collects text from the first chunk on, up to the first `end`.
pub async fn read_until_delimiter(transport: &dyn Transport, end: &[u8]) -> Result<Vec<u8>> {
    ensure_readable(transport)?;

    let end = decode_ascii(end);
    let mut buffer = vec![0u8; DELIMITED_CHUNK_SIZE];
    let mut frame = String::new();

    loop {
        let read = transport.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let chunk = decode_ascii(&buffer[..read]);
        if let Some(at) = chunk.find(&end) {
            frame.push_str(&chunk[..at]);
            break;
        }
        frame.push_str(&chunk);
    }

    Ok(frame.into_bytes())
}
