//! Length-prefixed bincode frames exchanged with worker processes

use std::io::{self, Read, Write};

use pipeinfer_core::{Result, Yielded};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// One batch of work for a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request<T> {
    /// Name of the registered task to run
    pub task: String,

    /// Global index of the first item
    pub start_index: u64,

    /// Total attempts allowed per item
    pub max_attempts: u32,

    /// Batch contents
    pub items: Vec<T>,
}

/// A worker's answer to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response<T> {
    /// One outcome per request item, in request order
    Done {
        /// Per-item outcomes
        outcomes: Vec<Yielded<T>>,
    },
    /// The worker cannot run the request
    Rejected {
        /// Why the request was refused
        message: String,
    },
}

/// Write one frame: a little-endian `u32` length followed by the payload
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// Read one frame; `None` on a clean end of stream
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len = [0_u8; 4];
    match reader.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Serialize a message body
pub fn encode<M: Serialize>(message: &M) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

/// Deserialize a message body
pub fn decode<M: DeserializeOwned>(bytes: &[u8]) -> Result<M> {
    Ok(bincode::deserialize(bytes)?)
}
