//! A minimal length-prefixed postcard framing used over the worker's stdin
//! and stdout pipes by [`crate::process_backend`] and the `rpool-echo-worker`
//! binary. Not part of the queue-pair abstraction itself — just how
//! [`ProcessBackend`](crate::process_backend::ProcessBackend) happens to
//! implement it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};

/// Encodes `value` as postcard bytes prefixed with a 4-byte little-endian
/// length, and writes it to `out`.
pub fn write_frame<T: Serialize>(out: &mut impl Write, value: &T) -> io::Result<()> {
    let bytes = postcard::to_allocvec(value).map_err(io::Error::other)?;
    out.write_all(&(bytes.len() as u32).to_le_bytes())?;
    out.write_all(&bytes)?;
    out.flush()
}

/// Reads one length-prefixed postcard frame from `input`. Returns `Ok(None)`
/// on a clean EOF at a frame boundary.
pub fn read_frame<T: DeserializeOwned>(input: &mut impl Read) -> io::Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match input.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf)?;
    postcard::from_bytes(&buf).map(Some).map_err(io::Error::other)
}
