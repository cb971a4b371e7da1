//! Index persistence.
//!
//! The engine owns the payload format. The core wraps it in a fixed header:
//!
//! ```text
//! magic "QVIX" | version u16 | component tag u8 | reserved u8 | xxh3-64 u64 | payload len u64 | payload
//! ```
//!
//! All integers are little-endian. Works for both index families; pick one
//! with the component type (`read_index_from_buffer::<u8>` for binary).

use std::path::Path;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{QuiverError, Result};
use crate::index::traits::{Component, VectorEngine};
use crate::index::Index;

const MAGIC: &[u8; 4] = b"QVIX";
const FORMAT_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 1 + 1 + 8 + 8;

pub fn write_index_to_buffer<T: Component>(index: &Index<T>) -> Result<Bytes> {
    let payload = index.serialize_native()?;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u16_le(FORMAT_VERSION);
    buf.put_u8(T::TAG);
    buf.put_u8(0);
    buf.put_u64_le(xxh3_64(&payload));
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

pub fn read_index_from_buffer<T: Component>(engine: &dyn VectorEngine, data: &[u8]) -> Result<Index<T>> {
    if data.len() < HEADER_LEN {
        return Err(QuiverError::invalid(format!(
            "index buffer too short: {} bytes",
            data.len()
        )));
    }
    let mut header = &data[..HEADER_LEN];
    let mut magic = [0u8; 4];
    header.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(QuiverError::invalid("not a serialized index (bad magic)"));
    }
    let version = header.get_u16_le();
    if version != FORMAT_VERSION {
        return Err(QuiverError::invalid(format!(
            "unsupported index format version {version}"
        )));
    }
    let tag = header.get_u8();
    if tag != T::TAG {
        return Err(QuiverError::invalid(format!(
            "serialized index holds component tag {tag}, expected {} ({})",
            T::TAG,
            T::NAME
        )));
    }
    let _reserved = header.get_u8();
    let expected = header.get_u64_le();
    let len = header.get_u64_le() as usize;

    let payload = &data[HEADER_LEN..];
    if payload.len() != len {
        return Err(QuiverError::invalid(format!(
            "index payload truncated: header says {len} bytes, found {}",
            payload.len()
        )));
    }
    let actual = xxh3_64(payload);
    if actual != expected {
        return Err(QuiverError::ChecksumMismatch { expected, actual });
    }

    let native = T::read_native(engine, payload)?;
    debug!(component = T::NAME, bytes = data.len(), "read index");
    Ok(Index::from_native(native))
}

pub fn write_index<T: Component>(index: &Index<T>, path: impl AsRef<Path>) -> Result<()> {
    let buf = write_index_to_buffer(index)?;
    std::fs::write(path.as_ref(), &buf)?;
    debug!(path = %path.as_ref().display(), bytes = buf.len(), "wrote index");
    Ok(())
}

pub fn read_index<T: Component>(engine: &dyn VectorEngine, path: impl AsRef<Path>) -> Result<Index<T>> {
    let data = std::fs::read(path.as_ref())?;
    read_index_from_buffer(engine, &data)
}
