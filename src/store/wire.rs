//! Wire primitives shared by the element and table codecs.
//!
//! Layout:
//! - bool: 1 byte (0 or 1)
//! - int64: 8 bytes, big-endian
//! - nullable duration: bool presence, then u64 seconds and u32 subsecond nanos
//! - binary: i32 length then payload, length -1 encodes null

use std::io;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes};

pub(crate) fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(u8::from(value));
}

pub(crate) fn put_duration(buf: &mut impl BufMut, value: Option<Duration>) {
    put_bool(buf, value.is_some());
    if let Some(d) = value {
        buf.put_u64(d.as_secs());
        buf.put_u32(d.subsec_nanos());
    }
}

pub(crate) fn put_binary(buf: &mut impl BufMut, value: Option<&[u8]>) -> io::Result<()> {
    match value {
        Some(data) => {
            let len = i32::try_from(data.len()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("binary too large: {} bytes", data.len()),
                )
            })?;
            buf.put_i32(len);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
    Ok(())
}

fn ensure(buf: &impl Buf, needed: usize) -> io::Result<()> {
    if buf.remaining() < needed {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("need {} bytes, {} remaining", needed, buf.remaining()),
        ));
    }
    Ok(())
}

pub(crate) fn get_bool(buf: &mut impl Buf) -> io::Result<bool> {
    ensure(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid bool byte {}", other),
        )),
    }
}

pub(crate) fn get_i64(buf: &mut impl Buf) -> io::Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64())
}

pub(crate) fn get_u32(buf: &mut impl Buf) -> io::Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn get_duration(buf: &mut impl Buf) -> io::Result<Option<Duration>> {
    if !get_bool(buf)? {
        return Ok(None);
    }
    ensure(buf, 12)?;
    let secs = buf.get_u64();
    let nanos = buf.get_u32();
    if nanos >= 1_000_000_000 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("subsecond nanos out of range: {}", nanos),
        ));
    }
    Ok(Some(Duration::new(secs, nanos)))
}

pub(crate) fn get_binary(buf: &mut impl Buf) -> io::Result<Option<Bytes>> {
    ensure(buf, 4)?;
    let len = buf.get_i32();
    if len == -1 {
        return Ok(None);
    }
    let len = usize::try_from(len).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, format!("bad length {}", len))
    })?;
    ensure(buf, len)?;
    Ok(Some(buf.copy_to_bytes(len)))
}
