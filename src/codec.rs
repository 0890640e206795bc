// CQL notation codec - the primitive [short]/[int]-prefixed encodings the
// native protocol composes message bodies from, plus the two message-level
// operations the proxy performs itself: synthesising ERROR frames and
// rewriting SUPPORTED option maps.
//
// Decoding works over a `Cursor` so callers can stop mid-body and splice the
// undecoded tail back verbatim; encoding appends to a `BytesMut`.

use crate::frame::{Frame, FrameHeader, Opcode};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Cursor;
use thiserror::Error;

/// ERROR code for an internal proxy failure surfaced to the client.
pub const ERROR_CODE_SERVER: i32 = 0x0000;
/// ERROR code for a protocol violation (unsupported version, bad frame).
pub const ERROR_CODE_PROTOCOL: i32 = 0x000a;

/// SUPPORTED option key listing the protocol versions a server speaks.
pub const OPT_PROTOCOL_VERSIONS: &str = "PROTOCOL_VERSIONS";
/// SUPPORTED option key listing the CQL language versions.
pub const OPT_CQL_VERSION: &str = "CQL_VERSION";

/// Codec errors with enough context to tell which decode gave up.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("message body truncated")]
    Incomplete,

    #[error("invalid UTF-8 in {field}")]
    Utf8 {
        field: &'static str,
        #[source]
        source: std::string::FromUtf8Error,
    },

    #[error("invalid length prefix: {0}")]
    BadLength(i32),

    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

/// A bound value in a QUERY or BATCH: `[int]` length then that many bytes.
/// Negative lengths mean the value is absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Null,
    NotSet,
}

pub fn get_u8(buf: &mut Cursor<&[u8]>) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut Cursor<&[u8]>) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u16())
}

pub fn get_i32(buf: &mut Cursor<&[u8]>) -> Result<i32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_i32())
}

fn get_utf8(
    buf: &mut Cursor<&[u8]>,
    len: usize,
    field: &'static str,
) -> Result<String, CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Incomplete);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|source| CodecError::Utf8 { field, source })
}

/// `[string]`: a `[short]` length followed by UTF-8 bytes.
pub fn get_string(buf: &mut Cursor<&[u8]>, field: &'static str) -> Result<String, CodecError> {
    let len = get_u16(buf)? as usize;
    get_utf8(buf, len, field)
}

/// `[long string]`: an `[int]` length followed by UTF-8 bytes.
pub fn get_long_string(buf: &mut Cursor<&[u8]>, field: &'static str) -> Result<String, CodecError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Err(CodecError::BadLength(len));
    }
    get_utf8(buf, len as usize, field)
}

/// `[string list]`: a `[short]` count of `[string]`s.
pub fn get_string_list(
    buf: &mut Cursor<&[u8]>,
    field: &'static str,
) -> Result<Vec<String>, CodecError> {
    let count = get_u16(buf)? as usize;
    let mut items = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        items.push(get_string(buf, field)?);
    }
    Ok(items)
}

/// `[string multimap]`: a `[short]` count of key/`[string list]` pairs.
/// Returned as a vector so the original key order survives a rewrite.
pub fn get_string_multimap(
    buf: &mut Cursor<&[u8]>,
) -> Result<Vec<(String, Vec<String>)>, CodecError> {
    let count = get_u16(buf)? as usize;
    let mut entries = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let key = get_string(buf, "multimap key")?;
        let values = get_string_list(buf, "multimap value")?;
        entries.push((key, values));
    }
    Ok(entries)
}

/// `[short bytes]`: a `[short]` length of raw bytes (prepared statement ids).
pub fn get_short_bytes(buf: &mut Cursor<&[u8]>) -> Result<Vec<u8>, CodecError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

/// `[value]`: an `[int]` length of raw bytes; -1 is null, -2 is not-set.
pub fn get_value(buf: &mut Cursor<&[u8]>) -> Result<Value, CodecError> {
    let len = get_i32(buf)?;
    match len {
        -2 => Ok(Value::NotSet),
        -1 => Ok(Value::Null),
        n if n < 0 => Err(CodecError::BadLength(n)),
        n => {
            let n = n as usize;
            if buf.remaining() < n {
                return Err(CodecError::Incomplete);
            }
            Ok(Value::Bytes(buf.copy_to_bytes(n).to_vec()))
        }
    }
}

pub fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

pub fn put_long_string(buf: &mut BytesMut, value: &str) {
    buf.put_i32(value.len() as i32);
    buf.put_slice(value.as_bytes());
}

pub fn put_string_list(buf: &mut BytesMut, values: &[String]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        put_string(buf, value);
    }
}

pub fn put_string_multimap(buf: &mut BytesMut, entries: &[(String, Vec<String>)]) {
    buf.put_u16(entries.len() as u16);
    for (key, values) in entries {
        put_string(buf, key);
        put_string_list(buf, values);
    }
}

pub fn put_short_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

pub fn put_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Bytes(bytes) => {
            buf.put_i32(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        Value::Null => buf.put_i32(-1),
        Value::NotSet => buf.put_i32(-2),
    }
}

/// Synthesise an ERROR response frame: `[int code][string message]`.
///
/// `version` is the bare protocol version; the direction bit is set here.
pub fn error_frame(version: u8, stream: i16, code: i32, message: &str) -> Frame {
    let mut body = BytesMut::with_capacity(4 + 2 + message.len());
    body.put_i32(code);
    put_string(&mut body, message);
    let header = FrameHeader {
        version: version | 0x80,
        flags: 0,
        stream,
        opcode: Opcode::Error as u8,
        body_len: 0,
    };
    Frame::from_parts(header, &body)
}

/// Render a protocol version the way servers advertise it, e.g. `4/v4`.
pub fn protocol_version_label(version: u8) -> String {
    format!("{version}/v{version}")
}

/// Rewrite a SUPPORTED response so the advertised `PROTOCOL_VERSIONS` and
/// `CQL_VERSION` match the proxy's configuration. Every other option key is
/// preserved in its original order. Header fields are carried over verbatim
/// apart from the body length.
pub fn override_supported(
    frame: &Frame,
    protocol_versions: &[u8],
    cql_versions: &[String],
) -> Result<Frame, CodecError> {
    let mut cursor = Cursor::new(frame.body());
    let mut entries = get_string_multimap(&mut cursor)?;

    if !protocol_versions.is_empty() {
        let labels: Vec<String> = protocol_versions
            .iter()
            .map(|v| protocol_version_label(*v))
            .collect();
        upsert(&mut entries, OPT_PROTOCOL_VERSIONS, labels);
    }
    if !cql_versions.is_empty() {
        upsert(&mut entries, OPT_CQL_VERSION, cql_versions.to_vec());
    }

    let mut body = BytesMut::with_capacity(frame.body().len() + 32);
    put_string_multimap(&mut body, &entries);
    Ok(Frame::from_parts(frame.header, &body))
}

fn upsert(entries: &mut Vec<(String, Vec<String>)>, key: &str, values: Vec<String>) {
    match entries.iter_mut().find(|(k, _)| k == key) {
        Some((_, existing)) => *existing = values,
        None => entries.push((key.to_string(), values)),
    }
}
