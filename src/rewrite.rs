// ABOUTME: Detects inline uuid()/now() calls in QUERY and BATCH frames and replaces
// ABOUTME: them with concrete time-UUIDs so both clusters store identical values

use crate::codec::{self, CodecError, Value};
use crate::frame::{Frame, FrameKind};
use bytes::{BufMut, BytesMut};
use std::io::Cursor;
use tracing::{debug, warn};
use uuid::Uuid;

const UUID_TOKEN: &[u8] = b"uuid()";
const NOW_TOKEN: &[u8] = b"now()";

/// Rewrites server-evaluated UUID functions into literal values.
///
/// Left alone, `uuid()` and `now()` are evaluated independently by each
/// cluster, so mirrored writes end up with different values. The rewriter
/// substitutes each occurrence with a freshly generated time-UUID *before*
/// fan-out; both upstreams then receive the identical rewritten buffer.
///
/// The fast path is a cheap case-insensitive scan of the raw body; frames
/// without either token are passed through untouched and never decoded.
/// Prepared statements (EXECUTE) are not rewritten.
pub struct QueryRewriter {
    /// Node id for generated time-UUIDs; random per rewriter, with the
    /// multicast bit set as the convention for non-MAC node ids.
    node_id: [u8; 6],
}

impl QueryRewriter {
    pub fn new() -> QueryRewriter {
        let mut node_id: [u8; 6] = rand::random();
        node_id[0] |= 0x01;
        QueryRewriter { node_id }
    }

    /// Rewrite a client frame if it needs it. `None` means the original
    /// buffer should be forwarded, including when a decode fails (the frame
    /// keeps its server-evaluated functions in that case).
    pub fn rewrite(&self, frame: &Frame) -> Option<Frame> {
        let kind = frame.kind();
        if kind != FrameKind::Query && kind != FrameKind::Batch {
            return None;
        }
        if frame.header.compression() {
            debug!("compressed frame, skipping uuid rewrite");
            return None;
        }
        if !contains_token(frame.body()) {
            return None;
        }

        let result = if kind == FrameKind::Query {
            self.rewrite_query(frame)
        } else {
            self.rewrite_batch(frame)
        };
        match result {
            Ok(updated) => updated,
            Err(e) => {
                warn!(error = %e, stream = frame.stream(), "uuid rewrite decode failed, forwarding original frame");
                None
            }
        }
    }

    fn fresh(&self) -> String {
        Uuid::now_v1(&self.node_id).to_string()
    }

    /// QUERY body is `[long string]` + parameters; only the statement text is
    /// touched, the parameter bytes are spliced back verbatim.
    fn rewrite_query(&self, frame: &Frame) -> Result<Option<Frame>, CodecError> {
        let body = frame.body();
        let mut cursor = Cursor::new(body);
        let statement = codec::get_long_string(&mut cursor, "query statement")?;
        if !is_rewritable_statement(&statement) {
            return Ok(None);
        }
        let Some(updated) = replace_tokens(&statement, &mut || self.fresh()) else {
            return Ok(None);
        };

        let tail = &body[cursor.position() as usize..];
        let mut new_body = BytesMut::with_capacity(4 + updated.len() + tail.len());
        codec::put_long_string(&mut new_body, &updated);
        new_body.put_slice(tail);
        Ok(Some(Frame::from_parts(frame.header, &new_body)))
    }

    /// BATCH body is `[byte type][short n]` sub-statements followed by
    /// consistency/flags options. Textual sub-statements get the token
    /// replacement; bound values whose trimmed text *is* a token are swapped
    /// for a literal UUID string. Prepared-id entries pass through.
    fn rewrite_batch(&self, frame: &Frame) -> Result<Option<Frame>, CodecError> {
        let body = frame.body();
        let mut cursor = Cursor::new(body);
        let batch_type = codec::get_u8(&mut cursor)?;
        let count = codec::get_u16(&mut cursor)?;

        let mut new_body = BytesMut::with_capacity(body.len() + 128);
        new_body.put_u8(batch_type);
        new_body.put_u16(count);

        let mut changed = false;
        for _ in 0..count {
            let stmt_kind = codec::get_u8(&mut cursor)?;
            new_body.put_u8(stmt_kind);
            match stmt_kind {
                0 => {
                    let statement = codec::get_long_string(&mut cursor, "batch statement")?;
                    match replace_tokens(&statement, &mut || self.fresh()) {
                        Some(updated) => {
                            changed = true;
                            codec::put_long_string(&mut new_body, &updated);
                        }
                        None => codec::put_long_string(&mut new_body, &statement),
                    }
                }
                1 => {
                    let id = codec::get_short_bytes(&mut cursor)?;
                    codec::put_short_bytes(&mut new_body, &id);
                }
                _ => return Err(CodecError::Malformed("batch statement kind")),
            }

            let value_count = codec::get_u16(&mut cursor)?;
            new_body.put_u16(value_count);
            for _ in 0..value_count {
                let value = codec::get_value(&mut cursor)?;
                match token_value_replacement(&value, &mut || self.fresh()) {
                    Some(updated) => {
                        changed = true;
                        codec::put_value(&mut new_body, &updated);
                    }
                    None => codec::put_value(&mut new_body, &value),
                }
            }
        }

        if !changed {
            return Ok(None);
        }
        new_body.put_slice(&body[cursor.position() as usize..]);
        Ok(Some(Frame::from_parts(frame.header, &new_body)))
    }
}

impl Default for QueryRewriter {
    fn default() -> Self {
        QueryRewriter::new()
    }
}

/// Cheap scan deciding whether a body is worth decoding at all.
/// Deliberately matches inside string literals and comments as well.
fn contains_token(body: &[u8]) -> bool {
    body.windows(UUID_TOKEN.len())
        .any(|w| w.eq_ignore_ascii_case(UUID_TOKEN))
        || body
            .windows(NOW_TOKEN.len())
            .any(|w| w.eq_ignore_ascii_case(NOW_TOKEN))
}

/// Statements worth rewriting: INSERT, UPDATE, or an inline BEGIN BATCH that
/// contains either.
fn is_rewritable_statement(statement: &str) -> bool {
    let trimmed = statement.trim_start();
    if starts_ignore_case(trimmed, "INSERT") || starts_ignore_case(trimmed, "UPDATE") {
        return true;
    }
    starts_ignore_case(trimmed, "BEGIN BATCH")
        && (contains_ignore_case(statement, "INSERT")
            || contains_ignore_case(statement, "UPDATE"))
}

fn starts_ignore_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

fn contains_ignore_case(s: &str, needle: &str) -> bool {
    s.as_bytes()
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Replace every `uuid()` / `now()` occurrence with a fresh generated value.
/// Returns `None` when the statement contains neither token.
fn replace_tokens(statement: &str, fresh: &mut impl FnMut() -> String) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with the original
    let lower = statement.to_ascii_lowercase();
    let mut out = String::with_capacity(statement.len() + 72);
    let mut pos = 0;
    loop {
        let next_uuid = lower[pos..].find("uuid()");
        let next_now = lower[pos..].find("now()");
        let (offset, token_len) = match (next_uuid, next_now) {
            (None, None) => break,
            (Some(u), None) => (u, UUID_TOKEN.len()),
            (None, Some(n)) => (n, NOW_TOKEN.len()),
            (Some(u), Some(n)) if u <= n => (u, UUID_TOKEN.len()),
            (_, Some(n)) => (n, NOW_TOKEN.len()),
        };
        out.push_str(&statement[pos..pos + offset]);
        out.push_str(&fresh());
        pos += offset + token_len;
    }
    if pos == 0 {
        return None;
    }
    out.push_str(&statement[pos..]);
    Some(out)
}

fn token_value_replacement(value: &Value, fresh: &mut impl FnMut() -> String) -> Option<Value> {
    let Value::Bytes(bytes) = value else {
        return None;
    };
    let text = std::str::from_utf8(bytes).ok()?;
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("uuid()") || trimmed.eq_ignore_ascii_case("now()") {
        Some(Value::Bytes(fresh().into_bytes()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameHeader, Opcode};

    fn query_frame(statement: &str, params: &[u8]) -> Frame {
        let mut body = BytesMut::new();
        codec::put_long_string(&mut body, statement);
        body.put_slice(params);
        let header = FrameHeader {
            version: 0x04,
            flags: 0,
            stream: 3,
            opcode: Opcode::Query as u8,
            body_len: 0,
        };
        Frame::from_parts(header, &body)
    }

    fn decode_statement(frame: &Frame) -> (String, Vec<u8>) {
        let mut cursor = Cursor::new(frame.body());
        let statement = codec::get_long_string(&mut cursor, "q").unwrap();
        let tail = frame.body()[cursor.position() as usize..].to_vec();
        (statement, tail)
    }

    #[test]
    fn insert_tokens_become_distinct_time_uuids() {
        let rewriter = QueryRewriter::new();
        let params = [0x00, 0x01, 0x00];
        let frame = query_frame("INSERT INTO t(id,ts) VALUES (uuid(), NOW())", &params);

        let rewritten = rewriter.rewrite(&frame).expect("must rewrite");
        assert_eq!(rewritten.stream(), 3);
        assert_eq!(rewritten.header.version, 0x04);

        let (statement, tail) = decode_statement(&rewritten);
        assert_eq!(tail, params, "parameter bytes must be spliced back");

        let inner = statement
            .strip_prefix("INSERT INTO t(id,ts) VALUES (")
            .unwrap()
            .strip_suffix(')')
            .unwrap();
        let parts: Vec<&str> = inner.split(", ").collect();
        assert_eq!(parts.len(), 2);
        let first = Uuid::parse_str(parts[0]).unwrap();
        let second = Uuid::parse_str(parts[1]).unwrap();
        assert_eq!(first.get_version_num(), 1);
        assert_eq!(second.get_version_num(), 1);
        assert_ne!(first, second, "each occurrence gets its own value");
    }

    #[test]
    fn select_with_token_is_left_alone() {
        let rewriter = QueryRewriter::new();
        let frame = query_frame("SELECT uuid() FROM system.local", &[]);
        assert!(rewriter.rewrite(&frame).is_none());
    }

    #[test]
    fn statement_without_tokens_is_left_alone() {
        let rewriter = QueryRewriter::new();
        let frame = query_frame("INSERT INTO t(id) VALUES (42)", &[]);
        assert!(rewriter.rewrite(&frame).is_none());
    }

    #[test]
    fn update_and_inline_batch_qualify() {
        assert!(is_rewritable_statement("  update t set v = now()"));
        assert!(is_rewritable_statement(
            "BEGIN BATCH INSERT INTO t(id) VALUES (uuid()); APPLY BATCH"
        ));
        assert!(!is_rewritable_statement("BEGIN BATCH SELECT 1; APPLY BATCH"));
        assert!(!is_rewritable_statement("SELECT now() FROM t"));
    }

    #[test]
    fn token_inside_string_literal_is_rewritten() {
        // Matching inside literals is inherited behaviour, kept on purpose.
        let rewriter = QueryRewriter::new();
        let frame = query_frame("INSERT INTO t(s) VALUES ('this is not uuid()')", &[]);
        let rewritten = rewriter.rewrite(&frame).expect("literal is still replaced");
        let (statement, _) = decode_statement(&rewritten);
        assert!(!statement.contains("uuid()"));
    }

    #[test]
    fn execute_frames_are_never_rewritten() {
        let rewriter = QueryRewriter::new();
        let header = FrameHeader {
            version: 0x04,
            flags: 0,
            stream: 1,
            opcode: Opcode::Execute as u8,
            body_len: 0,
        };
        let frame = Frame::from_parts(header, b"uuid()");
        assert!(rewriter.rewrite(&frame).is_none());
    }

    #[test]
    fn compressed_frames_are_never_rewritten() {
        let rewriter = QueryRewriter::new();
        let header = FrameHeader {
            version: 0x04,
            flags: crate::frame::flags::COMPRESSION,
            stream: 1,
            opcode: Opcode::Query as u8,
            body_len: 0,
        };
        let frame = Frame::from_parts(header, b"INSERT now()");
        assert!(rewriter.rewrite(&frame).is_none());
    }

    #[test]
    fn undecodable_body_falls_back_to_original() {
        let rewriter = QueryRewriter::new();
        let header = FrameHeader {
            version: 0x04,
            flags: 0,
            stream: 1,
            opcode: Opcode::Query as u8,
            body_len: 0,
        };
        // contains a token but is not a valid [long string] body
        let frame = Frame::from_parts(header, b"uuid()");
        assert!(rewriter.rewrite(&frame).is_none());
    }

    #[test]
    fn batch_statements_and_values_are_rewritten() {
        let rewriter = QueryRewriter::new();

        let mut body = BytesMut::new();
        body.put_u8(0); // logged batch
        body.put_u16(2);
        // textual statement with a token and one bound token value
        body.put_u8(0);
        codec::put_long_string(&mut body, "INSERT INTO t(id,v) VALUES (now(), ?)");
        body.put_u16(1);
        codec::put_value(&mut body, &Value::Bytes(b" Uuid() ".to_vec()));
        // prepared statement: id untouched, plain value untouched
        body.put_u8(1);
        codec::put_short_bytes(&mut body, &[0xde, 0xad]);
        body.put_u16(1);
        codec::put_value(&mut body, &Value::Bytes(b"plain".to_vec()));
        // consistency + batch flags tail
        body.put_u16(0x0001);
        body.put_u8(0);

        let header = FrameHeader {
            version: 0x04,
            flags: 0,
            stream: 8,
            opcode: Opcode::Batch as u8,
            body_len: 0,
        };
        let frame = Frame::from_parts(header, &body);

        let rewritten = rewriter.rewrite(&frame).expect("must rewrite");
        let mut cursor = Cursor::new(rewritten.body());
        assert_eq!(codec::get_u8(&mut cursor).unwrap(), 0);
        assert_eq!(codec::get_u16(&mut cursor).unwrap(), 2);

        assert_eq!(codec::get_u8(&mut cursor).unwrap(), 0);
        let statement = codec::get_long_string(&mut cursor, "q").unwrap();
        assert!(!statement.contains("now()"));
        assert!(statement.starts_with("INSERT INTO t(id,v) VALUES ("));
        assert_eq!(codec::get_u16(&mut cursor).unwrap(), 1);
        let value = codec::get_value(&mut cursor).unwrap();
        let Value::Bytes(bytes) = value else {
            panic!("expected bytes value")
        };
        let generated = Uuid::parse_str(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(generated.get_version_num(), 1);

        assert_eq!(codec::get_u8(&mut cursor).unwrap(), 1);
        assert_eq!(codec::get_short_bytes(&mut cursor).unwrap(), vec![0xde, 0xad]);
        assert_eq!(codec::get_u16(&mut cursor).unwrap(), 1);
        assert_eq!(
            codec::get_value(&mut cursor).unwrap(),
            Value::Bytes(b"plain".to_vec())
        );

        // tail preserved verbatim
        assert_eq!(codec::get_u16(&mut cursor).unwrap(), 0x0001);
        assert_eq!(codec::get_u8(&mut cursor).unwrap(), 0);
    }

    #[test]
    fn fast_scan_is_case_insensitive() {
        assert!(contains_token(b"VALUES (UUID(), 1)"));
        assert!(contains_token(b"values (NoW())"));
        assert!(!contains_token(b"SELECT * FROM system.peers"));
    }
}
