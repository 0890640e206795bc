// ABOUTME: Protocol-version allow-list enforcement for client-facing frames
// ABOUTME: Rejections are answered locally with a synthesised protocol-error frame

use crate::codec::{self, ERROR_CODE_PROTOCOL};
use crate::frame::Frame;

/// Enforces the configured set of acceptable protocol versions.
///
/// With an empty allow-list every version is admitted and negotiation is left
/// to the source cluster. With a non-empty list, frames carrying any other
/// version are answered directly with a `0x000A` protocol error and never
/// fanned out.
#[derive(Debug, Clone)]
pub struct ProtocolGuard {
    /// Sorted ascending; the lowest entry doubles as the version of the
    /// synthesised error frame so any client can decode it.
    allowed: Vec<u8>,
}

impl ProtocolGuard {
    pub fn new(mut versions: Vec<u8>) -> ProtocolGuard {
        versions.sort_unstable();
        versions.dedup();
        ProtocolGuard { allowed: versions }
    }

    pub fn is_enforcing(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Check a client frame. `None` admits the frame; `Some` carries the
    /// rejection to send back on the client's stream id.
    pub fn admit(&self, frame: &Frame) -> Option<Frame> {
        if self.allowed.is_empty() {
            return None;
        }
        let version = frame.header.protocol_version();
        if self.allowed.contains(&version) {
            return None;
        }

        let supported: Vec<String> = self
            .allowed
            .iter()
            .map(|v| codec::protocol_version_label(*v))
            .collect();
        let message = format!(
            "Invalid or unsupported protocol version ({}); supported versions are ({})",
            version,
            supported.join(",")
        );
        // allowed is non-empty here, so first() always yields
        let lowest = self.allowed.first().copied().unwrap_or(version);
        Some(codec::error_frame(
            lowest,
            frame.stream(),
            ERROR_CODE_PROTOCOL,
            &message,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::get_string;
    use crate::frame::{FrameHeader, FrameKind, Opcode};
    use std::io::Cursor;

    fn startup(version: u8, stream: i16) -> Frame {
        let header = FrameHeader {
            version,
            flags: 0,
            stream,
            opcode: Opcode::Startup as u8,
            body_len: 0,
        };
        Frame::from_parts(header, &[0x00, 0x00])
    }

    #[test]
    fn empty_allow_list_admits_everything() {
        let guard = ProtocolGuard::new(Vec::new());
        assert!(!guard.is_enforcing());
        assert!(guard.admit(&startup(0x05, 1)).is_none());
        assert!(guard.admit(&startup(0x03, 1)).is_none());
    }

    #[test]
    fn allowed_version_passes() {
        let guard = ProtocolGuard::new(vec![4]);
        assert!(guard.admit(&startup(0x04, 1)).is_none());
    }

    #[test]
    fn rejected_version_gets_protocol_error() {
        let guard = ProtocolGuard::new(vec![4]);
        let reject = guard.admit(&startup(0x05, 12)).unwrap();
        assert_eq!(reject.kind(), FrameKind::Error);
        assert_eq!(reject.stream(), 12);
        // synthesised at the lowest supported version, response direction
        assert_eq!(reject.header.version, 0x84);

        let mut cursor = Cursor::new(reject.body());
        let code = crate::codec::get_i32(&mut cursor).unwrap();
        assert_eq!(code, ERROR_CODE_PROTOCOL);
        let message = get_string(&mut cursor, "message").unwrap();
        assert!(message.starts_with(
            "Invalid or unsupported protocol version (5); supported versions are (4/v4)"
        ));
    }

    #[test]
    fn message_lists_versions_sorted() {
        let guard = ProtocolGuard::new(vec![5, 3, 4, 4]);
        let reject = guard.admit(&startup(0x02, 0)).unwrap();
        let mut cursor = Cursor::new(reject.body());
        crate::codec::get_i32(&mut cursor).unwrap();
        let message = get_string(&mut cursor, "message").unwrap();
        assert!(message.ends_with("(3/v3,4/v4,5/v5)"));
        assert_eq!(reject.header.version, 0x83);
    }
}
