//! Wire framing for service messages
//!
//! Text frames are a CRLF header block (`Path`, `X-RequestId`,
//! `X-Timestamp`, `Content-Type`) separated from a UTF-8 body by a blank
//! line. Binary frames carry a big-endian `u16` header-section length,
//! the same header block, then the raw payload. A binary frame on path
//! `audio` with an empty payload is the end-of-audio signal.

use chrono::{SecondsFormat, Utc};

pub const HEADER_PATH: &str = "Path";
pub const HEADER_REQUEST_ID: &str = "X-RequestId";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Audio path; an empty binary body here means end-of-audio.
pub const PATH_AUDIO: &str = "audio";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

/// One framed service message, either direction.
#[derive(Debug, Clone)]
pub struct MessageFrame {
    pub message_type: MessageType,
    pub path: String,
    pub request_id: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl MessageFrame {
    /// A JSON text frame.
    pub fn text(path: &str, request_id: &str, body: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Text,
            path: path.to_string(),
            request_id: request_id.to_string(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            body: body.into().into_bytes(),
        }
    }

    /// A binary frame; an empty body on the audio path denotes end-of-audio.
    pub fn binary(path: &str, request_id: &str, body: Vec<u8>) -> Self {
        Self {
            message_type: MessageType::Binary,
            path: path.to_string(),
            request_id: request_id.to_string(),
            content_type: String::new(),
            body,
        }
    }

    pub fn is_end_of_audio(&self) -> bool {
        self.message_type == MessageType::Binary
            && self.path.eq_ignore_ascii_case(PATH_AUDIO)
            && self.body.is_empty()
    }

    /// Body as UTF-8 text; lossy for binary payloads.
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Errors from frame decoding
#[derive(Debug, Clone)]
pub enum FrameError {
    /// A required header is absent
    MissingPath,
    /// The frame bytes do not form a valid header block
    Malformed(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::MissingPath => write!(f, "Frame has no Path header"),
            FrameError::Malformed(e) => write!(f, "Malformed frame: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn header_block(frame: &MessageFrame) -> String {
    let mut block = format!(
        "{}: {}\r\n{}: {}\r\n{}: {}\r\n",
        HEADER_PATH,
        frame.path,
        HEADER_REQUEST_ID,
        frame.request_id,
        HEADER_TIMESTAMP,
        timestamp(),
    );
    if !frame.content_type.is_empty() {
        block.push_str(&format!("{}: {}\r\n", HEADER_CONTENT_TYPE, frame.content_type));
    }
    block
}

/// Serialize a text frame to its wire string.
pub fn encode_text(frame: &MessageFrame) -> String {
    format!("{}\r\n{}", header_block(frame), frame.body_text())
}

/// Serialize a binary frame to its wire bytes.
pub fn encode_binary(frame: &MessageFrame) -> Vec<u8> {
    let headers = header_block(frame);
    let header_bytes = headers.as_bytes();
    let mut out = Vec::with_capacity(2 + header_bytes.len() + frame.body.len());
    out.extend_from_slice(&(header_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(header_bytes);
    out.extend_from_slice(&frame.body);
    out
}

fn parse_headers(block: &str) -> (Option<String>, String, String) {
    let mut path = None;
    let mut request_id = String::new();
    let mut content_type = String::new();
    for line in block.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            let value = value.trim();
            if name.eq_ignore_ascii_case(HEADER_PATH) {
                path = Some(value.to_string());
            } else if name.eq_ignore_ascii_case(HEADER_REQUEST_ID) {
                request_id = value.to_string();
            } else if name.eq_ignore_ascii_case(HEADER_CONTENT_TYPE) {
                content_type = value.to_string();
            }
            // Other headers (X-Timestamp included) are not needed client-side.
        }
    }
    (path, request_id, content_type)
}

/// Parse a received text frame.
pub fn decode_text(raw: &str) -> Result<MessageFrame, FrameError> {
    let (header_block, body) = raw
        .split_once("\r\n\r\n")
        .ok_or_else(|| FrameError::Malformed("no header/body separator".to_string()))?;
    let (path, request_id, content_type) = parse_headers(header_block);
    Ok(MessageFrame {
        message_type: MessageType::Text,
        path: path.ok_or(FrameError::MissingPath)?,
        request_id,
        content_type,
        body: body.as_bytes().to_vec(),
    })
}

/// Parse a received binary frame.
pub fn decode_binary(raw: &[u8]) -> Result<MessageFrame, FrameError> {
    if raw.len() < 2 {
        return Err(FrameError::Malformed("shorter than length prefix".to_string()));
    }
    let header_len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    if raw.len() < 2 + header_len {
        return Err(FrameError::Malformed(format!(
            "header section of {} bytes exceeds frame of {}",
            header_len,
            raw.len()
        )));
    }
    let header_block = std::str::from_utf8(&raw[2..2 + header_len])
        .map_err(|e| FrameError::Malformed(e.to_string()))?;
    let (path, request_id, content_type) = parse_headers(header_block);
    Ok(MessageFrame {
        message_type: MessageType::Binary,
        path: path.ok_or(FrameError::MissingPath)?,
        request_id,
        content_type,
        body: raw[2 + header_len..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_frame_layout() {
        let frame = MessageFrame::text("speech.config", "abc123", r#"{"context":{}}"#);
        let raw = encode_text(&frame);

        assert!(raw.starts_with("Path: speech.config\r\n"));
        assert!(raw.contains("X-RequestId: abc123\r\n"));
        assert!(raw.contains("X-Timestamp: "));
        assert!(raw.contains("Content-Type: application/json\r\n"));
        assert!(raw.ends_with("\r\n\r\n{\"context\":{}}"));
    }

    #[test]
    fn test_decode_text_case_insensitive_headers() {
        let raw = "path: turn.start\r\nx-requestid: DEAD\r\ncontent-type: application/json\r\n\r\n{}";
        let frame = decode_text(raw).unwrap();
        assert_eq!(frame.path, "turn.start");
        assert_eq!(frame.request_id, "DEAD");
        assert_eq!(frame.body_text(), "{}");
    }

    #[test]
    fn test_decode_text_without_separator_fails() {
        assert!(decode_text("Path: turn.start").is_err());
    }

    #[test]
    fn test_binary_frame_carries_payload() {
        let frame = MessageFrame::binary("audio", "abc", vec![7, 8, 9]);
        let raw = encode_binary(&frame);
        let decoded = decode_binary(&raw).unwrap();
        assert_eq!(decoded.path, "audio");
        assert_eq!(decoded.request_id, "abc");
        assert_eq!(decoded.body, vec![7, 8, 9]);
        assert!(!decoded.is_end_of_audio());
    }

    #[test]
    fn test_empty_audio_frame_is_end_of_stream() {
        let frame = MessageFrame::binary("audio", "abc", Vec::new());
        assert!(frame.is_end_of_audio());
        let decoded = decode_binary(&encode_binary(&frame)).unwrap();
        assert!(decoded.is_end_of_audio());
    }

    #[test]
    fn test_decode_binary_bounds() {
        assert!(decode_binary(&[0]).is_err());
        // Claims a 100-byte header block in a 4-byte frame
        assert!(decode_binary(&[0, 100, 1, 2]).is_err());
    }
}
