use bytes::Bytes;
use http::StatusCode;

pub const IMAGE_CONTENT_TYPE: &str = "image/jpeg";
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// One fully materialized client response: status, content type, body. Every dispatch
/// outcome collapses into this before anything is written to the socket.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: Bytes,
}

impl Response {
    pub fn image(body: Bytes) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: IMAGE_CONTENT_TYPE,
            body,
        }
    }

    /// Short plain-text status body; never carries internal paths or error chains.
    pub fn text(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            content_type: TEXT_CONTENT_TYPE,
            body: Bytes::from(format!("{message}\n")),
        }
    }

    pub fn encode(&self, close: bool) -> Vec<u8> {
        let reason = self.status.canonical_reason().unwrap_or("");
        let mut buffer = Vec::with_capacity(128 + self.body.len());
        buffer.extend_from_slice(
            format!("HTTP/1.1 {} {reason}\r\n", self.status.as_u16()).as_bytes(),
        );
        buffer.extend_from_slice(format!("Content-Type: {}\r\n", self.content_type).as_bytes());
        buffer.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        if close {
            buffer.extend_from_slice(b"Connection: close\r\n");
        }
        buffer.extend_from_slice(b"\r\n");
        buffer.extend_from_slice(&self.body);
        buffer
    }
}
