use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Writes a raw request (or several pipelined ones), half-closes the connection, and
/// returns everything the server sends back.
pub async fn send_request(addr: SocketAddr, raw: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect to proxy");
    stream.write_all(raw).await.expect("write request");
    stream.shutdown().await.expect("half-close");
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.expect("read response");
    out
}

pub fn status_of(response: &[u8]) -> u16 {
    let text = std::str::from_utf8(response).expect("response is not UTF-8");
    let line = text.lines().next().expect("empty response");
    line.split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or_else(|| panic!("malformed status line: {line}"))
}

pub fn body_of(response: &[u8]) -> &[u8] {
    response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| &response[idx + 4..])
        .expect("response has no header terminator")
}
