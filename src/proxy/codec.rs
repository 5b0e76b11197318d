use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{Method, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

/// Parsed head of one inbound client request.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub content_length: Option<usize>,
    pub chunked: bool,
    pub close: bool,
}

/// Reads and parses a request line plus headers, bounded by a deadline and a total
/// header budget. Returns `None` when the client closed the connection cleanly between
/// requests.
pub async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    timeout: Duration,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max request header size must be greater than zero"
    );
    let deadline = Instant::now() + timeout;
    let mut line = String::new();

    let read = read_line_with_deadline(
        reader,
        &mut line,
        deadline,
        "reading request line from client",
        max_header_bytes,
    )
    .await?;
    if read == 0 {
        return Ok(None);
    }
    let request_line = line.trim_end_matches(['\r', '\n']);
    if request_line.is_empty() {
        bail!("empty request line");
    }

    let mut parts = request_line.split_whitespace();
    let method_str = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing method"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing target"))?
        .to_string();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("malformed request line: missing version"))?;
    match version {
        "HTTP/1.1" | "HTTP/1.0" => {}
        other => bail!("invalid HTTP version '{other}'"),
    }
    let method = Method::from_bytes(method_str.as_bytes())
        .with_context(|| format!("invalid method '{method_str}'"))?;

    let mut budget = max_header_bytes
        .checked_sub(read)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    let mut close = version == "HTTP/1.0";

    loop {
        line.clear();
        let read = read_line_with_deadline(
            reader,
            &mut line,
            deadline,
            "reading request headers from client",
            budget,
        )
        .await?;
        if read == 0 {
            bail!("connection closed during request headers");
        }
        budget = budget
            .checked_sub(read)
            .ok_or_else(|| anyhow!("request headers exceed configured limit"))?;

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        // More lines must follow, so an exhausted budget is only fatal here.
        ensure!(budget > 0, "request headers exceed configured limit");
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        ensure!(!name.is_empty(), "header name must not be empty");

        if name.eq_ignore_ascii_case("content-length") {
            let parsed: usize = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            if let Some(existing) = content_length {
                ensure!(
                    existing == parsed,
                    "conflicting Content-Length headers are not supported"
                );
            }
            content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        } else if name.eq_ignore_ascii_case("connection") {
            for token in value.split(',').map(|token| token.trim()) {
                if token.eq_ignore_ascii_case("close") {
                    close = true;
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    close = false;
                }
            }
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        content_length,
        chunked,
        close,
    }))
}

/// Parsed head of an origin response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub content_length: Option<u64>,
    pub chunked: bool,
}

pub async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    deadline: Instant,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    ensure!(
        max_header_bytes > 0,
        "max response header size must be greater than zero"
    );
    let mut line = String::new();
    let read = read_line_with_deadline(
        reader,
        &mut line,
        deadline,
        "reading status line from origin",
        max_header_bytes,
    )
    .await?;
    if read == 0 {
        bail!("origin closed connection before sending a status line");
    }
    let status = parse_status_line(line.trim_end_matches(['\r', '\n']))?;

    let mut budget = max_header_bytes
        .checked_sub(read)
        .filter(|remaining| *remaining > 0)
        .ok_or_else(|| anyhow!("origin response headers exceed configured limit"))?;
    let mut content_length = None;
    let mut chunked = false;
    let mut transfer_encoding_present = false;

    loop {
        line.clear();
        let read = read_line_with_deadline(
            reader,
            &mut line,
            deadline,
            "reading response headers from origin",
            budget,
        )
        .await?;
        if read == 0 {
            bail!("origin closed connection during response headers");
        }
        budget = budget
            .checked_sub(read)
            .ok_or_else(|| anyhow!("origin response headers exceed configured limit"))?;

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        ensure!(
            budget > 0,
            "origin response headers exceed configured limit"
        );
        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("origin header missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            ensure!(
                content_length.is_none(),
                "multiple Content-Length headers from origin are not supported"
            );
            let parsed: u64 = value
                .parse()
                .with_context(|| format!("invalid Content-Length value '{value}'"))?;
            content_length = Some(parsed);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            transfer_encoding_present = true;
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        }
    }

    if transfer_encoding_present && content_length.is_some() {
        bail!("origin response must not include both Transfer-Encoding and Content-Length");
    }

    Ok(ResponseHead {
        status,
        content_length,
        chunked,
    })
}

pub(crate) fn parse_status_line(value: &str) -> Result<StatusCode> {
    let mut parts = value.split_whitespace();
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing HTTP version"))?;
    match version {
        "HTTP/1.1" | "HTTP/1.0" => {}
        other => bail!("invalid HTTP version '{other}' in status line"),
    }
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("status line missing status code"))?;
    let code: u16 = status
        .parse()
        .with_context(|| format!("invalid status code '{status}'"))?;
    StatusCode::from_u16(code).map_err(|_| anyhow!("unsupported status code '{code}'"))
}

/// Reads one newline-terminated line via the buffered reader, enforcing both the
/// deadline and a length cap. Returns 0 on clean EOF before any byte.
pub(crate) async fn read_line_with_deadline<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    deadline: Instant,
    context: &str,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or_else(|| anyhow!("timed out {context}"))?;
        let available = timeout_with_context(remaining, reader.fill_buf(), context).await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while {context}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected.len() + consume > max_len {
            bail!("line exceeds configured limit of {max_len} bytes while {context}");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string =
        String::from_utf8(collected).map_err(|_| anyhow!("line contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}
