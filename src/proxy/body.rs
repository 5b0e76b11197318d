use anyhow::{Context, Result, anyhow, bail};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;

use crate::util::timeout_with_context;

use super::codec::read_line_with_deadline;

const MAX_CHUNK_LINE_LENGTH: usize = 8192;

/// Raised when a body would exceed the configured limit; mapped to its own client
/// status at the dispatch boundary instead of a generic failure.
#[derive(Debug, Error)]
#[error("body exceeds configured limit of {limit} bytes")]
pub struct BodyTooLarge {
    pub limit: usize,
}

fn remaining(deadline: Instant, context: &str) -> Result<std::time::Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| anyhow!("timed out {context}"))
}

/// Reads exactly `len` body bytes into memory. This is the single "read the full body"
/// step the dispatcher performs before any cache operation.
pub async fn read_fixed_body<S>(
    reader: &mut BufReader<S>,
    len: usize,
    limit: usize,
    deadline: Instant,
    context: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    if len > limit {
        return Err(BodyTooLarge { limit }.into());
    }
    let mut body = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        let read = timeout_with_context(
            remaining(deadline, context)?,
            reader.read(&mut body[filled..]),
            context,
        )
        .await?;
        if read == 0 {
            bail!("unexpected EOF while {context}");
        }
        filled += read;
    }
    Ok(body)
}

/// Decodes a chunked transfer-coded body into memory, enforcing the size cap across
/// all chunks. Trailers are read and discarded.
pub async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    limit: usize,
    deadline: Instant,
    context: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        let read =
            read_line_with_deadline(reader, &mut line, deadline, context, MAX_CHUNK_LINE_LENGTH)
                .await?;
        if read == 0 {
            bail!("unexpected EOF while reading chunk size ({context})");
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let size_str = trimmed
            .split_once(';')
            .map(|(size, _)| size)
            .unwrap_or(trimmed);
        let chunk_size = usize::from_str_radix(size_str, 16)
            .with_context(|| format!("invalid chunk size '{size_str}'"))?;

        if chunk_size == 0 {
            // Trailer section runs until an empty line.
            loop {
                let read = read_line_with_deadline(
                    reader,
                    &mut line,
                    deadline,
                    context,
                    MAX_CHUNK_LINE_LENGTH,
                )
                .await?;
                if read == 0 {
                    bail!("unexpected EOF while reading chunk trailers ({context})");
                }
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
            break;
        }

        if body.len() + chunk_size > limit {
            return Err(BodyTooLarge { limit }.into());
        }
        let start = body.len();
        body.resize(start + chunk_size, 0);
        timeout_with_context(
            remaining(deadline, context)?,
            reader.read_exact(&mut body[start..]),
            context,
        )
        .await?;

        let mut crlf = [0u8; 2];
        timeout_with_context(
            remaining(deadline, context)?,
            reader.read_exact(&mut crlf),
            context,
        )
        .await?;
        if &crlf != b"\r\n" {
            bail!("invalid chunk terminator ({context})");
        }
    }

    Ok(body)
}

/// Reads a body delimited by connection close, enforcing the size cap.
pub async fn read_body_until_close<S>(
    reader: &mut BufReader<S>,
    limit: usize,
    deadline: Instant,
    context: &str,
) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = timeout_with_context(
            remaining(deadline, context)?,
            reader.read(&mut buffer),
            context,
        )
        .await?;
        if read == 0 {
            break;
        }
        if body.len() + read > limit {
            return Err(BodyTooLarge { limit }.into());
        }
        body.extend_from_slice(&buffer[..read]);
    }
    Ok(body)
}
