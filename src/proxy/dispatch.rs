use std::net::SocketAddr;
use std::time::Instant as WallInstant;

use anyhow::Result;
use bytes::Bytes;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::debug;

use crate::cache::CacheKey;
use crate::logging::AccessLogBuilder;
use crate::util::timeout_with_context;

use super::AppContext;
use super::body::{BodyTooLarge, read_fixed_body};
use super::codec::read_request_head;
use super::handler::{self, Handled};
use super::response::Response;

/// Serves one client connection: a keep-alive loop of head parse, body read, dispatch,
/// response write. Any framing failure ends the connection; a clean EOF between
/// requests ends it quietly.
pub(super) async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    app: AppContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_timeout = app.settings.client_timeout();
    let max_header_size = app.settings.max_header_size;
    let max_body_size = app.settings.max_body_size;
    let mut reader = BufReader::new(stream);

    loop {
        let started = WallInstant::now();
        let head = match read_request_head(&mut reader, client_timeout, max_header_size).await {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(()),
            Err(err) => {
                debug!(peer = %peer, error = %err, "rejecting unparsable request");
                let encoded = Response::text(StatusCode::BAD_REQUEST, "Bad Request").encode(true);
                let _ = timeout_with_context(
                    client_timeout,
                    write_response(&mut reader, &encoded),
                    "writing error response to client",
                )
                .await;
                return Err(err.context("parsing client request"));
            }
        };

        let deadline = Instant::now() + client_timeout;
        let key = CacheKey::resolve(&head.target);
        let mut close = head.close;

        let (handled, body_len) = if head.chunked {
            // Bodies must be length-delimited so the size cap can be checked up front.
            close = true;
            let handled = Handled {
                response: Response::text(StatusCode::LENGTH_REQUIRED, "Length Required"),
                cache: "none",
                origin_fetch: false,
                error_reason: Some("chunked request body".to_string()),
            };
            (handled, 0u64)
        } else {
            let body_len = head.content_length.unwrap_or(0);
            match read_fixed_body(
                &mut reader,
                body_len,
                max_body_size,
                deadline,
                "reading request body from client",
            )
            .await
            {
                Ok(body) => {
                    let handled =
                        handler::handle_request(&app, &head.method, &key, Bytes::from(body)).await;
                    (handled, body_len as u64)
                }
                Err(err) if err.downcast_ref::<BodyTooLarge>().is_some() => {
                    // The body was never read, so the connection cannot be reused.
                    close = true;
                    let handled = Handled {
                        response: Response::text(
                            StatusCode::PAYLOAD_TOO_LARGE,
                            "Payload Too Large",
                        ),
                        cache: "none",
                        origin_fetch: false,
                        error_reason: Some(err.to_string()),
                    };
                    (handled, 0u64)
                }
                Err(err) => return Err(err),
            }
        };

        let encoded = handled.response.encode(close);
        timeout_with_context(
            client_timeout,
            write_response(&mut reader, &encoded),
            "writing response to client",
        )
        .await?;

        let mut builder = AccessLogBuilder::new(peer)
            .method(head.method.as_str())
            .target(&head.target)
            .key(key.as_str())
            .status(handled.response.status)
            .cache(handled.cache)
            .origin_fetch(handled.origin_fetch)
            .bytes(body_len, encoded.len() as u64)
            .elapsed(started.elapsed());
        if let Some(reason) = handled.error_reason {
            builder = builder.error_reason(reason);
        }
        builder.log();

        if close {
            return Ok(());
        }
    }
}

async fn write_response<S>(reader: &mut BufReader<S>, encoded: &[u8]) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = reader.get_mut();
    stream.write_all(encoded).await?;
    stream.flush().await
}
