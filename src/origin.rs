use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::Bytes;
use http::StatusCode;
use rustls::client::ClientConfig;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::cache::{CacheKey, ImageStore};
use crate::metrics;
use crate::proxy::body::{read_body_until_close, read_chunked_body, read_fixed_body};
use crate::proxy::codec::read_response_head;
use crate::util::timeout_with_context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Parsed origin base URL. Each key maps to exactly one resource:
/// `{scheme}://{host}:{port}{base_path}/{key}`.
#[derive(Debug, Clone)]
pub struct OriginEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl OriginEndpoint {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            bail!("origin URL '{url}' must start with http:// or https://");
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        ensure!(!authority.is_empty(), "origin URL '{url}' is missing a host");

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                ensure!(!host.is_empty(), "origin URL '{url}' is missing a host");
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("invalid origin port in '{url}'"))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), scheme.default_port()),
        };

        Ok(Self {
            scheme,
            host,
            port,
            base_path: path.trim_end_matches('/').to_string(),
        })
    }

    fn resource_path(&self, key: &CacheKey) -> String {
        format!("{}/{}", self.base_path, key)
    }

    fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// All origin failures look the same to the client (a miss); the variants exist so the
/// access log can tell them apart.
#[derive(Debug, Error)]
pub enum OriginError {
    #[error("origin fetch timed out")]
    Timeout,
    #[error("origin returned status {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

enum OriginIo {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OriginIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            OriginIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for OriginIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            OriginIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            OriginIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            OriginIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            OriginIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            OriginIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Read-through fetcher: one short-lived HTTP/1.1 request per cache miss.
pub struct OriginClient {
    endpoint: OriginEndpoint,
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Duration,
    fetch_timeout: Duration,
    max_response_size: usize,
    max_header_size: usize,
}

impl OriginClient {
    pub fn new(
        endpoint: OriginEndpoint,
        tls: Option<Arc<ClientConfig>>,
        connect_timeout: Duration,
        fetch_timeout: Duration,
        max_response_size: usize,
        max_header_size: usize,
    ) -> Result<Self> {
        ensure!(
            endpoint.scheme == Scheme::Http || tls.is_some(),
            "https origin requires a TLS client configuration"
        );
        Ok(Self {
            endpoint,
            tls,
            connect_timeout,
            fetch_timeout,
            max_response_size,
            max_header_size,
        })
    }

    /// Retrieves the image for a key from the origin. The whole exchange (connect,
    /// request, response) is bounded by the fetch timeout.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Bytes, OriginError> {
        let result = match timeout(self.fetch_timeout, self.fetch_inner(key)).await {
            Ok(result) => result,
            Err(_) => Err(OriginError::Timeout),
        };
        match &result {
            Ok(body) => {
                debug!(key = %key, bytes = body.len(), "origin fetch succeeded");
                metrics::record_origin_fetch("ok");
            }
            Err(OriginError::Timeout) => metrics::record_origin_fetch("timeout"),
            Err(OriginError::Status(_)) => metrics::record_origin_fetch("status"),
            Err(OriginError::Transport(_)) => metrics::record_origin_fetch("error"),
        }
        result
    }

    async fn fetch_inner(&self, key: &CacheKey) -> Result<Bytes, OriginError> {
        let deadline = Instant::now() + self.fetch_timeout;
        let mut stream = self.connect().await?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: pixcache\r\nAccept: image/*\r\nConnection: close\r\n\r\n",
            self.endpoint.resource_path(key),
            self.endpoint.host_header(),
        );
        stream
            .write_all(request.as_bytes())
            .await
            .context("writing request to origin")?;
        stream.flush().await.context("flushing request to origin")?;

        let mut reader = BufReader::new(stream);
        let head = read_response_head(&mut reader, deadline, self.max_header_size).await?;
        if !head.status.is_success() {
            return Err(OriginError::Status(head.status));
        }

        let context = "reading response body from origin";
        let body = if head.chunked {
            read_chunked_body(&mut reader, self.max_response_size, deadline, context).await?
        } else if let Some(length) = head.content_length {
            let length = usize::try_from(length)
                .map_err(|_| anyhow!("origin Content-Length {length} does not fit in memory"))?;
            read_fixed_body(&mut reader, length, self.max_response_size, deadline, context).await?
        } else {
            read_body_until_close(&mut reader, self.max_response_size, deadline, context).await?
        };
        Ok(Bytes::from(body))
    }

    async fn connect(&self) -> Result<OriginIo> {
        let tcp = timeout_with_context(
            self.connect_timeout,
            TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)),
            format!(
                "connecting to origin {}:{}",
                self.endpoint.host, self.endpoint.port
            ),
        )
        .await?;

        match self.endpoint.scheme {
            Scheme::Http => Ok(OriginIo::Plain(tcp)),
            Scheme::Https => {
                let config = self
                    .tls
                    .clone()
                    .ok_or_else(|| anyhow!("https origin requires a TLS client configuration"))?;
                let server_name = ServerName::try_from(self.endpoint.host.as_str())
                    .map_err(|_| anyhow!("invalid origin host '{}' for TLS", self.endpoint.host))?
                    .to_owned();
                let connector = TlsConnector::from(config);
                let tls = connector
                    .connect(server_name, tcp)
                    .await
                    .with_context(|| {
                        format!("TLS handshake with origin {} failed", self.endpoint.host)
                    })?;
                Ok(OriginIo::Tls(Box::new(tls)))
            }
        }
    }

    /// Read-through population: fetch from the origin and persist the result. The
    /// fetched bytes are returned even when the cache write fails; the response is not
    /// withheld just because caching broke, but the failure is logged.
    pub async fn fetch_and_populate(
        &self,
        key: &CacheKey,
        store: &ImageStore,
    ) -> Result<Bytes, OriginError> {
        let body = self.fetch(key).await?;
        match store.put(key, &body).await {
            Ok(()) => metrics::record_cache_store(),
            Err(err) => {
                warn!(key = %key, error = %err, "failed to populate cache after origin fetch");
            }
        }
        Ok(body)
    }
}
