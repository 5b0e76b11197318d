use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    time::Instant,
};

use crate::proxy::codec::read_line_with_deadline;

const MAX_SCRAPE_REQUEST_LINE: usize = 1024;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("requests_total", "Requests by method and status class");
    let vec = IntCounterVec::new(opts, &["method", "status_class"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register requests_total");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Cache lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_store_total", "Cache entries written").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_DELETE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter =
        IntCounter::new("cache_delete_total", "Cache entries removed").expect("create counter");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_delete_total");
    counter
});

static ORIGIN_FETCH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("origin_fetch_total", "Origin fetches by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register origin_fetch_total");
    vec
});

static REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("request_duration_seconds", "Request latency by method")
        .buckets(vec![0.001, 0.005, 0.025, 0.1, 0.25, 1.0, 2.5, 10.0]);
    let vec = HistogramVec::new(opts, &["method"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register request_duration_seconds");
    vec
});

pub fn record_request(method: &str, status: StatusCode, elapsed: Duration) {
    let status_class = match status.as_u16() {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    };
    REQUESTS_TOTAL
        .with_label_values(&[method, status_class])
        .inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[method])
        .observe(elapsed.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_delete() {
    CACHE_DELETE_TOTAL.inc();
}

pub fn record_origin_fetch(outcome: &str) {
    ORIGIN_FETCH_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("metrics output was not UTF-8")
}

/// Minimal plain-HTTP exporter: answers `GET /metrics`, everything else gets 404.
pub async fn serve(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {addr}"))?;

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::debug!(error = %err, "metrics accept failed");
                continue;
            }
        };
        tokio::spawn(handle_scrape(stream));
    }
}

/// One scrape connection. The request line is read under a deadline and a small byte
/// cap; a connection that exceeds either is dropped without a response.
async fn handle_scrape<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    match read_line_with_deadline(
        &mut reader,
        &mut request_line,
        deadline,
        "reading metrics request line",
        MAX_SCRAPE_REQUEST_LINE,
    )
    .await
    {
        Ok(read) if read > 0 => {}
        Ok(_) => return,
        Err(err) => {
            tracing::debug!(error = %err, "dropping metrics connection");
            return;
        }
    }

    let is_metrics = {
        let mut parts = request_line.split_whitespace();
        parts.next() == Some("GET")
            && parts
                .next()
                .map(|path| path == "/metrics" || path.starts_with("/metrics?"))
                .unwrap_or(false)
    };

    let response = if is_metrics {
        match render() {
            Ok(body) => format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            ),
            Err(err) => {
                tracing::error!(error = %err, "failed to render metrics");
                "HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
            }
        }
    } else {
        "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string()
    };

    let mut stream = reader.into_inner();
    stream.write_all(response.as_bytes()).await.ok();
    stream.shutdown().await.ok();
}
