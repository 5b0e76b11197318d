use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use pixcache::cli::LogFormat;
use pixcache::settings::Settings;

/// Loopback origin that answers every request with one canned response and counts
/// how many requests it saw.
pub struct MockOrigin {
    pub addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

impl MockOrigin {
    pub async fn spawn(response: Vec<u8>) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind mock origin");
        let addr = listener.local_addr().expect("mock origin address");
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let response = Arc::new(response);

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                let counter = counter.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut data = Vec::new();
                    loop {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        data.extend_from_slice(&buf[..n]);
                        if data.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    socket.write_all(&response).await.ok();
                    socket.shutdown().await.ok();
                });
            }
        });

        Self { addr, requests }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// A full proxy instance on an ephemeral port, backed by a fresh cache directory and
/// a mock origin. Dropping the harness drops the cache directory.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub origin: MockOrigin,
    cache_dir: TempDir,
}

impl TestProxy {
    pub async fn start(origin_response: &[u8]) -> Self {
        let origin = MockOrigin::spawn(origin_response.to_vec()).await;
        Self::start_with_origin(origin).await
    }

    pub async fn start_with_origin(origin: MockOrigin) -> Self {
        let cache_dir = TempDir::new().expect("create cache dir");
        let port = free_port();
        let settings = Settings {
            host: "127.0.0.1".to_string(),
            port,
            cache_dir: cache_dir.path().to_path_buf(),
            origin: format!("http://{}", origin.addr),
            log: LogFormat::Text,
            client_timeout: 5,
            origin_connect_timeout: 1,
            origin_timeout: 2,
            max_header_size: 16 * 1024,
            max_body_size: 1024 * 1024,
            metrics_listen: None,
        };
        tokio::spawn(async move {
            if let Err(err) = pixcache::run(settings).await {
                eprintln!("proxy exited: {err:#}");
            }
        });

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        wait_for_listener(addr).await;
        Self {
            addr,
            origin,
            cache_dir,
        }
    }

    pub fn cache_path(&self) -> &Path {
        self.cache_dir.path()
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .expect("probe for free port")
        .local_addr()
        .expect("probe address")
        .port()
}

pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..200 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("proxy at {addr} did not start listening");
}
