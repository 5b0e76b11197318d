use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::AppContext;
use super::dispatch::serve_connection;

/// Binds the client-facing listener and serves connections until the process exits.
/// Each accepted connection runs in its own task; a failed accept is logged and the
/// loop keeps going.
pub(super) async fn run(app: AppContext) -> Result<()> {
    let bind_addr = (app.settings.host.as_str(), app.settings.port);
    let listener = TcpListener::bind(bind_addr).await.with_context(|| {
        format!(
            "failed to bind listener on {}:{}",
            app.settings.host, app.settings.port
        )
    })?;
    let local_addr = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!(address = %local_addr, origin = %app.settings.origin, "cache proxy listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
        }

        let app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, peer, app).await {
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        });
    }
}
