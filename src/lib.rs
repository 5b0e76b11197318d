pub mod cache;
pub mod cli;
pub mod logging;
pub mod metrics;
pub mod origin;
pub mod proxy;
pub mod settings;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use rustls::crypto::ring;
use rustls::{RootCertStore, client::ClientConfig};
use rustls_native_certs as native_certs;
use tracing::warn;

use crate::cache::ImageStore;
use crate::origin::{OriginClient, Scheme};
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            tracing::info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = metrics::serve(addr).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let endpoint = settings.origin_endpoint()?;
    let tls = match endpoint.scheme {
        Scheme::Https => Some(build_tls_client_config()?),
        Scheme::Http => None,
    };

    let store = Arc::new(ImageStore::new(settings.cache_dir.clone()));
    store
        .remove_temp_files()
        .await
        .with_context(|| format!("sweeping cache directory {}", store.root().display()))?;

    let origin = Arc::new(OriginClient::new(
        endpoint,
        tls,
        settings.origin_connect_timeout(),
        settings.origin_timeout(),
        settings.max_body_size,
        settings.max_header_size,
    )?);

    let app = proxy::AppContext::new(settings, store, origin);
    proxy::run(app).await
}

fn build_tls_client_config() -> Result<Arc<ClientConfig>> {
    let provider = ring::default_provider();
    let builder = ClientConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()?;

    let mut root_store = RootCertStore::empty();
    let mut anchors_loaded = 0usize;

    match native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if ignored > 0 {
                warn!(ignored, "ignored {ignored} invalid system trust anchors");
            }
            anchors_loaded += added;
        }
        Err(err) => {
            warn!(error = %err, "failed to load system trust anchors");
        }
    }

    ensure!(
        anchors_loaded > 0,
        "no trust anchors available; install system certificates or use an http:// origin"
    );

    let mut config = builder
        .with_root_certificates(Arc::new(root_store))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
