//! Client-facing side of the proxy: the listener, the per-connection request loop,
//! the HTTP/1.1 codec, and the method dispatch table.

use std::sync::Arc;

use anyhow::Result;

use crate::cache::ImageStore;
use crate::origin::OriginClient;
use crate::settings::Settings;

pub mod body;
pub mod codec;
mod dispatch;
mod handler;
mod listener;
pub mod response;

/// Shared per-process state handed to every connection task.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub store: Arc<ImageStore>,
    pub origin: Arc<OriginClient>,
}

impl AppContext {
    pub fn new(settings: Arc<Settings>, store: Arc<ImageStore>, origin: Arc<OriginClient>) -> Self {
        Self {
            settings,
            store,
            origin,
        }
    }
}

pub async fn run(app: AppContext) -> Result<()> {
    listener::run(app).await
}
