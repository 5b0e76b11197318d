use bytes::Bytes;
use http::{Method, StatusCode};
use tracing::{error, warn};

use crate::cache::{CacheError, CacheKey};
use crate::metrics;

use super::AppContext;
use super::response::Response;

/// Result of dispatching one request, with the fields the access log wants alongside
/// the wire response.
pub(super) struct Handled {
    pub response: Response,
    /// hit | miss | stored | deleted | none
    pub cache: &'static str,
    pub origin_fetch: bool,
    pub error_reason: Option<String>,
}

impl Handled {
    fn new(response: Response, cache: &'static str) -> Self {
        Self {
            response,
            cache,
            origin_fetch: false,
            error_reason: None,
        }
    }
}

/// The method × cache-outcome dispatch table. Every component failure is mapped to
/// exactly one status here; nothing below this layer touches the client.
pub(super) async fn handle_request(
    app: &AppContext,
    method: &Method,
    key: &CacheKey,
    body: Bytes,
) -> Handled {
    match *method {
        Method::GET => handle_get(app, key).await,
        Method::PUT => match app.store.put(key, &body).await {
            Ok(()) => {
                metrics::record_cache_store();
                Handled::new(Response::text(StatusCode::CREATED, "Created"), "stored")
            }
            Err(err) => storage_failure(key, err),
        },
        Method::DELETE => match app.store.delete(key).await {
            Ok(()) => {
                metrics::record_cache_delete();
                Handled::new(Response::text(StatusCode::OK, "OK"), "deleted")
            }
            Err(CacheError::NotFound) => Handled::new(
                Response::text(StatusCode::NOT_FOUND, "Not Found"),
                "miss",
            ),
            Err(err) => storage_failure(key, err),
        },
        _ => Handled::new(
            Response::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
            "none",
        ),
    }
}

async fn handle_get(app: &AppContext, key: &CacheKey) -> Handled {
    match app.store.get(key).await {
        Ok(bytes) => {
            metrics::record_cache_lookup(true);
            Handled::new(Response::image(bytes), "hit")
        }
        Err(CacheError::NotFound) => {
            metrics::record_cache_lookup(false);
            match app.origin.fetch_and_populate(key, &app.store).await {
                Ok(bytes) => Handled {
                    response: Response::image(bytes),
                    cache: "miss",
                    origin_fetch: true,
                    error_reason: None,
                },
                Err(err) => {
                    warn!(key = %key, error = %err, "origin fetch failed");
                    Handled {
                        response: Response::text(StatusCode::NOT_FOUND, "Not Found"),
                        cache: "miss",
                        origin_fetch: true,
                        error_reason: Some(err.to_string()),
                    }
                }
            }
        }
        Err(err) => storage_failure(key, err),
    }
}

fn storage_failure(key: &CacheKey, err: CacheError) -> Handled {
    error!(key = %key, error = %err, "cache storage failure");
    Handled {
        response: Response::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"),
        cache: "none",
        origin_fetch: false,
        error_reason: Some(err.to_string()),
    }
}
