use std::fmt;

/// Fallback key for any request target that does not name a status code.
pub const SENTINEL_KEY: &str = "404";

/// A normalized cache key: a non-empty run of ASCII digits.
///
/// The only constructors normalize their input, so holding a `CacheKey` is proof the
/// token is a safe filename stem (no separators, no `..`, nothing outside the cache
/// root).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derives the key from a raw request target.
    ///
    /// Any query string is ignored. After stripping the single leading `/`, the whole
    /// remainder must be decimal digits; everything else collapses to [`SENTINEL_KEY`].
    /// Malformed input is normalized, never rejected.
    pub fn resolve(target: &str) -> Self {
        let path = target.split('?').next().unwrap_or("");
        let token = path.strip_prefix('/').unwrap_or(path);
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            Self(token.to_string())
        } else {
            Self(SENTINEL_KEY.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the entry for this key.
    pub fn file_name(&self) -> String {
        format!("{}.jpg", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
