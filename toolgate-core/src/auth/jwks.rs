//! Discovery key-set fetch with a one-hour in-process cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How long a fetched key set stays fresh.
const CACHE_TTL: Duration = Duration::from_secs(3600);

struct CachedSet {
    fetched_at: Instant,
    keys: Arc<JwkSet>,
}

/// In-process JWKS cache keyed by discovery URL.
///
/// A miss or an expired entry triggers one HTTPS fetch; a fetch failure
/// yields `None` so token verification fails closed without evicting a
/// previously cached set before its TTL.
#[derive(Default)]
pub struct JwksCache {
    entries: Mutex<HashMap<String, CachedSet>>,
}

impl JwksCache {
    /// Return the key set for `url`, fetching when absent or stale.
    pub async fn get(&self, url: &str) -> Option<Arc<JwkSet>> {
        let mut entries = self.entries.lock().await;
        if let Some(cached) = entries.get(url) {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Some(Arc::clone(&cached.keys));
            }
        }

        let keys = match fetch(url).await {
            Ok(set) => Arc::new(set),
            Err(e) => {
                warn!(%url, error = %e, "discovery key set fetch failed");
                return None;
            }
        };
        debug!(%url, key_count = keys.keys.len(), "discovery key set cached");
        entries.insert(
            url.to_string(),
            CachedSet {
                fetched_at: Instant::now(),
                keys: Arc::clone(&keys),
            },
        );
        Some(keys)
    }
}

async fn fetch(url: &str) -> Result<JwkSet, reqwest::Error> {
    reqwest::get(url).await?.error_for_status()?.json().await
}
