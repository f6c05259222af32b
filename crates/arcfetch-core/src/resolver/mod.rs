//! Turning the URLs a download was requested with into fetchable URLs.
//!
//! Indirect links (site-specific schemes) are translated by pluggable
//! [`ProtocolHandler`]s keyed by URL scheme. Plain URLs with a scheme nobody
//! registered for pass through unchanged.

mod cache;
mod sources;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DownloadError;

use cache::ResolveCache;
pub use cache::RESOLVE_CACHE_TTL;
pub use sources::Sources;

/// Result of resolving one or more input URLs.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedUrls {
    /// Fetchable URLs in preference order.
    pub urls: Vec<String>,
    /// Handler-provided metadata, passed through to the download result.
    pub meta: Value,
}

impl ResolvedUrls {
    pub fn direct(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            meta: empty_meta(),
        }
    }

    pub fn empty() -> Self {
        Self {
            urls: Vec::new(),
            meta: empty_meta(),
        }
    }
}

/// Resolves links of one URL scheme to direct URLs.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// `name` is the download's name template; `friendly_name` an optional
    /// display hint supplied with the request.
    async fn resolve(
        &self,
        url: &str,
        name: &str,
        friendly_name: Option<&str>,
    ) -> Result<ResolvedUrls, DownloadError>;
}

/// Scheme-keyed handler registry with a short-lived result cache.
#[derive(Clone, Default)]
pub struct UrlResolver {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
    cache: Arc<Mutex<ResolveCache>>,
}

impl UrlResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `scheme` (without the trailing `:`).
    pub fn with_handler(mut self, scheme: &str, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.register(scheme, handler);
        self
    }

    pub fn register(&mut self, scheme: &str, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(scheme.to_ascii_lowercase(), handler);
    }

    /// Resolve a single input URL.
    pub async fn resolve(
        &self,
        input: &str,
        name: &str,
        friendly_name: Option<&str>,
    ) -> Result<ResolvedUrls, DownloadError> {
        if let Some(hit) = self.cached(input) {
            return Ok(hit);
        }
        let scheme = match url::Url::parse(input) {
            Ok(parsed) => parsed.scheme().to_string(),
            Err(_) => return Ok(ResolvedUrls::empty()),
        };
        let Some(handler) = self.handlers.get(&scheme) else {
            return Ok(ResolvedUrls::direct(input));
        };
        let resolved = handler.resolve(input, name, friendly_name).await?;
        tracing::debug!(url = input, count = resolved.urls.len(), "resolved url");
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(input, resolved.clone());
        Ok(resolved)
    }

    /// Resolve every input in order and concatenate the results.
    ///
    /// Inputs that fail are skipped; metadata objects are deep-merged. Fails
    /// only when nothing resolved to a URL.
    pub async fn resolve_all(
        &self,
        inputs: &[String],
        name: &str,
        friendly_name: Option<&str>,
    ) -> Result<ResolvedUrls, DownloadError> {
        let mut out = ResolvedUrls::empty();
        let mut last_error = None;
        for input in inputs {
            match self.resolve(input, name, friendly_name).await {
                Ok(resolved) => {
                    out.urls.extend(resolved.urls);
                    merge_meta(&mut out.meta, resolved.meta);
                }
                Err(e) => {
                    tracing::warn!(url = %input, "failed to resolve url: {}", e);
                    last_error = Some(e);
                }
            }
        }
        if out.urls.is_empty() {
            let url = inputs.first().cloned().unwrap_or_default();
            let message = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no fetchable url".to_string());
            return Err(DownloadError::Resolve { url, message });
        }
        Ok(out)
    }

    fn cached(&self, input: &str) -> Option<ResolvedUrls> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(input)
    }
}

fn empty_meta() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Deep-merge `src` into `target`. Objects merge key by key; anything else in
/// `src` replaces what was there.
pub fn merge_meta(target: &mut Value, src: Value) {
    match (target, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                match dst.get_mut(&key) {
                    Some(existing) => merge_meta(existing, value),
                    None => {
                        dst.insert(key, value);
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (target, src) => *target = src,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Mirrors {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ProtocolHandler for Mirrors {
        async fn resolve(
            &self,
            url: &str,
            name: &str,
            _friendly_name: Option<&str>,
        ) -> Result<ResolvedUrls, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if url.contains("broken") {
                return Err(DownloadError::Resolve {
                    url: url.to_string(),
                    message: "link expired".into(),
                });
            }
            Ok(ResolvedUrls {
                urls: vec![
                    format!("https://a.example.com/{name}"),
                    format!("https://b.example.com/{name}"),
                ],
                meta: json!({ "source": { "site": "mods" }, "game": "balatro" }),
            })
        }
    }

    fn resolver() -> (UrlResolver, Arc<Mirrors>) {
        let handler = Arc::new(Mirrors {
            calls: AtomicUsize::new(0),
        });
        (UrlResolver::new().with_handler("mod", handler.clone()), handler)
    }

    #[tokio::test]
    async fn plain_urls_pass_through() {
        let (r, _) = resolver();
        let res = r.resolve("https://example.com/f.zip", "f.zip", None).await.unwrap();
        assert_eq!(res.urls, vec!["https://example.com/f.zip"]);
        assert_eq!(res.meta, json!({}));
    }

    #[tokio::test]
    async fn input_without_scheme_resolves_to_nothing() {
        let (r, _) = resolver();
        let res = r.resolve("just-a-name", "x", None).await.unwrap();
        assert!(res.urls.is_empty());
    }

    #[tokio::test]
    async fn handler_results_are_cached() {
        let (r, handler) = resolver();
        let first = r.resolve("mod://item/12", "pack.zip", None).await.unwrap();
        let second = r.resolve("mod://item/12", "pack.zip", None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.urls.len(), 2);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_all_concatenates_and_skips_failures() {
        let (r, _) = resolver();
        let inputs = vec![
            "mod://broken/1".to_string(),
            "mod://item/2".to_string(),
            "https://direct.example.com/pack.zip".to_string(),
        ];
        let res = r.resolve_all(&inputs, "pack.zip", None).await.unwrap();
        assert_eq!(
            res.urls,
            vec![
                "https://a.example.com/pack.zip",
                "https://b.example.com/pack.zip",
                "https://direct.example.com/pack.zip",
            ]
        );
        assert_eq!(res.meta["source"]["site"], "mods");
    }

    #[tokio::test]
    async fn resolve_all_fails_when_nothing_resolves() {
        let (r, _) = resolver();
        let err = r
            .resolve_all(&["mod://broken/1".to_string()], "x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Resolve { .. }));
        assert!(err.to_string().contains("link expired"));
    }

    #[test]
    fn meta_merges_deeply() {
        let mut meta = json!({ "a": { "x": 1, "y": 2 }, "b": 1 });
        merge_meta(&mut meta, json!({ "a": { "y": 3, "z": 4 }, "c": [1] }));
        assert_eq!(meta, json!({ "a": { "x": 1, "y": 3, "z": 4 }, "b": 1, "c": [1] }));
    }
}
