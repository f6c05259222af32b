//! Candidate URLs of one download, resolved at most once.

use serde_json::Value;
use tokio::sync::OnceCell;

use super::{ResolvedUrls, UrlResolver};
use crate::error::DownloadError;

/// The URLs a download was requested with plus their memoized resolution.
/// Shared by all chunks of the download.
pub struct Sources {
    inputs: Vec<String>,
    name: String,
    friendly_name: Option<String>,
    resolver: UrlResolver,
    resolved: OnceCell<Result<ResolvedUrls, String>>,
}

impl Sources {
    pub fn new(
        inputs: Vec<String>,
        name: String,
        friendly_name: Option<String>,
        resolver: UrlResolver,
    ) -> Self {
        Self {
            inputs,
            name,
            friendly_name,
            resolver,
            resolved: OnceCell::new(),
        }
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    async fn resolution(&self) -> &Result<ResolvedUrls, String> {
        self.resolved
            .get_or_init(|| async {
                self.resolver
                    .resolve_all(&self.inputs, &self.name, self.friendly_name.as_deref())
                    .await
                    .map_err(|e| e.to_string())
            })
            .await
    }

    /// URL a chunk on mirror `mirror_index` should fetch.
    pub async fn url_for(&self, mirror_index: usize) -> Result<String, DownloadError> {
        match self.resolution().await {
            Ok(resolved) if !resolved.urls.is_empty() => {
                Ok(resolved.urls[mirror_index % resolved.urls.len()].clone())
            }
            Ok(_) => Err(self.resolve_error("no fetchable url".to_string())),
            Err(message) => Err(self.resolve_error(message.clone())),
        }
    }

    /// Resolved URLs, if resolution already ran and succeeded.
    pub fn resolved_urls(&self) -> Option<Vec<String>> {
        match self.resolved.get() {
            Some(Ok(resolved)) => Some(resolved.urls.clone()),
            _ => None,
        }
    }

    /// Merged handler metadata; an empty object when resolution failed.
    pub async fn meta(&self) -> Value {
        match self.resolution().await {
            Ok(resolved) => resolved.meta.clone(),
            Err(_) => ResolvedUrls::empty().meta,
        }
    }

    fn resolve_error(&self, message: String) -> DownloadError {
        DownloadError::Resolve {
            url: self.inputs.first().cloned().unwrap_or_default(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mirrors_rotate_by_index() {
        let sources = Sources::new(
            vec!["https://a.example.com/f".into(), "https://b.example.com/f".into()],
            "f".into(),
            None,
            UrlResolver::new(),
        );
        assert!(sources.resolved_urls().is_none());
        assert_eq!(sources.url_for(0).await.unwrap(), "https://a.example.com/f");
        assert_eq!(sources.url_for(1).await.unwrap(), "https://b.example.com/f");
        assert_eq!(sources.url_for(2).await.unwrap(), "https://a.example.com/f");
        assert_eq!(sources.resolved_urls().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unresolvable_sources_fail_every_chunk() {
        let sources = Sources::new(vec!["nothing".into()], "f".into(), None, UrlResolver::new());
        let err = sources.url_for(0).await.unwrap_err();
        assert!(matches!(err, DownloadError::Resolve { .. }));
        assert_eq!(sources.meta().await, serde_json::json!({}));
    }
}
