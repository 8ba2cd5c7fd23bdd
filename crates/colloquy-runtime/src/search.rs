//! SearxNG client
//!
//! Backs both the `web_search` tool and media marker resolution.

use std::time::Duration;

use async_trait::async_trait;
use colloquy_core::{
    error::{AgentError, Result},
    media::{MediaItem, MediaKind, MediaResolver},
};
use serde::Deserialize;

use crate::framing;

/// One SearxNG result row
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub img_src: Option<String>,
    #[serde(default)]
    pub thumbnail_src: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

impl SearchHit {
    fn into_media(self, kind: MediaKind) -> Option<MediaItem> {
        let url = match kind {
            MediaKind::Image => self.img_src.clone().filter(|u| !u.is_empty()).unwrap_or(self.url),
            MediaKind::Video => self.url,
        };
        if url.is_empty() {
            return None;
        }
        Some(MediaItem {
            title: self.title,
            url,
            thumbnail_url: self.thumbnail_src.or(self.thumbnail).filter(|t| !t.is_empty()),
            source: self.engine,
        })
    }
}

/// Thin client over the SearxNG JSON API
#[derive(Clone, Debug)]
pub struct SearxngClient {
    client: reqwest::Client,
    base_url: String,
    max_media_results: usize,
}

impl SearxngClient {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_media_results: 6,
        })
    }

    #[must_use]
    pub const fn with_max_media_results(mut self, max: usize) -> Self {
        self.max_media_results = max;
        self
    }

    /// Run one query, optionally scoped to a SearxNG category
    pub async fn search(&self, query: &str, category: Option<&str>) -> Result<Vec<SearchHit>> {
        let mut params = vec![("q", query), ("format", "json")];
        if let Some(category) = category {
            params.push(("categories", category));
        }
        tracing::debug!(query, category, "SearxNG search");

        let request = self.client.get(format!("{}/search", self.base_url)).query(&params);
        let response = framing::send(request).await?;
        let body: SearchResponse = response.json().await.map_err(|e| framing::request_error(&e))?;
        Ok(body.results)
    }
}

#[async_trait]
impl MediaResolver for SearxngClient {
    async fn resolve(&self, kind: MediaKind, query: &str) -> Result<Vec<MediaItem>> {
        let category = match kind {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
        };
        let hits = self.search(query, Some(category)).await?;
        Ok(media_items(hits, kind, self.max_media_results))
    }
}

fn media_items(hits: Vec<SearchHit>, kind: MediaKind, max: usize) -> Vec<MediaItem> {
    hits.into_iter()
        .filter_map(|hit| hit.into_media(kind))
        .take(max)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hits(value: serde_json::Value) -> Vec<SearchHit> {
        serde_json::from_value::<SearchResponse>(value).unwrap().results
    }

    #[test]
    fn test_image_hits_prefer_img_src() {
        let results = hits(json!({"results": [
            {"title": "Cat", "url": "https://example.com/page", "img_src": "https://example.com/cat.jpg",
             "thumbnail_src": "https://example.com/cat_t.jpg", "engine": "bing images"},
            {"title": "No link", "url": ""}
        ]}));
        let items = media_items(results, MediaKind::Image, 6);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://example.com/cat.jpg");
        assert_eq!(items[0].thumbnail_url.as_deref(), Some("https://example.com/cat_t.jpg"));
        assert_eq!(items[0].source.as_deref(), Some("bing images"));
    }

    #[test]
    fn test_video_hits_use_page_url_and_limit() {
        let results = hits(json!({"results": [
            {"title": "a", "url": "https://v.example/1", "thumbnail": "https://v.example/1.jpg"},
            {"title": "b", "url": "https://v.example/2"},
            {"title": "c", "url": "https://v.example/3"}
        ]}));
        let items = media_items(results, MediaKind::Video, 2);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://v.example/1");
        assert_eq!(items[0].thumbnail_url.as_deref(), Some("https://v.example/1.jpg"));
    }

    #[test]
    fn test_missing_results_field() {
        assert!(hits(json!({"query": "x"})).is_empty());
    }
}
