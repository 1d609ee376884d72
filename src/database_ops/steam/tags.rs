use async_trait::async_trait;
use indexmap::IndexSet;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use tracing::debug;

use super::SteamEndpoints;
use crate::models::AppId;

/// User-applied tags as shown on the store page, most popular first.
const POPULAR_TAG_SELECTOR: &str = ".glance_tags.popular_tags a.app_tag";

/// Best-effort tag lookup: every failure yields an empty list.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn fetch_tags(&self, appid: AppId) -> Vec<String>;
}

/// Trimmed, de-duplicated tag labels in page order.
pub fn extract_tags(html: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse(POPULAR_TAG_SELECTOR) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    let tags: IndexSet<String> = document
        .select(&selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    tags.into_iter().collect()
}

pub struct SteamTagScraper {
    client: Client,
    store_base: String,
    language: String,
}

impl SteamTagScraper {
    pub fn new(client: Client, endpoints: &SteamEndpoints, language: impl Into<String>) -> Self {
        Self {
            client,
            store_base: endpoints.store_base().to_string(),
            language: language.into(),
        }
    }
}

#[async_trait]
impl TagSource for SteamTagScraper {
    async fn fetch_tags(&self, appid: AppId) -> Vec<String> {
        let url = format!("{}/app/{}", self.store_base, appid);
        let resp = match self
            .client
            .get(&url)
            .query(&[("l", self.language.as_str())])
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                debug!(appid, error = %err, "store page request failed; no tags");
                return Vec::new();
            }
        };
        if resp.status() != StatusCode::OK {
            debug!(appid, status = resp.status().as_u16(), "store page not available; no tags");
            return Vec::new();
        }
        match resp.text().await {
            Ok(body) => extract_tags(&body),
            Err(err) => {
                debug!(appid, error = %err, "store page body unreadable; no tags");
                Vec::new()
            }
        }
    }
}
