use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use super::SteamEndpoints;
use crate::models::CatalogEntry;

/// Source of the full app list. Failing here is fatal to the run.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>>;
}

#[derive(Debug, Deserialize)]
struct AppListResp {
    applist: AppList,
}

#[derive(Debug, Deserialize)]
struct AppList {
    apps: Vec<CatalogEntry>,
}

pub struct SteamCatalogClient {
    client: Client,
    url: String,
}

impl SteamCatalogClient {
    pub fn new(client: Client, endpoints: &SteamEndpoints) -> Self {
        Self {
            client,
            url: endpoints.app_list_url.clone(),
        }
    }
}

#[async_trait]
impl CatalogSource for SteamCatalogClient {
    async fn fetch_catalog(&self) -> Result<Vec<CatalogEntry>> {
        let resp = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("failed to request app list from {}", self.url))?
            .error_for_status()
            .context("app list request was rejected")?;
        let body: AppListResp = resp
            .json()
            .await
            .context("failed to decode app list response")?;
        info!(apps = body.applist.apps.len(), "fetched Steam app list");
        Ok(body.applist.apps)
    }
}
