pub mod catalog;
pub mod details;
pub mod tags;

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

pub const DEFAULT_APP_LIST_URL: &str = "https://api.steampowered.com/ISteamApps/GetAppList/v2/";
pub const DEFAULT_STORE_URL: &str = "https://store.steampowered.com";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";
pub const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Where the three Steam collaborators point, and how requests are bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SteamEndpoints {
    pub app_list_url: String,
    pub store_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    /// Ceiling for a server-sent `Retry-After`.
    pub max_retry_after: Duration,
}

impl SteamEndpoints {
    /// One client shared by every request of a run; the timeout applies per request.
    pub fn http_client(&self) -> Result<Client> {
        Client::builder()
            .user_agent(self.user_agent.clone())
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client")
    }

    pub(crate) fn store_base(&self) -> &str {
        self.store_url.trim_end_matches('/')
    }
}

impl Default for SteamEndpoints {
    fn default() -> Self {
        Self {
            app_list_url: DEFAULT_APP_LIST_URL.to_string(),
            store_url: DEFAULT_STORE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(10),
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }
}
