use indexmap::IndexSet;
use serde::Deserialize;

/// Steam application id as handed out by the app list.
pub type AppId = i64;

/// One row of the full app list. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "appid")]
    pub id: AppId,
    #[serde(rename = "name", default)]
    pub display_name: String,
}

impl CatalogEntry {
    pub fn new(id: AppId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }

    /// Entries without a name are skipped before any request is made.
    pub fn is_unnamed(&self) -> bool {
        self.display_name.trim().is_empty()
    }
}

/// Per-app properties pulled from the appdetails endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemDetail {
    pub id: AppId,
    /// `type` in the payload: "game", "dlc", "demo", "music", ...
    pub kind: String,
    pub name: Option<String>,
    pub short_description: String,
    pub image_url: String,
    pub popularity_count: i64,
    pub raw_language_support: String,
}

impl ItemDetail {
    pub fn is_game(&self) -> bool {
        self.kind.trim().eq_ignore_ascii_case("game")
    }
}

/// The unit written to the store: one `games` row plus its tag links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedRecord {
    pub id: AppId,
    pub display_name: String,
    pub description: String,
    pub image_url: String,
    pub popularity_count: i64,
    pub localization_flag: bool,
    pub tags: IndexSet<String>,
}

impl EnrichedRecord {
    pub fn from_detail(
        display_name: impl Into<String>,
        detail: ItemDetail,
        localization_flag: bool,
        tags: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: detail.id,
            display_name: display_name.into(),
            description: detail.short_description,
            image_url: detail.image_url,
            popularity_count: detail.popularity_count.max(0),
            localization_flag,
            tags: tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }
}
