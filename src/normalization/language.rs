//! Decides whether a store `supported_languages` string covers a target language.
//!
//! The store localizes that string when asked for a language (`l=korean` yields
//! "한국어, 영어"), so a match is attempted on the English name and, under
//! [`LocalizationPolicy::MultiScript`], on the native-script name too.

use std::fmt;
use std::str::FromStr;

use super::markup::strip_html_tags;

// (store language parameter, native-script name)
const KNOWN_LANGUAGES: &[(&str, &str)] = &[
    ("korean", "한국어"),
    ("japanese", "日本語"),
    ("schinese", "简体中文"),
    ("tchinese", "繁體中文"),
    ("english", "english"),
    ("french", "français"),
    ("german", "deutsch"),
    ("spanish", "español"),
    ("italian", "italiano"),
    ("portuguese", "português"),
    ("russian", "русский"),
    ("polish", "polski"),
    ("turkish", "türkçe"),
    ("thai", "ไทย"),
];

/// Target language: the name used in the store's `l=` parameter plus an
/// optional native-script spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTag {
    canonical: String,
    native: Option<String>,
}

impl LanguageTag {
    pub fn new(canonical: impl Into<String>, native: Option<String>) -> Self {
        Self {
            canonical: canonical.into().trim().to_lowercase(),
            native: native
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty()),
        }
    }

    pub fn korean() -> Self {
        Self::new("korean", Some("한국어".to_string()))
    }

    /// Name passed to the store as `l=`.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn native(&self) -> Option<&str> {
        self.native.as_deref()
    }

    fn needles(&self, policy: LocalizationPolicy) -> impl Iterator<Item = &str> {
        let native = match policy {
            LocalizationPolicy::MultiScript => self.native(),
            LocalizationPolicy::CanonicalOnly => None,
        };
        std::iter::once(self.canonical.as_str())
            .chain(native)
            .filter(|s| !s.is_empty())
    }
}

impl FromStr for LanguageTag {
    type Err = String;

    /// Known store language names resolve to their native spelling; anything
    /// else becomes a canonical-only tag.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim().to_lowercase();
        if key.is_empty() {
            return Err("language name must not be empty".to_string());
        }
        let native = KNOWN_LANGUAGES
            .iter()
            .find(|(canonical, _)| *canonical == key)
            .map(|(_, native)| native.to_string());
        Ok(Self::new(key, native))
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.native {
            Some(native) if native != &self.canonical => {
                write!(f, "{} ({})", self.canonical, native)
            }
            _ => f.write_str(&self.canonical),
        }
    }
}

/// Which spellings count as a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalizationPolicy {
    /// English name only.
    CanonicalOnly,
    /// English name or native-script name.
    #[default]
    MultiScript,
}

impl FromStr for LocalizationPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "canonical" | "canonical-only" | "single" => Ok(Self::CanonicalOnly),
            "multi-script" | "multi_script" | "multi" => Ok(Self::MultiScript),
            other => Err(format!(
                "unknown language match policy {other:?} (expected canonical | multi-script)"
            )),
        }
    }
}

/// Case-insensitive substring match of either spelling of `target` in the
/// markup-stripped `raw` text.
pub fn supports_language(raw: &str, target: &LanguageTag) -> bool {
    matches_with(raw, target, LocalizationPolicy::MultiScript)
}

fn matches_with(raw: &str, target: &LanguageTag, policy: LocalizationPolicy) -> bool {
    if raw.trim().is_empty() {
        return false;
    }
    let text = strip_html_tags(raw).to_lowercase();
    target.needles(policy).any(|needle| text.contains(needle))
}

/// Target language and matching policy bundled for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizationClassifier {
    target: LanguageTag,
    policy: LocalizationPolicy,
}

impl LocalizationClassifier {
    pub fn new(target: LanguageTag, policy: LocalizationPolicy) -> Self {
        Self { target, policy }
    }

    pub fn target(&self) -> &LanguageTag {
        &self.target
    }

    pub fn is_localized(&self, raw: &str) -> bool {
        matches_with(raw, &self.target, self.policy)
    }
}

impl Default for LocalizationClassifier {
    fn default() -> Self {
        Self::new(LanguageTag::korean(), LocalizationPolicy::MultiScript)
    }
}
