//! Environment helpers: one-time dotenv loading and typed getters.
//! Call `init_env()` early in `main`; every getter also calls it lazily.
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Once;
use tracing::warn;

static INIT: Once = Once::new();

/// Load `.env` exactly once. Values already in the process environment win.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Get required env var; error if missing or blank.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    env_opt(key).ok_or_else(|| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Parsed value; unset falls back silently, unparsable falls back with a warning.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    let Some(raw) = env_opt(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            warn!(key, value = %raw, default = %default, "invalid env value; using default");
            default
        }
    }
}

/// Optional parsed enum-like value; an unknown name is an error so a typo in
/// a policy never silently selects the default.
pub fn env_choice<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr<Err = String>,
{
    match env_opt(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}: {e}")),
        None => Ok(None),
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        None => default,
    }
}
