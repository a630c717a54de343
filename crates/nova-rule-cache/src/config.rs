use crate::error::CacheError;
use crate::policy::ExpiryPolicy;
use crate::store::PersistentEntryStore;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_HOT_ENTRIES: usize = 256;

/// Where rule cache stores live and how long their entries stay valid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Override the global rule cache directory (`~/.nova/cache/rules`).
    pub cache_root_override: Option<PathBuf>,
    /// Decoded entries kept in memory per executor. Zero disables.
    pub hot_entries: usize,
    /// Entries older than this are re-executed.
    pub max_age_millis: Option<u64>,
    /// Re-execute every cacheable rule, replacing existing entries.
    pub refresh: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root_override: None,
            hot_entries: DEFAULT_HOT_ENTRIES,
            max_age_millis: None,
            refresh: false,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|var| std::env::var_os(var))
    }

    /// Build a config from `NOVA_RULE_CACHE_*` variables resolved by `lookup`.
    ///
    /// Unparsable values are logged and ignored. `NOVA_RULE_CACHE_REFRESH`
    /// accepts `1`/`0`, `true`/`false`, `yes`/`no` and `on`/`off`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        let mut config = Self {
            cache_root_override: lookup("NOVA_RULE_CACHE_DIR").map(PathBuf::from),
            ..Self::default()
        };
        let hot_entries = parse_var(&lookup, "NOVA_RULE_CACHE_HOT_ENTRIES", str::parse::<usize>);
        if let Some(hot_entries) = hot_entries {
            config.hot_entries = hot_entries;
        }
        config.max_age_millis =
            parse_var(&lookup, "NOVA_RULE_CACHE_MAX_AGE_MILLIS", str::parse::<u64>);
        config.refresh = parse_var(&lookup, "NOVA_RULE_CACHE_REFRESH", parse_flag).unwrap_or(false);
        config
    }

    pub fn from_json(json: &str) -> Result<Self, CacheError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn cache_root(&self) -> Result<PathBuf, CacheError> {
        match &self.cache_root_override {
            Some(root) => Ok(root.clone()),
            None => default_cache_root(),
        }
    }

    /// Open (and lock) the store called `name` under the cache root.
    pub fn open_store(&self, name: &str) -> Result<PersistentEntryStore, CacheError> {
        let mut components = Path::new(name).components();
        let single = matches!(components.next(), Some(Component::Normal(_)));
        if !single || components.next().is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid rule cache store name `{name}`"),
            )
            .into());
        }
        PersistentEntryStore::open(self.cache_root()?.join(name))
    }

    pub fn validity_policy(&self) -> ExpiryPolicy {
        ExpiryPolicy {
            refresh: self.refresh,
            max_age: self.max_age_millis.map(Duration::from_millis),
        }
    }
}

fn parse_var<T, E: std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<OsString>,
    var: &str,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Option<T> {
    let raw = lookup(var)?;
    let raw = raw.to_string_lossy();
    match parse(raw.trim()) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(
                target = "nova.rule_cache",
                var,
                value = %raw,
                error = %err,
                "ignoring unparsable environment variable"
            );
            None
        }
    }
}

fn parse_flag(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!("expected a boolean flag, got `{raw}`")),
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".nova").join("cache").join("rules"))
}
