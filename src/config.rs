// ABOUTME: Configuration values built once at startup and passed into the pipeline
// ABOUTME: Output categories plus tuning loaded from an optional TOML file

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::replication::DEFAULT_BASE_URL;
use crate::utils::{duration_secs, RetryPolicy};

/// Kinds of output rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Nodes,
    Ways,
    Relations,
    Members,
    Tags,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Nodes,
        Category::Ways,
        Category::Relations,
        Category::Members,
        Category::Tags,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Nodes => "nodes",
            Category::Ways => "ways",
            Category::Relations => "relations",
            Category::Members => "members",
            Category::Tags => "tags",
        }
    }

    /// Value of the leading `kind` column for rows of this category.
    pub fn row_kind(&self) -> &'static str {
        match self {
            Category::Nodes => "node",
            Category::Ways => "way",
            Category::Relations => "relation",
            Category::Members => "member",
            Category::Tags => "tag",
        }
    }

    pub fn header(&self) -> &'static [&'static str] {
        match self {
            Category::Nodes => &[
                "kind",
                "action",
                "epochMillis",
                "id",
                "version",
                "changeset",
                "username",
                "uid",
                "lat",
                "lon",
            ],
            Category::Ways => &[
                "kind",
                "action",
                "epochMillis",
                "id",
                "version",
                "changeset",
                "username",
                "uid",
                "nodeRefs",
            ],
            Category::Relations => &[
                "kind",
                "action",
                "epochMillis",
                "id",
                "version",
                "changeset",
                "username",
                "uid",
                "memberCount",
            ],
            Category::Members => &[
                "kind",
                "relationId",
                "position",
                "memberType",
                "memberId",
                "memberRole",
            ],
            Category::Tags => &["kind", "epochMillis", "type", "id", "key", "value"],
        }
    }

    fn index(&self) -> usize {
        match self {
            Category::Nodes => 0,
            Category::Ways => 1,
            Category::Relations => 2,
            Category::Members => 3,
            Category::Tags => 4,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nodes" | "node" => Ok(Category::Nodes),
            "ways" | "way" => Ok(Category::Ways),
            "relations" | "relation" => Ok(Category::Relations),
            "members" | "member" => Ok(Category::Members),
            "tags" | "tag" => Ok(Category::Tags),
            other => bail!(
                "Unknown category '{}' (expected nodes, ways, relations, members or tags)",
                other
            ),
        }
    }
}

/// Which categories are emitted. Everything is disabled by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitConfig {
    enabled: [bool; 5],
}

impl EmitConfig {
    pub fn new(categories: &[Category]) -> Self {
        let mut config = Self::default();
        for category in categories {
            config.set(*category, true);
        }
        config
    }

    pub fn all() -> Self {
        Self::new(&Category::ALL)
    }

    pub fn set(&mut self, category: Category, enabled: bool) {
        self.enabled[category.index()] = enabled;
    }

    pub fn is_enabled(&self, category: Category) -> bool {
        self.enabled[category.index()]
    }

    pub fn is_empty(&self) -> bool {
        !self.enabled.iter().any(|enabled| *enabled)
    }

    pub fn enabled_categories(&self) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|category| self.is_enabled(*category))
            .collect()
    }
}

/// Tuning knobs for fetching and pacing. Loaded from TOML, overridden by CLI flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Replication repository base URL
    pub base_url: String,
    /// Where the low-water mark is persisted
    pub state_path: PathBuf,
    /// Categories enabled in addition to CLI/env toggles
    pub categories: Vec<Category>,
    /// Wait after an upstream "not published yet"
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Wait after a failed cycle (exhausted fetch retries or malformed diff)
    #[serde(with = "duration_secs")]
    pub retry_interval: Duration,
    /// Per-request HTTP timeout
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Consecutive failed cycles on one sequence before alerting at error level
    pub alert_threshold: u32,
    /// Backoff for transient fetch errors within a cycle
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            state_path: default_state_path(),
            categories: Vec::new(),
            poll_interval: Duration::from_secs(60),
            retry_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            alert_threshold: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load `path` if given, else the per-user config file if it exists, else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                tracing::debug!("Loading config from {:?}", path);
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base_url '{}'", self.base_url))?;
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than zero");
        }
        if self.alert_threshold == 0 {
            bail!("alert_threshold must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            bail!("retry.jitter must be between 0.0 and 1.0");
        }
        Ok(())
    }
}

/// Default location of the sequence state file, relative to the working directory.
pub fn default_state_path() -> PathBuf {
    PathBuf::from(".osm-minutely/sequence-state.json")
}

/// Per-user config file: `~/.config/osm-minutely/config.toml` on Linux.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("osm-minutely").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_config_defaults_to_disabled() {
        let config = EmitConfig::default();
        assert!(config.is_empty());
        for category in Category::ALL {
            assert!(!config.is_enabled(category));
        }
    }

    #[test]
    fn test_emit_config_new() {
        let config = EmitConfig::new(&[Category::Nodes, Category::Tags]);
        assert!(config.is_enabled(Category::Nodes));
        assert!(config.is_enabled(Category::Tags));
        assert!(!config.is_enabled(Category::Ways));
        assert_eq!(
            config.enabled_categories(),
            vec![Category::Nodes, Category::Tags]
        );
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!("NODES".parse::<Category>().unwrap(), Category::Nodes);
        assert_eq!("relation".parse::<Category>().unwrap(), Category::Relations);
        assert!("areas".parse::<Category>().is_err());
    }

    #[test]
    fn test_headers_start_with_kind() {
        for category in Category::ALL {
            assert_eq!(category.header()[0], "kind");
        }
    }

    #[test]
    fn test_settings_from_toml() {
        let settings = Settings::from_toml(
            r#"
            base_url = "https://example.org/replication/minute"
            categories = ["nodes", "tags"]
            poll_interval = 15
            retry_interval = 2.5
            alert_threshold = 3

            [retry]
            max_retries = 2
            initial_backoff = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(settings.base_url, "https://example.org/replication/minute");
        assert_eq!(settings.categories, vec![Category::Nodes, Category::Tags]);
        assert_eq!(settings.poll_interval, Duration::from_secs(15));
        assert_eq!(settings.retry_interval, Duration::from_millis(2500));
        assert_eq!(settings.alert_threshold, 3);
        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(settings.retry.initial_backoff, Duration::from_millis(500));
        // Unspecified values keep their defaults
        assert_eq!(settings.retry.max_backoff, Duration::from_secs(30));
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_settings_rejects_bad_values() {
        assert!(Settings::from_toml("base_url = \"nope\"").is_err());
        assert!(Settings::from_toml("alert_threshold = 0").is_err());
        assert!(Settings::from_toml("poll_interval = -1").is_err());
        assert!(Settings::from_toml("unknown_key = 1").is_err());
    }

    #[test]
    fn test_settings_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "alert_threshold = 9\n").unwrap();
        let settings = Settings::resolve(Some(&path)).unwrap();
        assert_eq!(settings.alert_threshold, 9);
        assert!(Settings::resolve(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
