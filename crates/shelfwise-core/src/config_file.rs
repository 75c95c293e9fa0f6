use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::Config;

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    pub cache: Option<CacheConfig>,
    pub source: Option<SourceConfig>,
    pub query: Option<QueryConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: Option<String>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub api_base: Option<String>,
    pub site_base: Option<String>,
    pub timeout_secs: Option<u64>,
    pub page_size: Option<usize>,
    pub requests_per_second: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub default_limit: Option<usize>,
    pub genres: Option<Vec<String>>,
}

/// Environment variables consulted by [`apply_env`].
pub const ENV_CACHE_PATH: &str = "SHELFWISE_CACHE_PATH";
pub const ENV_TTL_SECS: &str = "SHELFWISE_TTL_SECS";
pub const ENV_API_BASE: &str = "SHELFWISE_API_BASE";
pub const ENV_TIMEOUT_SECS: &str = "SHELFWISE_TIMEOUT_SECS";

/// Platform config directory path: `<config_dir>/shelfwise/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("shelfwise").join("config.toml"))
}

/// Load config by cascading CWD `.shelfwise.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".shelfwise.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparsable config file");
            None
        }
    }
}

fn pick<S, T>(
    overlay: &Option<S>,
    base: &Option<S>,
    field: impl Fn(&S) -> Option<T>,
) -> Option<T> {
    overlay
        .as_ref()
        .and_then(&field)
        .or_else(|| base.as_ref().and_then(&field))
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    ConfigFile {
        cache: Some(CacheConfig {
            path: pick(&overlay.cache, &base.cache, |c| c.path.clone()),
            ttl_secs: pick(&overlay.cache, &base.cache, |c| c.ttl_secs),
        }),
        source: Some(SourceConfig {
            api_base: pick(&overlay.source, &base.source, |s| s.api_base.clone()),
            site_base: pick(&overlay.source, &base.source, |s| s.site_base.clone()),
            timeout_secs: pick(&overlay.source, &base.source, |s| s.timeout_secs),
            page_size: pick(&overlay.source, &base.source, |s| s.page_size),
            requests_per_second: pick(&overlay.source, &base.source, |s| s.requests_per_second),
        }),
        query: Some(QueryConfig {
            default_limit: pick(&overlay.query, &base.query, |q| q.default_limit),
            genres: pick(&overlay.query, &base.query, |q| q.genres.clone()),
        }),
    }
}

impl ConfigFile {
    /// Every setting of `config`, for writing out a complete file.
    pub fn from_config(config: &Config) -> Self {
        ConfigFile {
            cache: Some(CacheConfig {
                path: config
                    .cache_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
                ttl_secs: Some(config.cache_ttl_secs),
            }),
            source: Some(SourceConfig {
                api_base: Some(config.api_base.clone()),
                site_base: Some(config.site_base.clone()),
                timeout_secs: Some(config.fetch_timeout_secs),
                page_size: Some(config.page_size),
                requests_per_second: Some(config.requests_per_second),
            }),
            query: Some(QueryConfig {
                default_limit: Some(config.default_limit),
                genres: Some(config.default_genres.clone()),
            }),
        }
    }

    /// Overwrite the fields of `config` that this file sets.
    ///
    /// Zero page sizes, limits and timeouts are ignored, as is an empty
    /// genre list.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(cache) = &self.cache {
            if let Some(path) = &cache.path {
                config.cache_path = Some(expand_home(path));
            }
            if let Some(ttl) = cache.ttl_secs {
                config.cache_ttl_secs = ttl;
            }
        }
        if let Some(source) = &self.source {
            if let Some(base) = &source.api_base {
                config.api_base = base.trim_end_matches('/').to_string();
            }
            if let Some(base) = &source.site_base {
                config.site_base = base.trim_end_matches('/').to_string();
            }
            if let Some(t) = source.timeout_secs.filter(|&t| t > 0) {
                config.fetch_timeout_secs = t;
            }
            if let Some(n) = source.page_size.filter(|&n| n > 0) {
                config.page_size = n;
            }
            if let Some(rps) = source.requests_per_second {
                config.requests_per_second = rps;
            }
        }
        if let Some(query) = &self.query {
            if let Some(limit) = query.default_limit.filter(|&l| l > 0) {
                config.default_limit = limit;
            }
            if let Some(genres) = query.genres.as_ref().filter(|g| !g.is_empty()) {
                config.default_genres = genres.clone();
            }
        }
    }
}

/// Apply `SHELFWISE_*` overrides read through `lookup` (normally
/// `std::env::var`). Unparsable numbers are logged and skipped.
pub fn apply_env(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(path) = lookup(ENV_CACHE_PATH).filter(|p| !p.trim().is_empty()) {
        config.cache_path = Some(expand_home(&path));
    }
    if let Some(ttl) = parse_env(&lookup, ENV_TTL_SECS) {
        config.cache_ttl_secs = ttl;
    }
    if let Some(base) = lookup(ENV_API_BASE).filter(|b| !b.trim().is_empty()) {
        config.api_base = base.trim().trim_end_matches('/').to_string();
    }
    if let Some(t) = parse_env(&lookup, ENV_TIMEOUT_SECS).filter(|&t| t > 0) {
        config.fetch_timeout_secs = t;
    }
}

fn parse_env(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring non-numeric environment override");
            None
        }
    }
}

/// Resolve `~/` against the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}

/// Save the current config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, String> {
    let path = config_path().ok_or_else(|| "Could not determine config directory".to_string())?;
    save_to_path(config, &path)?;
    Ok(path)
}

/// Write `config` as TOML to `path`, creating parent directories.
pub fn save_to_path(config: &ConfigFile, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;
    std::fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_parses() {
        let toml_str = "[cache]\nttl_secs = 60\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        let cache = parsed.cache.unwrap();
        assert_eq!(cache.ttl_secs, Some(60));
        assert!(cache.path.is_none());
        assert!(parsed.source.is_none());
    }

    #[test]
    fn merge_overlay_wins_and_base_fills_gaps() {
        let base = ConfigFile {
            cache: Some(CacheConfig {
                path: Some("/base/cache.json".into()),
                ttl_secs: Some(100),
            }),
            query: Some(QueryConfig {
                default_limit: Some(5),
                genres: Some(vec!["horror".into()]),
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            cache: Some(CacheConfig {
                path: Some("/overlay/cache.json".into()),
                ttl_secs: None,
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay);
        let cache = merged.cache.unwrap();
        assert_eq!(cache.path.as_deref(), Some("/overlay/cache.json"));
        assert_eq!(cache.ttl_secs, Some(100));
        let query = merged.query.unwrap();
        assert_eq!(query.default_limit, Some(5));
        assert_eq!(query.genres.unwrap(), ["horror"]);
    }

    #[test]
    fn apply_to_overrides_config() {
        let file: ConfigFile = toml::from_str(
            r#"
            [cache]
            path = "/tmp/shelf.json"
            ttl_secs = 3600

            [source]
            api_base = "http://localhost:8080/"
            timeout_secs = 0
            page_size = 25

            [query]
            default_limit = 3
            genres = []
            "#,
        )
        .unwrap();
        let mut config = Config::default();
        file.apply_to(&mut config);

        assert_eq!(config.cache_path, Some(PathBuf::from("/tmp/shelf.json")));
        assert_eq!(config.cache_ttl_secs, 3600);
        assert_eq!(config.api_base, "http://localhost:8080");
        assert_eq!(config.fetch_timeout_secs, 10);
        assert_eq!(config.page_size, 25);
        assert_eq!(config.default_limit, 3);
        assert_eq!(config.default_genres.len(), 8);
    }

    #[test]
    fn env_overrides_and_bad_numbers() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_CACHE_PATH, "/var/cache/books.json"),
            (ENV_TTL_SECS, "not-a-number"),
            (ENV_API_BASE, "https://mirror.example.org/"),
            (ENV_TIMEOUT_SECS, "3"),
        ]);
        let mut config = Config::default();
        apply_env(&mut config, |k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.cache_path, Some(PathBuf::from("/var/cache/books.json")));
        assert_eq!(config.cache_ttl_secs, 24 * 60 * 60);
        assert_eq!(config.api_base, "https://mirror.example.org");
        assert_eq!(config.fetch_timeout_secs, 3);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.toml");
        let config = ConfigFile {
            source: Some(SourceConfig {
                requests_per_second: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        save_to_path(&config, &path).unwrap();
        assert_eq!(load_from_path(&path), Some(config));
    }

    #[test]
    fn from_config_round_trips_through_apply() {
        let config = Config {
            cache_path: Some(PathBuf::from("/tmp/books.json")),
            cache_ttl_secs: 120,
            page_size: 40,
            default_genres: vec!["poetry".into()],
            ..Config::default()
        };
        let file = ConfigFile::from_config(&config);
        let reparsed: ConfigFile = toml::from_str(&toml::to_string_pretty(&file).unwrap()).unwrap();

        let mut rebuilt = Config {
            cache_path: None,
            ..Config::default()
        };
        reparsed.apply_to(&mut rebuilt);
        assert_eq!(rebuilt.cache_path, config.cache_path);
        assert_eq!(rebuilt.cache_ttl_secs, 120);
        assert_eq!(rebuilt.page_size, 40);
        assert_eq!(rebuilt.default_genres, ["poetry"]);
        assert_eq!(rebuilt.api_base, config.api_base);
    }

    #[test]
    fn unparsable_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[cache\nttl_secs = ").unwrap();
        assert!(load_from_path(&path).is_none());
        assert!(load_from_path(&dir.path().join("missing.toml")).is_none());
    }
}
