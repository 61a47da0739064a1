// Configuration loading and parsing (config/gavel.toml).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::auction::engine::{AuctionRules, DEFAULT_BIDDING_WINDOW_SECS, DEFAULT_TEAM_BUDGET};

/// Name of the configuration file under `config/` and `defaults/`.
pub const CONFIG_FILE: &str = "gavel.toml";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub auction: AuctionConfig,
    pub server: ServerConfig,
    /// Resolved SQLite file location.
    pub db_path: PathBuf,
    pub feed: FeedConfig,
    pub catalog: CatalogConfig,
}

// ---------------------------------------------------------------------------
// gavel.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire gavel.toml file.
#[derive(Debug, Clone, Deserialize)]
struct GavelFile {
    #[serde(default)]
    auction: AuctionConfig,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    feed: FeedConfig,
    #[serde(default)]
    catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuctionConfig {
    /// Length of the bidding window, restarted by every accepted bid.
    pub bidding_window_secs: u64,
    /// Budget for teams added without an explicit one.
    pub default_budget: u32,
    /// Key of the stored auction record.
    pub record_name: String,
    /// Preset bid amounts offered to the operator console.
    pub quick_bids: Vec<u32>,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        AuctionConfig {
            bidding_window_secs: DEFAULT_BIDDING_WINDOW_SECS as u64,
            default_budget: DEFAULT_TEAM_BUDGET,
            record_name: "auction-state".into(),
            quick_bids: vec![100, 500, 1000],
        }
    }
}

impl AuctionConfig {
    pub fn rules(&self) -> AuctionRules {
        AuctionRules {
            bidding_window: chrono::Duration::seconds(self.bidding_window_secs as i64),
            default_budget: self.default_budget,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub ws_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1".into(),
            ws_port: 9100,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.ws_port)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DatabaseSection {
    path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Interval of the observer's fallback poll.
    pub poll_interval_ms: u64,
    /// Interval of countdown notifications; 0 disables them.
    pub countdown_tick_ms: u64,
    /// Silence after which an observer reports its feed as timed out.
    pub heartbeat_timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            poll_interval_ms: 1000,
            countdown_tick_ms: 100,
            heartbeat_timeout_secs: 15,
        }
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn countdown_tick(&self) -> Option<Duration> {
        (self.countdown_tick_ms > 0).then(|| Duration::from_millis(self.countdown_tick_ms))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// CSV of lots loaded into a fresh auction at startup.
    pub lots_csv: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate `config/gavel.toml` relative to `base_dir`.
///
/// Does not copy defaults; prefer `load_config()` for that.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let path = base_dir.join("config").join(CONFIG_FILE);
    let text = read_file(&path)?;
    let file: GavelFile = toml::from_str(&text).map_err(|e| ConfigError::ParseError {
        path: path.clone(),
        source: e,
    })?;

    let config = Config {
        auction: file.auction,
        server: file.server,
        db_path: resolve_db_path(&file.database.path),
        feed: file.feed,
        catalog: CatalogConfig {
            lots_csv: file.catalog.lots_csv.map(|p| {
                if p.is_relative() {
                    base_dir.join(p)
                } else {
                    p
                }
            }),
        },
    };

    validate(&config)?;

    Ok(config)
}

/// Copy `defaults/gavel.toml` to `config/gavel.toml` unless the operator
/// already has one. Returns the path written, if any.
pub fn ensure_config_file(base_dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let target = base_dir.join("config").join(CONFIG_FILE);
    if target.exists() {
        return Ok(None);
    }

    let source = base_dir.join("defaults").join(CONFIG_FILE);
    let content = std::fs::read(&source).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!(
            "no config/{CONFIG_FILE} and cannot read {}: {e}; \
             run from the project root or ensure defaults/ is present",
            source.display()
        ),
    })?;

    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to create {}: {e}", dir.display()),
        })?;
    }
    std::fs::write(&target, content).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to write {}: {e}", target.display()),
    })?;
    info!("Created {} from defaults", target.display());

    Ok(Some(target))
}

/// Loads config relative to the current working directory, copying
/// defaults first.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_file(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

/// An empty `database.path` means the platform data directory.
fn resolve_db_path(configured: &str) -> PathBuf {
    if !configured.trim().is_empty() {
        return PathBuf::from(configured);
    }
    match directories::ProjectDirs::from("", "", "gavel") {
        Some(dirs) => dirs.data_dir().join("gavel.db"),
        None => PathBuf::from("gavel.db"),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    let a = &config.auction;
    if a.bidding_window_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "auction.bidding_window_secs".into(),
            message: "must be greater than 0".into(),
        });
    }
    if a.default_budget == 0 {
        return Err(ConfigError::ValidationError {
            field: "auction.default_budget".into(),
            message: "must be greater than 0".into(),
        });
    }
    if a.record_name.trim().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "auction.record_name".into(),
            message: "must not be blank".into(),
        });
    }
    if let Some(bad) = a.quick_bids.iter().find(|b| **b == 0) {
        return Err(ConfigError::ValidationError {
            field: "auction.quick_bids".into(),
            message: format!("amounts must be > 0, got {bad}"),
        });
    }

    if config.server.ws_port == 0 {
        return Err(ConfigError::ValidationError {
            field: "server.ws_port".into(),
            message: "must be a fixed port, got 0".into(),
        });
    }

    let feed = &config.feed;
    let feed_fields: &[(&str, u64)] = &[
        ("feed.poll_interval_ms", feed.poll_interval_ms),
        ("feed.heartbeat_timeout_secs", feed.heartbeat_timeout_secs),
    ];
    for (name, val) in feed_fields {
        if *val == 0 {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: "must be > 0".into(),
            });
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Workspace root, where `defaults/` lives.
    fn project_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    /// Fresh `<tmp>/config/` holding `contents` as gavel.toml.
    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let tmp = std::env::temp_dir().join(name);
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("config").join(CONFIG_FILE), contents).unwrap();
        tmp
    }

    fn expect_field(err: ConfigError, expected: &str) {
        match err {
            ConfigError::ValidationError { field, .. } => assert_eq!(field, expected),
            other => panic!("expected ValidationError, got: {other}"),
        }
    }

    #[test]
    fn load_shipped_defaults() {
        let defaults = fs::read_to_string(project_root().join("defaults").join(CONFIG_FILE))
            .expect("defaults/gavel.toml should ship with the repo");
        let tmp = temp_config("gavel_config_defaults", &defaults);

        let config = load_config_from(&tmp).expect("should load valid config");
        assert_eq!(config.auction.bidding_window_secs, 15);
        assert_eq!(config.auction.default_budget, 1000);
        assert_eq!(config.auction.record_name, "auction-state");
        assert_eq!(config.auction.quick_bids, vec![100, 500, 1000]);
        assert_eq!(config.feed.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.feed.countdown_tick(), Some(Duration::from_millis(100)));
        assert_eq!(config.feed.heartbeat_timeout(), Duration::from_secs(15));
        assert!(config.catalog.lots_csv.is_none());
        assert_eq!(config.auction.rules(), AuctionRules::default());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let tmp = temp_config("gavel_config_empty", "");
        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.auction.record_name, "auction-state");
        assert_eq!(config.server.addr(), "127.0.0.1:9100");
        assert!(config.db_path.ends_with("gavel.db"));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn explicit_db_path_and_relative_catalog() {
        let tmp = temp_config(
            "gavel_config_paths",
            "[database]\npath = \"/var/lib/gavel/auction.db\"\n\n[catalog]\nlots_csv = \"data/lots.csv\"\n",
        );
        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/gavel/auction.db"));
        assert_eq!(config.catalog.lots_csv, Some(tmp.join("data/lots.csv")));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn zero_countdown_tick_disables_ticks() {
        let tmp = temp_config("gavel_config_no_ticks", "[feed]\ncountdown_tick_ms = 0\n");
        let config = load_config_from(&tmp).unwrap();
        assert_eq!(config.feed.countdown_tick(), None);
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_bidding_window() {
        let tmp = temp_config(
            "gavel_config_zero_window",
            "[auction]\nbidding_window_secs = 0\n",
        );
        expect_field(load_config_from(&tmp).unwrap_err(), "auction.bidding_window_secs");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_blank_record_name() {
        let tmp = temp_config("gavel_config_blank_record", "[auction]\nrecord_name = \" \"\n");
        expect_field(load_config_from(&tmp).unwrap_err(), "auction.record_name");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_quick_bid() {
        let tmp = temp_config("gavel_config_zero_quick", "[auction]\nquick_bids = [100, 0]\n");
        expect_field(load_config_from(&tmp).unwrap_err(), "auction.quick_bids");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let tmp = temp_config("gavel_config_zero_poll", "[feed]\npoll_interval_ms = 0\n");
        expect_field(load_config_from(&tmp).unwrap_err(), "feed.poll_interval_ms");
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let tmp = temp_config("gavel_config_malformed", "[auction\n");
        assert!(matches!(
            load_config_from(&tmp).unwrap_err(),
            ConfigError::ParseError { .. }
        ));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_file_is_file_not_found() {
        let tmp = std::env::temp_dir().join("gavel_config_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        assert!(matches!(
            load_config_from(&tmp).unwrap_err(),
            ConfigError::FileNotFound { .. }
        ));
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_file_copies_once() {
        let tmp = std::env::temp_dir().join("gavel_config_ensure");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("defaults")).unwrap();
        fs::write(tmp.join("defaults").join(CONFIG_FILE), "[server]\nws_port = 9200\n").unwrap();

        let copied = ensure_config_file(&tmp).unwrap();
        assert_eq!(copied, Some(tmp.join("config").join(CONFIG_FILE)));
        assert_eq!(load_config_from(&tmp).unwrap().server.ws_port, 9200);

        // Operator edits survive a second run.
        fs::write(tmp.join("config").join(CONFIG_FILE), "[server]\nws_port = 9300\n").unwrap();
        assert_eq!(ensure_config_file(&tmp).unwrap(), None);
        assert_eq!(load_config_from(&tmp).unwrap().server.ws_port, 9300);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn existing_config_needs_no_defaults() {
        let tmp = std::env::temp_dir().join("gavel_config_no_defaults");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();
        fs::write(tmp.join("config").join(CONFIG_FILE), "").unwrap();
        assert_eq!(ensure_config_file(&tmp).unwrap(), None);
        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_file_errors_without_defaults() {
        let tmp = std::env::temp_dir().join("gavel_config_nothing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        assert!(matches!(
            ensure_config_file(&tmp).unwrap_err(),
            ConfigError::DefaultsCopyError { .. }
        ));
        let _ = fs::remove_dir_all(&tmp);
    }
}
