//! Service configuration.
//!
//! Precedence: explicit path > `MLS_CONFIG` > `./mls-listings.toml` > defaults,
//! then `MLS_<SECTION>_<KEY>` environment overrides on top.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ListingError;
use crate::query::PaginationConfig;

pub const CONFIG_ENV: &str = "MLS_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "mls-listings.toml";
/// Upper bound on the by-source lookback window, one hundred years.
pub const MAX_LOOKBACK_DAYS: i64 = 36_500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub deadline_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { deadline_secs: 3600 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BySourceConfig {
    pub allowed_last_change_days: i64,
}

impl Default for BySourceConfig {
    fn default() -> Self {
        Self { allowed_last_change_days: 7 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ByAddressConfig {
    pub search_index: String,
}

impl Default for ByAddressConfig {
    fn default() -> Self {
        Self { search_index: "addressSearchIdx".into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub listing_id_index: String,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { listing_id_index: "listingIdSearchIdx".into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub pagination: PaginationConfig,
    pub stream: StreamConfig,
    pub by_source: BySourceConfig,
    pub by_address: ByAddressConfig,
    pub search: SearchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub collection: String,
    pub max_query_time_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { collection: "listings".into(), max_query_time_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error|warn|info|debug|trace
    pub level: String,
    /// Rolling log files go here; console only when unset.
    pub dir: Option<PathBuf>,
    pub retention: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".into(), dir: None, retention: 7 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

fn parse_env<T: FromStr>(key: &str, raw: &str) -> Result<T, ListingError> {
    raw.trim()
        .parse()
        .map_err(|_| ListingError::InvalidArgument(format!("{key}: cannot parse '{raw}'")))
}

impl ServiceConfig {
    /// # Errors
    /// `InvalidArgument` for malformed TOML.
    pub fn from_toml_str(s: &str) -> Result<Self, ListingError> {
        toml::from_str(s).map_err(|e| ListingError::InvalidArgument(format!("invalid configuration: {e}")))
    }

    /// # Errors
    /// `Internal` when the file cannot be read, `InvalidArgument` when it does not parse.
    pub fn from_file(path: &Path) -> Result<Self, ListingError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ListingError::Internal(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// First configuration file that exists, in precedence order.
    #[must_use]
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(p) = explicit {
            candidates.push(p.to_path_buf());
        }
        if let Ok(p) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(p));
        }
        if let Ok(cur) = std::env::current_dir() {
            candidates.push(cur.join(DEFAULT_CONFIG_FILE));
        }
        candidates.into_iter().find(|p| p.exists())
    }

    /// Loads the file picked by [`ServiceConfig::locate`], applies environment
    /// overrides and validates the result.
    ///
    /// # Errors
    /// An explicit path that does not exist, an unreadable or malformed file,
    /// a bad override, or a failed [`ServiceConfig::validate`].
    pub fn load(explicit: Option<&Path>) -> Result<Self, ListingError> {
        if let Some(p) = explicit
            && !p.exists()
        {
            return Err(ListingError::InvalidArgument(format!("config file {} not found", p.display())));
        }
        let mut cfg = match Self::locate(explicit) {
            Some(path) => {
                log::debug!("loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };
        cfg.apply_overrides(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `MLS_<SECTION>_<KEY>` overrides read through `lookup`.
    ///
    /// # Errors
    /// `InvalidArgument` when a numeric override does not parse.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ListingError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! over {
            ($key:literal, $field:expr, parse) => {
                if let Some(v) = lookup($key) {
                    $field = parse_env($key, &v)?;
                }
            };
            ($key:literal, $field:expr) => {
                if let Some(v) = lookup($key) {
                    $field = v;
                }
            };
        }
        over!("MLS_PAGINATION_LIMIT_DEFAULT", self.api.pagination.limit_default, parse);
        over!("MLS_PAGINATION_LIMIT_MAX", self.api.pagination.limit_max, parse);
        over!("MLS_STREAM_DEADLINE_SECS", self.api.stream.deadline_secs, parse);
        over!("MLS_BY_SOURCE_ALLOWED_LAST_CHANGE_DAYS", self.api.by_source.allowed_last_change_days, parse);
        over!("MLS_BY_ADDRESS_SEARCH_INDEX", self.api.by_address.search_index);
        over!("MLS_SEARCH_LISTING_ID_INDEX", self.api.search.listing_id_index);
        over!("MLS_STORE_COLLECTION", self.store.collection);
        over!("MLS_STORE_MAX_QUERY_TIME_SECS", self.store.max_query_time_secs, parse);
        over!("MLS_LOG_LEVEL", self.log.level);
        over!("MLS_LOG_RETENTION", self.log.retention, parse);
        if let Some(dir) = lookup("MLS_LOG_DIR") {
            self.log.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` naming the first inconsistent setting.
    pub fn validate(&self) -> Result<(), ListingError> {
        let p = &self.api.pagination;
        let fail = |m: &str| Err(ListingError::InvalidArgument(format!("invalid configuration: {m}")));
        if p.limit_default <= 0 {
            return fail("api.pagination.limit_default must be positive");
        }
        if p.limit_max < p.limit_default {
            return fail("api.pagination.limit_max must not be below limit_default");
        }
        if self.api.stream.deadline_secs == 0 {
            return fail("api.stream.deadline_secs must be positive");
        }
        if !(1..=MAX_LOOKBACK_DAYS).contains(&self.api.by_source.allowed_last_change_days) {
            return fail("api.by_source.allowed_last_change_days must be between 1 and 36500");
        }
        if self.store.collection.trim().is_empty() {
            return fail("store.collection cannot be empty");
        }
        Ok(())
    }

    #[must_use]
    pub const fn stream_deadline(&self) -> Duration {
        Duration::from_secs(self.api.stream.deadline_secs)
    }

    #[must_use]
    pub const fn max_query_time(&self) -> Duration {
        Duration::from_secs(self.store.max_query_time_secs)
    }
}
