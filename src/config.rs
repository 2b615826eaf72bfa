use std::env;
use std::fmt;

use crate::limits::*;

/// The slot-allocation constants: which dates exist, how many slots each
/// carries, and which group sizes a reservation may request. Fixed for the
/// process lifetime.
#[derive(Debug, Clone)]
pub struct SlotPolicy {
    /// Valid presentation dates, in display order.
    pub dates: Vec<String>,
    pub max_slots_per_date: u32,
    /// Accepted group sizes, sorted ascending.
    pub group_sizes: Vec<u32>,
}

impl SlotPolicy {
    pub fn is_valid_date(&self, date: &str) -> bool {
        self.dates.iter().any(|d| d == date)
    }

    pub fn is_valid_group_size(&self, group_size: u32) -> bool {
        self.group_sizes.contains(&group_size)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.dates.is_empty() {
            return Err(ConfigError::invalid("PODIUM_DATES", "no dates configured"));
        }
        if self.dates.len() > MAX_DATES {
            return Err(ConfigError::invalid("PODIUM_DATES", "too many dates"));
        }
        for date in &self.dates {
            if date.is_empty() {
                return Err(ConfigError::invalid("PODIUM_DATES", "empty date label"));
            }
            if date.len() > MAX_DATE_NAME_LEN {
                return Err(ConfigError::invalid("PODIUM_DATES", "date label too long"));
            }
        }
        let mut deduped = self.dates.clone();
        deduped.sort();
        deduped.dedup();
        if deduped.len() != self.dates.len() {
            return Err(ConfigError::invalid("PODIUM_DATES", "duplicate date label"));
        }
        if self.max_slots_per_date == 0 || self.max_slots_per_date > MAX_SLOTS_PER_DATE_CAP {
            return Err(ConfigError::invalid(
                "PODIUM_MAX_SLOTS_PER_DATE",
                "capacity out of range",
            ));
        }
        if self.group_sizes.is_empty() {
            return Err(ConfigError::invalid(
                "PODIUM_GROUP_SIZES",
                "no group sizes configured",
            ));
        }
        if self
            .group_sizes
            .iter()
            .any(|&g| g == 0 || g > MAX_GROUP_SIZE)
        {
            return Err(ConfigError::invalid(
                "PODIUM_GROUP_SIZES",
                "group size out of range",
            ));
        }
        Ok(())
    }
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            dates: vec!["December 2".into(), "December 4".into()],
            max_slots_per_date: 22,
            group_sizes: vec![1, 2, 3],
        }
    }
}

/// Full server configuration, loaded once at startup from `PODIUM_*`
/// environment variables. Missing variables fall back to defaults; malformed
/// ones fail startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub slots: SlotPolicy,
    pub port: u16,
    pub bind: String,
    pub data_dir: String,
    pub password: String,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let slots = SlotPolicy {
            dates: env::var("PODIUM_DATES")
                .map(|s| split_list(&s))
                .unwrap_or_else(|_| SlotPolicy::default().dates),
            max_slots_per_date: parse_var("PODIUM_MAX_SLOTS_PER_DATE", 22)?,
            group_sizes: match env::var("PODIUM_GROUP_SIZES") {
                Ok(s) => parse_group_sizes(&s)?,
                Err(_) => SlotPolicy::default().group_sizes,
            },
        };
        slots.validate()?;

        let config = Self {
            slots,
            port: parse_var("PODIUM_PORT", 5433)?,
            bind: env::var("PODIUM_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            data_dir: env::var("PODIUM_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            password: env::var("PODIUM_PASSWORD").unwrap_or_else(|_| "podium".into()),
            max_connections: parse_var("PODIUM_MAX_CONNECTIONS", 256)?,
            metrics_port: parse_optional_var("PODIUM_METRICS_PORT")?,
            tls_cert: env::var("PODIUM_TLS_CERT").ok(),
            tls_key: env::var("PODIUM_TLS_KEY").ok(),
        };
        Ok(config)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_group_sizes(raw: &str) -> Result<Vec<u32>, ConfigError> {
    let mut sizes = Vec::new();
    for part in split_list(raw) {
        let size: u32 = part
            .parse()
            .map_err(|_| ConfigError::invalid("PODIUM_GROUP_SIZES", "not a number"))?;
        sizes.push(size);
    }
    sizes.sort_unstable();
    sizes.dedup();
    Ok(sizes)
}

fn parse_var<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::invalid(key, "malformed value")),
        Err(_) => Ok(default),
    }
}

fn parse_optional_var<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, "malformed value")),
        Err(_) => Ok(None),
    }
}

#[derive(Debug)]
pub struct ConfigError {
    key: &'static str,
    detail: &'static str,
}

impl ConfigError {
    fn invalid(key: &'static str, detail: &'static str) -> Self {
        Self { key, detail }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.detail)
    }
}

impl std::error::Error for ConfigError {}
