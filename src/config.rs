//! Runtime configuration from environment variables.
//! Defaults match the reference installation (10s polling, 60s aggregates).

use crate::models::channel::{ChannelId, ChannelSelector};
use crate::scheduler::{PulsePlan, SchedulerConfig};
use crate::source::simulated::DEFAULT_SEED;
use crate::source::sysfs::{DEFAULT_SYSFS_ROOT, DEFAULT_W1_ROOT};
use log::warn;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POLLING_SECS: u64 = 10;
pub const DEFAULT_AGGREGATION_SECS: u64 = 60;
pub const DEFAULT_FILE_HEADER: &str = "iono";
pub const MAX_DECIMALS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    IonoPi { root: PathBuf, w1_root: PathBuf },
    Simulated { seed: u64 },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub polling_period_secs: u64,
    pub aggregation_period_secs: u64,
    /// Raw poll and event files.
    pub data_path: PathBuf,
    /// Aggregate files, exported separately from the raw data.
    pub export_path: PathBuf,
    pub file_header: String,
    /// One-wire channel whose readings are aggregated, by 1-Wire address
    /// when `AGGREGATE_CHANNEL_NAME` is set, otherwise by id.
    pub aggregate_channel: ChannelSelector,
    /// Identifier written into aggregate rows for the downstream database.
    pub aggregate_db_id: i64,
    pub aggregate_decimals: usize,
    pub fine_tick: Duration,
    pub settle_delay: Duration,
    pub pulse: PulsePlan,
    pub source: SourceKind,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let polling_period_secs = parse_or(&get, "POLLING_PERIOD_SECS", DEFAULT_POLLING_SECS)?;
        let aggregation_period_secs = parse_or(&get, "AGGREGATION_PERIOD_SECS", DEFAULT_AGGREGATION_SECS)?;
        let file_header = get("FILE_HEADER").unwrap_or_else(|| DEFAULT_FILE_HEADER.to_string());

        let pulse = PulsePlan {
            led: parse_bool_or(&get, "PULSE_LED", true)?,
            relay: non_zero(parse_or(&get, "PULSE_RELAY", 1usize)?),
            open_collector: non_zero(parse_or(&get, "PULSE_OPEN_COLLECTOR", 1usize)?),
        };

        let source = match get("CHANNEL_SOURCE").as_deref().unwrap_or("ionopi") {
            "ionopi" => SourceKind::IonoPi {
                root: get("IONOPI_SYSFS_ROOT").unwrap_or_else(|| DEFAULT_SYSFS_ROOT.to_string()).into(),
                w1_root: get("W1_DEVICES_ROOT").unwrap_or_else(|| DEFAULT_W1_ROOT.to_string()).into(),
            },
            "simulated" => SourceKind::Simulated {
                seed: parse_or(&get, "SIMULATION_SEED", DEFAULT_SEED)?,
            },
            other => return Err(format!("CHANNEL_SOURCE must be `ionopi` or `simulated`, got `{}`", other)),
        };

        let cfg = Config {
            polling_period_secs,
            aggregation_period_secs,
            data_path: get("DATA_PATH").unwrap_or_else(|| "data".to_string()).into(),
            export_path: get("EXPORT_PATH").unwrap_or_else(|| "ftp".to_string()).into(),
            file_header,
            aggregate_channel: match get("AGGREGATE_CHANNEL_NAME").filter(|name| !name.is_empty()) {
                Some(name) => ChannelSelector::Name(name),
                None => ChannelSelector::Id(ChannelId(parse_or(&get, "AGGREGATE_CHANNEL_ID", 1)?)),
            },
            aggregate_db_id: parse_or(&get, "AGGREGATE_DB_ID", 1)?,
            aggregate_decimals: parse_or(&get, "AGGREGATE_DECIMALS", 2)?,
            fine_tick: Duration::from_millis(parse_or(&get, "FINE_TICK_MS", 100)?),
            settle_delay: Duration::from_millis(parse_or(&get, "SETTLE_DELAY_MS", 1500)?),
            pulse,
            source,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), String> {
        if self.polling_period_secs == 0 {
            return Err("POLLING_PERIOD_SECS must be positive".to_string());
        }
        if self.aggregation_period_secs == 0 {
            return Err("AGGREGATION_PERIOD_SECS must be positive".to_string());
        }
        if self.fine_tick.is_zero() {
            return Err("FINE_TICK_MS must be positive".to_string());
        }
        if self.aggregate_decimals > MAX_DECIMALS {
            return Err(format!("AGGREGATE_DECIMALS must be at most {}", MAX_DECIMALS));
        }
        if self.file_header.contains(['/', '\\']) {
            return Err("FILE_HEADER must not contain path separators".to_string());
        }
        // Not fatal: timestamps are still written, just less meaningful.
        if self.aggregation_period_secs % 60 != 0 {
            warn!(
                "AGGREGATION_PERIOD_SECS={} is not a multiple of 60; aggregate timestamps are truncated to the minute",
                self.aggregation_period_secs
            );
        }
        if self.aggregation_period_secs < self.polling_period_secs {
            warn!(
                "AGGREGATION_PERIOD_SECS={} is shorter than POLLING_PERIOD_SECS={}; most aggregates will lack data",
                self.aggregation_period_secs, self.polling_period_secs
            );
        }
        if self.settle_overruns_polling() {
            warn!(
                "SETTLE_DELAY_MS={} is not shorter than POLLING_PERIOD_SECS={}; polls will be skipped",
                self.settle_delay.as_millis(),
                self.polling_period_secs
            );
        }
        Ok(())
    }

    /// Whether a poll's settle delay reaches into the next polling period.
    pub fn settle_overruns_polling(&self) -> bool {
        self.settle_delay >= Duration::from_secs(self.polling_period_secs)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            polling_period_secs: self.polling_period_secs,
            aggregation_period_secs: self.aggregation_period_secs,
            fine_tick: self.fine_tick,
            settle_delay: self.settle_delay,
            pulse: self.pulse.clone(),
        }
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, String> {
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

fn parse_bool_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool, String> {
    match get(key).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "TRUE" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "no") => Ok(false),
        Some(other) => Err(format!("{} must be a boolean, got {}", key, other)),
    }
}

fn non_zero(index: usize) -> Option<usize> {
    (index != 0).then_some(index)
}

/// Load `KEY=value` lines from `path` into the process environment.
///
/// Variables already present in the environment are kept.
pub fn load_env_file(path: &Path) -> Result<(), String> {
    let contents = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    for (index, line) in contents.lines().enumerate() {
        let parsed = parse_env_line(line).map_err(|e| format!("{}:{}: {}", path.display(), index + 1, e))?;
        if let Some((key, value)) = parsed
            && std::env::var_os(&key).is_none()
        {
            // Updating process-level environment variables is unsafe on some targets;
            // this runs before any other thread is started.
            unsafe {
                std::env::set_var(key, value);
            }
        }
    }
    Ok(())
}

/// Parse one `.env` line; blank lines and `#` comments yield `None`.
pub fn parse_env_line(line: &str) -> Result<Option<(String, String)>, String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let (key, raw) = line.split_once('=').ok_or_else(|| "missing '=' in assignment".to_string())?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(format!("invalid variable name `{}`", key));
    }

    let raw = raw.trim();
    let value = match raw.chars().next() {
        Some(q @ ('"' | '\'')) => {
            let body = &raw[1..];
            let end = body.find(q).ok_or_else(|| format!("unterminated {} quote", q))?;
            let rest = body[end + 1..].trim();
            if !rest.is_empty() && !rest.starts_with('#') {
                return Err("unexpected characters after closing quote".to_string());
            }
            body[..end].to_string()
        }
        _ => raw.split('#').next().unwrap_or_default().trim_end().to_string(),
    };
    Ok(Some((key.to_string(), value)))
}
