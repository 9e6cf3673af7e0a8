use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::clock::ServiceTime;
use crate::model::UserId;

/// Runtime settings, read once at startup from `WASHLINE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_ttl: Duration,
    pub slot_interval_min: u16,
    pub service_duration: TimeDelta,
    pub notify_before: TimeDelta,
    pub notify_after: TimeDelta,
    pub max_slots_per_day: usize,
    pub tick: Duration,
    pub service_time: ServiceTime,
    pub admin_ids: Vec<UserId>,
    pub data_dir: PathBuf,
    pub session_timeout: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            slot_interval_min: 30,
            service_duration: TimeDelta::minutes(60),
            notify_before: TimeDelta::minutes(10),
            notify_after: TimeDelta::minutes(60),
            max_slots_per_day: 3,
            tick: Duration::from_secs(60),
            service_time: ServiceTime::default(),
            admin_ids: Vec::new(),
            data_dir: PathBuf::from("./data"),
            session_timeout: Duration::from_secs(900),
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?}: {}", self.var, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Upper bound for the minute settings.
const MAX_MINUTES: i64 = 7 * 24 * 60;
const MAX_TICK_SECS: u64 = 24 * 60 * 60;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "WASHLINE_CACHE_TTL_SECS")? {
            cfg.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(min) = parse_var::<u16>(&lookup, "WASHLINE_SLOT_INTERVAL_MIN")? {
            if min == 0 || 24 * 60 % min != 0 {
                return Err(invalid("WASHLINE_SLOT_INTERVAL_MIN", min, "must divide a day evenly"));
            }
            cfg.slot_interval_min = min;
        }
        if let Some(min) = parse_var::<i64>(&lookup, "WASHLINE_SERVICE_DURATION_MIN")? {
            cfg.service_duration = non_negative_minutes("WASHLINE_SERVICE_DURATION_MIN", min)?;
        }
        if let Some(min) = parse_var::<i64>(&lookup, "WASHLINE_NOTIFY_BEFORE_MIN")? {
            cfg.notify_before = non_negative_minutes("WASHLINE_NOTIFY_BEFORE_MIN", min)?;
        }
        if let Some(min) = parse_var::<i64>(&lookup, "WASHLINE_NOTIFY_AFTER_MIN")? {
            cfg.notify_after = non_negative_minutes("WASHLINE_NOTIFY_AFTER_MIN", min)?;
        }
        if let Some(n) = parse_var::<usize>(&lookup, "WASHLINE_MAX_SLOTS_PER_DAY")? {
            cfg.max_slots_per_day = n;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WASHLINE_TICK_SECS")? {
            if secs == 0 {
                return Err(invalid("WASHLINE_TICK_SECS", secs, "must be positive"));
            }
            if secs > MAX_TICK_SECS {
                return Err(invalid("WASHLINE_TICK_SECS", secs, "must be at most a day"));
            }
            cfg.tick = Duration::from_secs(secs);
        }
        if let Some(hours) = parse_var::<i32>(&lookup, "WASHLINE_UTC_OFFSET_HOURS")? {
            cfg.service_time = ServiceTime::from_offset_hours(hours)
                .ok_or_else(|| invalid("WASHLINE_UTC_OFFSET_HOURS", hours, "offset out of range"))?;
        }
        if let Some(raw) = lookup("WASHLINE_ADMIN_IDS") {
            cfg.admin_ids = parse_admin_ids(&raw)?;
        }
        if let Some(dir) = lookup("WASHLINE_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "WASHLINE_SESSION_TIMEOUT_SECS")? {
            cfg.session_timeout = Duration::from_secs(secs);
        }
        cfg.metrics_port = parse_var::<u16>(&lookup, "WASHLINE_METRICS_PORT")?;

        Ok(cfg)
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_ids.contains(&user)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(var) else { return Ok(None) };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed.parse().map(Some).map_err(|_| ConfigError {
        var,
        value: raw.clone(),
        reason: "not a valid number",
    })
}

fn parse_admin_ids(raw: &str) -> Result<Vec<UserId>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError {
                var: "WASHLINE_ADMIN_IDS",
                value: raw.to_string(),
                reason: "expected comma separated user ids",
            })
        })
        .collect()
}

fn non_negative_minutes(var: &'static str, min: i64) -> Result<TimeDelta, ConfigError> {
    if min < 0 {
        return Err(invalid(var, min, "must not be negative"));
    }
    if min > MAX_MINUTES {
        return Err(invalid(var, min, "must be at most a week"));
    }
    TimeDelta::try_minutes(min).ok_or_else(|| invalid(var, min, "out of range"))
}

fn invalid(var: &'static str, value: impl fmt::Display, reason: &'static str) -> ConfigError {
    ConfigError {
        var,
        value: value.to_string(),
        reason,
    }
}
