use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

const APP_JSON: &str = "app.json";
const SYNC_JSON: &str = "sync.json";
const DEFAULT_TIMEZONE: &str = "UTC";

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub sync: serde_json::Value,
}

/// Tuning for the ICS sync engine, read from `sync.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub fetch_timeout_seconds: u64,
    pub max_concurrent_fetches: usize,
    pub retry_max_attempts: u8,
    pub retry_base_delay_ms: u64,
    /// Days before and after today that synced events may cover.
    pub horizon_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_seconds: 30,
            max_concurrent_fetches: 4,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            horizon_days: 730,
        }
    }
}

impl SyncSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    let sync = SyncSettings::default();
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "timezone": DEFAULT_TIMEZONE,
                "exportBaseUrl": null
            }),
        ),
        (
            SYNC_JSON,
            serde_json::json!({
                "schema": 1,
                "fetchTimeoutSeconds": sync.fetch_timeout_seconds,
                "maxConcurrentFetches": sync.max_concurrent_fetches,
                "horizonDays": sync.horizon_days,
                "retry": {
                    "maxAttempts": sync.retry_max_attempts,
                    "baseDelayMs": sync.retry_base_delay_ms
                }
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        sync: read_config(&config_dir.join(SYNC_JSON))?,
    })
}

fn positive_u64(
    value: &serde_json::Value,
    pointer: &str,
    default: u64,
    path: &Path,
) -> Result<u64, InfraError> {
    match value.pointer(pointer) {
        None | Some(serde_json::Value::Null) => Ok(default),
        Some(raw) => raw
            .as_u64()
            .filter(|number| *number > 0)
            .ok_or_else(|| {
                InfraError::InvalidConfig(format!(
                    "{pointer} must be a positive integer in {}",
                    path.display()
                ))
            }),
    }
}

pub fn load_sync_settings(config_dir: &Path) -> Result<SyncSettings, InfraError> {
    let path = config_dir.join(SYNC_JSON);
    let sync = read_config(&path)?;
    let defaults = SyncSettings::default();

    let retry_max_attempts = positive_u64(
        &sync,
        "/retry/maxAttempts",
        u64::from(defaults.retry_max_attempts),
        &path,
    )?;
    let retry_max_attempts = u8::try_from(retry_max_attempts).map_err(|_| {
        InfraError::InvalidConfig(format!(
            "/retry/maxAttempts must be at most {} in {}",
            u8::MAX,
            path.display()
        ))
    })?;
    let horizon_days = positive_u64(&sync, "/horizonDays", u64::from(defaults.horizon_days), &path)?;
    let horizon_days = u32::try_from(horizon_days).map_err(|_| {
        InfraError::InvalidConfig(format!(
            "/horizonDays must be at most {} in {}",
            u32::MAX,
            path.display()
        ))
    })?;

    Ok(SyncSettings {
        fetch_timeout_seconds: positive_u64(
            &sync,
            "/fetchTimeoutSeconds",
            defaults.fetch_timeout_seconds,
            &path,
        )?,
        max_concurrent_fetches: positive_u64(
            &sync,
            "/maxConcurrentFetches",
            defaults.max_concurrent_fetches as u64,
            &path,
        )? as usize,
        retry_max_attempts,
        retry_base_delay_ms: match sync.pointer("/retry/baseDelayMs") {
            None | Some(serde_json::Value::Null) => defaults.retry_base_delay_ms,
            Some(raw) => raw.as_u64().ok_or_else(|| {
                InfraError::InvalidConfig(format!(
                    "/retry/baseDelayMs must be a non-negative integer in {}",
                    path.display()
                ))
            })?,
        },
        horizon_days,
    })
}

/// Property time zone used to read UTC event times as calendar days.
pub fn read_timezone(config_dir: &Path) -> Result<Tz, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    let name = app
        .get("timezone")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_TIMEZONE);
    name.parse::<Tz>()
        .map_err(|error| InfraError::InvalidConfig(format!("invalid timezone '{name}': {error}")))
}

pub fn read_export_base_url(config_dir: &Path) -> Result<Option<String>, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    Ok(app
        .get("exportBaseUrl")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned))
}
