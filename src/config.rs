use crate::errors::{AppError, AppResult};
use crate::models::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const MAX_REMOTE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    pub key_prefix: String,
    pub storage_quota_bytes: usize,
    pub probe_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub remote_timeout_ms: u64,
    pub queue_capacity: usize,
    pub quota_eviction_target: usize,
    pub freshness_secs: u64,
    pub recent_pin_values_cap: usize,
    pub retry: RetryPolicy,
    pub initially_online: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            key_prefix: "devicehub".to_string(),
            storage_quota_bytes: 5 * 1024 * 1024,
            probe_interval_secs: 30,
            probe_timeout_ms: 5_000,
            remote_timeout_ms: MAX_REMOTE_TIMEOUT_MS,
            queue_capacity: 100,
            quota_eviction_target: 10,
            freshness_secs: 3_600,
            recent_pin_values_cap: 50,
            retry: RetryPolicy::default(),
            initially_online: true,
        }
    }
}

impl SyncSettings {
    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(raw)?;
        settings.validate()
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Config(format!("{}: {}", path.display(), error)))?;
        Self::from_yaml_str(&raw)
    }

    /// Deep-merges a partial JSON update onto these settings.
    pub fn merged(&self, update: serde_json::Value) -> AppResult<Self> {
        let mut merged = serde_json::to_value(self)?;
        merge_json(&mut merged, update);
        let settings: Self = serde_json::from_value(merged).map_err(|error| AppError::Config(error.to_string()))?;
        settings.validate()
    }

    pub fn validate(mut self) -> AppResult<Self> {
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.maxAttempts must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(AppError::Config("queueCapacity must be at least 1".to_string()));
        }
        if self.quota_eviction_target > self.queue_capacity {
            return Err(AppError::Config(format!(
                "quotaEvictionTarget ({}) exceeds queueCapacity ({})",
                self.quota_eviction_target, self.queue_capacity
            )));
        }
        if self.probe_interval_secs == 0 {
            return Err(AppError::Config("probeIntervalSecs must be at least 1".to_string()));
        }
        if self.remote_timeout_ms > MAX_REMOTE_TIMEOUT_MS {
            tracing::warn!(
                requested = self.remote_timeout_ms,
                cap = MAX_REMOTE_TIMEOUT_MS,
                "remote timeout capped"
            );
            self.remote_timeout_ms = MAX_REMOTE_TIMEOUT_MS;
        }
        Ok(self)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.min(MAX_REMOTE_TIMEOUT_MS))
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms.min(MAX_REMOTE_TIMEOUT_MS))
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SyncSettings, MAX_REMOTE_TIMEOUT_MS};
    use serde_json::json;

    #[test]
    fn empty_yaml_yields_defaults() {
        let settings = SyncSettings::from_yaml_str("").expect("defaults");
        assert_eq!(settings, SyncSettings::default());
        assert_eq!(settings.queue_capacity, 100);
        assert_eq!(settings.probe_interval_secs, 30);
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let settings = SyncSettings::from_yaml_str("probeIntervalSecs: 5\nretry:\n  maxAttempts: 4\n  baseDelayMs: 250\n")
            .expect("parse");
        assert_eq!(settings.probe_interval_secs, 5);
        assert_eq!(settings.retry.max_attempts, 4);
        assert_eq!(settings.retry.base_delay_ms, 250);
        assert_eq!(settings.freshness_secs, 3_600);
    }

    #[test]
    fn merge_updates_nested_fields_and_caps_timeout() {
        let settings = SyncSettings::default()
            .merged(json!({ "retry": { "baseDelayMs": 50 }, "remoteTimeoutMs": 60_000 }))
            .expect("merge");
        assert_eq!(settings.retry.base_delay_ms, 50);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.remote_timeout_ms, MAX_REMOTE_TIMEOUT_MS);
    }

    #[test]
    fn rejects_zero_attempts() {
        let err = SyncSettings::default()
            .merged(json!({ "retry": { "maxAttempts": 0 } }))
            .expect_err("zero attempts");
        assert_eq!(err.code(), "CONFIG_INVALID");
    }
}
