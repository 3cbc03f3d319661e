//! Versioned per-device configuration storage.
//!
//! Layout, shared by every backend:
//! - set `Config` indexes `<MAC>:params` for every configured device
//! - hash `<MAC>` holds `ConfigTime`, the last write timestamp in ms
//! - set `<MAC>:params` lists the stored field names
//! - sorted set `<MAC>:params:<Field>` maps value -> timestamp; the
//!   highest-scored member is the current value

pub mod deferred;
pub mod memory;
pub mod postgres;

use crate::errors::{Error, Result};
use crate::model::{ConfigChange, DeviceConfig};
use crate::validate::{normalize_mac, validate_config};
use async_trait::async_trait;
use std::fmt;

pub use deferred::DeferredStore;
pub use memory::MemoryStore;
pub use postgres::PgConfigStore;

pub const CONFIG_INDEX_KEY: &str = "Config";
pub const CONFIG_TIME_FIELD: &str = "ConfigTime";
pub const DEFAULT_CONFIG_CHANNEL: &str = "configChan";

const PARAMS_SUFFIX: &str = ":params";

/// Persisted configuration fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    TurnedOn,
    CollectFreq,
    SendFreq,
}

impl ConfigField {
    pub const ALL: [ConfigField; 3] = [
        ConfigField::TurnedOn,
        ConfigField::CollectFreq,
        ConfigField::SendFreq,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigField::TurnedOn => "TurnedOn",
            ConfigField::CollectFreq => "CollectFreq",
            ConfigField::SendFreq => "SendFreq",
        }
    }

    /// Stored representation of this field's value in `config`
    pub fn value_of(self, config: &DeviceConfig) -> String {
        match self {
            ConfigField::TurnedOn => config.turned_on.to_string(),
            ConfigField::CollectFreq => config.collect_freq.to_string(),
            ConfigField::SendFreq => config.send_freq.to_string(),
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point in a field's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub field: ConfigField,
    pub value: String,
    pub timestamp_ms: i64,
}

/// `<MAC>:params`
pub fn params_key(mac: &str) -> String {
    format!("{}{}", mac, PARAMS_SUFFIX)
}

/// `<MAC>:params:<Field>`
pub fn history_key(mac: &str, field: ConfigField) -> String {
    format!("{}{}:{}", mac, PARAMS_SUFFIX, field.as_str())
}

/// Recovers the MAC from a `Config` index member
pub fn mac_from_params_key(key: &str) -> Option<&str> {
    key.strip_suffix(PARAMS_SUFFIX)
}

/// Stream of raw payloads published on one channel
#[async_trait]
pub trait ChangeFeed: Send {
    /// Next payload, or `None` once the feed can deliver nothing more.
    async fn recv(&mut self) -> Result<Option<String>>;
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Writes `config` as the state of `mac` at `timestamp_ms`.
    async fn save_config(&self, mac: &str, config: &DeviceConfig, timestamp_ms: i64)
        -> Result<()>;

    /// The highest-timestamp value recorded for `field`.
    async fn current_value(&self, mac: &str, field: ConfigField) -> Result<Option<String>>;

    async fn config_time(&self, mac: &str) -> Result<Option<i64>>;

    /// Every device with a saved configuration, sorted.
    async fn configured_devices(&self) -> Result<Vec<String>>;

    /// History of one field, oldest first.
    async fn field_history(&self, mac: &str, field: ConfigField) -> Result<Vec<HistoryEntry>>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeFeed>>;

    /// Rebuilds the current configuration from the per-field histories.
    ///
    /// `streamOn` is not persisted and always comes back `false`.
    async fn current_config(&self, mac: &str) -> Result<Option<DeviceConfig>> {
        let turned_on = self.current_value(mac, ConfigField::TurnedOn).await?;
        let collect_freq = self.current_value(mac, ConfigField::CollectFreq).await?;
        let send_freq = self.current_value(mac, ConfigField::SendFreq).await?;

        let (Some(turned_on), Some(collect_freq), Some(send_freq)) =
            (turned_on, collect_freq, send_freq)
        else {
            return Ok(None);
        };

        Ok(Some(DeviceConfig {
            turned_on: parse_stored(ConfigField::TurnedOn, &turned_on)?,
            stream_on: false,
            collect_freq: parse_stored(ConfigField::CollectFreq, &collect_freq)?,
            send_freq: parse_stored(ConfigField::SendFreq, &send_freq)?,
        }))
    }

    /// Persists a change under the normalized MAC and announces it on `channel`.
    ///
    /// Invalid changes are rejected before anything is written.
    async fn apply_change(
        &self,
        channel: &str,
        change: &ConfigChange,
        timestamp_ms: i64,
    ) -> Result<()> {
        let change = ConfigChange {
            mac: normalize_mac(&change.mac)?,
            config: change.config,
        };
        validate_config(&change.config)?;

        self.save_config(&change.mac, &change.config, timestamp_ms)
            .await?;
        let payload = serde_json::to_string(&change)?;
        self.publish(channel, &payload).await
    }
}

fn parse_stored<T: std::str::FromStr>(field: ConfigField, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Validation(format!("Stored {} value {:?} is corrupt", field, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let mac = "AA:BB:CC:DD:EE:FF";

        assert_eq!(params_key(mac), "AA:BB:CC:DD:EE:FF:params");
        assert_eq!(
            history_key(mac, ConfigField::CollectFreq),
            "AA:BB:CC:DD:EE:FF:params:CollectFreq"
        );
        assert_eq!(mac_from_params_key(&params_key(mac)), Some(mac));
        assert_eq!(mac_from_params_key(mac), None);
    }

    #[test]
    fn test_field_values() {
        let config = DeviceConfig::default();

        assert_eq!(ConfigField::TurnedOn.value_of(&config), "true");
        assert_eq!(ConfigField::CollectFreq.value_of(&config), "1");
        assert_eq!(ConfigField::SendFreq.value_of(&config), "5");
    }

    #[test]
    fn test_parse_stored_rejects_corrupt_values() {
        assert!(parse_stored::<bool>(ConfigField::TurnedOn, "yes").is_err());
        assert_eq!(parse_stored::<i32>(ConfigField::SendFreq, "20").unwrap(), 20);
    }
}
