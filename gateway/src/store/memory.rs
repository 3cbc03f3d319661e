use super::{
    history_key, mac_from_params_key, params_key, ChangeFeed, ConfigField, ConfigStore,
    HistoryEntry, CONFIG_INDEX_KEY, CONFIG_TIME_FIELD,
};
use crate::errors::{Error, Result};
use crate::model::DeviceConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::broadcast;
use tracing::warn;

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct State {
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
    sorted_sets: HashMap<String, HashMap<String, i64>>,
}

impl State {
    fn sadd(&mut self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }

    fn hset(&mut self, key: &str, field: &str, value: String) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    fn zadd(&mut self, key: &str, score: i64, member: String) {
        self.sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
    }

    /// Members ordered by (score, member), as a sorted set ranks them.
    fn zrange(&self, key: &str) -> Vec<(String, i64)> {
        let mut members: Vec<(String, i64)> = self
            .sorted_sets
            .get(key)
            .map(|set| set.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

/// Process-local store with the same semantics as the Postgres backend.
///
/// History is lost on restart.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    notifications: broadcast::Sender<(String, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            notifications,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn save_config(
        &self,
        mac: &str,
        config: &DeviceConfig,
        timestamp_ms: i64,
    ) -> Result<()> {
        let params = params_key(mac);
        let mut state = self.state.lock();

        state.sadd(CONFIG_INDEX_KEY, &params);
        state.hset(mac, CONFIG_TIME_FIELD, timestamp_ms.to_string());
        for field in ConfigField::ALL {
            state.sadd(&params, field.as_str());
            state.zadd(&history_key(mac, field), timestamp_ms, field.value_of(config));
        }
        Ok(())
    }

    async fn current_value(&self, mac: &str, field: ConfigField) -> Result<Option<String>> {
        let state = self.state.lock();
        Ok(state
            .zrange(&history_key(mac, field))
            .pop()
            .map(|(member, _)| member))
    }

    async fn config_time(&self, mac: &str) -> Result<Option<i64>> {
        let state = self.state.lock();
        match state.hashes.get(mac).and_then(|h| h.get(CONFIG_TIME_FIELD)) {
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::Validation(format!("Stored {} {:?} is corrupt", CONFIG_TIME_FIELD, raw))
            }),
            None => Ok(None),
        }
    }

    async fn configured_devices(&self) -> Result<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .sets
            .get(CONFIG_INDEX_KEY)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|m| mac_from_params_key(m))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn field_history(&self, mac: &str, field: ConfigField) -> Result<Vec<HistoryEntry>> {
        let state = self.state.lock();
        Ok(state
            .zrange(&history_key(mac, field))
            .into_iter()
            .map(|(value, timestamp_ms)| HistoryEntry {
                field,
                value,
                timestamp_ms,
            })
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // no subscribers is not an error, matching pub/sub semantics
        let _ = self
            .notifications
            .send((channel.to_string(), payload.to_string()));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeFeed>> {
        Ok(Box::new(MemoryFeed {
            channel: channel.to_string(),
            rx: self.notifications.subscribe(),
        }))
    }
}

struct MemoryFeed {
    channel: String,
    rx: broadcast::Receiver<(String, String)>,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.rx.recv().await {
                Ok((channel, payload)) if channel == self.channel => return Ok(Some(payload)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Change feed lagged, notifications lost");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}
