use super::{
    history_key, mac_from_params_key, params_key, ChangeFeed, ConfigField, ConfigStore,
    HistoryEntry, CONFIG_INDEX_KEY, CONFIG_TIME_FIELD,
};
use crate::errors::{Error, Result};
use crate::metrics::STORE_FAILURES_TOTAL;
use crate::model::DeviceConfig;
use crate::retry::retry_every;
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MAX_CONNECTIONS: u32 = 20;
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Config store backed by Postgres tables that model set, hash and sorted-set keys
#[derive(Debug, Clone)]
pub struct PgConfigStore {
    pool: PgPool,
}

impl PgConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool and brings the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        info!("Database connection established");
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Migrations completed");

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn save_config_inner(
        &self,
        mac: &str,
        config: &DeviceConfig,
        timestamp_ms: i64,
    ) -> Result<()> {
        let params = params_key(mac);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO kv_sets (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(CONFIG_INDEX_KEY)
        .bind(&params)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO kv_hashes (key, field, value) VALUES ($1, $2, $3)
            ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(mac)
        .bind(CONFIG_TIME_FIELD)
        .bind(timestamp_ms.to_string())
        .execute(&mut *tx)
        .await?;

        for field in ConfigField::ALL {
            sqlx::query(
                "INSERT INTO kv_sets (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(&params)
            .bind(field.as_str())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO kv_sorted_sets (key, member, score) VALUES ($1, $2, $3)
                ON CONFLICT (key, member) DO UPDATE SET score = EXCLUDED.score
                "#,
            )
            .bind(history_key(mac, field))
            .bind(field.value_of(config))
            .bind(timestamp_ms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn save_config(
        &self,
        mac: &str,
        config: &DeviceConfig,
        timestamp_ms: i64,
    ) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.save_config_inner(mac, config, timestamp_ms).await {
                Ok(()) => return Ok(()),
                Err(Error::Database(db_err))
                    if attempts < MAX_WRITE_ATTEMPTS && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Config write for {} failed (attempt {}/{}), retrying in {}ms: {}",
                        mac, attempts, MAX_WRITE_ATTEMPTS, wait_ms, db_err
                    );
                    STORE_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!(
                        "Config write for {} failed permanently after {} attempts: {}",
                        mac, attempts, e
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn current_value(&self, mac: &str, field: ConfigField) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            r#"
            SELECT member FROM kv_sorted_sets
            WHERE key = $1
            ORDER BY score DESC, member DESC
            LIMIT 1
            "#,
        )
        .bind(history_key(mac, field))
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn config_time(&self, mac: &str) -> Result<Option<i64>> {
        let raw = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_hashes WHERE key = $1 AND field = $2",
        )
        .bind(mac)
        .bind(CONFIG_TIME_FIELD)
        .fetch_optional(&self.pool)
        .await?;

        raw.map(|raw| {
            raw.parse().map_err(|_| {
                Error::Validation(format!("Stored {} {:?} is corrupt", CONFIG_TIME_FIELD, raw))
            })
        })
        .transpose()
    }

    async fn configured_devices(&self) -> Result<Vec<String>> {
        let members = sqlx::query_scalar::<_, String>(
            "SELECT member FROM kv_sets WHERE key = $1 ORDER BY member",
        )
        .bind(CONFIG_INDEX_KEY)
        .fetch_all(&self.pool)
        .await?;

        Ok(members
            .iter()
            .filter_map(|m| mac_from_params_key(m))
            .map(str::to_string)
            .collect())
    }

    async fn field_history(&self, mac: &str, field: ConfigField) -> Result<Vec<HistoryEntry>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT member, score FROM kv_sorted_sets
            WHERE key = $1
            ORDER BY score ASC, member ASC
            "#,
        )
        .bind(history_key(mac, field))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(value, timestamp_ms)| HistoryEntry {
                field,
                value,
                timestamp_ms,
            })
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn ChangeFeed>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(channel).await?;
        Ok(Box::new(PgFeed {
            channel: channel.to_string(),
            listener,
        }))
    }
}

struct PgFeed {
    channel: String,
    listener: PgListener,
}

#[async_trait]
impl ChangeFeed for PgFeed {
    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            // None means the connection dropped; the next call reconnects and re-listens
            match self.listener.try_recv().await? {
                Some(notification) => return Ok(Some(notification.payload().to_string())),
                None => {
                    warn!(
                        channel = %self.channel,
                        "Lost change feed connection, notifications sent meanwhile are lost"
                    );
                    STORE_FAILURES_TOTAL.inc();
                }
            }
        }
    }
}

/// Connects to Postgres, retrying every `interval` until it succeeds.
///
/// Returns `None` only when `shutdown` fires first.
pub async fn connect_with_retry(
    database_url: &str,
    interval: Duration,
    shutdown: &CancellationToken,
) -> Option<PgConfigStore> {
    let database_url = database_url.to_string();
    retry_every("Config store connection", interval, shutdown, || {
        let database_url = database_url.clone();
        async move { PgConfigStore::connect(&database_url).await }
    })
    .await
}

/// Whether a failed config write is worth repeating. A closed pool is not:
/// it only happens on shutdown.
fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| is_transient_sqlstate(&code)),
        _ => false,
    }
}

/// Connection loss, server restarts, and the conflicts two concurrent
/// handshakes for one MAC can hit inside the write transaction.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || matches!(
            code,
            "40001" // serialization_failure
                | "40P01" // deadlock_detected
                | "53300" // too_many_connections
                | "57P01" // admin_shutdown
                | "57P03" // cannot_connect_now
        )
}
