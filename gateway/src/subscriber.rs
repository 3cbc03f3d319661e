//! Routes configuration change notifications to the live device connection.

use crate::errors::{Error, Result};
use crate::metrics::{
    NOTIFICATIONS_TOTAL, PUSHES_DROPPED_TOTAL, PUSHES_TOTAL, PUSH_FAILURES_TOTAL,
};
use crate::model::ConfigChange;
use crate::registry::{AckReceiver, Registry};
use crate::retry::retry_every;
use crate::store::{ChangeFeed, ConfigStore};
use crate::validate::{normalize_mac, validate_config};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What happened to one notification
#[derive(Debug)]
pub enum Dispatch {
    /// No live connection for the device; the change is not queued.
    Dropped { mac: String },
    /// Queued on the device's connection; the ack arrives on `ack`.
    Delivering { mac: String, ack: AckReceiver },
}

/// Listens on `channel` until shutdown, resubscribing whenever the feed fails.
pub async fn run_subscriber(
    store: Arc<dyn ConfigStore>,
    registry: Registry,
    channel: String,
    retry_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let subscribed = retry_every(
            "Config channel subscription",
            retry_interval,
            &shutdown,
            || {
                let store = Arc::clone(&store);
                let channel = channel.clone();
                async move { store.subscribe(&channel).await }
            },
        )
        .await;

        let Some(mut feed) = subscribed else {
            break;
        };
        info!("Subscribed to {}", channel);

        match consume(feed.as_mut(), &registry, &shutdown).await {
            Ok(()) => break,
            Err(e) => {
                error!("Change feed on {} failed, resubscribing: {}", channel, e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(retry_interval) => {}
                }
            }
        }
    }

    info!("Config change subscriber stopped");
}

/// Processes notifications until shutdown (`Ok`) or a feed failure (`Err`).
async fn consume(
    feed: &mut dyn ChangeFeed,
    registry: &Registry,
    shutdown: &CancellationToken,
) -> Result<()> {
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = feed.recv() => match next? {
                Some(payload) => payload,
                None => return Err(Error::FeedClosed),
            },
        };

        NOTIFICATIONS_TOTAL.inc();
        match dispatch(&payload, registry).await {
            Ok(Dispatch::Delivering { mac, ack }) => {
                tokio::spawn(await_ack(mac, ack));
            }
            Ok(Dispatch::Dropped { .. }) => {}
            Err(e) => {
                PUSH_FAILURES_TOTAL.inc();
                warn!("Discarding config notification {:?}: {}", payload, e);
            }
        }
    }
}

/// Decodes one notification and hands the configuration to the device's session.
pub async fn dispatch(payload: &str, registry: &Registry) -> Result<Dispatch> {
    let change: ConfigChange = serde_json::from_str(payload)?;
    let mac = normalize_mac(&change.mac)?;
    validate_config(&change.config)?;

    let Some(handle) = registry.lookup(&mac) else {
        PUSHES_DROPPED_TOTAL.inc();
        info!(device = %mac, "Device not connected, dropping configuration change");
        return Ok(Dispatch::Dropped { mac });
    };

    debug!(device = %mac, peer = %handle.peer(), "Pushing configuration change");
    let ack = handle.push(change.config)?;
    Ok(Dispatch::Delivering { mac, ack })
}

async fn await_ack(mac: String, ack: AckReceiver) {
    match ack.await {
        Ok(Ok(response)) if response.is_ok() => {
            PUSHES_TOTAL.inc();
            info!(device = %mac, descr = %response.descr, "Configuration change applied");
        }
        Ok(Ok(response)) => {
            PUSHES_TOTAL.inc();
            warn!(
                device = %mac,
                status = response.status,
                descr = %response.descr,
                "Device rejected configuration change"
            );
        }
        Ok(Err(e)) => {
            PUSH_FAILURES_TOTAL.inc();
            warn!(device = %mac, "Configuration change not delivered: {}", e);
        }
        Err(_) => {
            PUSH_FAILURES_TOTAL.inc();
            warn!(device = %mac, "Device session ended before acknowledging");
        }
    }
}
