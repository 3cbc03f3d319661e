//! Per-connection device session: handshake, registration, default
//! configuration, then push delivery until the stream ends.

use crate::codec::JsonCodec;
use crate::config::ProtocolSettings;
use crate::errors::{Error, Result};
use crate::metrics::{
    CONNECTIONS_TOTAL, HANDSHAKES_TOTAL, HANDSHAKE_FAILURES_TOTAL, STORE_FAILURES_TOTAL,
};
use crate::model::{DeviceConfig, HandshakeRequest, Response};
use crate::registry::{DeviceHandle, PushRequest, Registry};
use crate::store::ConfigStore;
use crate::validate::validate_handshake;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type DeviceStream<S> = Framed<S, JsonCodec>;

/// Everything a session task needs, passed explicitly to each one
#[derive(Clone)]
pub struct GatewayContext {
    pub registry: Registry,
    pub store: Arc<dyn ConfigStore>,
    pub settings: ProtocolSettings,
    pub shutdown: CancellationToken,
}

/// Why an active session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Closed,
    Superseded,
    Shutdown,
}

/// Serves one device connection to completion. Never returns an error;
/// failures are logged and end the session.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, ctx: GatewayContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    CONNECTIONS_TOTAL.inc();
    debug!(%peer, "Device connected");

    match serve_device(stream, peer, &ctx).await {
        Ok((mac, end)) => info!(%peer, device = %mac, ?end, "Device session ended"),
        Err(e) => warn!(%peer, "Device session terminated: {}", e),
    }
}

async fn serve_device<S>(
    stream: S,
    peer: SocketAddr,
    ctx: &GatewayContext,
) -> Result<(String, SessionEnd)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let settings = &ctx.settings;
    let mut framed = Framed::new(stream, JsonCodec::new(settings.max_frame_len));

    let (request, mac) = match read_handshake(&mut framed, settings.handshake_timeout).await {
        Ok(handshake) => handshake,
        Err(e) => {
            HANDSHAKE_FAILURES_TOTAL.inc();
            return Err(e);
        }
    };
    HANDSHAKES_TOTAL.inc();
    info!(
        %peer,
        device = %mac,
        kind = %request.meta.kind,
        name = %request.meta.name,
        action = %request.action,
        "Device handshake accepted"
    );

    let (pushes_tx, mut pushes) = mpsc::channel(settings.push_queue_capacity);
    let handle = DeviceHandle::new(peer, request.meta, pushes_tx);
    // dropped on every return path below, which removes the registry entry
    let _registration = ctx.registry.register(&mac, handle);

    let config = DeviceConfig::default();
    let now_ms = Utc::now().timestamp_millis();
    if let Err(e) = ctx.store.save_config(&mac, &config, now_ms).await {
        STORE_FAILURES_TOTAL.inc();
        error!(device = %mac, "Failed to persist default configuration: {}", e);
    }

    send_frame(&mut framed, &config, settings.write_timeout).await?;
    info!(device = %mac, "Default configuration sent");

    loop {
        tokio::select! {
            biased;

            _ = ctx.shutdown.cancelled() => return Ok((mac, SessionEnd::Shutdown)),

            // buffered inbound frames go first so a late ack is never taken
            // as the answer to the next push
            frame = framed.next() => match frame {
                Some(Ok(value)) => debug!(device = %mac, %value, "Ignoring unsolicited frame"),
                Some(Err(e)) => return Err(e),
                None => return Ok((mac, SessionEnd::Closed)),
            },

            push = pushes.recv() => match push {
                Some(push) => tokio::select! {
                    biased;

                    // the pusher sees its reply slot dropped
                    _ = ctx.shutdown.cancelled() => return Ok((mac, SessionEnd::Shutdown)),
                    delivered = deliver_push(&mut framed, &mac, push, settings) => delivered?,
                },
                None => return Ok((mac, SessionEnd::Superseded)),
            },
        }
    }
}

/// Reads the first frame and returns it with the normalized device identity.
async fn read_handshake<S>(
    framed: &mut DeviceStream<S>,
    limit: Duration,
) -> Result<(HandshakeRequest, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = timeout(limit, framed.next())
        .await
        .map_err(|_| Error::Timeout("handshake"))?
        .ok_or_else(|| Error::Protocol("connection closed before handshake".to_string()))??;

    let request: HandshakeRequest = serde_json::from_value(frame)?;
    let mac = validate_handshake(&request)?;
    Ok((request, mac))
}

/// Writes one configuration, reads exactly one acknowledgement and hands the
/// outcome back to the pusher. Only errors that leave the stream unusable are
/// returned.
async fn deliver_push<S>(
    framed: &mut DeviceStream<S>,
    mac: &str,
    push: PushRequest,
    settings: &ProtocolSettings,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let PushRequest { config, reply } = push;
    let outcome = exchange(framed, &config, settings).await;

    let fatal = match &outcome {
        Ok(response) => {
            debug!(device = %mac, status = response.status, "Configuration acknowledged");
            None
        }
        Err(e) if !e.is_fatal_for_connection() => {
            warn!(device = %mac, "Configuration push not acknowledged: {}", e);
            None
        }
        Err(e) => Some(e.to_string()),
    };

    if reply.send(outcome).is_err() {
        debug!(device = %mac, "Pusher went away before the acknowledgement");
    }

    match fatal {
        Some(reason) => Err(Error::Protocol(format!("push delivery failed: {}", reason))),
        None => Ok(()),
    }
}

async fn exchange<S>(
    framed: &mut DeviceStream<S>,
    config: &DeviceConfig,
    settings: &ProtocolSettings,
) -> Result<Response>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_frame(framed, config, settings.write_timeout).await?;

    let frame = timeout(settings.ack_timeout, framed.next())
        .await
        .map_err(|_| Error::AckTimeout)?
        .ok_or_else(|| Error::Protocol("connection closed before acknowledgement".to_string()))??;

    Ok(serde_json::from_value(frame)?)
}

async fn send_frame<S, T>(framed: &mut DeviceStream<S>, item: &T, limit: Duration) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    timeout(limit, framed.send(item))
        .await
        .map_err(|_| Error::Timeout("write"))?
}
