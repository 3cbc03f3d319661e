use crate::device::{handle_connection, GatewayContext};
use crate::metrics::ACCEPT_ERRORS_TOTAL;
use crate::retry::retry_every;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Binds `addr`, retrying every `interval` for as long as it takes.
///
/// Returns `None` only when `shutdown` fires before a bind succeeds.
pub async fn bind_with_retry(
    addr: &str,
    interval: Duration,
    shutdown: &CancellationToken,
) -> Option<TcpListener> {
    let addr = addr.to_string();
    retry_every("Device listener bind", interval, shutdown, || {
        TcpListener::bind(addr.clone())
    })
    .await
}

/// Accepts device connections until shutdown, one session task per connection.
pub async fn accept_loop(listener: TcpListener, ctx: GatewayContext) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
                    }
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, ctx).await;
                    });
                }
                Err(e) => {
                    ACCEPT_ERRORS_TOTAL.inc();
                    error!("Device accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_PAUSE).await;
                }
            },
        }
    }

    info!("Device listener stopped");
}

pub async fn run_listener(addr: String, ctx: GatewayContext, retry_interval: Duration) {
    info!("Binding device listener on {}", addr);

    let Some(listener) = bind_with_retry(&addr, retry_interval, &ctx.shutdown).await else {
        return;
    };

    match listener.local_addr() {
        Ok(local) => info!("Accepting device connections on {}", local),
        Err(_) => info!("Accepting device connections on {}", addr),
    }
    accept_loop(listener, ctx).await;
}
