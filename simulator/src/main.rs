mod device;

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use gateway::codec::JsonCodec;
use gateway::model::{DeviceConfig, Response};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{error, info, warn};

/// Simulated devices speaking the gateway's TCP configuration protocol
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Gateway device listener address
    #[arg(long, env = "GATEWAY_ADDR", default_value = "127.0.0.1:9000")]
    gateway: String,

    /// Number of devices to simulate
    #[arg(long, env = "DEVICES", default_value_t = 1)]
    devices: usize,

    /// Fixed MAC for a single device; random otherwise
    #[arg(long, env = "DEVICE_MAC")]
    mac: Option<String>,

    /// Device type reported in the handshake
    #[arg(long = "type", env = "DEVICE_TYPE", default_value = "fridge")]
    kind: String,

    /// Status code sent back for every configuration
    #[arg(long, env = "ACK_STATUS", default_value_t = 200)]
    ack_status: i32,

    /// Pause before reconnecting after the gateway drops a device
    #[arg(long, env = "RECONNECT_MS", default_value_t = 1000)]
    reconnect_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    if args.mac.is_some() && args.devices > 1 {
        bail!("--mac can only be used with a single device");
    }

    info!("Starting device simulator");
    info!("Gateway: {}, Devices: {}", args.gateway, args.devices);

    let mut rng = rand::thread_rng();
    let mut tasks = Vec::with_capacity(args.devices);
    for i in 0..args.devices {
        let mac = args
            .mac
            .clone()
            .unwrap_or_else(|| device::random_mac(&mut rng));
        let name = format!("sim-{}", i);
        let args = args.clone();
        tasks.push(tokio::spawn(async move {
            run_device(args, mac, name).await;
        }));
    }

    tokio::select! {
        _ = futures::future::join_all(tasks) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    Ok(())
}

/// Keeps one device connected, reconnecting whenever the session ends.
async fn run_device(args: Args, mac: String, name: String) {
    loop {
        match session(&args, &mac, &name).await {
            Ok(()) => info!(device = %mac, "Gateway closed the connection"),
            Err(e) => warn!(device = %mac, "Session failed: {:#}", e),
        }
        tokio::time::sleep(Duration::from_millis(args.reconnect_ms)).await;
    }
}

async fn session(args: &Args, mac: &str, name: &str) -> Result<()> {
    let stream = TcpStream::connect(&args.gateway)
        .await
        .with_context(|| format!("connecting to {}", args.gateway))?;
    let ip = stream
        .local_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_default();
    let mut framed = Framed::new(stream, JsonCodec::default());

    framed
        .send(device::handshake(&args.kind, name, mac, &ip))
        .await
        .context("sending handshake")?;
    info!(device = %mac, "Handshake sent");

    while let Some(frame) = framed.next().await {
        let frame = frame.context("reading from gateway")?;
        let config: DeviceConfig = match serde_json::from_value(frame) {
            Ok(config) => config,
            Err(e) => {
                error!(device = %mac, "Gateway sent something other than a configuration: {}", e);
                continue;
            }
        };

        info!(
            device = %mac,
            turned_on = config.turned_on,
            stream_on = config.stream_on,
            collect_freq = config.collect_freq,
            send_freq = config.send_freq,
            "Configuration received"
        );

        let response = Response {
            status: args.ack_status,
            descr: if args.ack_status == 200 {
                "ok".to_string()
            } else {
                "rejected".to_string()
            },
        };
        framed.send(&response).await.context("sending acknowledgement")?;
    }

    Ok(())
}
