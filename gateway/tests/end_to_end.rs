use chrono::Utc;
use futures::{SinkExt, StreamExt};
use gateway::codec::JsonCodec;
use gateway::config::ProtocolSettings;
use gateway::model::{ConfigChange, DeviceConfig};
use gateway::store::{ConfigField, ConfigStore, MemoryStore, DEFAULT_CONFIG_CHANNEL};
use gateway::{listener, subscriber, GatewayContext, Registry};
use rand::Rng;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const MAC: &str = "AA:BB:CC:DD:EE:FF";

struct TestGateway {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    registry: Registry,
    shutdown: CancellationToken,
}

impl TestGateway {
    async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::new();
        let shutdown = CancellationToken::new();

        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = tcp.local_addr().unwrap();

        let ctx = GatewayContext {
            registry: registry.clone(),
            store: store.clone(),
            settings: ProtocolSettings {
                ack_timeout: Duration::from_secs(2),
                ..ProtocolSettings::default()
            },
            shutdown: shutdown.clone(),
        };
        tokio::spawn(listener::accept_loop(tcp, ctx));
        tokio::spawn(subscriber::run_subscriber(
            store.clone(),
            registry.clone(),
            DEFAULT_CONFIG_CHANNEL.to_string(),
            Duration::from_millis(50),
            shutdown.clone(),
        ));
        // let the subscriber attach to the channel
        tokio::time::sleep(Duration::from_millis(50)).await;

        Self {
            addr,
            store,
            registry,
            shutdown,
        }
    }

    async fn connect(&self, mac: &str) -> Framed<TcpStream, JsonCodec> {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        let mut device = Framed::new(stream, JsonCodec::default());
        device
            .send(json!({
                "action": "register",
                "time": Utc::now().timestamp_millis(),
                "meta": {"type": "fridge", "name": "kitchen", "mac": mac, "ip": "127.0.0.1"},
                "data": {"tempCam1": {}}
            }))
            .await
            .unwrap();
        device
    }

    async fn wait_until<F: Fn(&Registry) -> bool>(&self, condition: F) {
        for _ in 0..200 {
            if condition(&self.registry) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached the expected state");
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn next_frame(device: &mut Framed<TcpStream, JsonCodec>) -> Value {
    tokio::time::timeout(Duration::from_secs(5), device.next())
        .await
        .expect("gateway sent nothing")
        .expect("connection closed")
        .expect("undecodable frame")
}

fn random_mac() -> String {
    let mut rng = rand::thread_rng();
    let octets: Vec<String> = (0..6).map(|_| format!("{:02X}", rng.gen::<u8>())).collect();
    octets.join(":")
}

#[tokio::test]
async fn test_handshake_writes_defaults_and_replies() {
    let gw = TestGateway::start().await;
    let before = Utc::now().timestamp_millis();

    let mut device = gw.connect(MAC).await;
    let config = next_frame(&mut device).await;
    device
        .send(json!({"status": 200, "descr": "ok"}))
        .await
        .unwrap();

    assert_eq!(
        config,
        json!({"turnedOn": true, "streamOn": false, "collectFreq": 1, "sendFreq": 5})
    );
    assert!(gw.registry.lookup(MAC).is_some());

    let written_at = gw.store.config_time(MAC).await.unwrap().unwrap();
    assert!(written_at >= before);
    for field in ConfigField::ALL {
        let history = gw.store.field_history(MAC, field).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].timestamp_ms, written_at);
    }
    assert_eq!(gw.store.configured_devices().await.unwrap(), vec![MAC]);

    // the ack to the default configuration triggers nothing further
    let extra = tokio::time::timeout(Duration::from_millis(200), device.next()).await;
    assert!(extra.is_err());
}

#[tokio::test]
async fn test_change_notification_is_pushed_to_live_device() {
    let gw = TestGateway::start().await;

    let mut device = gw.connect(MAC).await;
    next_frame(&mut device).await;
    device
        .send(json!({"status": 200, "descr": "ok"}))
        .await
        .unwrap();

    let change = ConfigChange {
        mac: MAC.to_string(),
        config: DeviceConfig {
            turned_on: false,
            stream_on: false,
            collect_freq: 10,
            send_freq: 20,
        },
    };
    gw.store
        .apply_change(DEFAULT_CONFIG_CHANNEL, &change, Utc::now().timestamp_millis() + 1)
        .await
        .unwrap();

    let pushed = next_frame(&mut device).await;
    assert_eq!(
        pushed,
        json!({"turnedOn": false, "streamOn": false, "collectFreq": 10, "sendFreq": 20})
    );
    device
        .send(json!({"status": 200, "descr": "ok"}))
        .await
        .unwrap();

    assert_eq!(
        gw.store
            .current_value(MAC, ConfigField::CollectFreq)
            .await
            .unwrap()
            .as_deref(),
        Some("10")
    );
    assert_eq!(gw.store.current_config(MAC).await.unwrap(), Some(change.config));
}

#[tokio::test]
async fn test_change_for_offline_device_is_dropped() {
    let gw = TestGateway::start().await;
    let offline = random_mac();

    let change = ConfigChange {
        mac: offline.clone(),
        config: DeviceConfig::default(),
    };
    gw.store
        .apply_change(DEFAULT_CONFIG_CHANNEL, &change, Utc::now().timestamp_millis())
        .await
        .unwrap();

    // the subscriber keeps serving other devices afterwards
    let mut device = gw.connect(MAC).await;
    next_frame(&mut device).await;
    gw.store
        .apply_change(
            DEFAULT_CONFIG_CHANNEL,
            &ConfigChange {
                mac: MAC.to_string(),
                config: DeviceConfig {
                    send_freq: 7,
                    ..DeviceConfig::default()
                },
            },
            Utc::now().timestamp_millis() + 1,
        )
        .await
        .unwrap();

    let pushed: DeviceConfig = serde_json::from_value(next_frame(&mut device).await).unwrap();
    assert_eq!(pushed.send_freq, 7);
    assert!(gw.registry.lookup(&offline).is_none());
}

#[tokio::test]
async fn test_reconnect_routes_to_newest_connection() {
    let gw = TestGateway::start().await;

    let mut first = gw.connect(MAC).await;
    next_frame(&mut first).await;
    let first_id = gw.registry.lookup(MAC).unwrap().id();

    let mut second = gw.connect(MAC).await;
    next_frame(&mut second).await;
    gw.wait_until(|r| r.lookup(MAC).is_some_and(|h| h.id() != first_id))
        .await;

    // the superseded connection is closed by the gateway
    let closed = tokio::time::timeout(Duration::from_secs(5), first.next())
        .await
        .expect("superseded connection left open");
    assert!(closed.is_none());

    gw.store
        .apply_change(
            DEFAULT_CONFIG_CHANNEL,
            &ConfigChange {
                mac: MAC.to_string(),
                config: DeviceConfig {
                    collect_freq: 3,
                    ..DeviceConfig::default()
                },
            },
            Utc::now().timestamp_millis() + 1,
        )
        .await
        .unwrap();

    let pushed: DeviceConfig = serde_json::from_value(next_frame(&mut second).await).unwrap();
    assert_eq!(pushed.collect_freq, 3);
    assert_eq!(gw.registry.len(), 1);
}

#[tokio::test]
async fn test_disconnect_removes_registry_entry() {
    let gw = TestGateway::start().await;
    let mac = random_mac();

    let mut device = gw.connect(&mac).await;
    next_frame(&mut device).await;
    assert!(gw.registry.lookup(&mac).is_some());

    drop(device);
    gw.wait_until(|r| r.lookup(&mac).is_none()).await;

    // history survives the disconnect
    assert!(gw.store.current_config(&mac).await.unwrap().is_some());
}

#[tokio::test]
async fn test_malformed_handshake_is_not_registered() {
    let gw = TestGateway::start().await;

    let stream = TcpStream::connect(gw.addr).await.unwrap();
    let mut device = Framed::new(stream, JsonCodec::default());
    device
        .send(json!({"action": "register", "meta": {"mac": "not-a-mac"}}))
        .await
        .unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(5), device.next())
        .await
        .expect("gateway kept a bad connection open");
    assert!(closed.is_none());
    assert!(gw.registry.is_empty());
    assert!(gw.store.configured_devices().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_many_devices_connect_concurrently() {
    let gw = Arc::new(TestGateway::start().await);
    let mut tasks = Vec::new();

    for _ in 0..25 {
        let gw = Arc::clone(&gw);
        tasks.push(tokio::spawn(async move {
            let mac = random_mac();
            let mut device = gw.connect(&mac).await;
            let config: DeviceConfig =
                serde_json::from_value(next_frame(&mut device).await).unwrap();
            (mac, device, config)
        }));
    }

    let mut devices = Vec::new();
    for task in tasks {
        let (mac, device, config) = task.await.unwrap();
        assert_eq!(config, DeviceConfig::default());
        devices.push((mac, device));
    }

    for (mac, _) in &devices {
        assert!(gw.registry.lookup(mac).is_some());
    }
    assert_eq!(gw.registry.len(), devices.len());
}
