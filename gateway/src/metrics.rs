use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref CONNECTIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_connections_total",
        "Total device connections accepted"
    ))
    .unwrap();
    pub static ref ACCEPT_ERRORS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_accept_errors_total",
        "Total errors returned by the device listener accept loop"
    ))
    .unwrap();
    pub static ref HANDSHAKES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_handshakes_total",
        "Total successful device handshakes"
    ))
    .unwrap();
    pub static ref HANDSHAKE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_handshake_failures_total",
        "Total connections closed before a valid handshake"
    ))
    .unwrap();
    pub static ref CONNECTED_DEVICES: Gauge = Gauge::with_opts(Opts::new(
        "gateway_connected_devices",
        "Devices currently present in the connection registry"
    ))
    .unwrap();
    pub static ref NOTIFICATIONS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_config_notifications_total",
        "Total configuration change notifications received"
    ))
    .unwrap();
    pub static ref PUSHES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_config_pushes_total",
        "Total configuration pushes acknowledged by devices"
    ))
    .unwrap();
    pub static ref PUSHES_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_config_pushes_dropped_total",
        "Total configuration changes dropped because the device was not connected"
    ))
    .unwrap();
    pub static ref PUSH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_config_push_failures_total",
        "Total configuration pushes that failed or were never acknowledged"
    ))
    .unwrap();
    pub static ref STORE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "gateway_store_failures_total",
        "Total config store operations that failed"
    ))
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(CONNECTIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(ACCEPT_ERRORS_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(HANDSHAKES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(HANDSHAKE_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(CONNECTED_DEVICES.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(NOTIFICATIONS_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(PUSHES_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(PUSHES_DROPPED_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(PUSH_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(STORE_FAILURES_TOTAL.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
