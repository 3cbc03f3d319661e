//! Device configuration gateway.
//!
//! Devices connect over TCP, identify themselves by MAC address and receive a
//! default configuration. Configuration changes published on the store's
//! change channel are routed to whichever connection currently represents the
//! target device.

pub mod codec;
pub mod config;
pub mod device;
pub mod errors;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod model;
pub mod registry;
pub mod retry;
pub mod store;
pub mod subscriber;
pub mod validate;

pub use config::GatewayConfig;
pub use device::GatewayContext;
pub use errors::{Error, Result};
pub use registry::Registry;
pub use store::{ConfigStore, DeferredStore, MemoryStore, PgConfigStore};
