//! Live mapping from device identity to the connection currently serving it.

use crate::errors::{Error, Result};
use crate::metrics::CONNECTED_DEVICES;
use crate::model::{DeviceConfig, Metadata, Response};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

/// Receives the outcome of one configuration push
pub type AckReceiver = oneshot::Receiver<Result<Response>>;

/// A configuration waiting to be written to a device, with a slot for its ack
pub struct PushRequest {
    pub config: DeviceConfig,
    pub reply: oneshot::Sender<Result<Response>>,
}

/// Non-owning reference to a live device connection.
///
/// The socket stays with the session task that accepted it; the handle only
/// queues work for that task.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    id: Uuid,
    peer: SocketAddr,
    meta: Metadata,
    connected_at: DateTime<Utc>,
    pushes: mpsc::Sender<PushRequest>,
}

impl DeviceHandle {
    pub fn new(peer: SocketAddr, meta: Metadata, pushes: mpsc::Sender<PushRequest>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            meta,
            connected_at: Utc::now(),
            pushes,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queues a configuration for the session task and returns where its ack will land.
    ///
    /// Never waits: a session whose queue is full is reported as
    /// `PushQueueFull` so one stalled device cannot hold up the caller.
    pub fn push(&self, config: DeviceConfig) -> Result<AckReceiver> {
        let (reply, ack) = oneshot::channel();
        self.pushes
            .try_send(PushRequest { config, reply })
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::PushQueueFull(self.meta.mac.clone()),
                TrySendError::Closed(_) => Error::DeviceUnavailable(self.meta.mac.clone()),
            })?;
        Ok(ack)
    }
}

/// Connection registry shared by every session task and the change subscriber
#[derive(Debug, Clone, Default)]
pub struct Registry {
    devices: Arc<Mutex<HashMap<String, DeviceHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `identity` to `handle`, replacing whatever was there.
    ///
    /// The entry lives until the returned guard is dropped or a later
    /// registration for the same identity supersedes it.
    pub fn register(&self, identity: &str, handle: DeviceHandle) -> Registration {
        let id = handle.id();
        let peer = handle.peer();
        let previous = {
            let mut devices = self.devices.lock();
            let previous = devices.insert(identity.to_string(), handle);
            CONNECTED_DEVICES.set(devices.len() as f64);
            previous
        };

        if let Some(previous) = previous {
            info!(
                device = identity,
                old_peer = %previous.peer(),
                new_peer = %peer,
                "Device reconnected, superseding previous connection"
            );
        }

        Registration {
            registry: self.clone(),
            identity: identity.to_string(),
            id,
        }
    }

    pub fn lookup(&self, identity: &str) -> Option<DeviceHandle> {
        self.devices.lock().get(identity).cloned()
    }

    pub fn remove(&self, identity: &str) -> Option<DeviceHandle> {
        let mut devices = self.devices.lock();
        let removed = devices.remove(identity);
        CONNECTED_DEVICES.set(devices.len() as f64);
        removed
    }

    /// Removes the entry only if it still belongs to connection `id`.
    pub fn remove_if(&self, identity: &str, id: Uuid) -> bool {
        let mut devices = self.devices.lock();
        let owned = devices.get(identity).is_some_and(|h| h.id() == id);
        if owned {
            devices.remove(identity);
            CONNECTED_DEVICES.set(devices.len() as f64);
        }
        owned
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.devices.lock().keys().cloned().collect();
        identities.sort();
        identities
    }
}

/// Scoped registry entry owned by a session task
#[derive(Debug)]
pub struct Registration {
    registry: Registry,
    identity: String,
    id: Uuid,
}

impl Registration {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn connection_id(&self) -> Uuid {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.remove_if(&self.identity, self.id) {
            debug!(device = %self.identity, "Removed device from registry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    fn handle(port: u16) -> (DeviceHandle, mpsc::Receiver<PushRequest>) {
        let (tx, rx) = mpsc::channel(4);
        let meta = Metadata {
            mac: MAC.to_string(),
            ..Metadata::default()
        };
        let peer = SocketAddr::from(([127, 0, 0, 1], port));
        (DeviceHandle::new(peer, meta, tx), rx)
    }

    #[test]
    fn test_register_then_lookup() {
        let registry = Registry::new();
        let (h, _rx) = handle(4000);
        let id = h.id();

        let _registration = registry.register(MAC, h);

        assert_eq!(registry.lookup(MAC).unwrap().id(), id);
        assert!(registry.lookup("11:22:33:44:55:66").is_none());
    }

    #[test]
    fn test_second_registration_supersedes_first() {
        let registry = Registry::new();
        let (first, _rx1) = handle(4000);
        let (second, _rx2) = handle(4001);
        let second_id = second.id();

        let first_registration = registry.register(MAC, first);
        let _second_registration = registry.register(MAC, second);

        assert_eq!(registry.lookup(MAC).unwrap().id(), second_id);
        assert_eq!(registry.len(), 1);

        // cleanup of the superseded session must not evict the new one
        drop(first_registration);
        assert_eq!(registry.lookup(MAC).unwrap().id(), second_id);
    }

    #[test]
    fn test_registration_drop_removes_entry() {
        let registry = Registry::new();
        let (h, _rx) = handle(4000);

        let registration = registry.register(MAC, h);
        assert!(!registry.is_empty());

        drop(registration);
        assert!(registry.lookup(MAC).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_if_checks_owner() {
        let registry = Registry::new();
        let (h, _rx) = handle(4000);
        let id = h.id();
        let _registration = registry.register(MAC, h);

        assert!(!registry.remove_if(MAC, Uuid::new_v4()));
        assert!(registry.remove_if(MAC, id));
        assert!(registry.remove(MAC).is_none());
    }

    #[test]
    fn test_superseded_session_sees_closed_queue() {
        tokio_test::block_on(async {
            let registry = Registry::new();
            let (first, mut first_rx) = handle(4000);
            let (second, _rx2) = handle(4001);

            let _a = registry.register(MAC, first);
            let _b = registry.register(MAC, second);

            assert!(first_rx.recv().await.is_none());
        });
    }

    #[test]
    fn test_push_reaches_session() {
        tokio_test::block_on(async {
            let (h, mut rx) = handle(4000);

            let ack = h.push(DeviceConfig::default()).unwrap();
            let request = rx.recv().await.unwrap();
            assert_eq!(request.config, DeviceConfig::default());

            request
                .reply
                .send(Ok(Response {
                    status: 200,
                    descr: "ok".to_string(),
                }))
                .unwrap();
            assert!(ack.await.unwrap().unwrap().is_ok());
        });
    }

    #[test]
    fn test_push_to_closed_session_fails() {
        let (h, rx) = handle(4000);
        drop(rx);

        let result = h.push(DeviceConfig::default());
        assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
    }

    #[test]
    fn test_push_to_full_queue_fails_without_waiting() {
        let (h, mut rx) = handle(4000);

        for _ in 0..4 {
            h.push(DeviceConfig::default()).unwrap();
        }
        let result = h.push(DeviceConfig::default());
        assert!(matches!(result, Err(Error::PushQueueFull(mac)) if mac == MAC));

        // room frees up as soon as the session takes one
        rx.try_recv().unwrap();
        assert!(h.push(DeviceConfig::default()).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations() {
        let registry = Registry::new();
        let mut tasks = Vec::new();

        for i in 0..64u16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let identity = format!("02:00:00:00:00:{:02X}", i);
                let (h, rx) = handle(5000 + i);
                let registration = registry.register(&identity, h);
                let found = registry.lookup(&identity).map(|h| h.id());
                (registration, rx, found)
            }));
        }

        let mut held = Vec::new();
        for task in tasks {
            let (registration, rx, found) = task.await.unwrap();
            assert_eq!(found, Some(registration.connection_id()));
            held.push((registration, rx));
        }

        assert_eq!(registry.len(), 64);
        held.clear();
        assert!(registry.is_empty());
    }
}
