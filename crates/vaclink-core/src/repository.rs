//! Async lookup and persistence seams.
//!
//! The transport layer talks to storage only through these traits: device
//! lookup during identity reconciliation and durable tracking of live
//! connections. The in-memory implementations back the daemon's default
//! wiring and the test suites; durable backends are an external concern.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::device::Device;
use crate::identity::{DeviceId, DeviceSerial};

/// Storage backend failure.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The backend rejected or failed the operation.
    #[error("repository backend failure: {0}")]
    Backend(String),
}

/// Lookup and persistence for device aggregates.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    /// Finds a device by its 32-bit identity.
    async fn find_one_by_id(&self, id: DeviceId) -> Result<Option<Arc<Device>>, RepositoryError>;

    /// Finds a device by its serial number.
    async fn find_one_by_serial(
        &self,
        serial: &DeviceSerial,
    ) -> Result<Option<Arc<Device>>, RepositoryError>;

    /// Inserts or replaces a device.
    async fn save_one(&self, device: Arc<Device>) -> Result<(), RepositoryError>;
}

/// Durable record of a live connection and its device association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Connection identity.
    pub id: Uuid,
    /// Associated device, if any.
    pub device_id: Option<DeviceId>,
}

/// Persistence for live connection records.
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Inserts or replaces a connection record.
    async fn save_one(&self, record: ConnectionRecord) -> Result<(), RepositoryError>;

    /// Removes a connection record; removing an absent record is a no-op.
    async fn remove_one(&self, id: Uuid) -> Result<(), RepositoryError>;
}

/// In-memory device repository.
#[derive(Default)]
pub struct InMemoryDeviceRepository {
    devices: RwLock<HashMap<DeviceId, Arc<Device>>>,
}

impl InMemoryDeviceRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRepository for InMemoryDeviceRepository {
    async fn find_one_by_id(&self, id: DeviceId) -> Result<Option<Arc<Device>>, RepositoryError> {
        Ok(self.devices.read().await.get(&id).cloned())
    }

    async fn find_one_by_serial(
        &self,
        serial: &DeviceSerial,
    ) -> Result<Option<Arc<Device>>, RepositoryError> {
        Ok(self
            .devices
            .read()
            .await
            .values()
            .find(|device| device.serial() == serial)
            .cloned())
    }

    async fn save_one(&self, device: Arc<Device>) -> Result<(), RepositoryError> {
        self.devices.write().await.insert(device.id(), device);
        Ok(())
    }
}

/// In-memory connection store.
#[derive(Default)]
pub struct InMemoryConnectionStore {
    records: RwLock<HashMap<Uuid, ConnectionRecord>>,
}

impl InMemoryConnectionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `id`, if present.
    pub async fn find_one(&self, id: Uuid) -> Option<ConnectionRecord> {
        self.records.read().await.get(&id).cloned()
    }

    /// Snapshot of all records.
    pub async fn all(&self) -> Vec<ConnectionRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl ConnectionStore for InMemoryConnectionStore {
    async fn save_one(&self, record: ConnectionRecord) -> Result<(), RepositoryError> {
        self.records.write().await.insert(record.id, record);
        Ok(())
    }

    async fn remove_one(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.records.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::System;
    use crate::identity::UserId;

    fn device(id: u32, serial: &str) -> Arc<Device> {
        Arc::new(Device::new(
            DeviceId::from_raw(id),
            UserId::from_raw(1),
            DeviceSerial::new(serial).unwrap(),
            System::default(),
        ))
    }

    #[tokio::test]
    async fn find_by_id_and_serial() {
        let repo = InMemoryDeviceRepository::new();
        repo.save_one(device(7, "SN-7")).await.unwrap();

        let by_id = repo.find_one_by_id(DeviceId::from_raw(7)).await.unwrap();
        assert!(by_id.is_some());

        let serial = DeviceSerial::new("SN-7").unwrap();
        let by_serial = repo.find_one_by_serial(&serial).await.unwrap();
        assert_eq!(by_serial.unwrap().id(), DeviceId::from_raw(7));

        let missing = repo.find_one_by_id(DeviceId::from_raw(8)).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn connection_records_round_trip() {
        let store = InMemoryConnectionStore::new();
        let id = Uuid::new_v4();
        store
            .save_one(ConnectionRecord {
                id,
                device_id: Some(DeviceId::from_raw(7)),
            })
            .await
            .unwrap();

        let record = store.find_one(id).await.unwrap();
        assert_eq!(record.device_id, Some(DeviceId::from_raw(7)));

        store.remove_one(id).await.unwrap();
        assert!(store.find_one(id).await.is_none());
        // Removing twice is a no-op.
        store.remove_one(id).await.unwrap();
    }
}
