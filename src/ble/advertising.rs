//! BLE advertisement.
//!
//! The peripheral advertises its local name and the sensor service UUID
//! so centrals can find it without connecting first.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::ble::manager::{BleManager, RegistrationHandle};
use crate::ble::service::BASE_PATH;
use crate::error::{Error, Result};

/// Advertising PDU type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AdvertisementType {
    /// Connectable peripheral.
    #[default]
    Peripheral,
    /// Non-connectable broadcaster.
    Broadcast,
}

impl std::fmt::Display for AdvertisementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peripheral => write!(f, "peripheral"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// An advertisement record and its registration.
pub struct Advertisement {
    index: usize,
    path: String,
    advertisement_type: AdvertisementType,
    local_name: String,
    service_uuids: BTreeSet<Uuid>,
    include_tx_power: bool,
    discoverable: bool,
    registration: Mutex<Option<(Arc<dyn BleManager>, RegistrationHandle)>>,
}

impl Advertisement {
    /// Create a connectable, discoverable advertisement.
    pub fn new(index: usize, local_name: impl Into<String>) -> Self {
        Self {
            index,
            path: format!("{}/advertisement{}", BASE_PATH, index),
            advertisement_type: AdvertisementType::Peripheral,
            local_name: local_name.into(),
            service_uuids: BTreeSet::new(),
            include_tx_power: false,
            discoverable: true,
            registration: Mutex::new(None),
        }
    }

    /// Advertise a service UUID.
    pub fn with_service_uuid(mut self, uuid: Uuid) -> Self {
        self.service_uuids.insert(uuid);
        self
    }

    /// Include the TX power level.
    pub fn with_tx_power(mut self) -> Self {
        self.include_tx_power = true;
        self
    }

    /// Set the advertising type.
    pub fn with_type(mut self, advertisement_type: AdvertisementType) -> Self {
        self.advertisement_type = advertisement_type;
        self
    }

    /// Index of this advertisement.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Object path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Advertising type.
    pub fn advertisement_type(&self) -> AdvertisementType {
        self.advertisement_type
    }

    /// Local name.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Advertised service UUIDs.
    pub fn service_uuids(&self) -> &BTreeSet<Uuid> {
        &self.service_uuids
    }

    /// Check if the TX power level is included.
    pub fn includes_tx_power(&self) -> bool {
        self.include_tx_power
    }

    /// Check if the advertisement is discoverable.
    pub fn is_discoverable(&self) -> bool {
        self.discoverable
    }

    /// Check if the advertisement is currently registered.
    pub fn is_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    /// Publish the advertisement through `manager`.
    ///
    /// A failure means the device will not be discoverable. It is logged
    /// and returned as [`Error::Registration`].
    pub async fn register(&self, manager: Arc<dyn BleManager>) -> Result<()> {
        if self.is_registered() {
            return Err(Error::InvalidState {
                operation: "register advertisement".to_string(),
                state: "registered".to_string(),
            });
        }

        let result = async {
            let adapter = manager.find_adapter().await?;
            manager.register_advertisement(&adapter, self).await
        }
        .await;

        match result {
            Ok(handle) => {
                info!(
                    "Advertising \"{}\" on {} ({} service UUIDs)",
                    self.local_name,
                    handle.adapter,
                    self.service_uuids.len()
                );
                *self.registration.lock() = Some((manager, handle));
                Ok(())
            }
            Err(e) => {
                error!("Failed to register advertisement {}: {}", self.path, e);
                Err(match e {
                    Error::Registration { .. } => e,
                    other => Error::Registration {
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Stop advertising. Idempotent.
    pub async fn unregister(&self) -> Result<()> {
        let registration = self.registration.lock().take();
        match registration {
            Some((manager, handle)) => {
                info!("Advertisement {} released", handle.path);
                manager.unregister_advertisement(handle).await
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advertisement")
            .field("path", &self.path)
            .field("type", &self.advertisement_type)
            .field("local_name", &self.local_name)
            .field("service_uuids", &self.service_uuids)
            .field("registered", &self.is_registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::loopback::LoopbackManager;
    use crate::ble::manager::{AdapterId, MockBleManager};
    use crate::ble::uuids::SENSOR_SERVICE_UUID;

    #[test]
    fn test_builder() {
        let adv = Advertisement::new(0, "HealthSensor")
            .with_service_uuid(SENSOR_SERVICE_UUID)
            .with_service_uuid(SENSOR_SERVICE_UUID)
            .with_tx_power();

        assert_eq!(adv.path(), "/org/bluez/healthsensor/advertisement0");
        assert_eq!(adv.advertisement_type(), AdvertisementType::Peripheral);
        assert_eq!(adv.local_name(), "HealthSensor");
        assert_eq!(adv.service_uuids().len(), 1);
        assert!(adv.includes_tx_power());
        assert!(adv.is_discoverable());
        assert!(!adv.is_registered());
    }

    #[tokio::test]
    async fn test_register_and_release() {
        let manager = Arc::new(LoopbackManager::new());
        let adv = Advertisement::new(0, "HealthSensor").with_service_uuid(SENSOR_SERVICE_UUID);

        adv.register(manager.clone()).await.unwrap();
        assert!(adv.is_registered());
        assert!(manager.is_advertising());

        assert!(matches!(
            adv.register(manager.clone()).await,
            Err(Error::InvalidState { .. })
        ));

        adv.unregister().await.unwrap();
        adv.unregister().await.unwrap();
        assert!(!adv.is_registered());
        assert!(!manager.is_advertising());
    }

    #[tokio::test]
    async fn test_missing_adapter_is_reported() {
        let adv = Advertisement::new(0, "HealthSensor");
        let err = adv
            .register(Arc::new(LoopbackManager::unavailable()))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Registration { .. }));
        assert!(!adv.is_registered());
    }

    #[tokio::test]
    async fn test_platform_rejection_is_reported() {
        let mut manager = MockBleManager::new();
        manager
            .expect_find_adapter()
            .returning(|| Ok(AdapterId("hci0".to_string())));
        manager
            .expect_register_advertisement()
            .times(1)
            .returning(|_, _| {
                Err(Error::Registration {
                    reason: "maximum advertisements reached".to_string(),
                })
            });

        let adv = Advertisement::new(3, "HealthSensor");
        let err = adv.register(Arc::new(manager)).await.unwrap_err();
        assert!(err.to_string().contains("maximum advertisements"));
    }
}
