//! In-memory BLE manager.
//!
//! [`LoopbackManager`] accepts registrations without any radio. It keeps
//! what was exported and hands out the request channel of the registered
//! application, so a local "central" can read and subscribe through the
//! same path a BlueZ client would take.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

use crate::ble::advertising::Advertisement;
use crate::ble::application::GattRequestSender;
use crate::ble::manager::{AdapterId, ApplicationRegistration, BleManager, RegistrationHandle};
use crate::error::{Error, Result};

/// Default adapter name reported by the loopback manager.
pub const LOOPBACK_ADAPTER: &str = "hci0";

/// What the loopback manager recorded for an advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    /// Local name.
    pub local_name: String,
    /// Advertised service UUIDs.
    pub service_uuids: BTreeSet<Uuid>,
}

#[derive(Default)]
struct LoopbackState {
    // Registration order.
    applications: Vec<ApplicationRegistration>,
    advertisements: HashMap<String, AdvertisementRecord>,
}

/// A [`BleManager`] that never leaves the process.
pub struct LoopbackManager {
    adapter: Option<AdapterId>,
    state: RwLock<LoopbackState>,
}

impl LoopbackManager {
    /// A manager with one adapter.
    pub fn new() -> Self {
        Self {
            adapter: Some(AdapterId(LOOPBACK_ADAPTER.to_string())),
            state: RwLock::new(LoopbackState::default()),
        }
    }

    /// A manager with no adapter; every registration fails.
    pub fn unavailable() -> Self {
        Self {
            adapter: None,
            state: RwLock::new(LoopbackState::default()),
        }
    }

    /// Request channel of the most recently registered application.
    pub fn requests(&self) -> Option<GattRequestSender> {
        self.state
            .read()
            .applications
            .last()
            .map(|app| app.requests.clone())
    }

    /// Number of registered applications.
    pub fn application_count(&self) -> usize {
        self.state.read().applications.len()
    }

    /// Check if any advertisement is registered.
    pub fn is_advertising(&self) -> bool {
        !self.state.read().advertisements.is_empty()
    }

    /// Registered advertisements.
    pub fn advertisements(&self) -> Vec<AdvertisementRecord> {
        self.state.read().advertisements.values().cloned().collect()
    }

    fn check_adapter(&self, adapter: &AdapterId) -> Result<()> {
        match &self.adapter {
            Some(own) if own == adapter => Ok(()),
            _ => Err(Error::AdapterNotFound),
        }
    }
}

impl Default for LoopbackManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleManager for LoopbackManager {
    async fn find_adapter(&self) -> Result<AdapterId> {
        self.adapter.clone().ok_or(Error::AdapterNotFound)
    }

    async fn register_application(
        &self,
        adapter: &AdapterId,
        application: ApplicationRegistration,
    ) -> Result<RegistrationHandle> {
        self.check_adapter(adapter)?;

        let path = application.path.clone();
        let mut state = self.state.write();
        if state.applications.iter().any(|app| app.path == path) {
            return Err(Error::Registration {
                reason: format!("application {} already exists", path),
            });
        }

        debug!(
            "Loopback: application {} with {} services",
            path,
            application.services.len()
        );
        state.applications.push(application);

        Ok(RegistrationHandle {
            adapter: adapter.clone(),
            path,
        })
    }

    async fn unregister_application(&self, handle: RegistrationHandle) -> Result<()> {
        let mut state = self.state.write();
        let position = state
            .applications
            .iter()
            .position(|app| app.path == handle.path)
            .ok_or_else(|| Error::Registration {
                reason: format!("application {} does not exist", handle.path),
            })?;
        state.applications.remove(position);
        Ok(())
    }

    async fn register_advertisement(
        &self,
        adapter: &AdapterId,
        advertisement: &Advertisement,
    ) -> Result<RegistrationHandle> {
        self.check_adapter(adapter)?;

        let path = advertisement.path().to_string();
        let mut state = self.state.write();
        if state.advertisements.contains_key(&path) {
            return Err(Error::Registration {
                reason: format!("advertisement {} already exists", path),
            });
        }

        debug!("Loopback: advertising \"{}\"", advertisement.local_name());
        state.advertisements.insert(
            path.clone(),
            AdvertisementRecord {
                local_name: advertisement.local_name().to_string(),
                service_uuids: advertisement.service_uuids().clone(),
            },
        );

        Ok(RegistrationHandle {
            adapter: adapter.clone(),
            path,
        })
    }

    async fn unregister_advertisement(&self, handle: RegistrationHandle) -> Result<()> {
        self.state
            .write()
            .advertisements
            .remove(&handle.path)
            .map(|_| ())
            .ok_or(Error::Registration {
                reason: format!("advertisement {} does not exist", handle.path),
            })
    }
}

impl std::fmt::Debug for LoopbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("LoopbackManager")
            .field("adapter", &self.adapter)
            .field("applications", &state.applications.len())
            .field("advertisements", &state.advertisements.len())
            .finish()
    }
}
