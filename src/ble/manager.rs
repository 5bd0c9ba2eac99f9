//! Platform BLE manager abstraction.
//!
//! The GATT server never talks to the Bluetooth stack directly. It goes
//! through a [`BleManager`], which finds an adapter and exports
//! applications and advertisements on it. `bluez::BluezManager` drives a
//! real BlueZ daemon; [`LoopbackManager`](crate::ble::LoopbackManager) keeps
//! everything in memory.

use async_trait::async_trait;
use std::sync::Arc;

use crate::ble::advertising::Advertisement;
use crate::ble::application::GattRequestSender;
use crate::ble::service::Service;
use crate::error::Result;

/// Identifier of a Bluetooth adapter, such as `hci0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterId(pub String);

impl std::fmt::Display for AdapterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receipt for an exported application or advertisement.
///
/// Handed back to the manager to undo the registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    /// Adapter the object was exported on.
    pub adapter: AdapterId,
    /// Object path of the exported application or advertisement.
    pub path: String,
}

/// Everything a manager needs to export a GATT application.
#[derive(Debug, Clone)]
pub struct ApplicationRegistration {
    /// Root object path of the application.
    pub path: String,
    /// Services in export order.
    pub services: Vec<Arc<Service>>,
    /// Channel into the application's event loop.
    ///
    /// Remote reads and subscription changes are forwarded through here
    /// rather than touching characteristics directly.
    pub requests: GattRequestSender,
}

/// The platform's Bluetooth manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleManager: Send + Sync {
    /// Find an adapter that supports GATT server and advertising roles.
    ///
    /// Fails with [`Error::AdapterNotFound`](crate::Error::AdapterNotFound)
    /// when there is none.
    async fn find_adapter(&self) -> Result<AdapterId>;

    /// Export a GATT application on `adapter`.
    async fn register_application(
        &self,
        adapter: &AdapterId,
        application: ApplicationRegistration,
    ) -> Result<RegistrationHandle>;

    /// Withdraw a previously exported application.
    async fn unregister_application(&self, handle: RegistrationHandle) -> Result<()>;

    /// Start advertising on `adapter`.
    async fn register_advertisement(
        &self,
        adapter: &AdapterId,
        advertisement: &Advertisement,
    ) -> Result<RegistrationHandle>;

    /// Stop a previously registered advertisement.
    async fn unregister_advertisement(&self, handle: RegistrationHandle) -> Result<()>;
}
