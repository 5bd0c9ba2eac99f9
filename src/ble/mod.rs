//! BLE peripheral module.
//!
//! This module provides the GATT server side: characteristics and their
//! notify timers, services, the application event loop, advertising, and
//! the platform managers that export them.

pub mod advertising;
pub mod application;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod characteristics;
pub mod loopback;
pub mod manager;
pub mod service;
pub mod timer;
pub mod uuids;

pub use advertising::{Advertisement, AdvertisementType};
pub use application::{
    ApplicationState, GattApplication, GattOperation, GattRequest, GattRequestSender, QuitHandle,
};
#[cfg(feature = "bluez")]
pub use bluez::BluezManager;
pub use characteristics::{
    Characteristic, CharacteristicFlag, Descriptor, NotificationEvent, NotificationSource,
};
pub use loopback::LoopbackManager;
pub use manager::{AdapterId, ApplicationRegistration, BleManager, RegistrationHandle};
pub use service::Service;
pub use timer::NotifyTimer;
pub use uuids::*;
