//! BlueZ backend.
//!
//! Exports the GATT application and advertisement over D-Bus through the
//! `bluer` crate. Remote reads and subscriptions are not served here: each
//! callback forwards a request into the application's event loop and
//! relays the answer back to BlueZ.

use async_trait::async_trait;
use bluer::adv::{Advertisement as BluerAdvertisement, AdvertisementHandle, Feature, Type};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic as BluerCharacteristic, CharacteristicNotifier,
    CharacteristicNotify, CharacteristicNotifyMethod, CharacteristicRead, Descriptor as BluerDescriptor,
    DescriptorRead, ReqError, Service as BluerService,
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::ble::advertising::{Advertisement, AdvertisementType};
use crate::ble::application::GattRequestSender;
use crate::ble::characteristics::{Characteristic, CharacteristicFlag};
use crate::ble::manager::{AdapterId, ApplicationRegistration, BleManager, RegistrationHandle};
use crate::error::{Error, Result};

/// [`BleManager`] backed by the BlueZ daemon.
pub struct BluezManager {
    session: bluer::Session,
    adapter_name: Option<String>,
    applications: Mutex<HashMap<String, ApplicationHandle>>,
    advertisements: Mutex<HashMap<String, AdvertisementHandle>>,
}

impl BluezManager {
    /// Connect to BlueZ over the system bus.
    pub async fn new() -> Result<Self> {
        let session = bluer::Session::new().await?;
        Ok(Self {
            session,
            adapter_name: None,
            applications: Mutex::new(HashMap::new()),
            advertisements: Mutex::new(HashMap::new()),
        })
    }

    /// Use a specific adapter, such as `hci1`, instead of the default one.
    pub fn with_adapter(mut self, name: impl Into<String>) -> Self {
        self.adapter_name = Some(name.into());
        self
    }

    fn adapter(&self, id: &AdapterId) -> Result<bluer::Adapter> {
        self.session.adapter(&id.0).map_err(adapter_error)
    }
}

fn adapter_error(e: bluer::Error) -> Error {
    match e.kind {
        bluer::ErrorKind::NotFound => Error::AdapterNotFound,
        _ => Error::Bluetooth(e),
    }
}

fn request_failed(e: Error) -> ReqError {
    match e {
        Error::NotPermitted { .. } => ReqError::NotPermitted,
        _ => ReqError::Failed,
    }
}

/// Build the `bluer` view of one characteristic.
fn export_characteristic(
    characteristic: &Arc<Characteristic>,
    requests: &GattRequestSender,
) -> BluerCharacteristic {
    let path = characteristic.path().to_string();

    let read = characteristic.supports(CharacteristicFlag::Read).then(|| {
        let requests = requests.clone();
        let path = path.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |_req| {
                let requests = requests.clone();
                let path = path.clone();
                async move {
                    requests
                        .read(&path)
                        .await
                        .map(|data| data.to_vec())
                        .map_err(request_failed)
                }
                .boxed()
            }),
            ..Default::default()
        }
    });

    let notify = characteristic.supports(CharacteristicFlag::Notify).then(|| {
        let requests = requests.clone();
        let characteristic = characteristic.clone();
        CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                forward_notifications(characteristic.clone(), requests.clone(), notifier).boxed()
            })),
            ..Default::default()
        }
    });

    let descriptors = characteristic
        .descriptors()
        .iter()
        .enumerate()
        .map(|(index, descriptor)| {
            let requests = requests.clone();
            let desc_path = format!("{}/desc{}", path, index);
            BluerDescriptor {
                uuid: descriptor.uuid(),
                read: Some(DescriptorRead {
                    read: true,
                    fun: Box::new(move |_req| {
                        let requests = requests.clone();
                        let desc_path = desc_path.clone();
                        async move {
                            requests
                                .read(&desc_path)
                                .await
                                .map(|data| data.to_vec())
                                .map_err(request_failed)
                        }
                        .boxed()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect();

    BluerCharacteristic {
        uuid: characteristic.uuid(),
        read,
        notify,
        descriptors,
        ..Default::default()
    }
}

/// Relay one subscription until the central goes away.
async fn forward_notifications(
    characteristic: Arc<Characteristic>,
    requests: GattRequestSender,
    mut notifier: CharacteristicNotifier,
) {
    let path = characteristic.path().to_string();

    // Subscribe before starting so the immediate notification is not missed.
    let mut events = characteristic.subscribe_notifications();
    if let Err(e) = requests.start_notify(&path).await {
        warn!("StartNotify on {} failed: {}", path, e);
        return;
    }
    debug!("Central subscribed to {}", path);

    loop {
        match events.recv().await {
            Ok(event) => {
                if notifier.is_stopped() {
                    break;
                }
                if let Err(e) = notifier.notify(event.data.to_vec()).await {
                    debug!("Notification on {} not delivered: {}", path, e);
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                debug!("Dropped {} stale notifications on {}", skipped, path);
            }
            Err(RecvError::Closed) => break,
        }
    }

    if let Err(e) = requests.stop_notify(&path).await {
        debug!("StopNotify on {} failed: {}", path, e);
    }
    debug!("Central unsubscribed from {}", path);
}

#[async_trait]
impl BleManager for BluezManager {
    async fn find_adapter(&self) -> Result<AdapterId> {
        let adapter = match &self.adapter_name {
            Some(name) => self.session.adapter(name).map_err(adapter_error)?,
            None => self
                .session
                .default_adapter()
                .await
                .map_err(adapter_error)?,
        };

        adapter.set_powered(true).await?;
        info!(
            "Using Bluetooth adapter {} ({})",
            adapter.name(),
            adapter.address().await?
        );

        Ok(AdapterId(adapter.name().to_string()))
    }

    async fn register_application(
        &self,
        adapter: &AdapterId,
        application: ApplicationRegistration,
    ) -> Result<RegistrationHandle> {
        let bluez_adapter = self.adapter(adapter)?;

        let services = application
            .services
            .iter()
            .map(|service| BluerService {
                uuid: service.uuid(),
                primary: service.is_primary(),
                characteristics: service
                    .characteristics()
                    .iter()
                    .map(|c| export_characteristic(c, &application.requests))
                    .collect(),
                ..Default::default()
            })
            .collect();

        let handle = bluez_adapter
            .serve_gatt_application(Application {
                services,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Registration {
                reason: e.to_string(),
            })?;

        self.applications
            .lock()
            .insert(application.path.clone(), handle);

        Ok(RegistrationHandle {
            adapter: adapter.clone(),
            path: application.path,
        })
    }

    async fn unregister_application(&self, handle: RegistrationHandle) -> Result<()> {
        // Dropping the bluer handle withdraws the application.
        match self.applications.lock().remove(&handle.path) {
            Some(_) => Ok(()),
            None => Err(Error::Registration {
                reason: format!("application {} is not registered", handle.path),
            }),
        }
    }

    async fn register_advertisement(
        &self,
        adapter: &AdapterId,
        advertisement: &Advertisement,
    ) -> Result<RegistrationHandle> {
        let bluez_adapter = self.adapter(adapter)?;

        let mut system_includes = BTreeSet::new();
        if advertisement.includes_tx_power() {
            system_includes.insert(Feature::TxPower);
        }

        let record = BluerAdvertisement {
            advertisement_type: match advertisement.advertisement_type() {
                AdvertisementType::Peripheral => Type::Peripheral,
                AdvertisementType::Broadcast => Type::Broadcast,
            },
            service_uuids: advertisement.service_uuids().clone(),
            local_name: Some(advertisement.local_name().to_string()),
            discoverable: Some(advertisement.is_discoverable()),
            system_includes,
            ..Default::default()
        };

        let handle = bluez_adapter
            .advertise(record)
            .await
            .map_err(|e| Error::Registration {
                reason: e.to_string(),
            })?;

        self.advertisements
            .lock()
            .insert(advertisement.path().to_string(), handle);

        Ok(RegistrationHandle {
            adapter: adapter.clone(),
            path: advertisement.path().to_string(),
        })
    }

    async fn unregister_advertisement(&self, handle: RegistrationHandle) -> Result<()> {
        match self.advertisements.lock().remove(&handle.path) {
            Some(_) => Ok(()),
            None => Err(Error::Registration {
                reason: format!("advertisement {} is not registered", handle.path),
            }),
        }
    }
}

impl std::fmt::Debug for BluezManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluezManager")
            .field("adapter_name", &self.adapter_name)
            .field("applications", &self.applications.lock().len())
            .field("advertisements", &self.advertisements.lock().len())
            .finish()
    }
}
