//! GATT application and its request event loop.
//!
//! A [`GattApplication`] groups the exported services and owns the event
//! loop that serves them. The platform side never touches characteristics
//! itself: it turns every remote Read/Write/StartNotify/StopNotify into a
//! [`GattRequest`] and sends it through a [`GattRequestSender`]. The loop in
//! [`GattApplication::run`] dispatches requests one at a time until
//! [`GattApplication::quit`] is called, from any task or thread.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::ble::characteristics::Characteristic;
use crate::ble::manager::{AdapterId, ApplicationRegistration, BleManager, RegistrationHandle};
use crate::ble::service::{Service, BASE_PATH};
use crate::config::{GATT_REQUEST_QUEUE, GATT_REQUEST_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::CharacteristicKind;

/// Lifecycle of a GATT application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ApplicationState {
    /// Services may still be added.
    #[default]
    Constructed,
    /// Exported on an adapter, event loop not started.
    Registered,
    /// Event loop is dispatching requests.
    Running,
    /// Event loop has returned.
    Stopped,
}

impl ApplicationState {
    /// Check if the application is exported on an adapter.
    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Registered | Self::Running)
    }

    /// Check if the event loop is active.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ApplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constructed => write!(f, "Constructed"),
            Self::Registered => write!(f, "Registered"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Operation requested by a remote central.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOperation {
    /// Read the attribute value.
    Read,
    /// Write a value. Always rejected, no attribute here is writable.
    Write(Vec<u8>),
    /// Subscribe to notifications.
    StartNotify,
    /// Unsubscribe from notifications.
    StopNotify,
}

impl std::fmt::Display for GattOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "Read"),
            Self::Write(_) => write!(f, "Write"),
            Self::StartNotify => write!(f, "StartNotify"),
            Self::StopNotify => write!(f, "StopNotify"),
        }
    }
}

/// A request waiting to be handled by the event loop.
#[derive(Debug)]
pub struct GattRequest {
    /// Object path of the target characteristic or descriptor.
    pub path: String,
    /// What the central asked for.
    pub operation: GattOperation,
    reply: oneshot::Sender<Result<Bytes>>,
}

/// Sending half of the event loop's request queue.
#[derive(Debug, Clone)]
pub struct GattRequestSender {
    tx: mpsc::Sender<GattRequest>,
    timeout: Duration,
}

impl GattRequestSender {
    /// Submit a request and wait for the loop to answer it.
    ///
    /// Fails with [`Error::Timeout`] if the loop does not answer within the
    /// request timeout, e.g. because it is not running.
    pub async fn request(&self, path: &str, operation: GattOperation) -> Result<Bytes> {
        let (reply, response) = oneshot::channel();
        let request = GattRequest {
            path: path.to_string(),
            operation,
            reply,
        };

        let exchange = async {
            self.tx
                .send(request)
                .await
                .map_err(|_| Error::Internal("GATT event loop is gone".to_string()))?;
            response
                .await
                .map_err(|_| Error::Internal("GATT request dropped".to_string()))?
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Read a characteristic or descriptor.
    pub async fn read(&self, path: &str) -> Result<Bytes> {
        self.request(path, GattOperation::Read).await
    }

    /// Write a characteristic or descriptor.
    pub async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.request(path, GattOperation::Write(data.to_vec()))
            .await
            .map(|_| ())
    }

    /// Subscribe to a characteristic.
    pub async fn start_notify(&self, path: &str) -> Result<()> {
        self.request(path, GattOperation::StartNotify)
            .await
            .map(|_| ())
    }

    /// Unsubscribe from a characteristic.
    pub async fn stop_notify(&self, path: &str) -> Result<()> {
        self.request(path, GattOperation::StopNotify)
            .await
            .map(|_| ())
    }
}

/// Handle that stops a running event loop.
///
/// Safe to use from any task, thread or signal handler. A quit issued
/// before the loop starts is kept and makes `run` return right away.
#[derive(Debug, Clone, Default)]
pub struct QuitHandle {
    quit: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl QuitHandle {
    /// Ask the event loop to return. Idempotent.
    pub fn quit(&self) {
        if !self.quit.swap(true, Ordering::SeqCst) {
            self.notify.notify_one();
        }
    }

    /// Check if quit was requested.
    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        while !self.is_quit() {
            self.notify.notified().await;
        }
    }
}

/// A set of GATT services exported through a [`BleManager`].
pub struct GattApplication {
    path: String,
    services: RwLock<Vec<Arc<Service>>>,
    state: RwLock<ApplicationState>,
    request_tx: mpsc::Sender<GattRequest>,
    request_rx: Mutex<Option<mpsc::Receiver<GattRequest>>>,
    request_timeout: Duration,
    quit: QuitHandle,
    adapter: RwLock<Option<AdapterId>>,
    registration: Mutex<Option<(Arc<dyn BleManager>, RegistrationHandle)>>,
}

impl GattApplication {
    /// Create an application with no services.
    pub fn new() -> Self {
        let (request_tx, request_rx) = mpsc::channel(GATT_REQUEST_QUEUE);

        Self {
            path: BASE_PATH.to_string(),
            services: RwLock::new(Vec::new()),
            state: RwLock::new(ApplicationState::Constructed),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
            request_timeout: GATT_REQUEST_TIMEOUT,
            quit: QuitHandle::default(),
            adapter: RwLock::new(None),
            registration: Mutex::new(None),
        }
    }

    /// Create an application exporting the health sensor service.
    pub fn health_sensor(notify_period: Duration) -> Self {
        let app = Self::new();
        app.services
            .write()
            .push(Arc::new(Service::health_sensor(0, notify_period)));
        app
    }

    /// Set how long remote requests may wait for the loop.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Root object path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ApplicationState {
        *self.state.read()
    }

    /// Adapter the application is exported on, once registered.
    pub fn adapter(&self) -> Option<AdapterId> {
        self.adapter.read().clone()
    }

    /// Add a service. Only valid before registration.
    pub fn add_service(&self, service: Service) -> Result<Arc<Service>> {
        let state = self.state.read();
        if *state != ApplicationState::Constructed {
            return Err(Error::InvalidState {
                operation: "add service".to_string(),
                state: state.to_string(),
            });
        }

        let service = Arc::new(service);
        self.services.write().push(service.clone());
        Ok(service)
    }

    /// Exported services in order.
    pub fn services(&self) -> Vec<Arc<Service>> {
        self.services.read().clone()
    }

    /// First characteristic carrying `kind`, across all services.
    pub fn characteristic(&self, kind: CharacteristicKind) -> Option<Arc<Characteristic>> {
        self.services
            .read()
            .iter()
            .find_map(|s| s.characteristic(kind).cloned())
    }

    /// Characteristic exported at `path`.
    pub fn find_characteristic(&self, path: &str) -> Option<Arc<Characteristic>> {
        self.services
            .read()
            .iter()
            .find_map(|s| s.find_by_path(path).cloned())
    }

    /// A sender for submitting requests to the event loop.
    pub fn requests(&self) -> GattRequestSender {
        GattRequestSender {
            tx: self.request_tx.clone(),
            timeout: self.request_timeout,
        }
    }

    /// A handle that can stop the event loop from elsewhere.
    pub fn quit_handle(&self) -> QuitHandle {
        self.quit.clone()
    }

    /// Export the application through `manager`.
    ///
    /// Performs a single attempt. Any failure, including a missing adapter,
    /// is returned as [`Error::Registration`] and left to the caller to
    /// retry or give up.
    pub async fn register(&self, manager: Arc<dyn BleManager>) -> Result<()> {
        let state = self.state();
        if state != ApplicationState::Constructed {
            return Err(Error::InvalidState {
                operation: "register application".to_string(),
                state: state.to_string(),
            });
        }

        let registration = ApplicationRegistration {
            path: self.path.clone(),
            services: self.services(),
            requests: self.requests(),
        };

        let result = async {
            let adapter = manager.find_adapter().await?;
            let handle = manager
                .register_application(&adapter, registration)
                .await?;
            Ok::<_, Error>((adapter, handle))
        }
        .await;

        match result {
            Ok((adapter, handle)) => {
                info!("GATT application {} registered on {}", self.path, adapter);
                *self.adapter.write() = Some(adapter);
                *self.registration.lock() = Some((manager, handle));
                *self.state.write() = ApplicationState::Registered;
                Ok(())
            }
            Err(e) => {
                error!("Failed to register GATT application {}: {}", self.path, e);
                Err(match e {
                    Error::Registration { .. } => e,
                    other => Error::Registration {
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// Withdraw the application from the platform. Idempotent.
    ///
    /// Stops all notifications. A registered but never run application goes
    /// back to `Constructed`.
    pub async fn unregister(&self) -> Result<()> {
        let registration = self.registration.lock().take();

        self.stop_notifications();

        let Some((manager, handle)) = registration else {
            return Ok(());
        };

        *self.adapter.write() = None;
        {
            let mut state = self.state.write();
            if *state == ApplicationState::Registered {
                *state = ApplicationState::Constructed;
            }
        }

        debug!("Unregistering GATT application {}", handle.path);
        manager.unregister_application(handle).await
    }

    /// Dispatch requests until [`quit`](Self::quit) is called.
    ///
    /// Requires a registered application. On return every characteristic
    /// has stopped notifying and the state is `Stopped`.
    pub async fn run(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            if *state != ApplicationState::Registered {
                return Err(Error::InvalidState {
                    operation: "run event loop".to_string(),
                    state: state.to_string(),
                });
            }
            *state = ApplicationState::Running;
        }

        let Some(mut rx) = self.request_rx.lock().take() else {
            *self.state.write() = ApplicationState::Stopped;
            return Err(Error::Internal("GATT request queue already taken".to_string()));
        };

        info!("GATT event loop running");

        loop {
            tokio::select! {
                _ = self.quit.wait() => break,
                request = rx.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
            }
        }

        // Anything still queued gets an answer instead of a timeout.
        rx.close();
        while let Ok(request) = rx.try_recv() {
            let _ = request.reply.send(Err(Error::InvalidState {
                operation: request.operation.to_string(),
                state: ApplicationState::Stopped.to_string(),
            }));
        }

        *self.state.write() = ApplicationState::Stopped;
        self.stop_notifications();

        info!("GATT event loop stopped");
        Ok(())
    }

    /// Make [`run`](Self::run) return. Safe from any context.
    pub fn quit(&self) {
        self.quit.quit();
    }

    /// Stop notifications on every characteristic.
    pub fn stop_notifications(&self) {
        for service in self.services.read().iter() {
            service.stop_notifications();
        }
    }

    fn handle(&self, request: GattRequest) {
        trace!("GATT {} on {}", request.operation, request.path);

        let result = self.dispatch(&request.path, request.operation);
        if let Err(e) = &result {
            warn!("GATT request on {} rejected: {}", request.path, e);
        }

        // The requester may have timed out already.
        let _ = request.reply.send(result);
    }

    /// Apply one request to the attribute at `path`.
    pub fn dispatch(&self, path: &str, operation: GattOperation) -> Result<Bytes> {
        if let Some((char_path, index)) = split_descriptor_path(path) {
            let descriptor = self
                .find_characteristic(char_path)
                .and_then(|c| c.descriptors().get(index).cloned())
                .ok_or_else(|| Error::CharacteristicNotFound {
                    path: path.to_string(),
                })?;

            return match operation {
                GattOperation::Read => Ok(descriptor.read()),
                other => Err(Error::NotPermitted {
                    operation: format!("{} on descriptor {}", other, path),
                }),
            };
        }

        let characteristic =
            self.find_characteristic(path)
                .ok_or_else(|| Error::CharacteristicNotFound {
                    path: path.to_string(),
                })?;

        match operation {
            GattOperation::Read => Ok(characteristic.read()),
            GattOperation::StartNotify => {
                characteristic.start_notify();
                Ok(Bytes::new())
            }
            GattOperation::StopNotify => {
                characteristic.stop_notify();
                Ok(Bytes::new())
            }
            GattOperation::Write(_) => Err(Error::NotPermitted {
                operation: format!("Write on {}", path),
            }),
        }
    }
}

impl Default for GattApplication {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GattApplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GattApplication")
            .field("path", &self.path)
            .field("state", &self.state())
            .field("services", &self.services.read().len())
            .finish()
    }
}

/// Split `<characteristic>/desc<N>` into its parts.
fn split_descriptor_path(path: &str) -> Option<(&str, usize)> {
    let (parent, last) = path.rsplit_once('/')?;
    let index = last.strip_prefix("desc")?.parse().ok()?;
    Some((parent, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::loopback::LoopbackManager;
    use crate::ble::manager::MockBleManager;
    use crate::config::DEFAULT_NOTIFY_PERIOD;
    use uuid::Uuid;

    const HR_PATH: &str = "/org/bluez/healthsensor/service0/char0";
    const O2_PATH: &str = "/org/bluez/healthsensor/service0/char1";

    async fn running_app() -> (Arc<GattApplication>, tokio::task::JoinHandle<Result<()>>) {
        let app = Arc::new(GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD));
        app.register(Arc::new(LoopbackManager::new())).await.unwrap();

        let runner = app.clone();
        let task = tokio::spawn(async move { runner.run().await });
        (app, task)
    }

    #[test]
    fn test_split_descriptor_path() {
        assert_eq!(
            split_descriptor_path("/a/service0/char1/desc0"),
            Some(("/a/service0/char1", 0))
        );
        assert_eq!(split_descriptor_path("/a/service0/char1"), None);
        assert_eq!(split_descriptor_path("/a/service0/char1/descx"), None);
    }

    #[test]
    fn test_dispatch_without_loop() {
        let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);

        assert_eq!(app.dispatch(HR_PATH, GattOperation::Read).unwrap().as_ref(), b"0");
        assert_eq!(
            app.dispatch(&format!("{}/desc0", O2_PATH), GattOperation::Read)
                .unwrap()
                .as_ref(),
            b"Oxygen Saturation (%)"
        );
        assert!(matches!(
            app.dispatch(HR_PATH, GattOperation::Write(b"99".to_vec())),
            Err(Error::NotPermitted { .. })
        ));
        assert!(matches!(
            app.dispatch("/nowhere", GattOperation::Read),
            Err(Error::CharacteristicNotFound { .. })
        ));
        assert!(matches!(
            app.dispatch(&format!("{}/desc7", HR_PATH), GattOperation::Read),
            Err(Error::CharacteristicNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_service_only_before_registration() {
        let app = GattApplication::new();
        app.add_service(Service::new(0, Uuid::nil(), true)).unwrap();

        app.register(Arc::new(LoopbackManager::new())).await.unwrap();
        assert_eq!(app.state(), ApplicationState::Registered);
        assert_eq!(app.adapter(), Some(AdapterId("hci0".to_string())));

        let err = app
            .add_service(Service::new(1, Uuid::nil(), true))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(app.services().len(), 1);
    }

    #[tokio::test]
    async fn test_register_without_adapter_fails_once() {
        let mut manager = MockBleManager::new();
        manager
            .expect_find_adapter()
            .times(1)
            .returning(|| Err(Error::AdapterNotFound));
        manager.expect_register_application().never();

        let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);
        let err = app.register(Arc::new(manager)).await.unwrap_err();

        assert!(matches!(err, Error::Registration { .. }));
        assert!(err.is_registration_failure());
        assert_eq!(app.state(), ApplicationState::Constructed);
        assert!(app.adapter().is_none());
    }

    #[tokio::test]
    async fn test_register_rejected_by_platform() {
        let mut manager = MockBleManager::new();
        manager
            .expect_find_adapter()
            .returning(|| Ok(AdapterId("hci1".to_string())));
        manager
            .expect_register_application()
            .times(1)
            .returning(|_, _| {
                Err(Error::Registration {
                    reason: "org.bluez.Error.AlreadyExists".to_string(),
                })
            });

        let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);
        let err = app.register(Arc::new(manager)).await.unwrap_err();
        assert!(err.to_string().contains("AlreadyExists"));
    }

    #[tokio::test]
    async fn test_run_requires_registration() {
        let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);
        assert!(matches!(app.run().await, Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_requests_are_dispatched() {
        let (app, task) = running_app().await;
        let requests = app.requests();

        assert_eq!(requests.read(HR_PATH).await.unwrap().as_ref(), b"0");

        app.characteristic(CharacteristicKind::HeartRate)
            .unwrap()
            .update(72)
            .unwrap();
        assert_eq!(requests.read(HR_PATH).await.unwrap().as_ref(), b"72");

        assert!(matches!(
            requests.write(O2_PATH, b"50").await,
            Err(Error::NotPermitted { .. })
        ));
        assert_eq!(app.characteristic(CharacteristicKind::Oxygen).unwrap().read().as_ref(), b"0");

        requests.start_notify(O2_PATH).await.unwrap();
        assert!(app.find_characteristic(O2_PATH).unwrap().is_notifying());
        requests.stop_notify(O2_PATH).await.unwrap();
        assert!(!app.find_characteristic(O2_PATH).unwrap().is_notifying());

        app.quit();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_quit_stops_loop_and_notifications() {
        let (app, task) = running_app().await;
        let requests = app.requests();

        requests.start_notify(HR_PATH).await.unwrap();
        assert_eq!(app.state(), ApplicationState::Running);

        // Quit from another task, as a signal handler would.
        let quit = app.quit_handle();
        std::thread::spawn(move || quit.quit()).join().unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(app.state(), ApplicationState::Stopped);
        assert!(!app.characteristic(CharacteristicKind::HeartRate).unwrap().is_notifying());
    }

    #[tokio::test]
    async fn test_quit_before_run_is_kept() {
        let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);
        app.register(Arc::new(LoopbackManager::new())).await.unwrap();

        app.quit();
        app.quit();

        tokio::time::timeout(Duration::from_secs(1), app.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(app.state(), ApplicationState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_times_out_without_loop() {
        let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);
        let err = app.requests().read(HR_PATH).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let manager = Arc::new(LoopbackManager::new());
        let app = GattApplication::health_sensor(DEFAULT_NOTIFY_PERIOD);

        app.unregister().await.unwrap();

        app.register(manager.clone()).await.unwrap();
        assert_eq!(manager.application_count(), 1);

        app.unregister().await.unwrap();
        app.unregister().await.unwrap();
        assert_eq!(manager.application_count(), 0);
        assert_eq!(app.state(), ApplicationState::Constructed);
    }
}
