//! GATT characteristic handling.
//!
//! Provides the server-side characteristics of the health sensor service:
//! their current value, notify subscription state, and the notification
//! events pushed to subscribed centrals.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::timer::NotifyTimer;
use crate::ble::uuids::USER_DESCRIPTION_UUID;
use crate::config::DEFAULT_NOTIFY_PERIOD;
use crate::error::Result;
use crate::protocol::{CharacteristicKind, CharacteristicValue};

/// What caused a notification to be emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationSource {
    /// The immediate notification sent when a central subscribes.
    Subscribed,
    /// A new value was stored while subscribed.
    Updated,
    /// The periodic notify timer fired.
    Timer,
}

/// Notification event from a characteristic.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    /// UUID of the characteristic that sent the notification.
    pub characteristic_uuid: Uuid,
    /// Kind of the characteristic.
    pub kind: CharacteristicKind,
    /// The notification data.
    pub data: Bytes,
    /// Why the notification was sent.
    pub source: NotificationSource,
}

/// GATT characteristic flags supported by this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicFlag {
    /// Centrals may read the value.
    Read,
    /// Centrals may subscribe to notifications.
    Notify,
}

impl CharacteristicFlag {
    /// The BlueZ flag string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Notify => "notify",
        }
    }
}

/// A read-only descriptor with a static value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    uuid: Uuid,
    value: &'static str,
}

impl Descriptor {
    /// A Characteristic User Description (0x2901) descriptor.
    pub fn user_description(text: &'static str) -> Self {
        Self {
            uuid: USER_DESCRIPTION_UUID,
            value: text,
        }
    }

    /// Descriptor UUID.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Descriptor text.
    pub fn text(&self) -> &'static str {
        self.value
    }

    /// Read the descriptor value as ASCII bytes.
    pub fn read(&self) -> Bytes {
        Bytes::from_static(self.value.as_bytes())
    }
}

struct CharacteristicState {
    value: CharacteristicValue,
    encoded: Bytes,
    subscribed: bool,
    /// Bumped on every subscribe, so a timer armed by an earlier
    /// subscription can tell it has been superseded.
    notify_epoch: u64,
}

/// Sends one notification carrying the current value.
#[derive(Clone)]
struct Notifier {
    uuid: Uuid,
    kind: CharacteristicKind,
    tx: broadcast::Sender<NotificationEvent>,
}

impl Notifier {
    fn emit(&self, state: &CharacteristicState, source: NotificationSource) {
        trace!(
            "Notify {} ({:?}): {:02X?}",
            self.kind,
            source,
            state.encoded.as_ref()
        );

        // No receivers just means no central is listening right now.
        let _ = self.tx.send(NotificationEvent {
            characteristic_uuid: self.uuid,
            kind: self.kind,
            data: state.encoded.clone(),
            source,
        });
    }
}

/// A server-side characteristic carrying one kind of reading.
///
/// Value and subscription state sit behind a single lock. Every mutation,
/// whether it comes from the sensor loop, a remote request, or the notify
/// timer, goes through that lock, and notifications are emitted while it is
/// held, so subscribers observe values in the order they were stored.
pub struct Characteristic {
    kind: CharacteristicKind,
    path: String,
    flags: Vec<CharacteristicFlag>,
    descriptors: Vec<Descriptor>,
    state: Arc<RwLock<CharacteristicState>>,
    notifier: Notifier,
    notify_period: Duration,
    timer: Mutex<Option<NotifyTimer>>,
}

impl Characteristic {
    /// Create a Read/Notify characteristic with its user-description descriptor.
    pub fn new(kind: CharacteristicKind) -> Self {
        let (tx, _) = broadcast::channel(64);
        let value = CharacteristicValue::zero(kind);

        Self {
            kind,
            path: String::new(),
            flags: vec![CharacteristicFlag::Notify, CharacteristicFlag::Read],
            descriptors: vec![Descriptor::user_description(kind.description())],
            state: Arc::new(RwLock::new(CharacteristicState {
                value,
                encoded: value.encode(),
                subscribed: false,
                notify_epoch: 0,
            })),
            notifier: Notifier {
                uuid: kind.uuid(),
                kind,
                tx,
            },
            notify_period: DEFAULT_NOTIFY_PERIOD,
            timer: Mutex::new(None),
        }
    }

    /// Set the periodic notification interval.
    pub fn with_notify_period(mut self, period: Duration) -> Self {
        self.notify_period = period;
        self
    }

    /// Assign the object path. Done by the owning service.
    pub(crate) fn set_path(&mut self, path: String) {
        self.path = path;
    }

    /// Kind of reading carried.
    pub fn kind(&self) -> CharacteristicKind {
        self.kind
    }

    /// Characteristic UUID.
    pub fn uuid(&self) -> Uuid {
        self.kind.uuid()
    }

    /// Object path, stable for the lifetime of the owning application.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Supported operations.
    pub fn flags(&self) -> &[CharacteristicFlag] {
        &self.flags
    }

    /// Check if an operation is supported.
    pub fn supports(&self, flag: CharacteristicFlag) -> bool {
        self.flags.contains(&flag)
    }

    /// Attached descriptors.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    /// Periodic notification interval.
    pub fn notify_period(&self) -> Duration {
        self.notify_period
    }

    /// Read the current encoded value. Never fails.
    pub fn read(&self) -> Bytes {
        self.state.read().encoded.clone()
    }

    /// The current value.
    pub fn value(&self) -> CharacteristicValue {
        self.state.read().value
    }

    /// Check if a central is subscribed.
    pub fn is_notifying(&self) -> bool {
        self.state.read().subscribed
    }

    /// Get a receiver for notification events.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<NotificationEvent> {
        self.notifier.tx.subscribe()
    }

    /// Store a new reading.
    ///
    /// Out-of-domain values are rejected with [`Error::Validation`] and the
    /// previous value is kept. On success, a subscribed characteristic emits
    /// exactly one notification with the new value.
    ///
    /// [`Error::Validation`]: crate::Error::Validation
    pub fn update(&self, value: impl Into<i64>) -> Result<()> {
        let value = CharacteristicValue::new(self.kind, value.into())?;

        let mut state = self.state.write();
        state.value = value;
        state.encoded = value.encode();

        if state.subscribed {
            self.notifier.emit(&state, NotificationSource::Updated);
        }

        Ok(())
    }

    /// Start notifications. Idempotent.
    ///
    /// Emits the current value immediately, then arms the notify timer.
    pub fn start_notify(&self) {
        let epoch = {
            let mut state = self.state.write();
            if state.subscribed {
                debug!("{} already notifying", self.kind);
                return;
            }

            state.subscribed = true;
            state.notify_epoch += 1;
            self.notifier.emit(&state, NotificationSource::Subscribed);
            state.notify_epoch
        };

        let state = self.state.clone();
        let notifier = self.notifier.clone();
        let timer = NotifyTimer::start(self.notify_period, move || {
            let state = state.read();
            if !state.subscribed || state.notify_epoch != epoch {
                return false;
            }
            notifier.emit(&state, NotificationSource::Timer);
            true
        });

        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.cancel();
        }

        debug!("{} notifications started", self.kind);
    }

    /// Stop notifications. Idempotent.
    pub fn stop_notify(&self) {
        let was_subscribed = {
            let mut state = self.state.write();
            std::mem::replace(&mut state.subscribed, false)
        };

        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }

        if was_subscribed {
            debug!("{} notifications stopped", self.kind);
        }
    }
}

impl Drop for Characteristic {
    fn drop(&mut self) {
        self.state.write().subscribed = false;
    }
}

impl std::fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Characteristic")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("value", &self.value())
            .field("notifying", &self.is_notifying())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::sync::broadcast::error::TryRecvError;

    const PERIOD: Duration = Duration::from_millis(5000);

    fn drain(rx: &mut broadcast::Receiver<NotificationEvent>) -> Vec<NotificationEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return events,
            }
        }
    }

    #[test]
    fn test_read_before_any_update() {
        let chr = Characteristic::new(CharacteristicKind::HeartRate);
        assert_eq!(chr.read().as_ref(), b"0");
        assert!(!chr.is_notifying());
    }

    #[test]
    fn test_descriptor_text() {
        let hr = Characteristic::new(CharacteristicKind::HeartRate);
        assert_eq!(hr.descriptors()[0].uuid(), USER_DESCRIPTION_UUID);
        assert_eq!(hr.descriptors()[0].read().as_ref(), b"Heart Rate (bpm)");

        let o2 = Characteristic::new(CharacteristicKind::Oxygen);
        assert_eq!(o2.descriptors()[0].text(), "Oxygen Saturation (%)");
    }

    #[test]
    fn test_flags() {
        let chr = Characteristic::new(CharacteristicKind::Oxygen);
        assert!(chr.supports(CharacteristicFlag::Read));
        assert!(chr.supports(CharacteristicFlag::Notify));
        let names: Vec<_> = chr.flags().iter().map(|f| f.as_str()).collect();
        assert_eq!(names, vec!["notify", "read"]);
    }

    #[test]
    fn test_update_without_subscription_is_silent() {
        let chr = Characteristic::new(CharacteristicKind::HeartRate);
        let mut rx = chr.subscribe_notifications();

        chr.update(72).unwrap();
        assert_eq!(chr.read().as_ref(), b"72");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_rejected_update_keeps_value() {
        let chr = Characteristic::new(CharacteristicKind::Oxygen);
        chr.update(98).unwrap();

        for bad in [101, -2, 1000, i64::MIN] {
            let err = chr.update(bad).unwrap_err();
            assert!(matches!(err, Error::Validation { .. }));
            assert_eq!(chr.read().as_ref(), b"98");
        }
    }

    #[tokio::test]
    async fn test_rejected_update_does_not_notify() {
        let chr = Characteristic::new(CharacteristicKind::HeartRate);
        chr.start_notify();
        let mut rx = chr.subscribe_notifications();

        assert!(chr.update(300).is_err());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_notify_emits_immediately() {
        let chr = Characteristic::new(CharacteristicKind::HeartRate).with_notify_period(PERIOD);
        chr.update(65).unwrap();
        let mut rx = chr.subscribe_notifications();

        chr.start_notify();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, NotificationSource::Subscribed);
        assert_eq!(events[0].data.as_ref(), b"65");
        assert_eq!(events[0].characteristic_uuid, chr.uuid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_notify_is_idempotent() {
        let chr = Characteristic::new(CharacteristicKind::Oxygen).with_notify_period(PERIOD);
        let mut rx = chr.subscribe_notifications();

        chr.start_notify();
        chr.start_notify();
        assert_eq!(drain(&mut rx).len(), 1);

        // A second call must not arm a second timer.
        tokio::time::sleep(Duration::from_millis(5100)).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, NotificationSource::Timer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_and_timer_notifications() {
        let chr = Characteristic::new(CharacteristicKind::HeartRate).with_notify_period(PERIOD);
        let mut rx = chr.subscribe_notifications();
        chr.start_notify();
        drain(&mut rx);

        chr.update(80).unwrap();
        chr.update(81).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.source == NotificationSource::Updated));
        assert_eq!(events[1].data.as_ref(), b"81");

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.source == NotificationSource::Timer));
        assert!(events.iter().all(|e| e.data.as_ref() == b"81"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_is_notified() {
        let chr = Characteristic::new(CharacteristicKind::Oxygen).with_notify_period(PERIOD);
        chr.update(97).unwrap();
        chr.start_notify();
        let mut rx = chr.subscribe_notifications();

        chr.update(-1).unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_ref(), b"-1");
        assert!(chr.value().is_no_signal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_notify_silences_everything() {
        let chr = Characteristic::new(CharacteristicKind::HeartRate).with_notify_period(PERIOD);
        let mut rx = chr.subscribe_notifications();
        chr.start_notify();
        chr.stop_notify();
        chr.stop_notify();
        drain(&mut rx);

        chr.update(90).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut rx).is_empty());
        assert!(!chr.is_notifying());
        assert_eq!(chr.read().as_ref(), b"90");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_runs_one_timer() {
        let chr = Characteristic::new(CharacteristicKind::HeartRate).with_notify_period(PERIOD);
        let mut rx = chr.subscribe_notifications();

        chr.start_notify();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        chr.stop_notify();
        chr.start_notify();
        drain(&mut rx);

        // Only the second subscription's timer fires: at 2500 + 5000 ms.
        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert!(drain(&mut rx).is_empty());
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(drain(&mut rx).len(), 1);
    }
}
