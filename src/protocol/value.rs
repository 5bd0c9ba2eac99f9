//! Characteristic value encoding.
//!
//! Both sensor characteristics carry their reading as the ASCII decimal
//! representation of the value, without unit suffix:
//!
//! | Reading | Wire bytes         |
//! |---------|--------------------|
//! | 72      | `b"72"`            |
//! | 100     | `b"100"`           |
//! | -1      | `b"-1"` (no signal)|
//!
//! The -1 sentinel is in-domain for every kind, so "no signal" reaches
//! subscribed centrals as a real value.

use bytes::Bytes;
use std::ops::RangeInclusive;
use uuid::Uuid;

use crate::ble::uuids::{HEART_RATE_CHARACTERISTIC_UUID, OXYGEN_CHARACTERISTIC_UUID};
use crate::error::{Error, Result};

/// Sentinel meaning "no valid signal currently available".
pub const NO_SIGNAL: i16 = -1;

/// The physiological quantity a characteristic carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    /// Heart rate in beats per minute.
    HeartRate,
    /// Blood oxygen saturation in percent.
    Oxygen,
}

impl CharacteristicKind {
    /// All kinds, in service order.
    pub const ALL: [Self; 2] = [Self::HeartRate, Self::Oxygen];

    /// Characteristic UUID for this kind.
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::HeartRate => HEART_RATE_CHARACTERISTIC_UUID,
            Self::Oxygen => OXYGEN_CHARACTERISTIC_UUID,
        }
    }

    /// Look up the kind served under a characteristic UUID.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.uuid() == *uuid)
    }

    /// Static text of the user-description descriptor.
    pub fn description(&self) -> &'static str {
        match self {
            Self::HeartRate => "Heart Rate (bpm)",
            Self::Oxygen => "Oxygen Saturation (%)",
        }
    }

    /// Accepted values, sentinel included.
    pub fn domain(&self) -> RangeInclusive<i16> {
        match self {
            Self::HeartRate => NO_SIGNAL..=250,
            Self::Oxygen => NO_SIGNAL..=100,
        }
    }

    /// Check a raw value against the domain of this kind.
    pub fn validate(&self, value: i64) -> Result<i16> {
        let domain = self.domain();
        i16::try_from(value)
            .ok()
            .filter(|v| domain.contains(v))
            .ok_or(Error::Validation {
                kind: *self,
                value,
                min: *domain.start(),
                max: *domain.end(),
            })
    }
}

impl std::fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HeartRate => write!(f, "Heart Rate"),
            Self::Oxygen => write!(f, "Oxygen Saturation"),
        }
    }
}

/// A validated reading of one kind, with its wire representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicValue {
    kind: CharacteristicKind,
    value: i16,
}

impl CharacteristicValue {
    /// Create a value, rejecting anything outside the kind's domain.
    pub fn new(kind: CharacteristicKind, value: i64) -> Result<Self> {
        let value = kind.validate(value)?;
        Ok(Self { kind, value })
    }

    /// The value served before any reading has been set.
    pub fn zero(kind: CharacteristicKind) -> Self {
        Self { kind, value: 0 }
    }

    /// The "no signal" value for a kind.
    pub fn no_signal(kind: CharacteristicKind) -> Self {
        Self {
            kind,
            value: NO_SIGNAL,
        }
    }

    /// Kind of this value.
    pub fn kind(&self) -> CharacteristicKind {
        self.kind
    }

    /// The numeric value.
    pub fn value(&self) -> i16 {
        self.value
    }

    /// Check if this is the "no signal" sentinel.
    pub fn is_no_signal(&self) -> bool {
        self.value == NO_SIGNAL
    }

    /// Encode to ASCII decimal bytes.
    pub fn encode(&self) -> Bytes {
        Bytes::from(self.value.to_string())
    }

    /// Decode ASCII decimal bytes produced by [`encode`](Self::encode).
    ///
    /// Accepts an optional leading `-` followed by one or more ASCII digits.
    pub fn decode(kind: CharacteristicKind, data: &[u8]) -> Result<Self> {
        let digits = data.strip_prefix(b"-").unwrap_or(data);
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(Error::InvalidData {
                context: format!("{} value is not a decimal number: {:02X?}", kind, data),
            });
        }

        // Digits and '-' are ASCII, so the slice is valid UTF-8.
        let text = std::str::from_utf8(data).map_err(|_| Error::InvalidData {
            context: format!("{} value is not UTF-8", kind),
        })?;
        let value: i64 = text.parse().map_err(|_| Error::InvalidData {
            context: format!("{} value {:?} does not fit", kind, text),
        })?;

        Self::new(kind, value)
    }
}

impl std::fmt::Display for CharacteristicValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_no_signal() {
            return write!(f, "N/A");
        }
        match self.kind {
            CharacteristicKind::HeartRate => write!(f, "{} bpm", self.value),
            CharacteristicKind::Oxygen => write!(f, "{}%", self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_ascii_decimal() {
        let hr = CharacteristicValue::new(CharacteristicKind::HeartRate, 72).unwrap();
        assert_eq!(hr.encode().as_ref(), b"72");

        let o2 = CharacteristicValue::new(CharacteristicKind::Oxygen, 98).unwrap();
        assert_eq!(o2.encode().as_ref(), b"98");

        let none = CharacteristicValue::no_signal(CharacteristicKind::Oxygen);
        assert_eq!(none.encode().as_ref(), b"-1");
    }

    #[test]
    fn test_zero_default() {
        let zero = CharacteristicValue::zero(CharacteristicKind::HeartRate);
        assert_eq!(zero.value(), 0);
        assert_eq!(zero.encode().as_ref(), b"0");
    }

    #[test]
    fn test_domain_bounds() {
        let hr = CharacteristicKind::HeartRate;
        assert!(hr.validate(-1).is_ok());
        assert!(hr.validate(250).is_ok());
        assert!(hr.validate(251).is_err());
        assert!(hr.validate(-2).is_err());

        let o2 = CharacteristicKind::Oxygen;
        assert!(o2.validate(100).is_ok());
        assert!(o2.validate(101).is_err());
        assert!(o2.validate(i64::from(i16::MAX) + 1).is_err());
    }

    #[test]
    fn test_validation_error_fields() {
        match CharacteristicKind::Oxygen.validate(120) {
            Err(Error::Validation {
                kind,
                value,
                min,
                max,
            }) => {
                assert_eq!(kind, CharacteristicKind::Oxygen);
                assert_eq!(value, 120);
                assert_eq!((min, max), (-1, 100));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let hr = CharacteristicKind::HeartRate;
        assert!(CharacteristicValue::decode(hr, b"").is_err());
        assert!(CharacteristicValue::decode(hr, b"-").is_err());
        assert!(CharacteristicValue::decode(hr, b"72 bpm").is_err());
        assert!(CharacteristicValue::decode(hr, b" 72").is_err());
        assert!(CharacteristicValue::decode(hr, b"999").is_err());
        assert!(CharacteristicValue::decode(hr, b"99999999999999999999999").is_err());
    }

    #[test]
    fn test_kind_lookup_by_uuid() {
        assert_eq!(
            CharacteristicKind::from_uuid(&HEART_RATE_CHARACTERISTIC_UUID),
            Some(CharacteristicKind::HeartRate)
        );
        assert_eq!(
            CharacteristicKind::from_uuid(&OXYGEN_CHARACTERISTIC_UUID),
            Some(CharacteristicKind::Oxygen)
        );
        assert_eq!(CharacteristicKind::from_uuid(&Uuid::nil()), None);
    }

    #[test]
    fn test_display() {
        let hr = CharacteristicValue::new(CharacteristicKind::HeartRate, 60).unwrap();
        assert_eq!(hr.to_string(), "60 bpm");
        let o2 = CharacteristicValue::new(CharacteristicKind::Oxygen, 97).unwrap();
        assert_eq!(o2.to_string(), "97%");
        assert_eq!(
            CharacteristicValue::no_signal(CharacteristicKind::HeartRate).to_string(),
            "N/A"
        );
    }

    proptest! {
        #[test]
        fn heart_rate_round_trips(value in -1i64..=250) {
            let kind = CharacteristicKind::HeartRate;
            let encoded = CharacteristicValue::new(kind, value).unwrap().encode();
            let decoded = CharacteristicValue::decode(kind, &encoded).unwrap();
            prop_assert_eq!(i64::from(decoded.value()), value);
        }

        #[test]
        fn oxygen_round_trips(value in -1i64..=100) {
            let kind = CharacteristicKind::Oxygen;
            let encoded = CharacteristicValue::new(kind, value).unwrap().encode();
            let decoded = CharacteristicValue::decode(kind, &encoded).unwrap();
            prop_assert_eq!(i64::from(decoded.value()), value);
        }

        #[test]
        fn out_of_domain_is_rejected(value in prop_oneof![i64::MIN..-1, 251i64..i64::MAX]) {
            prop_assert!(CharacteristicValue::new(CharacteristicKind::HeartRate, value).is_err());
        }
    }
}
