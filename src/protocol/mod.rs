//! Protocol module for the characteristic wire format.
//!
//! This module contains the encoding of sensor readings into the bytes
//! served by the GATT characteristics, and the domain checks applied
//! before a value is accepted.

pub mod value;

pub use value::{CharacteristicKind, CharacteristicValue, NO_SIGNAL};
