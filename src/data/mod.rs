//! Data structures for sensor readings.
//!
//! This module contains the reading produced by each sensor poll, the
//! status derived from it, and the shared state record handed between
//! processes.

pub mod reading;
pub mod shared_state;

pub use reading::{Reading, SensorStatus};
pub use shared_state::{SharedStateFile, SharedStateRecord};
