//! Protocol module.
//!
//! Decoding of the values notified by the reading characteristic.

pub mod payload;

pub use payload::{PayloadDecoder, Reading};
