//! Reading characteristic payload decoding.
//!
//! The thermometer notifies plain UTF-8 text lines such as `"23.5 PW\r\n"`.
//! Only lines carrying the `PW` marker are treated as readings.

use chrono::{DateTime, Utc};

use crate::ble::uuids::READING_MARKER;
use crate::error::DecodeError;

/// A decoded characteristic value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Reading {
    /// Payload text with every `\r\n` removed.
    pub raw_text: String,
    /// Whether `raw_text` carries the reading marker.
    pub accepted: bool,
    /// When the payload was decoded.
    pub received_at: DateTime<Utc>,
}

/// Stateless decoder for reading payloads.
pub struct PayloadDecoder;

impl PayloadDecoder {
    /// Decode a characteristic value.
    ///
    /// Rejected (unmarked) payloads still decode; acceptance is reported on
    /// the returned [`Reading`] and filtered downstream.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidEncoding`] if `data` is not UTF-8.
    ///
    /// # Example
    ///
    /// ```
    /// use jatemp_ble::PayloadDecoder;
    ///
    /// let reading = PayloadDecoder::decode(b"23.5 PW\r\n").unwrap();
    /// assert_eq!(reading.raw_text, "23.5 PW");
    /// assert!(reading.accepted);
    /// ```
    pub fn decode(data: &[u8]) -> Result<Reading, DecodeError> {
        let text = std::str::from_utf8(data).map_err(|e| DecodeError::InvalidEncoding {
            valid_up_to: e.valid_up_to(),
        })?;

        let raw_text = text.replace("\r\n", "");
        let accepted = raw_text.contains(READING_MARKER);

        Ok(Reading {
            raw_text,
            accepted,
            received_at: Utc::now(),
        })
    }
}
