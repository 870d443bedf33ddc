//! Message header maps and their stored representation.
//!
//! Headers travel as an ordered string map. Stores keep them as opaque bytes
//! (bincode, standard configuration) so they never need to understand the
//! transport envelope.

use std::collections::BTreeMap;

use thiserror::Error;

/// Transport headers attached to a message
pub type Headers = BTreeMap<String, String>;

/// Well-known header names
pub mod names {
    /// Address the delayed message should be delivered to once due
    pub const DELAY_DESTINATION: &str = "tarry.delay.destination";
    /// RFC 3339 instant at which the delayed message becomes due
    pub const DELAY_DUE: &str = "tarry.delay.due";
    /// Short, stable classification of the failure
    pub const EXCEPTION_TYPE: &str = "tarry.exception.type";
    /// Human-readable failure description
    pub const EXCEPTION_MESSAGE: &str = "tarry.exception.message";
    /// Chain of underlying causes, outermost first
    pub const EXCEPTION_SOURCE: &str = "tarry.exception.source";
    /// Queue the message was being processed from when it failed
    pub const FAILED_QUEUE: &str = "tarry.failure.queue";
    /// RFC 3339 instant of the final failure
    pub const TIME_OF_FAILURE: &str = "tarry.failure.time";
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("Unable to encode headers: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Unable to decode headers: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Encode headers into their stored form
///
/// # Errors
/// If the map cannot be serialised
pub fn encode(headers: &Headers) -> Result<Vec<u8>, HeaderError> {
    Ok(bincode::serde::encode_to_vec(
        headers,
        bincode::config::standard(),
    )?)
}

/// Decode headers from their stored form
///
/// An empty buffer decodes to an empty map.
///
/// # Errors
/// If the bytes are not a valid encoded header map
pub fn decode(bytes: &[u8]) -> Result<Headers, HeaderError> {
    if bytes.is_empty() {
        return Ok(Headers::new());
    }

    let (headers, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(headers)
}
