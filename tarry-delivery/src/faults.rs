use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use tarry_common::{Headers, headers::names};

use crate::error::DelayedDeliveryError;

/// Stamp failure details onto the headers of a message bound for the error queue
///
/// Configured fault metadata is applied last and may override the stamped
/// values.
pub(crate) fn stamp(
    headers: &mut Headers,
    error: &DelayedDeliveryError,
    source: &str,
    failed_queue: &str,
    fault_metadata: &BTreeMap<String, String>,
) {
    headers.insert(names::EXCEPTION_TYPE.to_string(), error.kind().to_string());
    headers.insert(names::EXCEPTION_MESSAGE.to_string(), error.to_string());
    headers.insert(names::EXCEPTION_SOURCE.to_string(), source.to_string());
    headers.insert(names::FAILED_QUEUE.to_string(), failed_queue.to_string());
    headers.insert(
        names::TIME_OF_FAILURE.to_string(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    headers.extend(
        fault_metadata
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
}
