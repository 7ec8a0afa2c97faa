//! # Masking
//!
//! One-way masking of the PII carried by login events. `device_id` and `ip` are
//! replaced by the hex encoded SHA-256 digest of their raw value. The digest is
//! deterministic, so masked values can still be joined on downstream.
use sha2::{Digest, Sha256};

use crate::event::{RawEvent, SanitizedEvent};

/// Lower-case hex SHA-256 digest of a raw PII value.
pub fn mask_value(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Build the sanitized version of an event. Raw `device_id` and `ip` are not
/// carried over; absent raw values stay absent.
pub fn mask(event: &RawEvent) -> SanitizedEvent {
    SanitizedEvent {
        user_id: event.user_id.clone(),
        device_type: event.device_type.clone(),
        masked_ip: event.ip.as_deref().map(mask_value),
        masked_device_id: event.device_id.as_deref().map(mask_value),
        locale: event.locale.clone(),
        app_version: event.app_version.clone(),
    }
}
