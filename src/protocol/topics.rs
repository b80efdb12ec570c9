//! Topic-level validation for identities and event types
//!
//! Event types and identity segments are spliced into MQTT topic names, so
//! they must never carry wildcards or produce empty topic levels.

use thiserror::Error;

/// Validation errors for events and device identities
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Field '{0}' cannot be empty")]
    EmptyField(&'static str),
    #[error("Field '{field}' contains invalid character: {ch:?}")]
    InvalidChar { field: &'static str, ch: char },
    #[error("Field '{0}' contains an empty topic level")]
    EmptyTopicLevel(&'static str),
}

/// Validate an event type used as the trailing part of an uplink topic.
///
/// Slashes are allowed so producers can route into sub-topics
/// (`alarms/occlusion`), but empty levels, MQTT wildcards and control
/// characters are rejected.
pub fn validate_event_type(event_type: &str) -> Result<(), ValidationError> {
    const FIELD: &str = "type";

    if event_type.is_empty() {
        return Err(ValidationError::EmptyField(FIELD));
    }

    for ch in event_type.chars() {
        if ch == '+' || ch == '#' || ch.is_control() {
            return Err(ValidationError::InvalidChar { field: FIELD, ch });
        }
    }

    if event_type.split('/').any(str::is_empty) {
        return Err(ValidationError::EmptyTopicLevel(FIELD));
    }

    Ok(())
}

/// Validate one segment of the device identity (`[a-zA-Z0-9._-]+`)
pub fn validate_identity_segment(field: &'static str, segment: &str) -> Result<(), ValidationError> {
    if segment.is_empty() {
        return Err(ValidationError::EmptyField(field));
    }

    for ch in segment.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(ValidationError::InvalidChar { field, ch });
        }
    }

    Ok(())
}
