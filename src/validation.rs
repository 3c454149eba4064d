use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

use crate::model::{TransmissionEvent, MAX_SUMMARY_CHARS};

pub(crate) const MAX_ICON_CHARS: usize = 16;
pub(crate) const MAX_PLAYER_NAME_CHARS: usize = 100;
pub(crate) const MAX_METADATA_ENTRIES: usize = 64;
pub(crate) const MAX_METADATA_BYTES: usize = 8 * 1024;
pub(crate) const MAX_CHILDREN: usize = 100;
pub(crate) const MAX_BATCH_EVENTS: usize = 1_000;
pub(crate) const MAX_COMPRESSED_PAYLOAD_BYTES: usize = 1024 * 1024;

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z0-9_.:\-]{1,128}$").expect("valid identifier pattern");
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid identifier in field {field}")]
    InvalidIdentifier { field: &'static str },

    #[error("field {field} exceeds {max} characters")]
    TooLong { field: &'static str, max: usize },

    #[error("metadata exceeds {max_entries} entries or {max_bytes} bytes")]
    MetadataTooLarge { max_entries: usize, max_bytes: usize },

    #[error("event has {count} children, at most {max} allowed")]
    TooManyChildren { count: usize, max: usize },

    #[error("composite events may not be nested")]
    NestedComposite,

    #[error("batch of {count} events exceeds {max}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("compressed payload of {size} bytes exceeds {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if IDENTIFIER.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidIdentifier { field })
    }
}

fn validate_length(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.chars().count() > max {
        return Err(ValidationError::TooLong { field, max });
    }
    Ok(())
}

fn validate_fields(event: &TransmissionEvent) -> Result<(), ValidationError> {
    validate_identifier("id", &event.id)?;
    if let Some(source_user_id) = event.source_user_id.as_deref() {
        validate_identifier("sourceUserId", source_user_id)?;
    }
    validate_length("summary", &event.summary, MAX_SUMMARY_CHARS)?;
    validate_length("icon", &event.icon, MAX_ICON_CHARS)?;
    if let Some(player_name) = event.player_name.as_deref() {
        validate_length("playerName", player_name, MAX_PLAYER_NAME_CHARS)?;
    }

    if let Some(metadata) = event.metadata.as_ref() {
        let serialized_len = serde_json::to_vec(metadata)
            .map(|bytes| bytes.len())
            .unwrap_or(usize::MAX);
        if metadata.len() > MAX_METADATA_ENTRIES || serialized_len > MAX_METADATA_BYTES {
            return Err(ValidationError::MetadataTooLarge {
                max_entries: MAX_METADATA_ENTRIES,
                max_bytes: MAX_METADATA_BYTES,
            });
        }
    }

    Ok(())
}

/// Checks one inbound event, including its children, against the wire bounds.
pub fn validate_event(event: &TransmissionEvent) -> Result<(), ValidationError> {
    validate_fields(event)?;

    let Some(children) = event.children.as_ref() else {
        return Ok(());
    };
    if children.len() > MAX_CHILDREN {
        return Err(ValidationError::TooManyChildren {
            count: children.len(),
            max: MAX_CHILDREN,
        });
    }
    for child in children {
        if child.children.as_ref().is_some_and(|nested| !nested.is_empty()) {
            return Err(ValidationError::NestedComposite);
        }
        validate_fields(child)?;
    }

    Ok(())
}

/// Rejects the whole batch when any event is invalid.
pub fn validate_batch(events: &[TransmissionEvent]) -> Result<(), ValidationError> {
    if events.len() > MAX_BATCH_EVENTS {
        return Err(ValidationError::BatchTooLarge {
            count: events.len(),
            max: MAX_BATCH_EVENTS,
        });
    }
    events.iter().try_for_each(validate_event)
}

pub fn validate_compressed_payload(payload: &str) -> Result<(), ValidationError> {
    if payload.len() > MAX_COMPRESSED_PAYLOAD_BYTES {
        return Err(ValidationError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_COMPRESSED_PAYLOAD_BYTES,
        });
    }
    Ok(())
}
