use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::timestamp::serde_millis;

pub(crate) const MAX_SUMMARY_CHARS: usize = 1_000;
pub(crate) const MAX_RAW_CHARS: usize = 2_000;

pub type EventMetadata = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connection,
    Inventory,
    Death,
    Destruction,
    ShipDestruction,
    Quit,
    Boarding,
    Spree,
}

/// One classified occurrence, either parsed from the local log or received from a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<String>,
    #[serde(default)]
    pub player_name: Option<String>,
    pub icon: String,
    pub summary: String,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub raw_original: String,
    #[serde(default)]
    pub ui_expanded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<LogEvent>>,
}

/// Wire form of [`LogEvent`]: never carries the raw source line or UI state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransmissionEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<String>,
    #[serde(default)]
    pub player_name: Option<String>,
    pub icon: String,
    pub summary: String,
    #[serde(with = "serde_millis")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TransmissionEvent>>,
}

impl LogEvent {
    pub fn to_transmission(&self) -> TransmissionEvent {
        TransmissionEvent {
            id: self.id.clone(),
            source_user_id: self.source_user_id.clone(),
            player_name: self.player_name.clone(),
            icon: self.icon.clone(),
            summary: self.summary.clone(),
            timestamp: self.timestamp,
            event_type: self.event_type,
            metadata: self.metadata.clone(),
            children: self
                .children
                .as_ref()
                .map(|children| children.iter().map(LogEvent::to_transmission).collect()),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    pub fn is_composite(&self) -> bool {
        self.children
            .as_ref()
            .map(|children| !children.is_empty())
            .unwrap_or(false)
    }
}

impl TransmissionEvent {
    /// Rebuilds a full event on the receiving side; local-only fields start empty.
    pub fn into_log_event(self) -> LogEvent {
        LogEvent {
            id: self.id,
            source_user_id: self.source_user_id,
            player_name: self.player_name,
            icon: self.icon,
            summary: self.summary,
            timestamp: self.timestamp,
            raw_original: String::new(),
            ui_expanded: false,
            event_type: self.event_type,
            metadata: self.metadata,
            children: self.children.map(|children| {
                children
                    .into_iter()
                    .map(TransmissionEvent::into_log_event)
                    .collect()
            }),
        }
    }
}

pub(crate) fn clip_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => value[..byte_index].to_string(),
        None => value.to_string(),
    }
}
