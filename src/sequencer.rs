use std::collections::HashSet;

use crate::model::LogEvent;

/// Keeps the first occurrence of every id, then stable-sorts ascending by timestamp.
///
/// Every mutation of the canonical set goes through here; running it twice is a
/// no-op and running it over the union of two deduped sets merges them.
pub fn dedupe_and_sort(events: Vec<LogEvent>) -> Vec<LogEvent> {
    let mut seen_ids: HashSet<String> = HashSet::with_capacity(events.len());
    let mut unique_events: Vec<LogEvent> = events
        .into_iter()
        .filter(|event| seen_ids.insert(event.id.clone()))
        .collect();

    unique_events.sort_by(|left, right| left.timestamp.cmp(&right.timestamp));
    unique_events
}

/// Merges `incoming` into `existing`; existing entries win on id conflicts.
pub fn merge_events(existing: Vec<LogEvent>, incoming: Vec<LogEvent>) -> Vec<LogEvent> {
    let mut combined = existing;
    combined.extend(incoming);
    dedupe_and_sort(combined)
}

/// Drops the oldest events once the sorted set grows past `max_events`.
/// Returns how many were dropped.
pub fn apply_retention_cap(events: &mut Vec<LogEvent>, max_events: usize) -> usize {
    if events.len() <= max_events {
        return 0;
    }

    let overflow = events.len() - max_events;
    events.drain(..overflow);
    overflow
}
