use chrono::TimeDelta;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::model::{EventType, LogEvent};

const ICON_SPREE: &str = "🩸";
const SPREE_ID_SUFFIX: &str = "-spree";

#[derive(Debug, Clone)]
pub struct SpreeSettings {
    /// Consecutive kills must be strictly closer than this to share a spree.
    pub window: Duration,
    /// Damage types that belong to vehicle destruction rather than personal kills.
    pub excluded_damage_types: Vec<String>,
}

impl Default for SpreeSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(120),
            excluded_damage_types: vec![
                "VehicleDestruction".to_string(),
                "Crash".to_string(),
                "SelfDestruct".to_string(),
            ],
        }
    }
}

impl SpreeSettings {
    fn is_excluded_damage_type(&self, damage_type: &str) -> bool {
        self.excluded_damage_types
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(damage_type))
    }

    fn window_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.window).unwrap_or(TimeDelta::MAX)
    }
}

/// Folds runs of kills by the same killer into composite spree events.
///
/// Expects `events` sorted by timestamp. A spree parent takes the place of its
/// first kill; the remaining members only appear as its children.
pub fn group_killing_sprees(events: &[LogEvent], settings: &SpreeSettings) -> Vec<LogEvent> {
    let mut kills_by_killer: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        if let Some(killer_id) = spree_candidate_killer(event, settings) {
            kills_by_killer.entry(killer_id).or_default().push(index);
        }
    }

    let window = settings.window_delta();
    let mut spree_parents: HashMap<usize, LogEvent> = HashMap::new();
    let mut consumed: HashSet<usize> = HashSet::new();

    for kill_indices in kills_by_killer.values() {
        let mut run: Vec<usize> = Vec::new();
        for &index in kill_indices {
            let continues_run = run
                .last()
                .map(|&previous| events[index].timestamp - events[previous].timestamp < window)
                .unwrap_or(false);

            if !continues_run {
                close_run(events, &run, &mut spree_parents, &mut consumed);
                run.clear();
            }
            run.push(index);
        }
        close_run(events, &run, &mut spree_parents, &mut consumed);
    }

    let mut grouped = Vec::with_capacity(events.len() - consumed.len() + spree_parents.len());
    for (index, event) in events.iter().enumerate() {
        if let Some(parent) = spree_parents.remove(&index) {
            grouped.push(parent);
        } else if !consumed.contains(&index) {
            grouped.push(event.clone());
        }
    }

    grouped
}

fn spree_candidate_killer<'a>(event: &'a LogEvent, settings: &SpreeSettings) -> Option<&'a str> {
    if event.event_type != Some(EventType::Death) || event.is_composite() {
        return None;
    }

    let killer_id = event.metadata_str("killerId")?.trim();
    if killer_id.is_empty() || killer_id.chars().all(|character| character == '0') {
        return None;
    }
    if event.metadata_str("victimId").map(str::trim) == Some(killer_id) {
        return None;
    }
    if let Some(damage_type) = event.metadata_str("damageType") {
        if settings.is_excluded_damage_type(damage_type) {
            return None;
        }
    }

    Some(killer_id)
}

fn close_run(
    events: &[LogEvent],
    run: &[usize],
    spree_parents: &mut HashMap<usize, LogEvent>,
    consumed: &mut HashSet<usize>,
) {
    let [first_index, ..] = run else {
        return;
    };
    if run.len() < 2 {
        return;
    }

    let children: Vec<LogEvent> = run
        .iter()
        .map(|&index| LogEvent {
            children: None,
            ..events[index].clone()
        })
        .collect();

    spree_parents.insert(*first_index, build_spree_parent(&events[*first_index], children));
    consumed.extend(run.iter().copied());
}

fn build_spree_parent(first_kill: &LogEvent, children: Vec<LogEvent>) -> LogEvent {
    let killer_name = first_kill
        .metadata_str("killerName")
        .unwrap_or("Unknown")
        .to_string();
    let kill_count = children.len();
    let last_kill_at = children
        .last()
        .map(|child| child.timestamp)
        .unwrap_or(first_kill.timestamp);

    let mut metadata = first_kill.metadata.clone().unwrap_or_default();
    metadata.insert("killCount".to_string(), json!(kill_count));
    metadata.insert(
        "firstKillAt".to_string(),
        json!(crate::timestamp::format_timestamp(&first_kill.timestamp)),
    );
    metadata.insert(
        "lastKillAt".to_string(),
        json!(crate::timestamp::format_timestamp(&last_kill_at)),
    );

    LogEvent {
        id: format!("{}{SPREE_ID_SUFFIX}", first_kill.id),
        icon: ICON_SPREE.to_string(),
        summary: format!("{killer_name} is on a killing spree: {kill_count} kills"),
        ui_expanded: false,
        event_type: Some(EventType::Spree),
        metadata: Some(metadata),
        children: Some(children),
        ..first_kill.clone()
    }
}

/// Reverses spree grouping: composites are replaced by their children so the
/// canonical set only ever holds flat events.
pub fn flatten_sprees(events: Vec<LogEvent>) -> Vec<LogEvent> {
    let mut flat = Vec::with_capacity(events.len());
    for event in events {
        match event.children {
            Some(children) if !children.is_empty() => flat.extend(children.into_iter().map(
                |child| LogEvent {
                    children: None,
                    ..child
                },
            )),
            _ => flat.push(LogEvent {
                children: None,
                ..event
            }),
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::{flatten_sprees, group_killing_sprees, SpreeSettings};
    use crate::model::fixtures::{event_at, kill_at};
    use crate::model::EventType;
    use crate::sequencer::dedupe_and_sort;
    use serde_json::json;

    fn ids(events: &[crate::model::LogEvent]) -> Vec<&str> {
        events.iter().map(|event| event.id.as_str()).collect()
    }

    #[test]
    fn three_kills_within_window_form_one_spree() {
        let events = dedupe_and_sort(vec![
            event_at("before", "2024-06-07T11:59:00.000Z"),
            kill_at("k1", "2024-06-07T12:00:00.000Z", "77", "1"),
            kill_at("k2", "2024-06-07T12:00:30.000Z", "77", "2"),
            event_at("between", "2024-06-07T12:01:00.000Z"),
            kill_at("k3", "2024-06-07T12:01:30.000Z", "77", "3"),
        ]);

        let grouped = group_killing_sprees(&events, &SpreeSettings::default());

        assert_eq!(ids(&grouped), vec!["before", "k1-spree", "between"]);
        let spree = &grouped[1];
        assert_eq!(spree.event_type, Some(EventType::Spree));
        assert_eq!(spree.summary, "Killer77 is on a killing spree: 3 kills");
        let children = spree.children.as_ref().expect("spree has children");
        assert_eq!(ids(children), vec!["k1", "k2", "k3"]);
        assert!(children.iter().all(|child| child.children.is_none()));
        assert_eq!(spree.metadata.as_ref().expect("metadata")["killCount"], json!(3));
    }

    #[test]
    fn kills_three_minutes_apart_stay_standalone() {
        let events = vec![
            kill_at("k1", "2024-06-07T12:00:00.000Z", "77", "1"),
            kill_at("k2", "2024-06-07T12:03:00.000Z", "77", "2"),
        ];

        let grouped = group_killing_sprees(&events, &SpreeSettings::default());

        assert_eq!(ids(&grouped), vec!["k1", "k2"]);
        assert!(grouped
            .iter()
            .all(|event| event.event_type == Some(EventType::Death)));
    }

    #[test]
    fn window_boundary_is_exclusive() {
        let events = vec![
            kill_at("k1", "2024-06-07T12:00:00.000Z", "77", "1"),
            kill_at("k2", "2024-06-07T12:02:00.000Z", "77", "2"),
        ];

        let grouped = group_killing_sprees(&events, &SpreeSettings::default());
        assert_eq!(ids(&grouped), vec!["k1", "k2"]);
    }

    #[test]
    fn runs_are_tracked_per_killer_and_split_on_gaps() {
        let events = vec![
            kill_at("a1", "2024-06-07T12:00:00.000Z", "1", "9"),
            kill_at("b1", "2024-06-07T12:00:10.000Z", "2", "9"),
            kill_at("a2", "2024-06-07T12:00:20.000Z", "1", "8"),
            kill_at("b2", "2024-06-07T12:10:00.000Z", "2", "8"),
            kill_at("a3", "2024-06-07T12:10:10.000Z", "1", "7"),
            kill_at("a4", "2024-06-07T12:10:20.000Z", "1", "6"),
        ];

        let grouped = group_killing_sprees(&events, &SpreeSettings::default());

        assert_eq!(ids(&grouped), vec!["a1-spree", "b1", "b2", "a3-spree"]);
        assert_eq!(grouped[3].children.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn ignores_suicides_unknown_killers_and_vehicle_damage() {
        let mut vehicle_kill = kill_at("v2", "2024-06-07T12:00:20.000Z", "77", "3");
        vehicle_kill
            .metadata
            .as_mut()
            .expect("metadata")
            .insert("damageType".to_string(), json!("vehicledestruction"));

        let events = vec![
            kill_at("s1", "2024-06-07T12:00:00.000Z", "5", "5"),
            kill_at("s2", "2024-06-07T12:00:05.000Z", "5", "5"),
            kill_at("z1", "2024-06-07T12:00:06.000Z", "0", "1"),
            kill_at("z2", "2024-06-07T12:00:07.000Z", "0", "2"),
            kill_at("v1", "2024-06-07T12:00:10.000Z", "77", "2"),
            vehicle_kill,
        ];

        let grouped = group_killing_sprees(&events, &SpreeSettings::default());
        assert_eq!(grouped.len(), events.len(), "No spree should form");
    }

    #[test]
    fn excluded_damage_types_are_configurable() {
        let events = vec![
            kill_at("k1", "2024-06-07T12:00:00.000Z", "77", "1"),
            kill_at("k2", "2024-06-07T12:00:10.000Z", "77", "2"),
        ];
        let settings = SpreeSettings {
            excluded_damage_types: vec!["Bullet".to_string()],
            ..SpreeSettings::default()
        };

        assert_eq!(group_killing_sprees(&events, &settings).len(), 2);
    }

    #[test]
    fn regrouping_is_stable_and_never_nests() {
        let events = vec![
            kill_at("k1", "2024-06-07T12:00:00.000Z", "77", "1"),
            kill_at("k2", "2024-06-07T12:00:10.000Z", "77", "2"),
        ];

        let grouped = group_killing_sprees(&events, &SpreeSettings::default());
        let regrouped = group_killing_sprees(&grouped, &SpreeSettings::default());

        assert_eq!(grouped, regrouped);
    }

    #[test]
    fn flattening_restores_the_member_events() {
        let events = vec![
            event_at("x", "2024-06-07T11:00:00.000Z"),
            kill_at("k1", "2024-06-07T12:00:00.000Z", "77", "1"),
            kill_at("k2", "2024-06-07T12:00:10.000Z", "77", "2"),
        ];

        let grouped = group_killing_sprees(&events, &SpreeSettings::default());
        assert_eq!(flatten_sprees(grouped), events);
    }
}
