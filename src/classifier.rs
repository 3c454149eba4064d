use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde_json::json;
use std::time::{Duration, Instant};

use crate::event_id::generate_event_id;
use crate::model::{clip_chars, EventMetadata, EventType, LogEvent, MAX_RAW_CHARS, MAX_SUMMARY_CHARS};
use crate::timestamp::resolve_line_timestamp;

const ICON_CONNECTION: &str = "🔌";
const ICON_INVENTORY: &str = "🎒";
const ICON_SELF_DEATH: &str = "💀";
const ICON_OTHER_DEATH: &str = "☠️";
const ICON_SOFT_DESTRUCTION: &str = "🔥";
const ICON_HARD_DESTRUCTION: &str = "💥";
const ICON_SHIP_DESTRUCTION: &str = "🚀";
const ICON_QUIT: &str = "🚪";
const ICON_BOARDING: &str = "🛩️";

const SOFT_DEATH_LEVEL: &str = "1";
const SOFT_DEATH_MARKER: &str = "soft";

lazy_static::lazy_static! {
    static ref CONNECTION_PATTERN: Regex = Regex::new(
        r"<AccountLoginCharacterStatus_Character>.*?\bgeid (?P<player_id>\d+)\b.*?- name (?P<name>[\w\-]+)"
    )
    .expect("valid connection pattern");
    static ref INVENTORY_PATTERN: Regex = Regex::new(
        r"<RequestLocationInventory>.*?Player\[(?P<player>[^\]]*)\].*?Location\[(?P<location>[^\]]*)\]"
    )
    .expect("valid inventory pattern");
    static ref DEATH_PATTERN: Regex = Regex::new(concat!(
        r"<Actor Death> CActor::Kill: '(?P<victim>[^']*)' \[(?P<victim_id>\d*)\]",
        r" in zone '(?P<zone>[^']*)'",
        r" killed by '(?P<killer>[^']*)' \[(?P<killer_id>\d*)\]",
        r" using '(?P<weapon>[^']*)'(?: \[[^\]]*\])?",
        r" with damage type '(?P<damage_type>[^']*)'",
        r"(?: from direction x: (?P<dir_x>-?[\d.]+), y: (?P<dir_y>-?[\d.]+), z: (?P<dir_z>-?[\d.]+))?"
    ))
    .expect("valid death pattern");
    static ref VEHICLE_DESTRUCTION_PATTERN: Regex = Regex::new(concat!(
        r"<Vehicle Destruction> CVehicle::OnAdvanceDestroyLevel: Vehicle '(?P<vehicle>[^']*)' \[(?P<vehicle_id>\d*)\]",
        r" in zone '(?P<zone>[^']*)'",
        r".*? advanced from destroy level (?P<from>\S+) to (?P<to>\S+)",
        r" caused by '(?P<destroyer>[^']*)' \[(?P<destroyer_id>\d*)\]",
        r"(?: with '(?P<cause>[^']*)')?"
    ))
    .expect("valid vehicle destruction pattern");
    static ref SHIP_DESTRUCTION_PATTERN: Regex =
        Regex::new(r"<(?:Vehicle|Ship) Destruction>").expect("valid ship destruction pattern");
    static ref SYSTEM_QUIT_PATTERN: Regex =
        Regex::new(r"<SystemQuit>|CSystem::Quit").expect("valid system quit pattern");
    static ref BOARDING_PATTERN: Regex = Regex::new(
        r"<Vehicle Control Flow>.*?control token for '(?P<vehicle>[^']+)' \[(?P<vehicle_id>\d+)\]"
    )
    .expect("valid boarding pattern");
    static ref VEHICLE_INSTANCE_SUFFIX: Regex =
        Regex::new(r"_\d+$").expect("valid vehicle suffix pattern");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Connection,
    InventoryRequest,
    SelfDeath,
    OtherDeath,
    VehicleDestruction,
    ShipDestruction,
    SystemQuit,
    VehicleBoarding,
}

impl RuleKind {
    pub fn label(self) -> &'static str {
        match self {
            RuleKind::Connection => "connection",
            RuleKind::InventoryRequest => "inventory_request",
            RuleKind::SelfDeath => "self_death",
            RuleKind::OtherDeath => "other_death",
            RuleKind::VehicleDestruction => "vehicle_destruction",
            RuleKind::ShipDestruction => "ship_destruction",
            RuleKind::SystemQuit => "system_quit",
            RuleKind::VehicleBoarding => "vehicle_boarding",
        }
    }
}

/// The pending notification produced when the local player's display name changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileChange {
    pub display_name: String,
    pub player_id: Option<String>,
}

/// Running state the classifier reads and mutates while walking the log.
#[derive(Debug, Clone, Default)]
pub struct ParserContext {
    pub player_name: Option<String>,
    pub player_id: Option<String>,
    /// Account id stamped on locally produced events.
    pub source_user_id: Option<String>,
    /// Lines stamped at or before this instant are not turned into events.
    pub only_process_after: Option<DateTime<Utc>>,
    pending_profile_change: Option<ProfileChange>,
}

impl ParserContext {
    pub fn new(source_user_id: Option<String>) -> Self {
        Self {
            source_user_id,
            ..Self::default()
        }
    }

    pub fn take_profile_change(&mut self) -> Option<ProfileChange> {
        self.pending_profile_change.take()
    }

    fn is_local_player(&self, name: &str) -> bool {
        self.player_name.as_deref() == Some(name)
    }
}

struct ClassifiedLine {
    icon: &'static str,
    summary: String,
    event_type: Option<EventType>,
    metadata: Option<EventMetadata>,
}

enum RuleOutcome {
    /// The rule does not apply; the cascade continues.
    Skip,
    /// The rule applies but the line is unusable; the cascade stops.
    Drop,
    Emit(ClassifiedLine),
}

type Extractor = fn(&Captures<'_>, &mut ParserContext) -> RuleOutcome;

struct Rule {
    kind: RuleKind,
    pattern: &'static Regex,
    extract: Extractor,
}

lazy_static::lazy_static! {
    /// Priority order matters: the first rule that emits or drops wins.
    static ref RULES: Vec<Rule> = vec![
        Rule { kind: RuleKind::Connection, pattern: &CONNECTION_PATTERN, extract: extract_connection },
        Rule { kind: RuleKind::InventoryRequest, pattern: &INVENTORY_PATTERN, extract: extract_inventory },
        Rule { kind: RuleKind::SelfDeath, pattern: &DEATH_PATTERN, extract: extract_self_death },
        Rule { kind: RuleKind::OtherDeath, pattern: &DEATH_PATTERN, extract: extract_other_death },
        Rule { kind: RuleKind::VehicleDestruction, pattern: &VEHICLE_DESTRUCTION_PATTERN, extract: extract_vehicle_destruction },
        Rule { kind: RuleKind::ShipDestruction, pattern: &SHIP_DESTRUCTION_PATTERN, extract: extract_ship_destruction },
        Rule { kind: RuleKind::SystemQuit, pattern: &SYSTEM_QUIT_PATTERN, extract: extract_system_quit },
        Rule { kind: RuleKind::VehicleBoarding, pattern: &BOARDING_PATTERN, extract: extract_boarding },
    ];
}

#[derive(Debug, Clone)]
pub struct Classifier {
    pattern_budget: Duration,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(Duration::from_millis(150))
    }
}

impl Classifier {
    pub fn new(pattern_budget: Duration) -> Self {
        Self { pattern_budget }
    }

    pub fn classify(&self, line: &str, context: &mut ParserContext) -> Option<LogEvent> {
        let trimmed_line = line.trim();
        if trimmed_line.is_empty() {
            return None;
        }

        let line = clip_chars(trimmed_line, MAX_RAW_CHARS);
        let timestamp = resolve_line_timestamp(&line);
        let (kind, classified) = self.run_rules(&line, context)?;

        if let Some(cutoff) = context.only_process_after {
            if timestamp <= cutoff {
                tracing::trace!(rule = kind.label(), "Skipping line stamped before the processing cutoff");
                return None;
            }
        }

        Some(LogEvent {
            id: generate_event_id(&timestamp, &line),
            source_user_id: context.source_user_id.clone(),
            player_name: context.player_name.clone(),
            icon: classified.icon.to_string(),
            summary: clip_chars(&classified.summary, MAX_SUMMARY_CHARS),
            timestamp,
            raw_original: line,
            ui_expanded: false,
            event_type: classified.event_type,
            metadata: classified.metadata,
            children: None,
        })
    }

    fn run_rules(
        &self,
        line: &str,
        context: &mut ParserContext,
    ) -> Option<(RuleKind, ClassifiedLine)> {
        for rule in RULES.iter() {
            let Some(captures) = self.guarded_captures(rule.kind, rule.pattern, line) else {
                continue;
            };

            match (rule.extract)(&captures, context) {
                RuleOutcome::Skip => continue,
                RuleOutcome::Drop => return None,
                RuleOutcome::Emit(classified) => return Some((rule.kind, classified)),
            }
        }

        None
    }

    fn guarded_captures<'h>(
        &self,
        kind: RuleKind,
        pattern: &Regex,
        line: &'h str,
    ) -> Option<Captures<'h>> {
        let started_at = Instant::now();
        let captures = pattern.captures(line);
        let elapsed = started_at.elapsed();

        if elapsed > self.pattern_budget {
            tracing::warn!(
                target: "security",
                rule = kind.label(),
                elapsed_ms = elapsed.as_millis() as u64,
                budget_ms = self.pattern_budget.as_millis() as u64,
                line_length = line.len(),
                "Classifier pattern exceeded its time budget, treating line as no match"
            );
            return None;
        }

        captures
    }
}

fn group<'h>(captures: &Captures<'h>, name: &str) -> Option<&'h str> {
    captures
        .name(name)
        .map(|value| value.as_str().trim())
        .filter(|value| !value.is_empty())
}

fn extract_connection(captures: &Captures<'_>, context: &mut ParserContext) -> RuleOutcome {
    let (Some(name), Some(player_id)) = (group(captures, "name"), group(captures, "player_id"))
    else {
        return RuleOutcome::Drop;
    };

    if context.player_id.is_none() {
        context.player_id = Some(player_id.to_string());
    }

    if context.player_name.as_deref() != Some(name) {
        context.player_name = Some(name.to_string());
        context.pending_profile_change = Some(ProfileChange {
            display_name: name.to_string(),
            player_id: context.player_id.clone(),
        });
    }

    let mut metadata = EventMetadata::new();
    metadata.insert("playerId".to_string(), json!(player_id));

    RuleOutcome::Emit(ClassifiedLine {
        icon: ICON_CONNECTION,
        summary: format!("{name} connected"),
        event_type: Some(EventType::Connection),
        metadata: Some(metadata),
    })
}

fn extract_inventory(captures: &Captures<'_>, context: &mut ParserContext) -> RuleOutcome {
    let Some(player) = group(captures, "player") else {
        return RuleOutcome::Skip;
    };
    if !context.is_local_player(player) {
        return RuleOutcome::Skip;
    }
    let Some(location) = group(captures, "location") else {
        return RuleOutcome::Drop;
    };

    let mut metadata = EventMetadata::new();
    metadata.insert("location".to_string(), json!(location));

    RuleOutcome::Emit(ClassifiedLine {
        icon: ICON_INVENTORY,
        summary: format!("Opened inventory at {}", humanize_identifier(location)),
        event_type: Some(EventType::Inventory),
        metadata: Some(metadata),
    })
}

struct DeathDetails<'h> {
    victim: &'h str,
    victim_id: &'h str,
    killer: &'h str,
    killer_id: &'h str,
    zone: &'h str,
    weapon: &'h str,
    damage_type: &'h str,
    metadata: EventMetadata,
}

fn death_details<'h>(captures: &Captures<'h>) -> Option<DeathDetails<'h>> {
    let victim = group(captures, "victim")?;
    let killer = group(captures, "killer")?;
    let victim_id = group(captures, "victim_id").unwrap_or("0");
    let killer_id = group(captures, "killer_id").unwrap_or("0");
    let zone = group(captures, "zone").unwrap_or("unknown");
    let weapon = group(captures, "weapon").unwrap_or("unknown");
    let damage_type = group(captures, "damage_type").unwrap_or("unknown");

    let mut metadata = EventMetadata::new();
    metadata.insert("victimName".to_string(), json!(victim));
    metadata.insert("victimId".to_string(), json!(victim_id));
    metadata.insert("killerName".to_string(), json!(killer));
    metadata.insert("killerId".to_string(), json!(killer_id));
    metadata.insert("zone".to_string(), json!(zone));
    metadata.insert("weapon".to_string(), json!(weapon));
    metadata.insert("damageType".to_string(), json!(damage_type));

    let direction = ["dir_x", "dir_y", "dir_z"]
        .map(|name| group(captures, name).and_then(|value| value.parse::<f64>().ok()));
    if let [Some(x), Some(y), Some(z)] = direction {
        metadata.insert("direction".to_string(), json!({ "x": x, "y": y, "z": z }));
    }

    Some(DeathDetails {
        victim,
        victim_id,
        killer,
        killer_id,
        zone,
        weapon,
        damage_type,
        metadata,
    })
}

fn extract_self_death(captures: &Captures<'_>, context: &mut ParserContext) -> RuleOutcome {
    let Some(victim) = group(captures, "victim") else {
        return RuleOutcome::Drop;
    };
    if !context.is_local_player(victim) {
        return RuleOutcome::Skip;
    }
    let Some(details) = death_details(captures) else {
        return RuleOutcome::Drop;
    };

    let summary = if details.killer == details.victim || details.killer_id == details.victim_id {
        format!(
            "You died in {} ({})",
            humanize_identifier(details.zone),
            details.damage_type
        )
    } else {
        format!(
            "You were killed by {} with {} in {}",
            details.killer,
            humanize_identifier(details.weapon),
            humanize_identifier(details.zone)
        )
    };

    RuleOutcome::Emit(ClassifiedLine {
        icon: ICON_SELF_DEATH,
        summary,
        event_type: Some(EventType::Death),
        metadata: Some(details.metadata),
    })
}

fn extract_other_death(captures: &Captures<'_>, _context: &mut ParserContext) -> RuleOutcome {
    let Some(details) = death_details(captures) else {
        return RuleOutcome::Drop;
    };

    RuleOutcome::Emit(ClassifiedLine {
        icon: ICON_OTHER_DEATH,
        summary: format!(
            "{} killed {} with {} ({})",
            details.killer,
            details.victim,
            humanize_identifier(details.weapon),
            details.damage_type
        ),
        event_type: Some(EventType::Death),
        metadata: Some(details.metadata),
    })
}

fn extract_vehicle_destruction(captures: &Captures<'_>, _context: &mut ParserContext) -> RuleOutcome {
    let (Some(vehicle), Some(destroyer), Some(from_level), Some(to_level)) = (
        group(captures, "vehicle"),
        group(captures, "destroyer"),
        group(captures, "from"),
        group(captures, "to"),
    ) else {
        return RuleOutcome::Drop;
    };

    let soft_death = is_soft_death_level(to_level);
    let vehicle_name = vehicle_type_name(vehicle);

    let mut metadata = EventMetadata::new();
    metadata.insert("vehicleName".to_string(), json!(vehicle));
    metadata.insert("vehicleType".to_string(), json!(vehicle_name));
    metadata.insert("destroyer".to_string(), json!(destroyer));
    metadata.insert("destroyLevelFrom".to_string(), json!(from_level));
    metadata.insert("destroyLevelTo".to_string(), json!(to_level));
    metadata.insert("softDeath".to_string(), json!(soft_death));
    if let Some(vehicle_id) = group(captures, "vehicle_id") {
        metadata.insert("vehicleId".to_string(), json!(vehicle_id));
    }
    if let Some(destroyer_id) = group(captures, "destroyer_id") {
        metadata.insert("destroyerId".to_string(), json!(destroyer_id));
    }
    if let Some(zone) = group(captures, "zone") {
        metadata.insert("zone".to_string(), json!(zone));
    }
    if let Some(cause) = group(captures, "cause") {
        metadata.insert("cause".to_string(), json!(cause));
    }

    let (icon, outcome) = if soft_death {
        (ICON_SOFT_DESTRUCTION, "disabled")
    } else {
        (ICON_HARD_DESTRUCTION, "destroyed")
    };

    RuleOutcome::Emit(ClassifiedLine {
        icon,
        summary: format!("{vehicle_name} was {outcome} by {destroyer}"),
        event_type: Some(EventType::Destruction),
        metadata: Some(metadata),
    })
}

fn extract_ship_destruction(_captures: &Captures<'_>, _context: &mut ParserContext) -> RuleOutcome {
    RuleOutcome::Emit(ClassifiedLine {
        icon: ICON_SHIP_DESTRUCTION,
        summary: "A ship was destroyed".to_string(),
        event_type: Some(EventType::ShipDestruction),
        metadata: None,
    })
}

fn extract_system_quit(_captures: &Captures<'_>, _context: &mut ParserContext) -> RuleOutcome {
    RuleOutcome::Emit(ClassifiedLine {
        icon: ICON_QUIT,
        summary: "Left the game".to_string(),
        event_type: Some(EventType::Quit),
        metadata: None,
    })
}

fn extract_boarding(captures: &Captures<'_>, _context: &mut ParserContext) -> RuleOutcome {
    let (Some(vehicle), Some(vehicle_id)) =
        (group(captures, "vehicle"), group(captures, "vehicle_id"))
    else {
        return RuleOutcome::Drop;
    };

    let vehicle_name = vehicle_type_name(vehicle);
    let mut metadata = EventMetadata::new();
    metadata.insert("vehicleName".to_string(), json!(vehicle));
    metadata.insert("vehicleType".to_string(), json!(vehicle_name));
    metadata.insert("vehicleId".to_string(), json!(vehicle_id));

    RuleOutcome::Emit(ClassifiedLine {
        icon: ICON_BOARDING,
        summary: format!("Boarded {vehicle_name}"),
        event_type: Some(EventType::Boarding),
        metadata: Some(metadata),
    })
}

fn is_soft_death_level(level: &str) -> bool {
    level == SOFT_DEATH_LEVEL || level.to_ascii_lowercase().contains(SOFT_DEATH_MARKER)
}

/// `ANVL_Hornet_F7A_Mk2_3084957383` becomes `ANVL Hornet F7A Mk2`.
fn vehicle_type_name(vehicle: &str) -> String {
    humanize_identifier(&VEHICLE_INSTANCE_SUFFIX.replace(vehicle, ""))
}

fn humanize_identifier(value: &str) -> String {
    value.replace('_', " ")
}

#[cfg(test)]
mod tests {
    use super::{Classifier, ParserContext, ProfileChange};
    use crate::model::EventType;
    use crate::timestamp::parse_log_timestamp;
    use std::time::Duration;

    const LOGIN_LINE: &str = "<2024-06-07T12:00:00.000Z> [Notice] <AccountLoginCharacterStatus_Character> Character: createdAt 1700000000000 - updatedAt 1700000000001 - geid 200000012345 - accountId 5551 - name PlayerOne - state STATE_CURRENT [Team_GameServices][Login]";

    fn death_line(victim: &str, killer: &str, damage_type: &str) -> String {
        format!(
            "<2024-06-07T12:34:56.789Z> [Notice] <Actor Death> CActor::Kill: '{victim}' [200000099999] in zone 'OOC_Stanton_2b_Daymar' killed by '{killer}' [200000077777] using 'KSAR_Rifle_Energy_01_123' [Class unknown] with damage type '{damage_type}' from direction x: 0.125, y: -0.5, z: 0.75 [Team_ActorTech][Actor]"
        )
    }

    fn logged_in_context() -> (Classifier, ParserContext) {
        let classifier = Classifier::default();
        let mut context = ParserContext::new(Some("user-1".to_string()));
        classifier
            .classify(LOGIN_LINE, &mut context)
            .expect("login line should classify");
        (classifier, context)
    }

    #[test]
    fn connection_sets_identity_once_and_reports_profile_change() {
        let classifier = Classifier::default();
        let mut context = ParserContext::default();

        let event = classifier
            .classify(LOGIN_LINE, &mut context)
            .expect("login line should classify");
        assert_eq!(event.event_type, Some(EventType::Connection));
        assert_eq!(event.summary, "PlayerOne connected");
        assert_eq!(context.player_name.as_deref(), Some("PlayerOne"));
        assert_eq!(context.player_id.as_deref(), Some("200000012345"));
        assert_eq!(
            context.take_profile_change(),
            Some(ProfileChange {
                display_name: "PlayerOne".to_string(),
                player_id: Some("200000012345".to_string()),
            })
        );

        let renamed = LOGIN_LINE
            .replace("geid 200000012345", "geid 200000054321")
            .replace("name PlayerOne", "name PlayerTwo");
        classifier.classify(&renamed, &mut context);
        assert_eq!(context.player_name.as_deref(), Some("PlayerTwo"));
        assert_eq!(
            context.player_id.as_deref(),
            Some("200000012345"),
            "Local id must never be overwritten once known"
        );
        assert!(context.take_profile_change().is_some());

        classifier.classify(&renamed, &mut context);
        assert!(
            context.take_profile_change().is_none(),
            "Unchanged display name must not re-notify"
        );
    }

    #[test]
    fn self_death_extracts_structured_fields() {
        let (classifier, mut context) = logged_in_context();
        let line = death_line("PlayerOne", "Outlaw", "Bullet");

        let event = classifier
            .classify(&line, &mut context)
            .expect("self death should classify");

        assert_eq!(event.event_type, Some(EventType::Death));
        assert_eq!(event.icon, "💀");
        assert!(event.summary.starts_with("You were killed by Outlaw"));
        assert_eq!(event.metadata_str("killerId"), Some("200000077777"));
        assert_eq!(event.metadata_str("victimId"), Some("200000099999"));
        assert_eq!(event.metadata_str("damageType"), Some("Bullet"));
        assert_eq!(event.metadata_str("zone"), Some("OOC_Stanton_2b_Daymar"));
        let metadata = event.metadata.as_ref().expect("metadata present");
        assert_eq!(metadata["direction"]["y"], -0.5);
        assert_eq!(event.source_user_id.as_deref(), Some("user-1"));
        assert_eq!(
            event.timestamp,
            parse_log_timestamp("2024-06-07T12:34:56.789Z").expect("valid timestamp")
        );
        assert_eq!(event.raw_original, line);
    }

    #[test]
    fn other_death_uses_third_person_summary() {
        let (classifier, mut context) = logged_in_context();

        let event = classifier
            .classify(&death_line("SomeoneElse", "Outlaw", "Bullet"), &mut context)
            .expect("other death should classify");

        assert_eq!(event.icon, "☠️");
        assert!(event.summary.starts_with("Outlaw killed SomeoneElse"));
    }

    #[test]
    fn inventory_only_matches_the_local_player() {
        let (classifier, mut context) = logged_in_context();
        let own = "<2024-06-07T12:01:00.000Z> [Notice] <RequestLocationInventory> Player[PlayerOne] requested inventory for Location[Stanton_ArcCorp_Area18] [Team_CoreGameplayFeatures][Inventory]";
        let foreign = own.replace("Player[PlayerOne]", "Player[Stranger]");

        let event = classifier
            .classify(own, &mut context)
            .expect("own inventory request should classify");
        assert_eq!(event.event_type, Some(EventType::Inventory));
        assert_eq!(event.metadata_str("location"), Some("Stanton_ArcCorp_Area18"));
        assert!(classifier.classify(&foreign, &mut context).is_none());
    }

    #[test]
    fn vehicle_destruction_distinguishes_soft_and_hard_levels() {
        let (classifier, mut context) = logged_in_context();
        let line = |to_level: &str| {
            format!(
                "<2024-06-07T12:05:00.000Z> [Notice] <Vehicle Destruction> CVehicle::OnAdvanceDestroyLevel: Vehicle 'ANVL_Hornet_F7A_Mk2_3084957383' [3084957383] in zone 'OOC_Stanton_1_Hurston' [pos x: 1.0, y: 2.0, z: 3.0 vel x: 0, y: 0, z: 0] driven by 'PlayerOne' [200000012345] advanced from destroy level 0 to {to_level} caused by 'Outlaw' [200000077777] with 'Combat' [Team_VehicleFeatures][Vehicle]"
            )
        };

        let soft = classifier
            .classify(&line("1"), &mut context)
            .expect("soft destruction should classify");
        let hard = classifier
            .classify(&line("2"), &mut context)
            .expect("hard destruction should classify");

        assert_eq!(soft.event_type, Some(EventType::Destruction));
        assert_eq!(soft.icon, "🔥");
        assert_eq!(hard.icon, "💥");
        assert_eq!(soft.summary, "ANVL Hornet F7A Mk2 was disabled by Outlaw");
        assert_eq!(hard.metadata_str("destroyLevelTo"), Some("2"));
        assert_eq!(hard.metadata_str("cause"), Some("Combat"));
        assert_ne!(soft.id, hard.id);
    }

    #[test]
    fn unstructured_destruction_falls_back_to_generic_ship_rule() {
        let classifier = Classifier::default();
        let mut context = ParserContext::default();

        let event = classifier
            .classify(
                "<2024-06-07T12:05:00.000Z> [Notice] <Vehicle Destruction> something unexpected",
                &mut context,
            )
            .expect("fallback should classify");

        assert_eq!(event.event_type, Some(EventType::ShipDestruction));
        assert!(event.metadata.is_none());
    }

    #[test]
    fn quit_and_boarding_lines_classify() {
        let classifier = Classifier::default();
        let mut context = ParserContext::default();

        let quit = classifier
            .classify(
                "<2024-06-07T13:00:00.000Z> [Notice] <SystemQuit> CSystem::Quit invoked by user",
                &mut context,
            )
            .expect("quit should classify");
        assert_eq!(quit.event_type, Some(EventType::Quit));

        let boarding = classifier
            .classify(
                "<2024-06-07T12:10:00.000Z> [Notice] <Vehicle Control Flow> CVehicleMovementBase::SetDriver: Local client node [200000012345] requesting control token for 'DRAK_Cutlass_Black_2958102345' [2958102345] [Team_VehicleFeatures][Vehicle]",
                &mut context,
            )
            .expect("boarding should classify");
        assert_eq!(boarding.event_type, Some(EventType::Boarding));
        assert_eq!(boarding.summary, "Boarded DRAK Cutlass Black");
        assert_eq!(boarding.metadata_str("vehicleId"), Some("2958102345"));
    }

    #[test]
    fn ignores_blank_and_unrelated_lines() {
        let classifier = Classifier::default();
        let mut context = ParserContext::default();

        assert!(classifier.classify("   ", &mut context).is_none());
        assert!(classifier
            .classify("<2024-06-07T12:00:00.000Z> [Notice] <Something Else> nothing to see", &mut context)
            .is_none());
    }

    #[test]
    fn reclassifying_the_same_line_yields_the_same_id() {
        let (classifier, mut context) = logged_in_context();
        let line = death_line("SomeoneElse", "Outlaw", "Bullet");

        let first = classifier.classify(&line, &mut context).expect("classifies");
        let second = classifier.classify(&line, &mut context).expect("classifies");
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn processing_cutoff_suppresses_older_lines_but_keeps_identity() {
        let classifier = Classifier::default();
        let mut context = ParserContext {
            only_process_after: parse_log_timestamp("2024-06-07T12:30:00.000Z"),
            ..ParserContext::default()
        };

        assert!(classifier.classify(LOGIN_LINE, &mut context).is_none());
        assert_eq!(context.player_name.as_deref(), Some("PlayerOne"));

        let later = classifier.classify(&death_line("PlayerOne", "Outlaw", "Bullet"), &mut context);
        assert!(later.is_some(), "Lines after the cutoff must still classify");
    }

    #[test]
    fn exhausted_pattern_budget_is_treated_as_no_match() {
        let classifier = Classifier::new(Duration::ZERO);
        let mut context = ParserContext::default();

        assert!(classifier
            .classify(
                "<2024-06-07T13:00:00.000Z> [Notice] <SystemQuit> CSystem::Quit invoked",
                &mut context
            )
            .is_none());
    }
}
