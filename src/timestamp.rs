use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use regex::Regex;

lazy_static::lazy_static! {
    static ref LINE_TIMESTAMP_PREFIX: Regex =
        Regex::new(r"^\s*[<\[]([^>\]]{8,40})[>\]]").expect("valid timestamp prefix pattern");
    static ref RAW_TIMESTAMP: Regex = Regex::new(
        r"^(\d{4})\.(\d{2})\.(\d{2})-(\d{2}):(\d{2}):(\d{2})(?::(\d{1,3}))?$"
    )
    .expect("valid raw timestamp pattern");
}

/// Renders an instant the way every event timestamp is stored and hashed:
/// `YYYY-MM-DDTHH:MM:SS.mmmZ`.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Parses the token found inside a line's bracketed prefix.
///
/// Accepts a pass-through ISO-8601 instant or the dotted game format
/// `YYYY.MM.DD-HH:MM:SS[:mmm]`, where a short millisecond field is padded
/// on the right (`:7` is 700ms).
pub fn parse_log_timestamp(token: &str) -> Option<DateTime<Utc>> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    if let Some(captures) = RAW_TIMESTAMP.captures(token) {
        let field = |index: usize| captures.get(index).map(|value| value.as_str());
        let year = field(1)?.parse::<i32>().ok()?;
        let month = field(2)?.parse::<u32>().ok()?;
        let day = field(3)?.parse::<u32>().ok()?;
        let hour = field(4)?.parse::<u32>().ok()?;
        let minute = field(5)?.parse::<u32>().ok()?;
        let second = field(6)?.parse::<u32>().ok()?;
        let millis = match field(7) {
            Some(raw_millis) => format!("{raw_millis:0<3}").parse::<u32>().ok()?,
            None => 0,
        };

        let naive = NaiveDate::from_ymd_opt(year, month, day)?
            .and_hms_milli_opt(hour, minute, second, millis)?;
        return Some(naive.and_utc());
    }

    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|value| value.with_timezone(&Utc).trunc_subsecs(3))
}

/// Extracts the bracketed timestamp prefix of a log line, if it parses.
pub fn extract_line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let captures = LINE_TIMESTAMP_PREFIX.captures(line)?;
    parse_log_timestamp(captures.get(1)?.as_str())
}

/// Same as [`extract_line_timestamp`] but never fails: lines with a missing or
/// malformed prefix are stamped with the current wall-clock time.
pub fn resolve_line_timestamp(line: &str) -> DateTime<Utc> {
    extract_line_timestamp(line).unwrap_or_else(now_millis)
}

pub(crate) mod serde_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_log_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'")))
    }
}

pub(crate) mod serde_millis_option {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(timestamp) => serializer.serialize_str(&super::format_timestamp(timestamp)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        match raw {
            Some(raw) => super::parse_log_timestamp(&raw)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{raw}'"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{extract_line_timestamp, format_timestamp, parse_log_timestamp};

    fn parsed(token: &str) -> String {
        let timestamp = parse_log_timestamp(token).expect("Expected timestamp to parse");
        format_timestamp(&timestamp)
    }

    #[test]
    fn parses_dotted_timestamp_with_millis() {
        assert_eq!(parsed("2024.06.07-12:34:56:789"), "2024-06-07T12:34:56.789Z");
    }

    #[test]
    fn pads_missing_or_short_millis() {
        assert_eq!(parsed("2024.06.07-12:34:56"), "2024-06-07T12:34:56.000Z");
        assert_eq!(parsed("2024.06.07-12:34:56:7"), "2024-06-07T12:34:56.700Z");
        assert_eq!(parsed("2024.06.07-12:34:56:78"), "2024-06-07T12:34:56.780Z");
    }

    #[test]
    fn passes_iso_timestamps_through() {
        assert_eq!(parsed("2024-06-07T12:34:56.789Z"), "2024-06-07T12:34:56.789Z");
        assert_eq!(parsed("2024-06-07T14:34:56.789+02:00"), "2024-06-07T12:34:56.789Z");
    }

    #[test]
    fn rejects_impossible_dates() {
        assert!(parse_log_timestamp("2024.13.40-12:34:56").is_none());
        assert!(parse_log_timestamp("yesterday").is_none());
    }

    #[test]
    fn extracts_angle_and_square_bracket_prefixes() {
        let angle = extract_line_timestamp("<2024-06-07T12:34:56.789Z> [Notice] <SystemQuit>")
            .expect("Expected angle bracket prefix");
        let square = extract_line_timestamp("[2024.06.07-12:34:56:789] something happened")
            .expect("Expected square bracket prefix");

        assert_eq!(angle, square);
        assert!(extract_line_timestamp("[Notice] no timestamp here").is_none());
    }
}
