use chrono::{DateTime, Utc};

use crate::timestamp::format_timestamp;

/// Stable id for a classified line: the same line re-parsed after a restart
/// must land on the same id so the sequencer can drop it.
///
/// Two independent 32-bit hashes over `timestamp|line` (a ×31 rolling hash and a
/// position-weighted character sum), each base-36 encoded.
pub fn generate_event_id(timestamp: &DateTime<Utc>, raw_line: &str) -> String {
    let input = format!("{}|{}", format_timestamp(timestamp), raw_line);

    let mut rolling_hash: u32 = 0;
    let mut weighted_sum: u32 = 0;
    for (position, character) in input.chars().enumerate() {
        let code = u32::from(character);
        rolling_hash = rolling_hash.wrapping_mul(31).wrapping_add(code);
        weighted_sum = weighted_sum.wrapping_add(code.wrapping_mul(position as u32 + 1));
    }

    format!("{}{}", to_base36(rolling_hash), to_base36(weighted_sum))
}

fn to_base36(mut value: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut encoded = Vec::with_capacity(7);
    while value > 0 {
        encoded.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    encoded.reverse();

    String::from_utf8_lossy(&encoded).into_owned()
}
