//! Destination lookups

use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Timelike, Utc};
use relaycast_common::types::normalize_carrier;
use serde::{Deserialize, Serialize};

use super::tables::{
    CARRIER_PREFIXES, GATEWAY_DOMAINS, STATE_PREFIXES, TIMEZONE_OFFSETS, TIMEZONE_PREFIXES,
};

/// Timezone assumed when the area code is unknown
pub const DEFAULT_TIMEZONE: &str = "eastern";

/// Everything known about a destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    /// 10-digit national number, if the destination parsed as one
    pub number: Option<String>,
    pub area_code: Option<String>,
    pub carrier: Option<String>,
    pub state: Option<String>,
    pub timezone: String,
}

/// Strip everything but digits; an 11-digit number with a leading `1`
/// loses the country code. Returns `None` unless 10 digits remain.
pub fn normalize_number(destination: &str) -> Option<String> {
    let digits: String = destination.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = match digits.len() {
        11 if digits.starts_with('1') => &digits[1..],
        10 => digits.as_str(),
        _ => return None,
    };
    Some(national.to_string())
}

/// First three digits of the national number
pub fn area_code(destination: &str) -> Option<String> {
    normalize_number(destination).map(|n| n[..3].to_string())
}

fn lookup(table: &[(&[&str], &'static str)], number: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(prefixes, _)| prefixes.iter().any(|p| number.starts_with(p)))
        .map(|(_, result)| *result)
}

/// Best-guess carrier of the destination
pub fn detect_carrier(destination: &str) -> Option<String> {
    let number = normalize_number(destination)?;
    lookup(CARRIER_PREFIXES, &number).map(str::to_string)
}

/// Timezone of the destination, `eastern` when unknown
pub fn detect_timezone(destination: &str) -> String {
    normalize_number(destination)
        .and_then(|n| lookup(TIMEZONE_PREFIXES, &n))
        .unwrap_or(DEFAULT_TIMEZONE)
        .to_string()
}

/// Two-letter state of the destination
pub fn detect_state(destination: &str) -> Option<String> {
    let number = normalize_number(destination)?;
    lookup(STATE_PREFIXES, &number).map(str::to_string)
}

/// All lookups at once
pub fn geo_info(destination: &str) -> GeoInfo {
    let number = normalize_number(destination);
    let lookup_in =
        |table: &[(&[&str], &'static str)]| number.as_deref().and_then(|n| lookup(table, n));

    GeoInfo {
        area_code: number.as_ref().map(|n| n[..3].to_string()),
        carrier: lookup_in(CARRIER_PREFIXES).map(str::to_string),
        state: lookup_in(STATE_PREFIXES).map(str::to_string),
        timezone: lookup_in(TIMEZONE_PREFIXES)
            .unwrap_or(DEFAULT_TIMEZONE)
            .to_string(),
        number,
    }
}

/// SMTP-to-SMS gateway domain for a carrier
pub fn gateway_domain(carrier: &str) -> Option<&'static str> {
    let key = normalize_carrier(carrier);
    GATEWAY_DOMAINS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, domain)| *domain)
}

/// UTC offset of a timezone name; unknown names use the default timezone
pub fn timezone_offset_hours(timezone: &str) -> i32 {
    let name = timezone.trim().to_lowercase();
    TIMEZONE_OFFSETS
        .iter()
        .find(|(tz, _)| *tz == name)
        .or_else(|| TIMEZONE_OFFSETS.iter().find(|(tz, _)| *tz == DEFAULT_TIMEZONE))
        .map(|(_, offset)| *offset)
        .unwrap_or(-5)
}

fn offset_of(timezone: &str) -> FixedOffset {
    let seconds = timezone_offset_hours(timezone) * 3600;
    FixedOffset::east_opt(seconds).unwrap_or_else(|| Utc.fix())
}

/// Hour of day (0-23) in the timezone at `now`
pub fn local_hour(timezone: &str, now: DateTime<Utc>) -> u32 {
    now.with_timezone(&offset_of(timezone)).hour()
}

/// Whether the local hour lies in `[start, end)`, wrapping past midnight
/// when `start > end`
pub fn within_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// Next moment the `[start_hour, end_hour)` send window opens in the
/// timezone, strictly after `now` unless the window is open right now
pub fn next_window_open(
    timezone: &str,
    start_hour: u32,
    end_hour: u32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let offset = offset_of(timezone);
    let local = now.with_timezone(&offset);
    if within_window(local.hour(), start_hour, end_hour) {
        return now;
    }

    let today_open = local
        .date_naive()
        .and_hms_opt(start_hour.min(23), 0, 0)
        .and_then(|naive| offset.from_local_datetime(&naive).single());

    match today_open {
        Some(open) if open > local => open.with_timezone(&Utc),
        Some(open) => (open + Duration::days(1)).with_timezone(&Utc),
        None => now + Duration::hours(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number("(212) 555-0100").as_deref(), Some("2125550100"));
        assert_eq!(normalize_number("+1 212 555 0100").as_deref(), Some("2125550100"));
        assert_eq!(normalize_number("555-0100"), None);
        assert_eq!(normalize_number("22125550100"), None);
    }

    #[test]
    fn test_first_match_wins() {
        // 212 is listed for both verizon and at&t; verizon comes first
        assert_eq!(detect_carrier("2125550100").as_deref(), Some("verizon"));
        assert_eq!(detect_carrier("4045550100").as_deref(), Some("at&t"));
        assert_eq!(detect_carrier("9135550100").as_deref(), Some("sprint"));
        assert_eq!(detect_carrier("9995550100"), None);
    }

    #[test]
    fn test_geo_info() {
        let info = geo_info("+1 (415) 555-0100");
        assert_eq!(
            info,
            GeoInfo {
                number: Some("4155550100".into()),
                area_code: Some("415".into()),
                carrier: Some("at&t".into()),
                state: Some("CA".into()),
                timezone: "pacific".into(),
            }
        );
    }

    #[test]
    fn test_unknown_defaults_to_eastern() {
        assert_eq!(detect_timezone("9995550100"), "eastern");
        assert_eq!(detect_timezone("garbage"), "eastern");
        assert_eq!(detect_state("9995550100"), None);
        assert_eq!(area_code("garbage"), None);
    }

    #[test]
    fn test_gateway_domain() {
        assert_eq!(gateway_domain("Verizon Wireless"), Some("vtext.com"));
        assert_eq!(gateway_domain("AT&T"), Some("txt.att.net"));
        assert_eq!(gateway_domain("unknown"), None);
    }

    #[test]
    fn test_window_wraps_midnight() {
        assert!(within_window(9, 8, 21));
        assert!(!within_window(21, 8, 21));
        assert!(within_window(23, 22, 6));
        assert!(within_window(3, 22, 6));
        assert!(!within_window(12, 22, 6));
    }

    #[test]
    fn test_next_window_open() {
        // 03:00 UTC is 22:00 eastern the previous day
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 3, 0, 0).unwrap();
        assert_eq!(local_hour("eastern", now), 22);
        let open = next_window_open("eastern", 8, 21, now);
        assert_eq!(open, Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap());

        // 10:00 UTC is 05:00 eastern, same-day opening
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 10, 0, 0).unwrap();
        let open = next_window_open("eastern", 8, 21, now);
        assert_eq!(open, Utc.with_ymd_and_hms(2024, 3, 10, 13, 0, 0).unwrap());

        // Inside the window
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        assert_eq!(next_window_open("eastern", 8, 21, now), now);
    }
}
