//! Carrier Detection - Destination number to carrier, timezone and state
//!
//! Lookups are best-effort heuristics over area-code prefix tables. They
//! only steer optimization and never block a send.

mod detector;
mod tables;

pub use detector::{
    area_code, detect_carrier, detect_state, detect_timezone, gateway_domain, geo_info,
    local_hour, next_window_open, normalize_number, timezone_offset_hours, within_window,
    GeoInfo, DEFAULT_TIMEZONE,
};
