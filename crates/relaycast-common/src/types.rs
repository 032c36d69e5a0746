//! Common types for Relaycast

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for user accounts (server and rule owners)
pub type UserId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for messages
pub type MessageId = Uuid;

/// Unique identifier for egress servers (proxies and relays)
pub type ServerId = Uuid;

/// Unique identifier for routing rules
pub type RuleId = Uuid;

/// Unique identifier for retry attempts
pub type RetryAttemptId = Uuid;

/// Kind of egress server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerKind {
    Proxy,
    Relay,
}

impl ServerKind {
    pub const ALL: [ServerKind; 2] = [ServerKind::Proxy, ServerKind::Relay];
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerKind::Proxy => write!(f, "proxy"),
            ServerKind::Relay => write!(f, "relay"),
        }
    }
}

impl std::str::FromStr for ServerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proxy" => Ok(ServerKind::Proxy),
            "relay" | "smtp" => Ok(ServerKind::Relay),
            _ => Err(format!("Invalid server kind: {}", s)),
        }
    }
}

/// Policy for choosing among healthy servers of one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    #[default]
    RoundRobin,
    Random,
    LeastUsed,
    BestPerformance,
    Adaptive,
}

impl std::fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationStrategy::RoundRobin => write!(f, "round_robin"),
            RotationStrategy::Random => write!(f, "random"),
            RotationStrategy::LeastUsed => write!(f, "least_used"),
            RotationStrategy::BestPerformance => write!(f, "best_performance"),
            RotationStrategy::Adaptive => write!(f, "adaptive"),
        }
    }
}

impl std::str::FromStr for RotationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(RotationStrategy::RoundRobin),
            "random" => Ok(RotationStrategy::Random),
            "least_used" => Ok(RotationStrategy::LeastUsed),
            "best_performance" => Ok(RotationStrategy::BestPerformance),
            "adaptive" => Ok(RotationStrategy::Adaptive),
            _ => Err(format!("Invalid rotation strategy: {}", s)),
        }
    }
}

impl RotationStrategy {
    /// Parse a stored strategy, falling back to round-robin when unset or unknown
    pub fn parse_or_default(value: Option<&str>) -> Self {
        value.and_then(|v| v.parse().ok()).unwrap_or_default()
    }
}

/// Classified category of a delivery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Temporary,
    Auth,
    Permanent,
    Server,
    Unknown,
    /// No server of a required kind was available
    Configuration,
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorType::Temporary => write!(f, "temporary"),
            ErrorType::Auth => write!(f, "auth"),
            ErrorType::Permanent => write!(f, "permanent"),
            ErrorType::Server => write!(f, "server"),
            ErrorType::Unknown => write!(f, "unknown"),
            ErrorType::Configuration => write!(f, "configuration"),
        }
    }
}

impl std::str::FromStr for ErrorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporary" => Ok(ErrorType::Temporary),
            "auth" => Ok(ErrorType::Auth),
            "permanent" => Ok(ErrorType::Permanent),
            "server" => Ok(ErrorType::Server),
            "unknown" => Ok(ErrorType::Unknown),
            "configuration" => Ok(ErrorType::Configuration),
            _ => Err(format!("Invalid error type: {}", s)),
        }
    }
}

macro_rules! impl_try_from_string {
    ($($ty:ty),*) => {
        $(
            impl TryFrom<String> for $ty {
                type Error = String;

                fn try_from(value: String) -> Result<Self, Self::Error> {
                    value.parse()
                }
            }
        )*
    };
}

// Lets row decoders read the enums from text columns.
impl_try_from_string!(ServerKind, ErrorType);

impl TryFrom<String> for RotationStrategy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self::parse_or_default(Some(&value)))
    }
}

/// Normalize a carrier name into the key used by configuration tables,
/// rate-limit windows and performance logs.
///
/// Lowercases, trims and folds the common spellings of the large US carriers
/// onto one canonical name. Unrecognized names are returned lowercased.
pub fn normalize_carrier(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let compact: String = lowered
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '&')
        .collect();

    match compact.as_str() {
        "att" | "at&t" | "atandt" | "attwireless" | "cingular" => "at&t".to_string(),
        "tmobile" | "tmo" => "t-mobile".to_string(),
        "verizon" | "verizonwireless" | "vzw" => "verizon".to_string(),
        "sprint" | "sprintpcs" => "sprint".to_string(),
        "uscellular" => "us cellular".to_string(),
        _ => lowered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_carrier() {
        assert_eq!(normalize_carrier("AT&T"), "at&t");
        assert_eq!(normalize_carrier(" att "), "at&t");
        assert_eq!(normalize_carrier("T-Mobile"), "t-mobile");
        assert_eq!(normalize_carrier("Sprint"), "sprint");
        assert_eq!(normalize_carrier("Verizon Wireless"), "verizon");
        assert_eq!(normalize_carrier("Cricket"), "cricket");
        assert_eq!(normalize_carrier(""), "");
    }

    #[test]
    fn test_rotation_strategy_fallback() {
        assert_eq!(RotationStrategy::parse_or_default(None), RotationStrategy::RoundRobin);
        assert_eq!(
            RotationStrategy::parse_or_default(Some("bogus")),
            RotationStrategy::RoundRobin
        );
        assert_eq!(
            RotationStrategy::parse_or_default(Some("least_used")),
            RotationStrategy::LeastUsed
        );
        assert_eq!(
            RotationStrategy::try_from("weighted".to_string()),
            Ok(RotationStrategy::RoundRobin)
        );
    }

    #[test]
    fn test_enum_display_roundtrip() {
        for kind in ServerKind::ALL {
            assert_eq!(kind.to_string().parse::<ServerKind>().unwrap(), kind);
        }
        assert_eq!(ErrorType::Configuration.to_string(), "configuration");
        assert_eq!("server".parse::<ErrorType>().unwrap(), ErrorType::Server);
    }
}
