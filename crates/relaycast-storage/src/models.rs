//! Database models

use chrono::{DateTime, Utc};
use relaycast_common::types::{
    CampaignId, ErrorType, MessageId, RetryAttemptId, RotationStrategy, RuleId, ServerId,
    ServerKind, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    InProgress,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl CampaignStatus {
    /// Whether no further dispatch can happen for the campaign
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Cancelled | CampaignStatus::Failed
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::InProgress => write!(f, "in_progress"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Cancelled => write!(f, "cancelled"),
            CampaignStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "in_progress" => Ok(CampaignStatus::InProgress),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            "failed" => Ok(CampaignStatus::Failed),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

impl TryFrom<String> for CampaignStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Message delivery status
///
/// `pending → sending → sent`, or on failure either `retrying` (a retry is
/// scheduled; its deferred task moves the message back to `pending`) or the
/// terminal `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sending,
    Retrying,
    Sent,
    Delivered,
    Failed,
    Cancelled,
}

impl MessageStatus {
    /// Terminal messages are never mutated again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Sent
                | MessageStatus::Delivered
                | MessageStatus::Failed
                | MessageStatus::Cancelled
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Pending => write!(f, "pending"),
            MessageStatus::Sending => write!(f, "sending"),
            MessageStatus::Retrying => write!(f, "retrying"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Delivered => write!(f, "delivered"),
            MessageStatus::Failed => write!(f, "failed"),
            MessageStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sending" => Ok(MessageStatus::Sending),
            "retrying" => Ok(MessageStatus::Retrying),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "failed" => Ok(MessageStatus::Failed),
            "cancelled" => Ok(MessageStatus::Cancelled),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

impl TryFrom<String> for MessageStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Campaign model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub user_id: UserId,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub status: CampaignStatus,
    pub total_messages: i64,
    pub processed_messages: i64,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    /// Calculate progress percentage
    pub fn progress_percentage(&self) -> f64 {
        if self.total_messages == 0 {
            0.0
        } else {
            (self.processed_messages as f64 / self.total_messages as f64) * 100.0
        }
    }
}

/// Create campaign input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCampaign {
    pub user_id: UserId,
    pub name: String,
}

/// Egress server (proxy or mail relay)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EgressServer {
    pub id: ServerId,
    pub user_id: UserId,
    #[sqlx(try_from = "String")]
    pub kind: ServerKind,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub use_tls: bool,
    /// Administrator switch
    pub active: bool,
    /// Derived from recent outcomes
    pub healthy: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_requests: i64,
    pub average_response_time_ms: f64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EgressServer {
    /// Lifetime success rate (1.0 for an unused server)
    pub fn success_rate(&self) -> f64 {
        let finished = self.success_count + self.failure_count;
        if finished == 0 {
            1.0
        } else {
            self.success_count as f64 / finished as f64
        }
    }

    /// Whether the server may be selected
    pub fn is_available(&self) -> bool {
        self.active && self.healthy
    }
}

/// Create egress server input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEgressServer {
    pub user_id: UserId,
    pub kind: ServerKind,
    pub name: String,
    pub host: String,
    pub port: i32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

/// Per-server capacity and routing metadata configured by the owner
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ServerCapacityWeight {
    pub user_id: UserId,
    #[sqlx(try_from = "String")]
    pub server_kind: ServerKind,
    pub server_id: ServerId,
    pub weight: f64,
    pub max_concurrent: i32,
    pub min_success_rate: f64,
    pub max_response_time_ms: f64,
    pub timezone: Option<String>,
    pub tags: Vec<String>,
}

impl ServerCapacityWeight {
    /// Default capacity entry for a server without explicit configuration
    pub fn default_for(user_id: UserId, server_kind: ServerKind, server_id: ServerId) -> Self {
        Self {
            user_id,
            server_kind,
            server_id,
            weight: 1.0,
            max_concurrent: 10,
            min_success_rate: 0.8,
            max_response_time_ms: 5_000.0,
            timezone: None,
            tags: Vec::new(),
        }
    }
}

/// Per-campaign delivery behaviour
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct CampaignDeliverySettings {
    pub campaign_id: CampaignId,
    #[sqlx(try_from = "String")]
    pub proxy_strategy: RotationStrategy,
    #[sqlx(try_from = "String")]
    pub relay_strategy: RotationStrategy,
    pub min_delay_secs: Option<f64>,
    pub max_delay_secs: Option<f64>,
    pub delay_seed: Option<i64>,
    pub adaptive_optimization: bool,
    pub carrier_optimization: bool,
    pub timezone_optimization: bool,
    pub updated_at: DateTime<Utc>,
}

impl CampaignDeliverySettings {
    /// Defaults created on first use
    pub fn defaults(campaign_id: CampaignId) -> Self {
        Self {
            campaign_id,
            proxy_strategy: RotationStrategy::RoundRobin,
            relay_strategy: RotationStrategy::RoundRobin,
            min_delay_secs: None,
            max_delay_secs: None,
            delay_seed: None,
            adaptive_optimization: false,
            carrier_optimization: false,
            timezone_optimization: false,
            updated_at: Utc::now(),
        }
    }

    /// Rotation strategy for a server kind
    pub fn strategy_for(&self, kind: ServerKind) -> RotationStrategy {
        match kind {
            ServerKind::Proxy => self.proxy_strategy,
            ServerKind::Relay => self.relay_strategy,
        }
    }
}

/// Message (one destination of a campaign)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub campaign_id: CampaignId,
    pub destination: String,
    pub payload: String,
    pub carrier: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: MessageStatus,
    pub proxy_server_id: Option<ServerId>,
    pub relay_server_id: Option<ServerId>,
    /// Send attempts made
    pub attempts: i32,
    /// Retry attempts created
    pub retry_count: i32,
    pub not_before: Option<DateTime<Utc>>,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub error_type: Option<String>,
}

impl Message {
    /// Classified type of the last error
    pub fn error_kind(&self) -> Option<ErrorType> {
        self.error_type.as_deref().and_then(|t| t.parse().ok())
    }

    /// Whether the message may be picked up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == MessageStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }
}

/// Create message input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessage {
    pub campaign_id: CampaignId,
    pub destination: String,
    pub payload: String,
    pub carrier: Option<String>,
}

/// Message counts by status for a campaign
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageStatusCounts {
    pub pending: i64,
    pub sending: i64,
    pub retrying: i64,
    pub sent: i64,
    pub delivered: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl MessageStatusCounts {
    pub fn total(&self) -> i64 {
        self.pending
            + self.sending
            + self.retrying
            + self.sent
            + self.delivered
            + self.failed
            + self.cancelled
    }

    /// Messages that can still produce a send
    pub fn outstanding(&self) -> i64 {
        self.pending + self.sending + self.retrying
    }

    pub(crate) fn add(&mut self, status: MessageStatus, count: i64) {
        match status {
            MessageStatus::Pending => self.pending += count,
            MessageStatus::Sending => self.sending += count,
            MessageStatus::Retrying => self.retrying += count,
            MessageStatus::Sent => self.sent += count,
            MessageStatus::Delivered => self.delivered += count,
            MessageStatus::Failed => self.failed += count,
            MessageStatus::Cancelled => self.cancelled += count,
        }
    }
}

/// One scheduled retry of a message
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: RetryAttemptId,
    pub message_id: MessageId,
    pub campaign_id: CampaignId,
    pub attempt_number: i32,
    #[sqlx(try_from = "String")]
    pub error_type: ErrorType,
    pub error_text: String,
    pub delay_secs: f64,
    pub scheduled_at: DateTime<Utc>,
    pub completed: bool,
    pub success: bool,
    pub proxy_server_id: Option<ServerId>,
    pub relay_server_id: Option<ServerId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Create retry attempt input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRetryAttempt {
    pub message_id: MessageId,
    pub campaign_id: CampaignId,
    pub attempt_number: i32,
    pub error_type: ErrorType,
    pub error_text: String,
    pub delay_secs: f64,
    pub scheduled_at: DateTime<Utc>,
    pub proxy_server_id: Option<ServerId>,
    pub relay_server_id: Option<ServerId>,
}

/// Conditions of a routing rule; absent conditions always match
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, Default, PartialEq)]
pub struct RuleConditions {
    pub destination_pattern: Option<String>,
    pub carriers: Vec<String>,
    pub area_codes: Vec<String>,
    pub states: Vec<String>,
    pub timezones: Vec<String>,
    pub hour_start: Option<i32>,
    pub hour_end: Option<i32>,
}

/// Actions of a routing rule
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct RuleActions {
    pub preferred_tags: Vec<String>,
    pub rate_limit_multiplier: f64,
    pub prefer_high_capacity: bool,
    pub prefer_reliable: bool,
}

impl Default for RuleActions {
    fn default() -> Self {
        Self {
            preferred_tags: Vec::new(),
            rate_limit_multiplier: 1.0,
            prefer_high_capacity: false,
            prefer_reliable: false,
        }
    }
}

/// Conditional routing policy
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: RuleId,
    pub user_id: UserId,
    pub name: String,
    #[sqlx(flatten)]
    pub conditions: RuleConditions,
    #[sqlx(flatten)]
    pub actions: RuleActions,
    pub priority: i32,
    pub enabled: bool,
    pub match_count: i64,
    pub success_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Create routing rule input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRoutingRule {
    pub user_id: UserId,
    pub name: String,
    pub conditions: RuleConditions,
    pub actions: RuleActions,
    pub priority: i32,
    pub enabled: bool,
}

/// Delivery history of one (carrier, proxy, relay) combination
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CarrierPerformanceLog {
    pub user_id: UserId,
    pub carrier: String,
    pub proxy_server_id: Option<ServerId>,
    pub relay_server_id: ServerId,
    pub total_messages: i64,
    pub successful_messages: i64,
    pub success_rate: f64,
    pub average_delivery_ms: f64,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one attempt, recorded into the carrier performance log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarrierOutcome {
    pub user_id: UserId,
    pub carrier: String,
    pub proxy_server_id: Option<ServerId>,
    pub relay_server_id: ServerId,
    pub success: bool,
    pub delivery_ms: f64,
}

/// Per-campaign usage of one server
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, PartialEq)]
pub struct ServerUsageLog {
    pub campaign_id: CampaignId,
    #[sqlx(try_from = "String")]
    pub server_kind: ServerKind,
    pub server_id: ServerId,
    pub messages_sent: i64,
    pub successes: i64,
    pub failures: i64,
    pub last_used_at: DateTime<Utc>,
}

impl ServerUsageLog {
    pub fn success_rate(&self) -> f64 {
        if self.messages_sent == 0 {
            0.0
        } else {
            self.successes as f64 / self.messages_sent as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_status_terminal() {
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(MessageStatus::Cancelled.is_terminal());
        assert!(!MessageStatus::Retrying.is_terminal());
        assert!(!MessageStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("in_progress".parse::<CampaignStatus>().unwrap(), CampaignStatus::InProgress);
        assert_eq!(CampaignStatus::InProgress.to_string(), "in_progress");
        assert_eq!("retrying".parse::<MessageStatus>().unwrap(), MessageStatus::Retrying);
        assert!("bogus".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn test_status_counts() {
        let mut counts = MessageStatusCounts::default();
        counts.add(MessageStatus::Pending, 3);
        counts.add(MessageStatus::Retrying, 1);
        counts.add(MessageStatus::Sent, 6);
        assert_eq!(counts.total(), 10);
        assert_eq!(counts.outstanding(), 4);
    }

    #[test]
    fn test_unused_server_success_rate() {
        let now = Utc::now();
        let server = EgressServer {
            id: uuid::Uuid::new_v4(),
            user_id: uuid::Uuid::new_v4(),
            kind: ServerKind::Relay,
            name: "relay-1".into(),
            host: "smtp.example.com".into(),
            port: 587,
            username: None,
            password: None,
            use_tls: true,
            active: true,
            healthy: true,
            success_count: 0,
            failure_count: 0,
            total_requests: 0,
            average_response_time_ms: 0.0,
            last_used_at: None,
            created_at: now,
        };
        assert_eq!(server.success_rate(), 1.0);
        assert!(server.is_available());
    }
}
