//! Transport - Hands a message to an egress relay

mod smtp;

use async_trait::async_trait;
use relaycast_common::types::{CampaignId, MessageId};
use relaycast_storage::EgressServer;
use serde::{Deserialize, Serialize};

pub use smtp::SmtpGatewayTransport;

/// What the transport needs to deliver one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub message_id: MessageId,
    pub campaign_id: CampaignId,
    pub destination: String,
    pub payload: String,
    /// Declared or detected carrier
    pub carrier: Option<String>,
}

/// Result of a send attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SendOutcome {
    Sent { response_time_ms: u64 },
    /// Failure text is kept verbatim for classification
    Failed { error: String },
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

/// Sends one message through a relay, optionally via a proxy.
///
/// Implementations report failures as `SendOutcome::Failed` rather than
/// panicking; the dispatcher still guards against panics and timeouts.
#[async_trait]
pub trait TransportSender: Send + Sync {
    async fn send(
        &self,
        request: &SendRequest,
        proxy: Option<&EgressServer>,
        relay: &EgressServer,
    ) -> SendOutcome;
}
