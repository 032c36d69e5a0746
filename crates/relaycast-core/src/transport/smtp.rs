//! SMTP-to-SMS gateway transport
//!
//! Each message is mailed as plain text to `<number>@<carrier gateway>`
//! through the selected relay. lettre cannot tunnel through a proxy, so the
//! proxy is only recorded by the dispatcher for bookkeeping.
//!
//! Pooled mailers are cached per relay together with the connection settings
//! they were built from; an edited relay gets a fresh mailer, and a relay
//! whose connection broke drops its pool.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use relaycast_common::config::SmtpConfig;
use relaycast_common::types::ServerId;
use relaycast_storage::EgressServer;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{SendOutcome, SendRequest, TransportSender};
use crate::carrier::{detect_carrier, gateway_domain, normalize_number};

/// Implicit-TLS submission port; other TLS ports use STARTTLS
const SMTPS_PORT: i32 = 465;

/// Connection settings a mailer was built from
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: i32,
    use_tls: bool,
    username: Option<String>,
    password: Option<String>,
}

impl Endpoint {
    fn of(relay: &EgressServer) -> Self {
        Self {
            host: relay.host.clone(),
            port: relay.port,
            use_tls: relay.use_tls,
            username: relay.username.clone(),
            password: relay.password.clone(),
        }
    }
}

struct CachedMailer {
    endpoint: Endpoint,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

/// Sends messages through each relay's SMTP server
pub struct SmtpGatewayTransport {
    config: SmtpConfig,
    mailers: RwLock<HashMap<ServerId, CachedMailer>>,
}

impl SmtpGatewayTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config,
            mailers: RwLock::new(HashMap::new()),
        }
    }

    /// Pooled transport for a relay, built on first use and rebuilt when the
    /// relay's connection settings changed
    fn mailer(&self, relay: &EgressServer) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
        let endpoint = Endpoint::of(relay);
        if let Some(cached) = self
            .mailers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&relay.id)
            .filter(|cached| cached.endpoint == endpoint)
        {
            return Ok(cached.mailer.clone());
        }

        let port = u16::try_from(relay.port)
            .map_err(|_| format!("relay {} has invalid port {}", relay.name, relay.port))?;

        let mut builder = if relay.use_tls && relay.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&relay.host)
                .map_err(|e| format!("Failed to create SMTP transport: {}", e))?
        } else if relay.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&relay.host)
                .map_err(|e| format!("Failed to create SMTP transport: {}", e))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&relay.host)
        };
        builder = builder
            .port(port)
            .timeout(Some(Duration::from_secs(self.config.timeout_secs)));

        if let (Some(username), Some(password)) = (&relay.username, &relay.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let mailer = builder.build();
        let replaced = self
            .mailers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                relay.id,
                CachedMailer {
                    endpoint,
                    mailer: mailer.clone(),
                },
            );
        if replaced.is_some() {
            debug!(relay = %relay.name, "Relay settings changed, mailer rebuilt");
        }
        Ok(mailer)
    }

    fn drop_mailer(&self, relay: &EgressServer) {
        self.mailers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&relay.id);
    }

    /// Envelope sender: the relay login when it is an address, otherwise
    /// the configured default
    fn sender(&self, relay: &EgressServer) -> String {
        relay
            .username
            .as_deref()
            .filter(|u| u.contains('@'))
            .unwrap_or(self.config.from_address.as_str())
            .to_string()
    }

    fn build(&self, request: &SendRequest, relay: &EgressServer) -> Result<Message, String> {
        let recipient = gateway_address(&request.destination, request.carrier.as_deref())?;

        let from: Mailbox = self
            .sender(relay)
            .parse()
            .map_err(|e| format!("Invalid from address: {}", e))?;
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| format!("Invalid recipient address {}: {}", recipient, e))?;

        Message::builder()
            .from(from)
            .to(to)
            .header(ContentType::TEXT_PLAIN)
            .body(request.payload.clone())
            .map_err(|e| format!("Failed to build message: {}", e))
    }
}

/// `<number>@<gateway domain>` for a destination, detecting the carrier
/// when none is declared
pub fn gateway_address(destination: &str, carrier: Option<&str>) -> Result<String, String> {
    let number = normalize_number(destination)
        .ok_or_else(|| format!("Invalid number: {}", destination))?;
    let carrier = carrier
        .map(str::to_string)
        .or_else(|| detect_carrier(&number))
        .ok_or_else(|| format!("Invalid recipient: no carrier known for {}", number))?;
    let domain = gateway_domain(&carrier)
        .ok_or_else(|| format!("Invalid recipient: no SMS gateway for carrier {}", carrier))?;
    Ok(format!("{}@{}", number, domain))
}

#[async_trait]
impl TransportSender for SmtpGatewayTransport {
    async fn send(
        &self,
        request: &SendRequest,
        proxy: Option<&EgressServer>,
        relay: &EgressServer,
    ) -> SendOutcome {
        let email = match self.build(request, relay) {
            Ok(email) => email,
            Err(error) => return SendOutcome::Failed { error },
        };
        let mailer = match self.mailer(relay) {
            Ok(mailer) => mailer,
            Err(error) => return SendOutcome::Failed { error },
        };

        let started = Instant::now();
        match mailer.send(email).await {
            Ok(response) => {
                let response_time_ms = started.elapsed().as_millis() as u64;
                debug!(
                    message_id = %request.message_id,
                    relay = %relay.name,
                    proxy = proxy.map(|p| p.name.as_str()),
                    code = %response.code(),
                    response_time_ms,
                    "Message accepted by relay"
                );
                SendOutcome::Sent { response_time_ms }
            }
            Err(e) => {
                // Lead with the SMTP status code so classification sees it
                let error = match e.status() {
                    Some(code) => format!("{} {}", code, e),
                    None => {
                        // No SMTP reply at all: the pooled connection is suspect
                        self.drop_mailer(relay);
                        e.to_string()
                    }
                };
                warn!(
                    message_id = %request.message_id,
                    relay = %relay.name,
                    "SMTP send failed: {}",
                    error
                );
                SendOutcome::Failed { error }
            }
        }
    }
}
