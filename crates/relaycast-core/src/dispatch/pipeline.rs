//! Per-message send pipeline
//!
//! status check → send window → claim → routing → selection → rate-limit
//! gate → send delay → transport → outcome bookkeeping → retry or final
//! status.
//!
//! A claimed message never stays `sending` after its pipeline: a store error
//! past the claim hands it back to `pending`.

use std::any::Any;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relaycast_common::config::DispatchConfig;
use relaycast_common::types::{ErrorType, MessageId, RotationStrategy, ServerKind};
use relaycast_storage::{
    Campaign, CampaignDeliverySettings, CampaignStatus, CarrierOutcome, EgressServer, Message,
    MessageStatus,
};
use tracing::{debug, error, info, warn};

use super::coordinator::{DispatchCoordinator, PassContext};
use crate::carrier::{detect_carrier, detect_timezone, local_hour, next_window_open, within_window};
use crate::error::DispatchError;
use crate::retry::classify;
use crate::routing::RoutingDecision;
use crate::transport::{SendOutcome, SendRequest};

/// What happened to one message in a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MessageOutcome {
    Sent,
    Retrying,
    Failed,
    ConfigurationFault,
    Deferred,
    Skipped,
    /// The campaign left `in_progress`; the message was left untouched
    Aborted,
}

/// Servers and routing facts of one send attempt
struct Route {
    proxy: Option<EgressServer>,
    relay: EgressServer,
    decision: RoutingDecision,
}

impl DispatchCoordinator {
    pub(super) async fn process_message(
        &self,
        context: &PassContext,
        mut message: Message,
    ) -> Result<MessageOutcome, DispatchError> {
        let campaign = &context.campaign;
        let status = self
            .repos
            .campaigns
            .get(campaign.id)
            .await?
            .map(|c| c.status);
        if status != Some(CampaignStatus::InProgress) {
            debug!(campaign_id = %campaign.id, status = ?status, "Campaign left in_progress, pass aborted");
            return Ok(MessageOutcome::Aborted);
        }

        let settings = self.repos.settings.load_or_create(campaign.id).await?;

        if settings.timezone_optimization {
            if let Some(open_at) =
                send_window_deferral(&self.config, &message.destination, Utc::now())
            {
                message.not_before = Some(open_at);
                self.repos.messages.update(&message).await?;
                debug!(
                    message_id = %message.id,
                    not_before = %open_at,
                    "Outside local send window, deferred"
                );
                return Ok(MessageOutcome::Deferred);
            }
        }

        if !self.repos.messages.claim(message.id).await? {
            return Ok(MessageOutcome::Skipped);
        }
        message.status = MessageStatus::Sending;

        let message_id = message.id;
        let result = self.dispatch_claimed(context, &settings, message).await;
        if let Err(e) = &result {
            self.release_claim(message_id, e).await;
        }
        result
    }

    async fn dispatch_claimed(
        &self,
        context: &PassContext,
        settings: &CampaignDeliverySettings,
        mut message: Message,
    ) -> Result<MessageOutcome, DispatchError> {
        let campaign = &context.campaign;
        let declared = message.carrier.clone().filter(|c| !c.trim().is_empty());
        let carrier = declared.or_else(|| detect_carrier(&message.destination));
        if message.carrier.is_none() {
            message.carrier = carrier.clone();
        }

        let decision = self
            .routing
            .select_servers(
                campaign.user_id,
                &message.destination,
                carrier.as_deref(),
                context.proxies.clone(),
                context.relays.clone(),
                Utc::now(),
            )
            .await;
        let (proxy, relay) = self.choose_servers(campaign, settings, &decision).await;
        let Some(relay) = relay else {
            if context.relays.is_empty() {
                return self.fail_unroutable(campaign, message).await;
            }
            return self.defer_for_recovery(campaign, message).await;
        };

        message.proxy_server_id = proxy.as_ref().map(|p| p.id);
        message.relay_server_id = Some(relay.id);
        message.attempts += 1;
        let route = Route {
            proxy,
            relay,
            decision,
        };

        let rate_key = route.decision.carrier.clone().unwrap_or_default();
        let waited = self
            .limiter
            .acquire(&rate_key, campaign.id, route.decision.rate_limit_multiplier)
            .await;
        let delay = send_delay(settings, &self.config, message.id);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let request = SendRequest {
            message_id: message.id,
            campaign_id: campaign.id,
            destination: message.destination.clone(),
            payload: message.payload.clone(),
            carrier: route.decision.carrier.clone(),
        };
        debug!(
            message_id = %message.id,
            relay = %route.relay.name,
            proxy = route.proxy.as_ref().map(|p| p.name.as_str()),
            carrier = route.decision.carrier.as_deref(),
            waited_ms = waited.as_millis() as u64,
            delay_ms = delay.as_millis() as u64,
            "Sending message"
        );

        match self.send(request, &route).await {
            SendOutcome::Sent { response_time_ms } => {
                self.on_sent(campaign, settings, &route, message, response_time_ms)
                    .await
            }
            SendOutcome::Failed { error } => {
                self.on_failed(campaign, settings, &route, message, error)
                    .await
            }
        }
    }

    /// Put a message whose pipeline broke after the claim back to `pending`
    async fn release_claim(&self, message_id: MessageId, cause: &DispatchError) {
        let released = match self.repos.messages.get(message_id).await {
            Ok(Some(mut message)) if message.status == MessageStatus::Sending => {
                message.status = MessageStatus::Pending;
                self.repos.messages.update(&message).await.map(|_| true)
            }
            Ok(_) => Ok(false),
            Err(e) => Err(e),
        };
        match released {
            Ok(true) => warn!(message_id = %message_id, "Claim released after error: {}", cause),
            Ok(false) => {}
            Err(e) => error!(
                message_id = %message_id,
                "Failed to release claim, left for the next campaign loop: {}",
                e
            ),
        }
    }

    /// Carrier-optimal pair when enabled and still routable, otherwise one
    /// `next()` per kind
    async fn choose_servers(
        &self,
        campaign: &Campaign,
        settings: &CampaignDeliverySettings,
        decision: &RoutingDecision,
    ) -> (Option<EgressServer>, Option<EgressServer>) {
        let (proxy_strategy, relay_strategy) = if settings.carrier_optimization {
            if let Some(carrier) = decision.carrier.as_deref() {
                if let Some(pair) = self.selector.optimal_pair(campaign.user_id, carrier).await {
                    let relay_routed = decision.relays.iter().any(|c| c.server.id == pair.relay.id);
                    let proxy_routed = pair.proxy.as_ref().map_or(true, |proxy| {
                        decision.proxies.iter().any(|c| c.server.id == proxy.id)
                    });
                    if relay_routed && proxy_routed {
                        debug!(
                            campaign_id = %campaign.id,
                            carrier,
                            relay = %pair.relay.name,
                            success_rate = pair.success_rate,
                            "Using carrier-optimal pair"
                        );
                        return (pair.proxy, Some(pair.relay));
                    }
                }
            }
            (RotationStrategy::BestPerformance, RotationStrategy::BestPerformance)
        } else {
            (settings.proxy_strategy, settings.relay_strategy)
        };

        let relay = self
            .selector
            .next(campaign.id, ServerKind::Relay, relay_strategy, &decision.relays)
            .map(|c| c.server);
        let proxy = self
            .selector
            .next(campaign.id, ServerKind::Proxy, proxy_strategy, &decision.proxies)
            .map(|c| c.server);
        (proxy, relay)
    }

    /// Run the transport on its own task so a panic or a hang becomes a
    /// classified failure instead of taking the worker down
    async fn send(&self, request: SendRequest, route: &Route) -> SendOutcome {
        let _relay_guard = self.health.begin_request(ServerKind::Relay, route.relay.id);
        let _proxy_guard = route
            .proxy
            .as_ref()
            .map(|p| self.health.begin_request(ServerKind::Proxy, p.id));

        let transport = self.transport.clone();
        let proxy = route.proxy.clone();
        let relay = route.relay.clone();
        let mut handle =
            tokio::spawn(async move { transport.send(&request, proxy.as_ref(), &relay).await });

        let limit = Duration::from_secs(self.config.send_timeout_secs);
        match tokio::time::timeout(limit, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) if e.is_panic() => SendOutcome::Failed {
                error: format!("transport panic: {}", panic_message(e.into_panic())),
            },
            Ok(Err(e)) => SendOutcome::Failed {
                error: format!("transport task failed: {}", e),
            },
            Err(_) => {
                handle.abort();
                SendOutcome::Failed {
                    error: format!("send timeout after {}s", self.config.send_timeout_secs),
                }
            }
        }
    }

    async fn on_sent(
        &self,
        campaign: &Campaign,
        settings: &CampaignDeliverySettings,
        route: &Route,
        mut message: Message,
        response_time_ms: u64,
    ) -> Result<MessageOutcome, DispatchError> {
        let elapsed = Duration::from_millis(response_time_ms);
        self.health
            .record_success(ServerKind::Relay, route.relay.id, campaign.id, elapsed)
            .await;
        if let Some(proxy) = &route.proxy {
            self.health
                .record_success(ServerKind::Proxy, proxy.id, campaign.id, elapsed)
                .await;
        }
        self.record_performance(campaign, settings, route, true, response_time_ms as f64)
            .await;
        self.routing
            .record_success(&route.decision.matched_rules)
            .await;
        self.retry.complete_open(message.id, true).await?;

        message.status = MessageStatus::Sent;
        message.sent_at = Some(Utc::now());
        self.repos.messages.update(&message).await?;
        info!(
            message_id = %message.id,
            campaign_id = %campaign.id,
            relay = %route.relay.name,
            attempts = message.attempts,
            response_time_ms,
            "Message sent"
        );

        self.record_processed(campaign).await;
        Ok(MessageOutcome::Sent)
    }

    async fn on_failed(
        &self,
        campaign: &Campaign,
        settings: &CampaignDeliverySettings,
        route: &Route,
        mut message: Message,
        error: String,
    ) -> Result<MessageOutcome, DispatchError> {
        let error_type = classify(&error);
        self.health
            .record_failure(ServerKind::Relay, route.relay.id, campaign.id, &error, error_type)
            .await;
        if let Some(proxy) = &route.proxy {
            self.health
                .record_failure(ServerKind::Proxy, proxy.id, campaign.id, &error, error_type)
                .await;
        }
        self.record_performance(campaign, settings, route, false, 0.0)
            .await;
        // The attempt that led here is finished before the next one exists
        self.retry.complete_open(message.id, false).await?;

        if self.retry.should_retry(&message, &error) {
            match self.retry.schedule(&mut message, &error).await {
                Ok(_) => return Ok(MessageOutcome::Retrying),
                Err(e) => {
                    warn!(message_id = %message.id, "Retry could not be scheduled: {}", e);
                    if let Err(e) = self.retry.cancel_pending(message.id).await {
                        warn!(message_id = %message.id, "Failed to close retry attempt: {}", e);
                    }
                }
            }
        }

        message.status = MessageStatus::Failed;
        message.last_error = Some(error);
        message.error_type = Some(error_type.to_string());
        self.repos.messages.update(&message).await?;
        warn!(
            message_id = %message.id,
            campaign_id = %campaign.id,
            error_type = %error_type,
            attempts = message.attempts,
            retries = message.retry_count,
            "Message failed: {}",
            message.last_error.as_deref().unwrap_or_default()
        );

        self.record_processed(campaign).await;
        Ok(MessageOutcome::Failed)
    }

    /// The user has relays but none is healthy: hand the message back and
    /// let a later pass pick it up once a relay is admitted again
    async fn defer_for_recovery(
        &self,
        campaign: &Campaign,
        mut message: Message,
    ) -> Result<MessageOutcome, DispatchError> {
        message.status = MessageStatus::Pending;
        self.repos.messages.update(&message).await?;
        debug!(
            message_id = %message.id,
            campaign_id = %campaign.id,
            "No healthy relay, message deferred"
        );
        Ok(MessageOutcome::Deferred)
    }

    /// The user has no active relay: fail without a retry attempt
    async fn fail_unroutable(
        &self,
        campaign: &Campaign,
        mut message: Message,
    ) -> Result<MessageOutcome, DispatchError> {
        let fault = DispatchError::ConfigurationFault("no relay server available".to_string());
        self.retry.complete_open(message.id, false).await?;

        message.status = MessageStatus::Failed;
        message.last_error = Some(fault.to_string());
        message.error_type = Some(ErrorType::Configuration.to_string());
        self.repos.messages.update(&message).await?;
        warn!(
            message_id = %message.id,
            campaign_id = %campaign.id,
            code = fault.code(),
            "{}",
            fault
        );

        self.record_processed(campaign).await;
        Ok(MessageOutcome::ConfigurationFault)
    }

    async fn record_performance(
        &self,
        campaign: &Campaign,
        settings: &CampaignDeliverySettings,
        route: &Route,
        success: bool,
        delivery_ms: f64,
    ) {
        if !settings.carrier_optimization {
            return;
        }
        let Some(carrier) = route.decision.carrier.clone() else {
            return;
        };
        let outcome = CarrierOutcome {
            user_id: campaign.user_id,
            carrier,
            proxy_server_id: route.proxy.as_ref().map(|p| p.id),
            relay_server_id: route.relay.id,
            success,
            delivery_ms,
        };
        if let Err(e) = self.repos.performance.record(outcome).await {
            warn!(campaign_id = %campaign.id, "Failed to record carrier performance: {}", e);
        }
    }
}

/// Pre-send delay: uniform in the campaign's `[min, max]` window, falling
/// back to the configured defaults. A campaign seed makes the delay a pure
/// function of the seed and the message id.
pub fn send_delay(
    settings: &CampaignDeliverySettings,
    defaults: &DispatchConfig,
    message_id: MessageId,
) -> Duration {
    let min = settings
        .min_delay_secs
        .unwrap_or(defaults.default_min_delay_secs)
        .max(0.0);
    let max = settings
        .max_delay_secs
        .unwrap_or(defaults.default_max_delay_secs)
        .max(min);
    if !min.is_finite() || !max.is_finite() {
        return Duration::ZERO;
    }
    if max <= min {
        return Duration::from_secs_f64(min);
    }

    let secs = match settings.delay_seed {
        Some(seed) => StdRng::seed_from_u64(mix_seed(seed, message_id)).gen_range(min..=max),
        None => rand::thread_rng().gen_range(min..=max),
    };
    Duration::from_secs_f64(secs)
}

fn mix_seed(seed: i64, message_id: MessageId) -> u64 {
    let bits = message_id.as_u128();
    (seed as u64) ^ (bits as u64) ^ ((bits >> 64) as u64)
}

/// When the destination's local time is outside the configured send
/// window, the moment the window next opens
pub fn send_window_deferral(
    config: &DispatchConfig,
    destination: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let timezone = detect_timezone(destination);
    let (start, end) = (config.send_window_start_hour, config.send_window_end_hour);
    if within_window(local_hour(&timezone, now), start, end) {
        None
    } else {
        Some(next_window_open(&timezone, start, end, now))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
