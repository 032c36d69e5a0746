//! Retry scheduling
//!
//! A failed message that deserves another attempt gets a `RetryAttempt` row,
//! moves to `retrying`, and a deferred task flips it back to `pending` once
//! its backoff has elapsed. The re-dispatched send closes the attempt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use relaycast_common::types::{CampaignId, MessageId, RetryAttemptId};
use relaycast_storage::{
    CampaignRepository, CampaignStatus, Message, MessageRepository, MessageStatus,
    NewRetryAttempt, RetryAttempt, RetryAttemptRepository,
};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::classifier::classify;
use super::policy::RetryPolicy;
use crate::deferred::DeferredScheduler;
use crate::error::DispatchError;

/// Retry attempt totals for a campaign
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    /// Attempts still waiting for their re-dispatch to finish
    pub pending: u64,
    pub successful: u64,
    pub failed: u64,
    pub by_error_type: BTreeMap<String, u64>,
}

/// Retry scheduler
#[derive(Clone)]
pub struct RetryScheduler {
    policy: Arc<RetryPolicy>,
    campaigns: Arc<dyn CampaignRepository>,
    messages: Arc<dyn MessageRepository>,
    retries: Arc<dyn RetryAttemptRepository>,
    deferred: Arc<dyn DeferredScheduler>,
}

impl RetryScheduler {
    pub fn new(
        policy: Arc<RetryPolicy>,
        campaigns: Arc<dyn CampaignRepository>,
        messages: Arc<dyn MessageRepository>,
        retries: Arc<dyn RetryAttemptRepository>,
        deferred: Arc<dyn DeferredScheduler>,
    ) -> Self {
        Self {
            policy,
            campaigns,
            messages,
            retries,
            deferred,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether a failed message gets another attempt
    pub fn should_retry(&self, message: &Message, error_text: &str) -> bool {
        self.policy.should_retry(
            message.retry_count.max(0) as u32,
            message.carrier.as_deref(),
            error_text,
        )
    }

    /// Create the next retry attempt for `message`, move it to `retrying`
    /// and arm the deferred re-dispatch. The message's server ids are
    /// recorded on the attempt.
    ///
    /// Refused while the message still has an open attempt.
    pub async fn schedule(
        &self,
        message: &mut Message,
        error_text: &str,
    ) -> Result<RetryAttempt, DispatchError> {
        if let Some(open) = self.retries.open_for_message(message.id).await? {
            return Err(DispatchError::Scheduler(format!(
                "message {} already has open retry attempt {}",
                message.id, open.attempt_number
            )));
        }

        let attempt_number = message.retry_count.max(0) + 1;
        let delay = self
            .policy
            .delay(attempt_number as u32, message.carrier.as_deref(), error_text);
        let scheduled_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let error_type = classify(error_text);

        let attempt = self
            .retries
            .create(NewRetryAttempt {
                message_id: message.id,
                campaign_id: message.campaign_id,
                attempt_number,
                error_type,
                error_text: error_text.to_string(),
                delay_secs: delay.as_secs_f64(),
                scheduled_at,
                proxy_server_id: message.proxy_server_id,
                relay_server_id: message.relay_server_id,
            })
            .await?;

        message.status = MessageStatus::Retrying;
        message.retry_count = attempt_number;
        message.last_error = Some(error_text.to_string());
        message.error_type = Some(error_type.to_string());
        message.not_before = Some(scheduled_at);
        self.messages.update(message).await?;

        self.arm(message.id, attempt.id, delay)?;

        info!(
            message_id = %message.id,
            campaign_id = %message.campaign_id,
            attempt = attempt_number,
            error_type = %error_type,
            delay_secs = delay.as_secs_f64(),
            "Retry scheduled"
        );
        Ok(attempt)
    }

    fn arm(
        &self,
        message_id: MessageId,
        attempt_id: RetryAttemptId,
        delay: Duration,
    ) -> Result<(), DispatchError> {
        let scheduler = self.clone();
        self.deferred.schedule(
            Instant::now() + delay,
            Box::pin(async move {
                if let Err(e) = scheduler.fire(message_id, attempt_id).await {
                    error!(message_id = %message_id, "Retry task failed: {}", e);
                }
            }),
        )
    }

    /// Re-arm the deferred tasks of every open attempt of a campaign, e.g.
    /// after a restart lost the in-memory queue. Tasks that fire twice are
    /// harmless: the second finds the message no longer `retrying`.
    pub async fn rearm(&self, campaign_id: CampaignId) -> Result<usize, DispatchError> {
        let now = Utc::now();
        let mut armed = 0;
        for attempt in self.retries.list_by_campaign(campaign_id).await? {
            if attempt.completed {
                continue;
            }
            let delay = (attempt.scheduled_at - now).to_std().unwrap_or(Duration::ZERO);
            self.arm(attempt.message_id, attempt.id, delay)?;
            armed += 1;
        }
        if armed > 0 {
            debug!(campaign_id = %campaign_id, armed, "Re-armed open retry attempts");
        }
        Ok(armed)
    }

    /// Deferred task body: return the message to `pending`, or cancel it
    /// when its campaign has ended
    async fn fire(
        &self,
        message_id: MessageId,
        attempt_id: RetryAttemptId,
    ) -> Result<(), DispatchError> {
        let Some(mut message) = self.messages.get(message_id).await? else {
            return Ok(());
        };

        let open = self.retries.open_for_message(message_id).await?;
        if open.map(|a| a.id) != Some(attempt_id) {
            debug!(message_id = %message_id, "Stale retry task ignored");
            return Ok(());
        }

        if message.status != MessageStatus::Retrying {
            if message.status.is_terminal() {
                self.retries.close(attempt_id, false).await?;
            }
            return Ok(());
        }

        let status = self
            .campaigns
            .get(message.campaign_id)
            .await?
            .map(|c| c.status);

        match status {
            Some(CampaignStatus::Cancelled | CampaignStatus::Failed | CampaignStatus::Completed)
            | None => {
                self.retries.close(attempt_id, false).await?;
                message.status = MessageStatus::Cancelled;
                self.messages.update(&message).await?;
                debug!(message_id = %message_id, "Retry dropped, campaign ended");
            }
            Some(_) => {
                // Paused campaigns pick the message up when resumed
                message.status = MessageStatus::Pending;
                message.not_before = None;
                self.messages.update(&message).await?;
                debug!(message_id = %message_id, "Retry due, message pending");
            }
        }
        Ok(())
    }

    /// Close every open attempt of a message unsuccessfully. Returns how many
    /// were closed, so a second call returns 0.
    pub async fn cancel_pending(&self, message_id: MessageId) -> Result<u64, DispatchError> {
        Ok(self.retries.close_open_for_message(message_id, false).await?)
    }

    /// Close the open attempt once the re-dispatched message finished
    pub async fn complete_open(
        &self,
        message_id: MessageId,
        success: bool,
    ) -> Result<u64, DispatchError> {
        let closed = self
            .retries
            .close_open_for_message(message_id, success)
            .await?;
        if closed > 0 {
            debug!(message_id = %message_id, success, "Retry attempt closed");
        }
        Ok(closed)
    }

    pub async fn retry_stats(&self, campaign_id: CampaignId) -> Result<RetryStats, DispatchError> {
        let mut stats = RetryStats::default();
        for attempt in self.retries.list_by_campaign(campaign_id).await? {
            match (attempt.completed, attempt.success) {
                (false, _) => stats.pending += 1,
                (true, true) => stats.successful += 1,
                (true, false) => stats.failed += 1,
            }
            *stats
                .by_error_type
                .entry(attempt.error_type.to_string())
                .or_default() += 1;
        }
        Ok(stats)
    }

    /// Close every open attempt of a cancelled campaign
    pub async fn cancel_campaign(&self, campaign_id: CampaignId) -> Result<u64, DispatchError> {
        let mut closed = 0;
        for attempt in self.retries.list_by_campaign(campaign_id).await? {
            if !attempt.completed && self.retries.close(attempt.id, false).await? {
                closed += 1;
            }
        }
        if closed > 0 {
            warn!(campaign_id = %campaign_id, closed, "Open retry attempts cancelled");
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::DelayQueueScheduler;
    use pretty_assertions::assert_eq;
    use relaycast_common::config::RetryConfig;
    use relaycast_common::types::ErrorType;
    use relaycast_storage::{CreateCampaign, CreateMessage, MemoryStore};
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        scheduler: RetryScheduler,
        campaign_id: CampaignId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let (deferred, _handle) = DelayQueueScheduler::spawn(CancellationToken::new());
        let scheduler = RetryScheduler::new(
            Arc::new(RetryPolicy::new(RetryConfig::default())),
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(deferred),
        );
        let campaign = CampaignRepository::create(
            store.as_ref(),
            CreateCampaign {
                user_id: Uuid::new_v4(),
                name: "spring".into(),
            },
        )
        .await
        .unwrap();
        store
            .update_status(campaign.id, CampaignStatus::InProgress, None)
            .await
            .unwrap();
        Fixture {
            store,
            scheduler,
            campaign_id: campaign.id,
        }
    }

    async fn sending_message(fx: &Fixture, carrier: &str) -> Message {
        let message = fx
            .store
            .create_batch(vec![CreateMessage {
                campaign_id: fx.campaign_id,
                destination: "2125550100".into(),
                payload: "hello".into(),
                carrier: Some(carrier.into()),
            }])
            .await
            .unwrap()
            .remove(0);
        assert!(fx.store.claim(message.id).await.unwrap());
        MessageRepository::get(fx.store.as_ref(), message.id)
            .await
            .unwrap()
            .unwrap()
    }

    async fn stored(fx: &Fixture, id: MessageId) -> Message {
        MessageRepository::get(fx.store.as_ref(), id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_then_fire_returns_to_pending() {
        let fx = fixture().await;
        let mut message = sending_message(&fx, "at&t").await;

        let attempt = fx
            .scheduler
            .schedule(&mut message, "Rate limit exceeded")
            .await
            .unwrap();
        assert_eq!(attempt.attempt_number, 1);
        assert_eq!(attempt.error_type, ErrorType::Temporary);
        assert_eq!(attempt.delay_secs, 300.0);
        assert_eq!(stored(&fx, message.id).await.status, MessageStatus::Retrying);

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(stored(&fx, message.id).await.status, MessageStatus::Retrying);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let after = stored(&fx, message.id).await;
        assert_eq!(after.status, MessageStatus::Pending);
        assert_eq!(after.not_before, None);
        assert_eq!(after.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refuses_second_open_attempt() {
        let fx = fixture().await;
        let mut message = sending_message(&fx, "verizon").await;

        fx.scheduler.schedule(&mut message, "timeout").await.unwrap();
        let err = fx
            .scheduler
            .schedule(&mut message, "timeout")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCHEDULER_ERROR");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_numbers_are_gapless() {
        let fx = fixture().await;
        let mut message = sending_message(&fx, "verizon").await;

        for expected in 1..=3 {
            let attempt = fx
                .scheduler
                .schedule(&mut message, "Rate limit exceeded")
                .await
                .unwrap();
            assert_eq!(attempt.attempt_number, expected);
            assert_eq!(fx.scheduler.complete_open(message.id, false).await.unwrap(), 1);
        }

        let numbers: Vec<i32> = fx
            .store
            .list_by_message(message.id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_is_idempotent() {
        let fx = fixture().await;
        let mut message = sending_message(&fx, "sprint").await;

        fx.scheduler.schedule(&mut message, "timeout").await.unwrap();
        assert_eq!(fx.scheduler.cancel_pending(message.id).await.unwrap(), 1);
        assert_eq!(fx.scheduler.cancel_pending(message.id).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_after_cancel_drops_message() {
        let fx = fixture().await;
        let mut message = sending_message(&fx, "at&t").await;

        fx.scheduler
            .schedule(&mut message, "too many requests")
            .await
            .unwrap();
        fx.store
            .update_status(fx.campaign_id, CampaignStatus::Cancelled, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(stored(&fx, message.id).await.status, MessageStatus::Cancelled);
        let stats = fx.scheduler.retry_stats(fx.campaign_id).await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_error_type.get("temporary"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_is_harmless_when_fired_twice() {
        let fx = fixture().await;
        let mut message = sending_message(&fx, "at&t").await;

        fx.scheduler
            .schedule(&mut message, "throttled")
            .await
            .unwrap();
        assert_eq!(fx.scheduler.rearm(fx.campaign_id).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        let after = stored(&fx, message.id).await;
        assert_eq!(after.status, MessageStatus::Pending);
        let stats = fx.scheduler.retry_stats(fx.campaign_id).await.unwrap();
        assert_eq!(stats.pending, 1);
    }
}
