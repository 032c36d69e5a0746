//! Dispatch Coordinator
//!
//! Every running campaign owns one loop task. Each pass loads a batch of due
//! pending messages into a queue drained by a pool of worker tasks; a
//! message's whole pipeline runs on one worker. Campaign status is polled
//! before every message, so a pause or cancel stops new sends within one
//! message while in-flight sends complete.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use relaycast_common::config::{Config, DispatchConfig};
use relaycast_common::types::{CampaignId, ServerId, ServerKind, UserId};
use relaycast_storage::{Campaign, CampaignStatus, EgressServer, Message, Repositories, ServerUsageLog};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::MessageOutcome;
use crate::deferred::DeferredScheduler;
use crate::error::DispatchError;
use crate::health::ServerHealthTracker;
use crate::optimization::OptimizationAdvisor;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryPolicy, RetryScheduler, RetryStats};
use crate::rotation::ServerSelector;
use crate::routing::RoutingRulesEngine;
use crate::transport::TransportSender;

/// Reason recorded on a campaign failed for lack of relays
const NO_RELAYS_REASON: &str = "no active relay servers available";

/// Per-server usage of a campaign
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RotationStats {
    pub per_server_usage: Vec<ServerUsageLog>,
    pub success_rates: BTreeMap<ServerId, f64>,
}

/// Summary of one dispatch pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PassReport {
    pub campaign_id: CampaignId,
    /// Campaign status once the pass finished
    pub status: CampaignStatus,
    pub loaded: u64,
    pub sent: u64,
    pub retrying: u64,
    pub failed: u64,
    pub configuration_faults: u64,
    /// Held back until the destination's send window opens or a relay is
    /// healthy again
    pub deferred: u64,
    /// Claimed by someone else first
    pub skipped: u64,
    pub errors: u64,
    /// Stopped early because the campaign left `in_progress`
    pub aborted: bool,
}

impl PassReport {
    /// Messages that reached a send attempt or a final status
    pub fn progressed(&self) -> u64 {
        self.sent + self.retrying + self.failed + self.configuration_faults
    }
}

#[derive(Default)]
pub(super) struct Tally {
    loaded: AtomicU64,
    sent: AtomicU64,
    retrying: AtomicU64,
    failed: AtomicU64,
    configuration_faults: AtomicU64,
    deferred: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

impl Tally {
    fn count(&self, outcome: MessageOutcome) {
        let counter = match outcome {
            MessageOutcome::Sent => &self.sent,
            MessageOutcome::Retrying => &self.retrying,
            MessageOutcome::Failed => &self.failed,
            MessageOutcome::ConfigurationFault => &self.configuration_faults,
            MessageOutcome::Deferred => &self.deferred,
            MessageOutcome::Skipped => &self.skipped,
            MessageOutcome::Aborted => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn report(&self, campaign_id: CampaignId, status: CampaignStatus, aborted: bool) -> PassReport {
        PassReport {
            campaign_id,
            status,
            loaded: self.loaded.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            retrying: self.retrying.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            configuration_faults: self.configuration_faults.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            aborted,
        }
    }
}

/// State shared by the workers of one pass
pub(super) struct PassContext {
    pub(super) campaign: Campaign,
    pub(super) proxies: Vec<EgressServer>,
    pub(super) relays: Vec<EgressServer>,
    abort: CancellationToken,
    tally: Tally,
}

/// Dispatch coordinator
pub struct DispatchCoordinator {
    pub(super) config: DispatchConfig,
    pub(super) repos: Repositories,
    pub(super) health: Arc<ServerHealthTracker>,
    pub(super) limiter: RateLimiter,
    pub(super) routing: RoutingRulesEngine,
    pub(super) selector: ServerSelector,
    pub(super) retry: RetryScheduler,
    pub(super) advisor: OptimizationAdvisor,
    pub(super) transport: Arc<dyn TransportSender>,
    shutdown: CancellationToken,
    runs: Mutex<HashMap<CampaignId, JoinHandle<()>>>,
    progress: Mutex<HashMap<CampaignId, Arc<AtomicU64>>>,
}

impl DispatchCoordinator {
    pub fn new(
        config: &Config,
        repos: Repositories,
        transport: Arc<dyn TransportSender>,
        deferred: Arc<dyn DeferredScheduler>,
        shutdown: CancellationToken,
    ) -> Self {
        let health = Arc::new(ServerHealthTracker::new(
            config.health.clone(),
            repos.servers.clone(),
        ));
        let retry = RetryScheduler::new(
            Arc::new(RetryPolicy::new(config.retry.clone())),
            repos.campaigns.clone(),
            repos.messages.clone(),
            repos.retries.clone(),
            deferred,
        );

        Self {
            config: config.dispatch.clone(),
            health: health.clone(),
            limiter: RateLimiter::new(config.rate_limits.clone()),
            routing: RoutingRulesEngine::new(
                repos.rules.clone(),
                repos.servers.clone(),
                health.clone(),
            ),
            selector: ServerSelector::new(
                config.selection.clone(),
                repos.servers.clone(),
                repos.performance.clone(),
                health,
            ),
            retry,
            advisor: OptimizationAdvisor::new(repos.servers.clone(), repos.settings.clone()),
            transport,
            repos,
            shutdown,
            runs: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
        }
    }

    pub fn health(&self) -> &ServerHealthTracker {
        &self.health
    }

    /// Move a draft campaign to `in_progress` and start its loop. Already
    /// running campaigns only get their loop restarted if it has stopped.
    pub async fn start_campaign_dispatch(
        self: &Arc<Self>,
        campaign_id: CampaignId,
    ) -> Result<Campaign, DispatchError> {
        let campaign = self.campaign(campaign_id).await?;
        let campaign = match campaign.status {
            CampaignStatus::Draft => {
                let counts = self.repos.messages.status_counts(campaign_id).await?;
                if campaign.total_messages == 0 {
                    self.repos
                        .campaigns
                        .set_total_messages(campaign_id, counts.total())
                        .await?;
                }
                let started = self.transition(campaign_id, CampaignStatus::InProgress).await?;
                info!(
                    campaign_id = %campaign_id,
                    messages = counts.total(),
                    "Campaign dispatch started"
                );
                started
            }
            CampaignStatus::InProgress => campaign,
            from => {
                return Err(DispatchError::InvalidTransition {
                    from,
                    to: CampaignStatus::InProgress,
                })
            }
        };

        self.ensure_running(campaign_id).await?;
        Ok(campaign)
    }

    /// Stop issuing new sends; in-flight sends complete
    pub async fn pause_campaign_dispatch(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Campaign, DispatchError> {
        let campaign = self.campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::InProgress {
            return Err(DispatchError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Paused,
            });
        }

        let paused = self.transition(campaign_id, CampaignStatus::Paused).await?;
        info!(campaign_id = %campaign_id, "Campaign dispatch paused");
        Ok(paused)
    }

    pub async fn resume_campaign_dispatch(
        self: &Arc<Self>,
        campaign_id: CampaignId,
    ) -> Result<Campaign, DispatchError> {
        let campaign = self.campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::Paused {
            return Err(DispatchError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::InProgress,
            });
        }

        let resumed = self.transition(campaign_id, CampaignStatus::InProgress).await?;
        self.ensure_running(campaign_id).await?;
        info!(campaign_id = %campaign_id, "Campaign dispatch resumed");
        Ok(resumed)
    }

    /// Cancel the campaign, its pending messages and their open retries
    pub async fn cancel_campaign_dispatch(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Campaign, DispatchError> {
        let campaign = self.campaign(campaign_id).await?;
        if campaign.status.is_terminal() {
            return Err(DispatchError::InvalidTransition {
                from: campaign.status,
                to: CampaignStatus::Cancelled,
            });
        }

        let cancelled = self.transition(campaign_id, CampaignStatus::Cancelled).await?;
        let messages = self.repos.messages.cancel_by_campaign(campaign_id).await?;
        let retries = self.retry.cancel_campaign(campaign_id).await?;
        self.forget(campaign_id);

        info!(
            campaign_id = %campaign_id,
            messages,
            retries,
            "Campaign cancelled"
        );
        Ok(cancelled)
    }

    /// Start loops for every `in_progress` campaign that has none, e.g. on
    /// boot or when another process started a campaign
    pub async fn resume_active(self: &Arc<Self>) -> Result<usize, DispatchError> {
        let campaigns = self
            .repos
            .campaigns
            .list_by_status(CampaignStatus::InProgress)
            .await?;
        let mut started = 0;
        for campaign in campaigns {
            if self.ensure_running(campaign.id).await? {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Wait for every campaign loop to stop, after shutdown was requested
    pub async fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Campaign loop ended abnormally: {}", e);
            }
        }
    }

    pub async fn rotation_stats(
        &self,
        campaign_id: CampaignId,
    ) -> Result<RotationStats, DispatchError> {
        let usage = self.repos.servers.usage_by_campaign(campaign_id).await?;
        let success_rates = usage
            .iter()
            .map(|log| (log.server_id, log.success_rate()))
            .collect();
        Ok(RotationStats {
            per_server_usage: usage,
            success_rates,
        })
    }

    pub async fn retry_stats(&self, campaign_id: CampaignId) -> Result<RetryStats, DispatchError> {
        self.retry.retry_stats(campaign_id).await
    }

    /// Spawn the campaign loop unless one is alive. Open retry attempts are
    /// re-armed for a fresh loop, since their timers may not have survived.
    async fn ensure_running(self: &Arc<Self>, campaign_id: CampaignId) -> Result<bool, DispatchError> {
        {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            if runs.get(&campaign_id).is_some_and(|h| !h.is_finished()) {
                return Ok(false);
            }
            let handle = tokio::spawn(self.clone().run_campaign(campaign_id));
            runs.insert(campaign_id, handle);
        }

        self.retry.rearm(campaign_id).await?;
        Ok(true)
    }

    /// Run passes until the campaign ends or shutdown is requested. Paused
    /// campaigns keep their loop, which idles until they resume.
    pub async fn run_campaign(self: Arc<Self>, campaign_id: CampaignId) {
        let poll = Duration::from_secs(self.config.poll_interval_secs.max(1));
        info!(
            campaign_id = %campaign_id,
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            "Campaign loop started"
        );

        // Claims left by a loop that died mid-send
        match self.repos.messages.release_claimed(campaign_id).await {
            Ok(0) => {}
            Ok(released) => warn!(campaign_id = %campaign_id, released, "Released stale message claims"),
            Err(e) => error!(campaign_id = %campaign_id, "Failed to release stale claims: {}", e),
        }

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let idle = match self.run_pass(campaign_id).await {
                Ok(report) if report.status.is_terminal() => {
                    info!(campaign_id = %campaign_id, status = %report.status, "Campaign loop finished");
                    break;
                }
                Ok(report) => {
                    report.progressed() == 0 || report.status != CampaignStatus::InProgress
                }
                Err(DispatchError::CampaignNotFound(_)) => {
                    warn!(campaign_id = %campaign_id, "Campaign disappeared, loop stopped");
                    break;
                }
                Err(e) => {
                    error!(campaign_id = %campaign_id, "Dispatch pass failed: {}", e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }

    /// One pass: dispatch a batch of due messages, then settle the
    /// campaign's status
    pub async fn run_pass(self: &Arc<Self>, campaign_id: CampaignId) -> Result<PassReport, DispatchError> {
        let campaign = self.campaign(campaign_id).await?;
        if campaign.status != CampaignStatus::InProgress {
            return Ok(Tally::default().report(campaign_id, campaign.status, false));
        }

        let batch = self
            .repos
            .messages
            .load_pending(campaign_id, self.config.batch_size, Utc::now())
            .await?;

        let context = Arc::new(PassContext {
            proxies: self.load_servers(campaign.user_id, ServerKind::Proxy).await?,
            relays: self.load_servers(campaign.user_id, ServerKind::Relay).await?,
            campaign,
            abort: self.shutdown.child_token(),
            tally: Tally::default(),
        });

        if !batch.is_empty() {
            debug!(campaign_id = %campaign_id, messages = batch.len(), "Dispatch pass");
            context
                .tally
                .loaded
                .store(batch.len() as u64, Ordering::Relaxed);

            let (tx, rx) = mpsc::channel(batch.len());
            for message in batch {
                // Capacity fits the whole batch
                let _ = tx.try_send(message);
            }
            drop(tx);
            let queue = Arc::new(tokio::sync::Mutex::new(rx));

            let workers = self.config.workers.max(1);
            let mut handles = Vec::with_capacity(workers);
            for worker in 0..workers {
                let coordinator = self.clone();
                let context = context.clone();
                let queue = queue.clone();
                handles.push(tokio::spawn(async move {
                    coordinator.work(worker, &context, &queue).await;
                }));
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    error!(campaign_id = %campaign_id, "Dispatch worker failed: {}", e);
                }
            }
        }

        let status = self.settle(&context).await?;
        Ok(context
            .tally
            .report(campaign_id, status, context.abort.is_cancelled()))
    }

    async fn work(
        &self,
        worker: usize,
        context: &PassContext,
        queue: &tokio::sync::Mutex<mpsc::Receiver<Message>>,
    ) {
        loop {
            if context.abort.is_cancelled() {
                break;
            }
            let next = queue.lock().await.recv().await;
            let Some(message) = next else {
                break;
            };

            let message_id = message.id;
            match self.process_message(context, message).await {
                Ok(MessageOutcome::Aborted) => {
                    context.abort.cancel();
                    break;
                }
                Ok(outcome) => context.tally.count(outcome),
                Err(e) => {
                    error!(worker, message_id = %message_id, "Message dispatch failed: {}", e);
                    context.tally.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Fail the campaign when configuration faults met a user without any
    /// active relay, otherwise complete it once nothing is outstanding.
    /// Relays that are only unhealthy defer messages instead.
    async fn settle(&self, context: &PassContext) -> Result<CampaignStatus, DispatchError> {
        let campaign_id = context.campaign.id;
        let mut status = self.campaign(campaign_id).await?.status;
        if status != CampaignStatus::InProgress {
            return Ok(status);
        }

        let faults = context.tally.configuration_faults.load(Ordering::Relaxed);
        if faults > 0 && !self.has_active_relay(context.campaign.user_id).await? {
            self.repos
                .campaigns
                .update_status(
                    campaign_id,
                    CampaignStatus::Failed,
                    Some(NO_RELAYS_REASON.to_string()),
                )
                .await?;
            let cancelled = self.repos.messages.cancel_by_campaign(campaign_id).await?;
            self.retry.cancel_campaign(campaign_id).await?;
            error!(
                campaign_id = %campaign_id,
                cancelled,
                "Campaign failed: {}",
                NO_RELAYS_REASON
            );
            status = CampaignStatus::Failed;
        } else {
            let counts = self.repos.messages.status_counts(campaign_id).await?;
            if counts.outstanding() == 0 {
                self.transition(campaign_id, CampaignStatus::Completed).await?;
                info!(
                    campaign_id = %campaign_id,
                    sent = counts.sent,
                    failed = counts.failed,
                    cancelled = counts.cancelled,
                    "Campaign completed"
                );
                status = CampaignStatus::Completed;
            }
        }

        if status.is_terminal() {
            self.forget(campaign_id);
        }
        Ok(status)
    }

    async fn has_active_relay(&self, user_id: UserId) -> Result<bool, DispatchError> {
        let relays = self.load_servers(user_id, ServerKind::Relay).await?;
        Ok(!relays.is_empty())
    }

    async fn load_servers(
        &self,
        user_id: UserId,
        kind: ServerKind,
    ) -> Result<Vec<EgressServer>, DispatchError> {
        let servers = self.repos.servers.load_active(user_id, kind).await?;
        for server in &servers {
            self.health.observe(server);
        }
        Ok(servers)
    }

    /// Count a message that reached a terminal outcome, persist progress and
    /// run the optimization review every `optimization_interval` messages
    pub(super) async fn record_processed(&self, campaign: &Campaign) {
        let counter = {
            let mut progress = self.progress.lock().unwrap_or_else(|e| e.into_inner());
            progress
                .entry(campaign.id)
                .or_insert_with(|| {
                    Arc::new(AtomicU64::new(campaign.processed_messages.max(0) as u64))
                })
                .clone()
        };
        let processed = counter.fetch_add(1, Ordering::AcqRel) + 1;

        if let Err(e) = self
            .repos
            .campaigns
            .update_progress(campaign.id, processed as i64)
            .await
        {
            warn!(campaign_id = %campaign.id, "Failed to persist progress: {}", e);
        }

        let interval = self.config.optimization_interval;
        if interval > 0 && processed % interval == 0 {
            match self.advisor.evaluate(campaign.id).await {
                Ok(recommendations) if !recommendations.is_empty() => {
                    info!(
                        campaign_id = %campaign.id,
                        processed,
                        count = recommendations.len(),
                        "Optimization review produced recommendations"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(campaign_id = %campaign.id, "Optimization review failed: {}", e),
            }
        }
    }

    fn forget(&self, campaign_id: CampaignId) {
        self.selector.forget_campaign(campaign_id);
        self.limiter.forget_campaign(campaign_id);
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&campaign_id);
    }

    async fn campaign(&self, campaign_id: CampaignId) -> Result<Campaign, DispatchError> {
        self.repos
            .campaigns
            .get(campaign_id)
            .await?
            .ok_or(DispatchError::CampaignNotFound(campaign_id))
    }

    async fn transition(
        &self,
        campaign_id: CampaignId,
        status: CampaignStatus,
    ) -> Result<Campaign, DispatchError> {
        self.repos
            .campaigns
            .update_status(campaign_id, status, None)
            .await?
            .ok_or(DispatchError::CampaignNotFound(campaign_id))
    }
}
