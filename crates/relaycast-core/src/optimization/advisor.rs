//! Optimization Advisor
//!
//! Looks at a campaign's per-server usage logs and suggests settings
//! changes. Suggestions are always returned; they are written to the
//! campaign's settings only when adaptive optimization is enabled.

use std::sync::Arc;

use chrono::Utc;
use relaycast_common::types::{CampaignId, RotationStrategy, ServerKind};
use relaycast_storage::{
    CampaignDeliverySettings, DeliverySettingsRepository, ServerRepository, ServerUsageLog,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::DispatchError;

/// Success rate gap between servers of a kind that favours best performance
const SUCCESS_SPREAD: f64 = 0.20;

/// Sends a server needs before its success rate counts
const MIN_SERVER_SAMPLES: i64 = 10;

/// Busiest/idlest ratio above which usage counts as skewed
const USAGE_SKEW_RATIO: f64 = 3.0;

/// Relay sends observed before carrier optimization is worth enabling
const CARRIER_OPTIMIZATION_MIN_MESSAGES: i64 = 50;

/// A suggested settings change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recommendation {
    SwitchStrategy {
        kind: ServerKind,
        strategy: RotationStrategy,
        reason: String,
    },
    EnableCarrierOptimization {
        observed_messages: i64,
    },
}

impl Recommendation {
    /// Apply to settings; false when the settings already match
    pub fn apply(&self, settings: &mut CampaignDeliverySettings) -> bool {
        match self {
            Recommendation::SwitchStrategy { kind, strategy, .. } => {
                let slot = match kind {
                    ServerKind::Proxy => &mut settings.proxy_strategy,
                    ServerKind::Relay => &mut settings.relay_strategy,
                };
                if slot == strategy {
                    return false;
                }
                *slot = *strategy;
                true
            }
            Recommendation::EnableCarrierOptimization { .. } => {
                if settings.carrier_optimization {
                    return false;
                }
                settings.carrier_optimization = true;
                true
            }
        }
    }
}

/// Optimization advisor
pub struct OptimizationAdvisor {
    servers: Arc<dyn ServerRepository>,
    settings: Arc<dyn DeliverySettingsRepository>,
}

impl OptimizationAdvisor {
    pub fn new(
        servers: Arc<dyn ServerRepository>,
        settings: Arc<dyn DeliverySettingsRepository>,
    ) -> Self {
        Self { servers, settings }
    }

    /// Suggestions for the given settings and usage, without side effects
    pub fn recommend(
        settings: &CampaignDeliverySettings,
        usage: &[ServerUsageLog],
    ) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();

        for kind in ServerKind::ALL {
            let logs: Vec<&ServerUsageLog> =
                usage.iter().filter(|log| log.server_kind == kind).collect();
            if let Some(rec) = strategy_for(kind, settings.strategy_for(kind), &logs) {
                recommendations.push(rec);
            }
        }

        let observed_messages: i64 = usage
            .iter()
            .filter(|log| log.server_kind == ServerKind::Relay)
            .map(|log| log.messages_sent)
            .sum();
        if !settings.carrier_optimization && observed_messages >= CARRIER_OPTIMIZATION_MIN_MESSAGES
        {
            recommendations.push(Recommendation::EnableCarrierOptimization { observed_messages });
        }

        recommendations
    }

    /// Evaluate a campaign and, when adaptive optimization is on, persist
    /// the resulting changes
    pub async fn evaluate(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<Recommendation>, DispatchError> {
        let usage = self.servers.usage_by_campaign(campaign_id).await?;
        let mut settings = self.settings.load_or_create(campaign_id).await?;
        let recommendations = Self::recommend(&settings, &usage);

        if recommendations.is_empty() {
            debug!(campaign_id = %campaign_id, "No optimization recommendations");
            return Ok(recommendations);
        }
        if !settings.adaptive_optimization {
            debug!(
                campaign_id = %campaign_id,
                count = recommendations.len(),
                "Recommendations not applied, adaptive optimization off"
            );
            return Ok(recommendations);
        }

        let mut changed = false;
        for rec in &recommendations {
            if rec.apply(&mut settings) {
                info!(campaign_id = %campaign_id, recommendation = ?rec, "Applied optimization");
                changed = true;
            }
        }
        if changed {
            settings.updated_at = Utc::now();
            self.settings.update(&settings).await?;
        }
        Ok(recommendations)
    }
}

fn strategy_for(
    kind: ServerKind,
    current: RotationStrategy,
    logs: &[&ServerUsageLog],
) -> Option<Recommendation> {
    if logs.len() < 2 {
        return None;
    }

    let sampled: Vec<f64> = logs
        .iter()
        .filter(|log| log.messages_sent >= MIN_SERVER_SAMPLES)
        .map(|log| log.success_rate())
        .collect();
    if sampled.len() >= 2 {
        let best = sampled.iter().cloned().fold(f64::MIN, f64::max);
        let worst = sampled.iter().cloned().fold(f64::MAX, f64::min);
        if best - worst > SUCCESS_SPREAD {
            return (current != RotationStrategy::BestPerformance).then(|| {
                Recommendation::SwitchStrategy {
                    kind,
                    strategy: RotationStrategy::BestPerformance,
                    reason: format!(
                        "success rates range from {:.0}% to {:.0}%",
                        worst * 100.0,
                        best * 100.0
                    ),
                }
            });
        }
    }

    let busiest = logs.iter().map(|log| log.messages_sent).max().unwrap_or(0);
    let idlest = logs.iter().map(|log| log.messages_sent).min().unwrap_or(0);
    if idlest > 0 && busiest as f64 > idlest as f64 * USAGE_SKEW_RATIO {
        return (current != RotationStrategy::LeastUsed).then(|| Recommendation::SwitchStrategy {
            kind,
            strategy: RotationStrategy::LeastUsed,
            reason: format!("usage skewed {} to {} messages", busiest, idlest),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use relaycast_storage::{DeliverySettingsRepository, MemoryStore, UsageUpdate};
    use uuid::Uuid;

    fn usage(kind: ServerKind, sent: i64, successes: i64) -> ServerUsageLog {
        ServerUsageLog {
            campaign_id: Uuid::nil(),
            server_kind: kind,
            server_id: Uuid::new_v4(),
            messages_sent: sent,
            successes,
            failures: sent - successes,
            last_used_at: Utc::now(),
        }
    }

    fn strategies(recs: &[Recommendation]) -> Vec<(ServerKind, RotationStrategy)> {
        recs.iter()
            .filter_map(|r| match r {
                Recommendation::SwitchStrategy { kind, strategy, .. } => Some((*kind, *strategy)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_success_spread_prefers_best_performance() {
        let settings = CampaignDeliverySettings::defaults(Uuid::nil());
        let logs = vec![
            usage(ServerKind::Relay, 20, 19),
            usage(ServerKind::Relay, 20, 12),
        ];
        let recs = OptimizationAdvisor::recommend(&settings, &logs);
        assert_eq!(
            strategies(&recs),
            vec![(ServerKind::Relay, RotationStrategy::BestPerformance)]
        );
    }

    #[test]
    fn test_spread_needs_enough_samples() {
        let settings = CampaignDeliverySettings::defaults(Uuid::nil());
        // Second relay is too young to judge; usage is skewed instead
        let logs = vec![
            usage(ServerKind::Relay, 20, 20),
            usage(ServerKind::Relay, 4, 0),
        ];
        let recs = OptimizationAdvisor::recommend(&settings, &logs);
        assert_eq!(
            strategies(&recs),
            vec![(ServerKind::Relay, RotationStrategy::LeastUsed)]
        );
    }

    #[test]
    fn test_balanced_usage_recommends_nothing() {
        let settings = CampaignDeliverySettings::defaults(Uuid::nil());
        let logs = vec![
            usage(ServerKind::Proxy, 12, 12),
            usage(ServerKind::Proxy, 10, 9),
            usage(ServerKind::Relay, 11, 11),
            usage(ServerKind::Relay, 11, 10),
        ];
        assert!(OptimizationAdvisor::recommend(&settings, &logs).is_empty());
    }

    #[test]
    fn test_carrier_optimization_threshold() {
        let settings = CampaignDeliverySettings::defaults(Uuid::nil());
        let logs = vec![usage(ServerKind::Relay, 49, 49)];
        assert!(OptimizationAdvisor::recommend(&settings, &logs).is_empty());

        let logs = vec![usage(ServerKind::Relay, 50, 49)];
        assert_eq!(
            OptimizationAdvisor::recommend(&settings, &logs),
            vec![Recommendation::EnableCarrierOptimization {
                observed_messages: 50
            }]
        );

        let mut enabled = settings.clone();
        enabled.carrier_optimization = true;
        assert!(OptimizationAdvisor::recommend(&enabled, &logs).is_empty());
    }

    #[test]
    fn test_apply_reports_change() {
        let mut settings = CampaignDeliverySettings::defaults(Uuid::nil());
        let rec = Recommendation::SwitchStrategy {
            kind: ServerKind::Proxy,
            strategy: RotationStrategy::LeastUsed,
            reason: String::new(),
        };
        assert!(rec.apply(&mut settings));
        assert_eq!(settings.proxy_strategy, RotationStrategy::LeastUsed);
        assert!(!rec.apply(&mut settings));
    }

    async fn seed_usage(store: &MemoryStore, campaign_id: CampaignId, sent: usize) {
        let server_id = Uuid::new_v4();
        for _ in 0..sent {
            store
                .record_usage(UsageUpdate {
                    campaign_id,
                    kind: ServerKind::Relay,
                    server_id,
                    success: true,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_evaluate_applies_only_when_adaptive() {
        let store = Arc::new(MemoryStore::new());
        let advisor = OptimizationAdvisor::new(store.clone(), store.clone());
        let campaign_id = Uuid::new_v4();
        seed_usage(&store, campaign_id, 60).await;

        let recs = advisor.evaluate(campaign_id).await.unwrap();
        assert_eq!(recs.len(), 1);
        let settings = DeliverySettingsRepository::load_or_create(store.as_ref(), campaign_id)
            .await
            .unwrap();
        assert!(!settings.carrier_optimization);

        let mut adaptive = settings.clone();
        adaptive.adaptive_optimization = true;
        DeliverySettingsRepository::update(store.as_ref(), &adaptive)
            .await
            .unwrap();

        advisor.evaluate(campaign_id).await.unwrap();
        let settings = DeliverySettingsRepository::load_or_create(store.as_ref(), campaign_id)
            .await
            .unwrap();
        assert!(settings.carrier_optimization);
    }
}
