//! Rate Limiter - Controls sending rate per carrier and campaign
//!
//! Each (carrier, campaign) key owns a sliding 60-second window of send
//! instants behind its own lock, so keys never block each other. State is
//! per process; with several dispatcher processes the limit is approximate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relaycast_common::config::{CarrierTable, RateLimitEntry};
use relaycast_common::types::{normalize_carrier, CampaignId};
use tokio::time::Instant;
use tracing::debug;

/// Length of the sliding window
pub const WINDOW: Duration = Duration::from_secs(60);

type RateKey = (String, CampaignId);

#[derive(Debug, Default)]
struct Window {
    sends: VecDeque<Instant>,
    last_send: Option<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.sends.front() {
            if now.duration_since(*first) >= WINDOW {
                self.sends.pop_front();
            } else {
                break;
            }
        }
    }

    /// Time until both the cap and the minimum delay allow a send
    fn wait(&mut self, limits: &EffectiveLimits, now: Instant) -> Duration {
        self.prune(now);

        let cap_wait = if self.sends.len() >= limits.messages_per_minute {
            self.sends
                .front()
                .map(|first| (*first + WINDOW).saturating_duration_since(now))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };

        let delay_wait = self
            .last_send
            .map(|last| (last + limits.min_delay).saturating_duration_since(now))
            .unwrap_or_default();

        cap_wait.max(delay_wait)
    }

    fn record(&mut self, now: Instant) {
        self.sends.push_back(now);
        self.last_send = Some(now);
    }
}

/// Limits after applying a routing multiplier
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveLimits {
    pub messages_per_minute: usize,
    pub min_delay: Duration,
}

impl EffectiveLimits {
    /// `cap = max(1, floor(cap / m))`, `delay = min_delay * m`
    pub fn new(entry: &RateLimitEntry, multiplier: f64) -> Self {
        let m = if multiplier.is_finite() && multiplier > 0.0 {
            multiplier
        } else {
            1.0
        };
        let cap = (entry.messages_per_minute as f64 / m).floor().max(1.0) as usize;
        let delay = (entry.min_delay_secs * m).max(0.0);
        Self {
            messages_per_minute: cap,
            min_delay: Duration::from_secs_f64(delay),
        }
    }
}

/// Per-carrier, per-campaign rate limiter
pub struct RateLimiter {
    limits: CarrierTable<RateLimitEntry>,
    windows: Mutex<HashMap<RateKey, Arc<Mutex<Window>>>>,
}

impl RateLimiter {
    pub fn new(limits: CarrierTable<RateLimitEntry>) -> Self {
        Self {
            limits,
            windows: Mutex::new(HashMap::new()),
        }
    }

    fn key(carrier: &str, campaign_id: CampaignId) -> RateKey {
        let carrier = normalize_carrier(carrier);
        let carrier = if carrier.is_empty() {
            CarrierTable::<RateLimitEntry>::DEFAULT_KEY.to_string()
        } else {
            carrier
        };
        (carrier, campaign_id)
    }

    fn window(&self, carrier: &str, campaign_id: CampaignId) -> Arc<Mutex<Window>> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .entry(Self::key(carrier, campaign_id))
            .or_default()
            .clone()
    }

    /// Configured limits for a carrier with a multiplier applied
    pub fn limits_for(&self, carrier: &str, multiplier: f64) -> EffectiveLimits {
        EffectiveLimits::new(self.limits.get(carrier), multiplier)
    }

    /// Whether the trailing window still has room under the carrier's cap
    pub fn can_send(&self, carrier: &str, campaign_id: CampaignId) -> bool {
        let limits = self.limits_for(carrier, 1.0);
        let window = self.window(carrier, campaign_id);
        let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(Instant::now());
        window.sends.len() < limits.messages_per_minute
    }

    /// Record a send on the key
    pub fn record_send(&self, carrier: &str, campaign_id: CampaignId) {
        let window = self.window(carrier, campaign_id);
        let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
        window.record(Instant::now());
    }

    /// Time remaining until the minimum delay since the last send has
    /// elapsed; zero if the key never sent
    pub fn wait_time(&self, carrier: &str, campaign_id: CampaignId) -> Duration {
        let limits = self.limits_for(carrier, 1.0);
        let window = self.window(carrier, campaign_id);
        let window = window.lock().unwrap_or_else(|e| e.into_inner());
        window
            .last_send
            .map(|last| (last + limits.min_delay).saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }

    /// Suspend until both the cap and the minimum delay allow a send, then
    /// record it. Returns how long the caller waited.
    pub async fn acquire(
        &self,
        carrier: &str,
        campaign_id: CampaignId,
        multiplier: f64,
    ) -> Duration {
        let limits = self.limits_for(carrier, multiplier);
        let window = self.window(carrier, campaign_id);
        let started = Instant::now();

        loop {
            let wait = {
                let mut guard = window.lock().unwrap_or_else(|e| e.into_inner());
                let now = Instant::now();
                let wait = guard.wait(&limits, now);
                if wait.is_zero() {
                    guard.record(now);
                    return now.duration_since(started);
                }
                wait
            };

            debug!(
                carrier,
                campaign_id = %campaign_id,
                wait_ms = wait.as_millis() as u64,
                "Rate limit gate waiting"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Drop every window of a finished campaign
    pub fn forget_campaign(&self, campaign_id: CampaignId) {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(_, id), _| *id != campaign_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn limiter() -> RateLimiter {
        RateLimiter::new(CarrierTable::new(
            RateLimitEntry::new(20, 3.0),
            [
                ("verizon".to_string(), RateLimitEntry::new(30, 2.0)),
                ("sprint".to_string(), RateLimitEntry::new(3, 0.0)),
            ],
        ))
    }

    #[test]
    fn test_effective_limits_multiplier() {
        let entry = RateLimitEntry::new(30, 2.0);
        let limits = EffectiveLimits::new(&entry, 2.0);
        assert_eq!(limits.messages_per_minute, 15);
        assert_eq!(limits.min_delay, Duration::from_secs(4));

        let limits = EffectiveLimits::new(&entry, 100.0);
        assert_eq!(limits.messages_per_minute, 1);

        let limits = EffectiveLimits::new(&entry, 0.0);
        assert_eq!(limits.messages_per_minute, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_saturation_and_recovery() {
        let limiter = limiter();
        let campaign = Uuid::new_v4();

        for _ in 0..3 {
            assert!(limiter.can_send("Sprint", campaign));
            limiter.record_send("sprint", campaign);
        }
        assert!(!limiter.can_send("sprint", campaign));

        // Other campaigns and carriers are independent keys
        assert!(limiter.can_send("sprint", Uuid::new_v4()));
        assert!(limiter.can_send("verizon", campaign));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!limiter.can_send("sprint", campaign));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.can_send("sprint", campaign));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_time_tracks_min_delay() {
        let limiter = limiter();
        let campaign = Uuid::new_v4();

        assert_eq!(limiter.wait_time("verizon", campaign), Duration::ZERO);
        limiter.record_send("verizon", campaign);
        assert_eq!(limiter.wait_time("verizon", campaign), Duration::from_secs(2));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(
            limiter.wait_time("verizon", campaign),
            Duration::from_millis(1500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_carrier_uses_default() {
        let limiter = limiter();
        let campaign = Uuid::new_v4();

        limiter.record_send("", campaign);
        assert_eq!(limiter.wait_time("", campaign), Duration::from_secs(3));
        assert_eq!(limiter.limits_for("cricket", 1.0).messages_per_minute, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_min_delay() {
        let limiter = limiter();
        let campaign = Uuid::new_v4();

        assert_eq!(limiter.acquire("verizon", campaign, 1.0).await, Duration::ZERO);
        let waited = limiter.acquire("verizon", campaign, 1.0).await;
        assert_eq!(waited, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_window() {
        let limiter = limiter();
        let campaign = Uuid::new_v4();

        for _ in 0..3 {
            limiter.acquire("sprint", campaign, 1.0).await;
        }
        let waited = limiter.acquire("sprint", campaign, 1.0).await;
        assert_eq!(waited, WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_campaign_drops_its_windows() {
        let limiter = limiter();
        let finished = Uuid::new_v4();
        let running = Uuid::new_v4();

        for carrier in ["verizon", "sprint", ""] {
            limiter.record_send(carrier, finished);
        }
        limiter.record_send("verizon", running);
        assert_eq!(limiter.windows.lock().unwrap().len(), 4);

        limiter.forget_campaign(finished);
        let keys: Vec<RateKey> = limiter.windows.lock().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec![("verizon".to_string(), running)]);

        // The running campaign keeps its delay state
        assert_eq!(limiter.wait_time("verizon", running), Duration::from_secs(2));
    }
}
