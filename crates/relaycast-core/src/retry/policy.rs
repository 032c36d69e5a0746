//! Retry decisions and backoff

use std::time::Duration;

use rand::Rng;
use relaycast_common::config::{CarrierRetryConfig, RetryConfig};
use relaycast_common::types::ErrorType;

use super::classifier::{classify, is_rate_limited};

/// Per-carrier retry policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Carrier parameters, falling back to the default entry
    pub fn carrier(&self, carrier: Option<&str>) -> &CarrierRetryConfig {
        self.config.carriers.get(carrier.unwrap_or_default())
    }

    /// Whether a failure deserves another attempt, given how many retry
    /// attempts the message already had
    pub fn should_retry(&self, attempts_so_far: u32, carrier: Option<&str>, error_text: &str) -> bool {
        if attempts_so_far >= self.carrier(carrier).max_attempts {
            return false;
        }
        match classify(error_text) {
            ErrorType::Permanent | ErrorType::Configuration => false,
            ErrorType::Temporary | ErrorType::Auth | ErrorType::Server => true,
            ErrorType::Unknown => attempts_so_far == 0,
        }
    }

    /// Exponential backoff without jitter, capped at the global maximum
    pub fn calculate_backoff(&self, attempt_number: u32, carrier: Option<&str>) -> f64 {
        let params = self.carrier(carrier);
        let exponent = attempt_number.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = params.base_delay_secs * params.multiplier.powi(exponent);
        delay.clamp(0.0, self.config.max_delay_secs)
    }

    /// Delay before retry `attempt_number` (1-based)
    pub fn delay(&self, attempt_number: u32, carrier: Option<&str>, error_text: &str) -> Duration {
        self.delay_with_rng(attempt_number, carrier, error_text, &mut rand::thread_rng())
    }

    /// Throttling failures wait the carrier's flat delay; everything else
    /// backs off exponentially with uniform jitter
    pub fn delay_with_rng<R: Rng + ?Sized>(
        &self,
        attempt_number: u32,
        carrier: Option<&str>,
        error_text: &str,
        rng: &mut R,
    ) -> Duration {
        if is_rate_limited(error_text) {
            let flat = self.carrier(carrier).rate_limit_delay_secs.max(0.0);
            return Duration::from_secs_f64(flat);
        }

        let base = self.calculate_backoff(attempt_number, carrier);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rng.gen_range((1.0 - jitter)..=(1.0 + jitter))
        } else {
            1.0
        };
        let secs = (base * factor).clamp(0.0, self.config.max_delay_secs);
        Duration::from_secs_f64(secs)
    }
}
