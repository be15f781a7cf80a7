//! In-process token buckets keyed by (profile id, endpoint class).

use std::time::Instant;

use dashmap::DashMap;

use sibyl_core::SibylError;

/// Endpoint classes with their own budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Chat,
    Escalation,
    AgentCreate,
}

impl Endpoint {
    /// (bucket capacity, refill tokens per second)
    fn budget(&self) -> (f64, f64) {
        match self {
            // 20 messages, refills one every 3s.
            Endpoint::Chat => (20.0, 1.0 / 3.0),
            // 10 escalation actions per minute.
            Endpoint::Escalation => (10.0, 10.0 / 60.0),
            // 3 agent creations per hour.
            Endpoint::AgentCreate => (3.0, 3.0 / 3600.0),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Endpoint::Chat => "chat",
            Endpoint::Escalation => "escalation",
            Endpoint::AgentCreate => "agent_create",
        }
    }
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Classic token bucket per (user, endpoint). Admin-secret routes never
/// consult this.
pub struct RateLimiter {
    buckets: DashMap<(String, Endpoint), Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Take one token or fail with `QuotaExceeded`.
    pub fn check(&self, user_id: &str, endpoint: Endpoint) -> Result<(), SibylError> {
        let (capacity, refill_per_sec) = endpoint.budget();
        let mut bucket = self
            .buckets
            .entry((user_id.to_string(), endpoint))
            .or_insert_with(|| Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            });

        let elapsed = bucket.refilled_at.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_per_sec).min(capacity);
        bucket.refilled_at = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(SibylError::QuotaExceeded(format!(
                "rate limit hit for {}",
                endpoint.name()
            )))
        }
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity_then_blocked() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.check("u1", Endpoint::AgentCreate).unwrap();
        }
        assert!(limiter.check("u1", Endpoint::AgentCreate).is_err());
        // Other users and other endpoints are unaffected.
        assert!(limiter.check("u2", Endpoint::AgentCreate).is_ok());
        assert!(limiter.check("u1", Endpoint::Chat).is_ok());
    }

    #[test]
    fn chat_budget_is_generous() {
        let limiter = RateLimiter::new();
        for _ in 0..20 {
            limiter.check("u1", Endpoint::Chat).unwrap();
        }
        assert!(limiter.check("u1", Endpoint::Chat).is_err());
    }
}
