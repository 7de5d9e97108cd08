use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use rand::Rng;
use tracing::debug;

use crate::repo::{AttemptDecision, RateLimitRepository, Repository, StoreError, StoreResult};
use crate::tasks;

/// Chance that a call also purges stale attempts.
const PURGE_PROBABILITY: f64 = 0.05;

/// Stale attempts are kept at least this long, longer for wider windows.
const PURGE_HORIZON_HOURS: i64 = 24;

/// Named admission policies: action class, max attempts, window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub action: &'static str,
    pub max_attempts: u32,
    pub window: ChronoDuration,
}

impl RateLimitPolicy {
    pub fn admin_login() -> Self {
        Self {
            action: "login",
            max_attempts: 10,
            window: ChronoDuration::minutes(10),
        }
    }

    pub fn field_access() -> Self {
        Self {
            action: "access",
            max_attempts: 10,
            window: ChronoDuration::minutes(10),
        }
    }

    pub fn org_create() -> Self {
        Self {
            action: "org-create",
            max_attempts: 3,
            window: ChronoDuration::hours(1),
        }
    }

    pub fn key_for(&self, identity: &str) -> String {
        format!("{}:{}", self.action, identity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the oldest in-window attempt expires, when denied.
    pub retry_after: Option<u64>,
}

/// Sliding-window limiter. Every allowed call records exactly one attempt.
#[derive(Clone)]
pub struct RateLimiter {
    repo: Arc<dyn Repository>,
    purge_probability: f64,
}

impl RateLimiter {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            purge_probability: PURGE_PROBABILITY,
        }
    }

    pub fn with_purge_probability(mut self, probability: f64) -> Self {
        self.purge_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn check_policy(
        &self,
        policy: RateLimitPolicy,
        identity: &str,
    ) -> StoreResult<RateLimitDecision> {
        self.check(&policy.key_for(identity), policy.max_attempts, policy.window)
    }

    pub fn check(
        &self,
        key: &str,
        max_attempts: u32,
        window: ChronoDuration,
    ) -> StoreResult<RateLimitDecision> {
        self.check_at(key, max_attempts, window, Utc::now().naive_utc())
    }

    pub fn check_at(
        &self,
        key: &str,
        max_attempts: u32,
        window: ChronoDuration,
        now: NaiveDateTime,
    ) -> StoreResult<RateLimitDecision> {
        self.maybe_purge(now, window);

        let decision = self.repo.record_attempt_if_allowed(
            key,
            now - window,
            i64::from(max_attempts),
            now,
        )?;

        Ok(match decision {
            AttemptDecision::Allowed => RateLimitDecision {
                allowed: true,
                retry_after: None,
            },
            AttemptDecision::Denied { oldest } => {
                let remaining = (oldest + window - now).num_seconds().max(1);
                debug!(key, retry_after = remaining, "rate limit exceeded");
                RateLimitDecision {
                    allowed: false,
                    retry_after: Some(remaining as u64),
                }
            }
        })
    }

    fn maybe_purge(&self, now: NaiveDateTime, window: ChronoDuration) {
        if self.purge_probability <= 0.0
            || !rand::thread_rng().gen_bool(self.purge_probability)
        {
            return;
        }

        let repo = self.repo.clone();
        let cutoff = now - window.max(ChronoDuration::hours(PURGE_HORIZON_HOURS));
        tasks::spawn_blocking_best_effort("purge_rate_limit_attempts", move || {
            let purged = repo.purge_attempts_before(cutoff)?;
            if purged > 0 {
                debug!(purged, "purged stale rate limit attempts");
            }
            Ok::<_, StoreError>(())
        });
    }
}
