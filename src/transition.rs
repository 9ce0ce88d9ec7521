// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Outcome → backlog state transitions.
//!
//! ```text
//!              ┌──────────── SUCCESS ──────────────► COMPLETED
//!              │
//! PROCESSING ──┼── PERMISSION_DENIED / INVALID ────► FAILED
//!              │
//!              ├── RATE_LIMITED ───────────────────► PENDING (cooldown, uncounted)
//!              │
//!              └── TRANSIENT_ERROR ─┬ attempts < max ► PENDING (backoff)
//!                                   └ attempts ≥ max ► FAILED
//! ```
//!
//! The attempt counter is bumped when L1 claims an entry, so a resolution never
//! changes it. A rate-limit requeue instead marks the entry so that its next claim
//! is not charged: throttling never eats into the transient-error budget. Every resolution is applied with a compare-and-swap on
//! `(status = PROCESSING, claim_token = batch_id)`; a miss means a newer event or
//! claim has taken over and the outcome is dropped.

use crate::messages::{Outcome, OutcomeResult};
use crate::model::UrlEntry;
use crate::resilience::retry::requeue_delay;
use std::time::Duration;

/// Reason recorded when a shop uninstalled mid-flight.
pub const SHOP_INACTIVE: &str = "shop inactive";

/// The write L3 applies for one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// COMPLETED, `last_indexed_at = now`, error cleared
    Complete,
    /// FAILED with a reason
    Fail { reason: String },
    /// Back to PENDING, not claimable before `retry_after`.
    /// `counted = false` makes the next claim free of charge against `max_attempts`.
    Requeue { retry_after: i64, reason: String, counted: bool },
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Complete => "completed",
            Self::Fail { .. } => "failed",
            Self::Requeue { .. } => "requeued",
        }
    }
}

/// Timing knobs for requeues.
#[derive(Debug, Clone)]
pub struct TransitionPolicy {
    pub max_attempts: u32,
    pub rate_limit_cooldown: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rate_limit_cooldown: Duration::from_secs(900),
            retry_base: Duration::from_secs(60),
            retry_max: Duration::from_secs(3600),
        }
    }
}

impl From<&crate::config::PipelineConfig> for TransitionPolicy {
    fn from(config: &crate::config::PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            rate_limit_cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
            retry_base: Duration::from_secs(config.retry_base_secs),
            retry_max: Duration::from_secs(config.retry_max_secs),
        }
    }
}

fn describe(outcome: &Outcome) -> String {
    match (outcome.http_status, outcome.message.is_empty()) {
        (Some(status), false) => format!("{} ({}): {}", outcome.result, status, outcome.message),
        (Some(status), true) => format!("{} ({})", outcome.result, status),
        (None, false) => format!("{}: {}", outcome.result, outcome.message),
        (None, true) => outcome.result.to_string(),
    }
}

fn after(now: i64, delay: Duration) -> i64 {
    now.saturating_add(delay.as_millis().min(i64::MAX as u128) as i64)
}

/// Compute the resolution for `outcome` given the entry's current state.
///
/// `shop_active = false` overrides the outcome: the entry fails regardless.
pub fn for_outcome(
    entry: &UrlEntry,
    outcome: &Outcome,
    shop_active: bool,
    policy: &TransitionPolicy,
    now: i64,
) -> Resolution {
    if !shop_active {
        return Resolution::Fail { reason: SHOP_INACTIVE.to_string() };
    }

    match outcome.result {
        OutcomeResult::Success => Resolution::Complete,
        OutcomeResult::PermissionDenied | OutcomeResult::Invalid => {
            Resolution::Fail { reason: describe(outcome) }
        }
        OutcomeResult::RateLimited => Resolution::Requeue {
            retry_after: after(now, policy.rate_limit_cooldown),
            reason: describe(outcome),
            counted: false,
        },
        OutcomeResult::TransientError => {
            if entry.attempts >= policy.max_attempts {
                Resolution::Fail {
                    reason: format!("{} after {} attempts", describe(outcome), entry.attempts),
                }
            } else {
                let delay = requeue_delay(entry.attempts, policy.retry_base, policy.retry_max);
                Resolution::Requeue { retry_after: after(now, delay), reason: describe(outcome), counted: true }
            }
        }
    }
}
