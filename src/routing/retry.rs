//! Per-message delivery attempt tracking and backoff scheduling.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::protocol::{hours_before, BackoffStrategy, Envelope, RetryPolicy};

/// Base delay for exponential and linear backoff.
pub const BASE_DELAY_MS: u64 = 1000;

/// Constant delay of the fixed strategy.
pub const FIXED_DELAY_MS: u64 = 30_000;

/// Attempt bookkeeping for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryMetadata {
    pub message_id: String,
    pub attempt_count: u32,
    pub last_attempt: DateTime<Utc>,
    pub next_attempt: Option<DateTime<Utc>>,
    /// Error descriptions, oldest first
    pub errors: Vec<String>,
}

/// When and how a failed message should be attempted again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetrySchedule {
    pub message_id: String,
    pub next_attempt: DateTime<Utc>,
    pub attempt_number: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStats {
    pub total_tracked: usize,
    /// Entries whose next attempt is still in the future
    pub pending_retries: usize,
    /// Mean attempt count, rounded to two decimals
    pub avg_attempts: f64,
    pub max_attempts: u32,
}

/// Delay before attempt `attempt + 1`, given `attempt` failures so far.
///
/// Exponential delays are not capped; they saturate at `u64::MAX`.
pub fn backoff_ms(strategy: BackoffStrategy, attempt: u32) -> u64 {
    match strategy {
        BackoffStrategy::Exponential => {
            let exponent = attempt.saturating_sub(1);
            2u64.checked_pow(exponent)
                .and_then(|factor| factor.checked_mul(BASE_DELAY_MS))
                .unwrap_or(u64::MAX)
        }
        BackoffStrategy::Linear => BASE_DELAY_MS
            .saturating_mul(5)
            .saturating_mul(u64::from(attempt)),
        BackoffStrategy::Fixed => FIXED_DELAY_MS,
    }
}

#[derive(Debug, Default)]
pub struct RetryHandler {
    metadata: HashMap<String, RetryMetadata>,
}

impl RetryHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self, message_id: &str, error: Option<&str>) {
        self.record_attempt_at(message_id, error, Utc::now());
    }

    pub fn record_attempt_at(&mut self, message_id: &str, error: Option<&str>, now: DateTime<Utc>) {
        let entry = self
            .metadata
            .entry(message_id.to_string())
            .or_insert_with(|| RetryMetadata {
                message_id: message_id.to_string(),
                attempt_count: 0,
                last_attempt: now,
                next_attempt: None,
                errors: Vec::new(),
            });
        entry.attempt_count += 1;
        entry.last_attempt = now;
        if let Some(error) = error {
            entry.errors.push(error.to_string());
        }
    }

    /// Whether another attempt is allowed under `policy`.
    pub fn should_retry(&self, message_id: &str, policy: &RetryPolicy) -> bool {
        self.metadata
            .get(message_id)
            .map_or(true, |m| m.attempt_count < policy.max_attempts)
    }

    /// Record a failed attempt and compute the next one.
    ///
    /// Returns `None` when the envelope has no retry policy or its attempts are
    /// exhausted. The attempt is recorded either way.
    pub fn schedule_retry(&mut self, envelope: &Envelope, error: &str) -> Option<RetrySchedule> {
        self.schedule_retry_at(envelope, error, Utc::now())
    }

    pub fn schedule_retry_at(
        &mut self,
        envelope: &Envelope,
        error: &str,
        now: DateTime<Utc>,
    ) -> Option<RetrySchedule> {
        let id = envelope.message_id.as_str();
        self.record_attempt_at(id, Some(error), now);

        let policy = envelope.retry_policy?;
        if !self.should_retry(id, &policy) {
            return None;
        }

        let entry = self.metadata.get_mut(id)?;
        let attempt_number = entry.attempt_count;
        let backoff = backoff_ms(policy.backoff_strategy, attempt_number);
        let next_attempt = now
            .checked_add_signed(Duration::milliseconds(i64::try_from(backoff).unwrap_or(i64::MAX)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        entry.next_attempt = Some(next_attempt);

        Some(RetrySchedule {
            message_id: id.to_string(),
            next_attempt,
            attempt_number,
            backoff_ms: backoff,
        })
    }

    pub fn metadata(&self, message_id: &str) -> Option<&RetryMetadata> {
        self.metadata.get(message_id)
    }

    pub fn is_ready_for_retry(&self, message_id: &str) -> bool {
        self.is_ready_for_retry_at(message_id, Utc::now())
    }

    pub fn is_ready_for_retry_at(&self, message_id: &str, now: DateTime<Utc>) -> bool {
        self.metadata
            .get(message_id)
            .and_then(|m| m.next_attempt)
            .is_some_and(|next| now >= next)
    }

    pub fn ready_for_retry(&self) -> Vec<String> {
        self.ready_for_retry_at(Utc::now())
    }

    /// Ids whose next attempt is due, oldest due first.
    pub fn ready_for_retry_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut ready: Vec<(&DateTime<Utc>, &String)> = self
            .metadata
            .values()
            .filter_map(|m| m.next_attempt.as_ref().map(|next| (next, &m.message_id)))
            .filter(|(next, _)| now >= **next)
            .collect();
        ready.sort();
        ready.into_iter().map(|(_, id)| id.clone()).collect()
    }

    /// Forget a message, typically after successful delivery.
    pub fn clear_metadata(&mut self, message_id: &str) -> bool {
        self.metadata.remove(message_id).is_some()
    }

    pub fn clear_all(&mut self) {
        self.metadata.clear();
    }

    pub fn len(&self) -> usize {
        self.metadata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    pub fn stats(&self) -> RetryStats {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> RetryStats {
        let total_tracked = self.metadata.len();
        let total_attempts: u64 = self
            .metadata
            .values()
            .map(|m| u64::from(m.attempt_count))
            .sum();
        let avg_attempts = if total_tracked > 0 {
            (total_attempts as f64 / total_tracked as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };

        RetryStats {
            total_tracked,
            pending_retries: self
                .metadata
                .values()
                .filter(|m| m.next_attempt.is_some_and(|next| now < next))
                .count(),
            avg_attempts,
            max_attempts: self
                .metadata
                .values()
                .map(|m| m.attempt_count)
                .max()
                .unwrap_or(0),
        }
    }

    /// Drop entries whose last attempt is older than `max_age_hours`.
    pub fn cleanup_stale(&mut self, max_age_hours: u32) -> usize {
        self.cleanup_stale_at(max_age_hours, Utc::now())
    }

    pub fn cleanup_stale_at(&mut self, max_age_hours: u32, now: DateTime<Utc>) -> usize {
        let cutoff = hours_before(now, u64::from(max_age_hours));
        let before = self.metadata.len();
        self.metadata.retain(|_, m| m.last_attempt >= cutoff);
        before - self.metadata.len()
    }
}
