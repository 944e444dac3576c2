//! Relay service: validation, queueing, delivery bookkeeping and audit.
//!
//! The relay is the only layer that logs. Every lifecycle transition is
//! written to the message store and the audit log before it is reported.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::audit::{
    AuditEventType, AuditLogger, DeliveryStatus, MessageReplay, MessageSearch, MessageStatus,
    MessageStore, ReplayOptions, ReplayResult,
};
use crate::config::{Retention, Settings};
use crate::error::{Error, Result};
use crate::protocol::{format_instant, hours_before, xml, Envelope};
use crate::routing::{AgentRegistry, MessageQueue, QueueStats, RetryHandler, RetrySchedule, RetryStats};
use crate::validation::{EnvelopeValidator, ValidationIssue, ValidationReport};

/// Audit message id used when an envelope does not declare one.
const UNKNOWN_MESSAGE: &str = "unknown";

/// Runtime switches taken from [`Settings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    pub actor: String,
    pub enforce_registry: bool,
    pub reject_warnings: bool,
    pub stale_retry_hours: u32,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for RelayOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            actor: settings.actor.clone(),
            enforce_registry: settings.routing.enforce_registry,
            reject_warnings: settings.routing.reject_warnings,
            stale_retry_hours: settings.maintenance.stale_retry_hours,
        }
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Rejection {
    Invalid,
    Warnings,
    Unroutable { sender: String, recipient: String },
    Duplicate,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::Invalid => write!(f, "envelope failed validation"),
            Rejection::Warnings => write!(f, "envelope has warnings and warnings are rejected"),
            Rejection::Unroutable { sender, recipient } => {
                write!(f, "registry does not route {} -> {}", sender, recipient)
            }
            Rejection::Duplicate => write!(f, "message id already stored"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    Queued {
        message_id: String,
        warnings: Vec<ValidationIssue>,
    },
    Rejected {
        message_id: Option<String>,
        reason: Rejection,
        report: ValidationReport,
    },
}

impl SubmitOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, SubmitOutcome::Queued { .. })
    }
}

/// Result of a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Parked until the scheduled instant.
    Retrying(RetrySchedule),
    /// No retry left; the message is failed.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub expired: usize,
    pub requeued: usize,
    pub stale_cleared: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub messages: usize,
    pub audit_events: usize,
}

pub struct Relay {
    options: RelayOptions,
    validator: EnvelopeValidator,
    store: MessageStore,
    audit: AuditLogger,
    registry: RwLock<AgentRegistry>,
    queue: Mutex<MessageQueue>,
    retry: Mutex<RetryHandler>,
    /// Envelopes waiting for their next retry instant
    parked: Mutex<HashMap<String, Envelope>>,
}

impl Relay {
    pub fn new(
        options: RelayOptions,
        store: MessageStore,
        audit: AuditLogger,
        registry: AgentRegistry,
    ) -> Self {
        Self {
            options,
            validator: EnvelopeValidator::new(),
            store,
            audit,
            registry: RwLock::new(registry),
            queue: Mutex::new(MessageQueue::new()),
            retry: Mutex::new(RetryHandler::new()),
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Open the databases and load the agent registry named by `settings`.
    pub fn open(settings: &Settings) -> Result<Self> {
        let store = MessageStore::open(&settings.database_path)?;
        let audit = AuditLogger::open(&settings.audit_database_path)?;
        let registry = AgentRegistry::load(&settings.agents_dir)?;
        tracing::debug!(
            "Relay opened: store={}, audit={}, {} agents",
            settings.database_path.display(),
            settings.audit_database_path.display(),
            registry.len()
        );
        Ok(Self::new(RelayOptions::from(settings), store, audit, registry))
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn search(&self) -> MessageSearch<'_> {
        MessageSearch::new(&self.store)
    }

    pub fn validator(&self) -> &EnvelopeValidator {
        &self.validator
    }

    pub fn registry(&self) -> Result<RwLockReadGuard<'_, AgentRegistry>> {
        self.registry
            .read()
            .map_err(|_| Error::Other("registry lock poisoned".to_string()))
    }

    /// Rescan the agents directory. Returns the number of agents loaded.
    pub fn reload_registry(&self) -> Result<usize> {
        let mut registry = self
            .registry
            .write()
            .map_err(|_| Error::Other("registry lock poisoned".to_string()))?;
        registry.refresh()?;
        tracing::info!("Agent registry reloaded: {} agents", registry.len());
        Ok(registry.len())
    }

    pub fn queue_stats(&self) -> Result<QueueStats> {
        Ok(lock(&self.queue, "queue")?.stats())
    }

    pub fn retry_stats(&self) -> Result<RetryStats> {
        Ok(lock(&self.retry, "retry")?.stats())
    }

    /// Number of envelopes waiting for a retry instant.
    pub fn parked_len(&self) -> Result<usize> {
        Ok(lock(&self.parked, "parked")?.len())
    }

    pub fn submit(&self, raw: &str) -> Result<SubmitOutcome> {
        self.submit_at(raw, Utc::now())
    }

    /// Validate, persist and enqueue an envelope.
    pub fn submit_at(&self, raw: &str, now: DateTime<Utc>) -> Result<SubmitOutcome> {
        let declared = declared_message_id(raw);
        let audit_id = declared.as_deref().unwrap_or(UNKNOWN_MESSAGE);
        self.record(
            AuditEventType::MessageReceived,
            audit_id,
            json!({ "bytes": raw.len() }),
            now,
        )?;

        let validation = self.validator.validate_at(raw, now);
        let report = self.validator.report(&validation, raw);

        let envelope = match validation.envelope.clone() {
            Some(envelope) if validation.is_accepted(self.options.reject_warnings) => envelope,
            _ => {
                let reason = if validation.is_valid() {
                    Rejection::Warnings
                } else {
                    Rejection::Invalid
                };
                self.record(
                    AuditEventType::ValidationFailed,
                    audit_id,
                    json!({
                        "errors": validation.merged.errors.len(),
                        "warnings": validation.merged.warnings.len(),
                        "summary": report.summary,
                    }),
                    now,
                )?;
                tracing::warn!("Rejected message {}: {}", audit_id, report.summary);
                return Ok(SubmitOutcome::Rejected {
                    message_id: declared,
                    reason,
                    report,
                });
            }
        };

        let id = envelope.message_id.clone();
        self.record(
            AuditEventType::ValidationPassed,
            &id,
            json!({ "warnings": validation.merged.warnings.len() }),
            now,
        )?;

        if let Some(reason) = self.refuse(&envelope)? {
            return self.refused(id, reason, report, now);
        }

        match self.store.save(&envelope, MessageStatus::Pending) {
            Ok(()) => {}
            // lost a race with a concurrent submit of the same id
            Err(Error::Duplicate(_)) => return self.refused(id, Rejection::Duplicate, report, now),
            Err(e) => return Err(e),
        }
        let details = json!({
            "priority": envelope.priority.as_str(),
            "sender": envelope.sender.agent_name,
            "recipient": envelope.recipient.agent_name,
        });
        tracing::info!(
            "Queued message {} ({} -> {}, {})",
            id,
            envelope.sender.agent_name,
            envelope.recipient.agent_name,
            envelope.priority
        );
        lock(&self.queue, "queue")?.enqueue_at(envelope, now);
        self.record(AuditEventType::MessageQueued, &id, details, now)?;

        Ok(SubmitOutcome::Queued {
            message_id: id,
            warnings: validation.merged.warnings,
        })
    }

    fn refused(
        &self,
        id: String,
        reason: Rejection,
        report: ValidationReport,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        self.record(
            AuditEventType::ValidationFailed,
            &id,
            json!({ "reason": reason.to_string() }),
            now,
        )?;
        tracing::warn!("Rejected message {}: {}", id, reason);
        Ok(SubmitOutcome::Rejected {
            message_id: Some(id),
            reason,
            report,
        })
    }

    /// Routing and uniqueness checks applied after validation.
    fn refuse(&self, envelope: &Envelope) -> Result<Option<Rejection>> {
        if self.options.enforce_registry {
            let sender = &envelope.sender.agent_name;
            let recipient = &envelope.recipient.agent_name;
            if !self.registry()?.can_route(sender, recipient) {
                return Ok(Some(Rejection::Unroutable {
                    sender: sender.clone(),
                    recipient: recipient.clone(),
                }));
            }
        }
        if self.store.find_by_id(&envelope.message_id)?.is_some() {
            return Ok(Some(Rejection::Duplicate));
        }
        Ok(None)
    }

    pub fn next_delivery(&self) -> Result<Option<Envelope>> {
        self.next_delivery_at(Utc::now())
    }

    /// Take the next deliverable envelope and record the attempt.
    pub fn next_delivery_at(&self, now: DateTime<Utc>) -> Result<Option<Envelope>> {
        let Some(envelope) = lock(&self.queue, "queue")?.dequeue_at(now) else {
            return Ok(None);
        };
        let attempt = self.attempt_number(&envelope.message_id)?;
        self.record(
            AuditEventType::DeliveryAttempted,
            &envelope.message_id,
            json!({ "attempt": attempt, "recipient": envelope.recipient.agent_name }),
            now,
        )?;
        tracing::debug!(
            "Dispatching message {} to {} (attempt {})",
            envelope.message_id,
            envelope.recipient.agent_name,
            attempt
        );
        Ok(Some(envelope))
    }

    pub fn record_success(&self, message_id: &str) -> Result<()> {
        self.record_success_at(message_id, Utc::now())
    }

    pub fn record_success_at(&self, message_id: &str, now: DateTime<Utc>) -> Result<()> {
        let attempt = self.attempt_number(message_id)?;
        if !self.store.update_status(message_id, MessageStatus::Delivered)? {
            return Err(Error::NotFound(format!("message {}", message_id)));
        }
        self.store
            .log_delivery_at(message_id, attempt, DeliveryStatus::Success, None, now)?;
        lock(&self.retry, "retry")?.clear_metadata(message_id);
        lock(&self.parked, "parked")?.remove(message_id);
        self.record(
            AuditEventType::DeliverySuccess,
            message_id,
            json!({ "attempt": attempt }),
            now,
        )?;
        tracing::info!("Delivered message {} (attempt {})", message_id, attempt);
        Ok(())
    }

    pub fn record_failure(&self, envelope: &Envelope, error: &str) -> Result<FailureOutcome> {
        self.record_failure_at(envelope, error, Utc::now())
    }

    /// Record a failed delivery and either park the envelope for a retry or
    /// mark it failed.
    pub fn record_failure_at(
        &self,
        envelope: &Envelope,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        let id = envelope.message_id.as_str();
        let (schedule, attempt) = {
            let mut retry = lock(&self.retry, "retry")?;
            let schedule = retry.schedule_retry_at(envelope, error, now);
            let attempt = retry.metadata(id).map_or(1, |m| m.attempt_count);
            (schedule, attempt)
        };

        match schedule {
            Some(schedule) => {
                self.store
                    .log_delivery_at(id, attempt, DeliveryStatus::Retry, Some(error), now)?;
                lock(&self.parked, "parked")?.insert(id.to_string(), envelope.clone());
                self.record(
                    AuditEventType::DeliveryFailed,
                    id,
                    json!({
                        "error": error,
                        "attempt": attempt,
                        "final": false,
                        "next_attempt": format_instant(schedule.next_attempt),
                    }),
                    now,
                )?;
                tracing::warn!(
                    "Delivery of {} failed (attempt {}), retrying in {} ms: {}",
                    id,
                    attempt,
                    schedule.backoff_ms,
                    error
                );
                Ok(FailureOutcome::Retrying(schedule))
            }
            None => {
                self.store
                    .log_delivery_at(id, attempt, DeliveryStatus::Failed, Some(error), now)?;
                self.store.update_status(id, MessageStatus::Failed)?;
                self.record(
                    AuditEventType::DeliveryFailed,
                    id,
                    json!({ "error": error, "attempt": attempt, "final": true }),
                    now,
                )?;
                tracing::error!(
                    "Delivery of {} failed permanently after {} attempt(s): {}",
                    id,
                    attempt,
                    error
                );
                Ok(FailureOutcome::Exhausted { attempts: attempt })
            }
        }
    }

    pub fn requeue_ready(&self) -> Result<usize> {
        self.requeue_ready_at(Utc::now())
    }

    /// Move parked envelopes whose retry instant has come back into the queue.
    pub fn requeue_ready_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let ready = lock(&self.retry, "retry")?.ready_for_retry_at(now);
        let envelopes: Vec<Envelope> = {
            let mut parked = lock(&self.parked, "parked")?;
            ready.iter().filter_map(|id| parked.remove(id)).collect()
        };

        let count = envelopes.len();
        let mut queue = lock(&self.queue, "queue")?;
        for envelope in envelopes {
            tracing::debug!("Requeued message {} for retry", envelope.message_id);
            queue.enqueue_at(envelope, now);
        }
        Ok(count)
    }

    pub fn expire(&self) -> Result<Vec<String>> {
        self.expire_at(Utc::now())
    }

    /// Remove expired envelopes from the queue and the retry park and mark
    /// them expired. Returns their ids.
    pub fn expire_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut expired = lock(&self.queue, "queue")?.drain_expired_at(now);
        {
            let mut parked = lock(&self.parked, "parked")?;
            let ids: Vec<String> = parked
                .values()
                .filter(|e| e.is_expired_at(now))
                .map(|e| e.message_id.clone())
                .collect();
            expired.extend(ids.iter().filter_map(|id| parked.remove(id)));
        }

        let mut ids = Vec::with_capacity(expired.len());
        for envelope in expired {
            let id = envelope.message_id;
            self.store.update_status(&id, MessageStatus::Expired)?;
            lock(&self.retry, "retry")?.clear_metadata(&id);
            self.record(
                AuditEventType::MessageExpired,
                &id,
                json!({ "expiration": format_instant(envelope.expiration) }),
                now,
            )?;
            tracing::info!("Message {} expired", id);
            ids.push(id);
        }
        Ok(ids)
    }

    pub fn restore_pending(&self) -> Result<usize> {
        self.restore_pending_at(Utc::now())
    }

    /// Reload pending stored messages into the queue after a restart.
    /// Pending messages that expired in the meantime are marked expired.
    pub fn restore_pending_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut restored = 0;
        for stored in self.store.find_by_status(MessageStatus::Pending)? {
            if self.is_held(&stored.message_id)? {
                continue;
            }
            let envelope = match Envelope::parse(&stored.raw_xml) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!("Skipping stored message {}: {}", stored.message_id, e);
                    continue;
                }
            };
            if envelope.is_expired_at(now) {
                self.store
                    .update_status(&stored.message_id, MessageStatus::Expired)?;
                self.record(
                    AuditEventType::MessageExpired,
                    &stored.message_id,
                    json!({ "expiration": format_instant(envelope.expiration), "restored": true }),
                    now,
                )?;
                continue;
            }
            lock(&self.queue, "queue")?.enqueue_at(envelope, now);
            restored += 1;
        }
        if restored > 0 {
            tracing::info!("Restored {} pending message(s) into the queue", restored);
        }
        Ok(restored)
    }

    fn is_held(&self, message_id: &str) -> Result<bool> {
        Ok(lock(&self.queue, "queue")?.find_by_id(message_id).is_some()
            || lock(&self.parked, "parked")?.contains_key(message_id))
    }

    /// Replay one stored message and queue it again.
    pub fn replay(&self, message_id: &str, options: &ReplayOptions) -> Result<ReplayResult> {
        let result = MessageReplay::new(&self.store).replay(message_id, options)?;
        self.after_replay(&result, options)?;
        Ok(result)
    }

    pub fn replay_conversation(
        &self,
        correlation_id: &str,
        options: &ReplayOptions,
    ) -> Result<Vec<ReplayResult>> {
        let results = MessageReplay::new(&self.store).replay_conversation(correlation_id, options)?;
        for result in &results {
            self.after_replay(result, options)?;
        }
        Ok(results)
    }

    pub fn replay_failed(&self, options: &ReplayOptions) -> Result<Vec<ReplayResult>> {
        let results = MessageReplay::new(&self.store).replay_failed(options)?;
        for result in &results {
            self.after_replay(result, options)?;
        }
        Ok(results)
    }

    fn after_replay(&self, result: &ReplayResult, options: &ReplayOptions) -> Result<()> {
        let Some(envelope) = &result.envelope else {
            if !result.success {
                tracing::warn!(
                    "Replay of {} failed: {}",
                    result.message_id,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
            return Ok(());
        };

        let id = envelope.message_id.as_str();
        if options.reset_retry_count {
            lock(&self.retry, "retry")?.clear_metadata(id);
        }
        lock(&self.parked, "parked")?.remove(id);
        {
            let mut queue = lock(&self.queue, "queue")?;
            queue.remove_by_id(id);
            queue.enqueue_at(envelope.clone(), result.timestamp);
        }
        self.record(
            AuditEventType::MessageReplayed,
            id,
            json!({
                "reset_retry_count": options.reset_retry_count,
                "update_timestamps": options.update_timestamps,
            }),
            result.timestamp,
        )?;
        tracing::info!("Replayed message {}", id);
        Ok(())
    }

    pub fn maintain(&self) -> Result<MaintenanceReport> {
        self.maintain_at(Utc::now())
    }

    /// One maintenance tick: expire, requeue due retries, drop stale retry state.
    pub fn maintain_at(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let expired = self.expire_at(now)?.len();
        let mut requeued = self.requeue_ready_at(now)?;
        let stale_cleared =
            lock(&self.retry, "retry")?.cleanup_stale_at(self.options.stale_retry_hours, now);

        if stale_cleared > 0 {
            // parked envelopes whose retry state was dropped go back to the queue
            let orphans: Vec<Envelope> = {
                let retry = lock(&self.retry, "retry")?;
                let mut parked = lock(&self.parked, "parked")?;
                let ids: Vec<String> = parked
                    .keys()
                    .filter(|id| retry.metadata(id).is_none())
                    .cloned()
                    .collect();
                ids.iter().filter_map(|id| parked.remove(id)).collect()
            };
            requeued += orphans.len();
            let mut queue = lock(&self.queue, "queue")?;
            for envelope in orphans {
                queue.enqueue_at(envelope, now);
            }
        }

        let report = MaintenanceReport {
            expired,
            requeued,
            stale_cleared,
        };
        if report != MaintenanceReport::default() {
            tracing::info!(
                "Maintenance: {} expired, {} requeued, {} stale retry entries cleared",
                report.expired,
                report.requeued,
                report.stale_cleared
            );
        }
        Ok(report)
    }

    pub fn prune(&self, retention: &Retention) -> Result<PruneReport> {
        self.prune_at(retention, Utc::now())
    }

    /// Apply the retention periods to the message store and the audit log.
    pub fn prune_at(&self, retention: &Retention, now: DateTime<Utc>) -> Result<PruneReport> {
        let messages = self
            .store
            .delete_older_than(hours_before(now, u64::from(retention.message_days) * 24))?;
        let audit_events = self
            .audit
            .delete_older_than(hours_before(now, u64::from(retention.audit_days) * 24))?;
        tracing::info!(
            "Pruned {} message(s) and {} audit event(s)",
            messages,
            audit_events
        );
        Ok(PruneReport {
            messages,
            audit_events,
        })
    }

    /// Attempt number of the next delivery of a message.
    fn attempt_number(&self, message_id: &str) -> Result<u32> {
        Ok(lock(&self.retry, "retry")?
            .metadata(message_id)
            .map_or(1, |m| m.attempt_count + 1))
    }

    fn record(
        &self,
        event_type: AuditEventType,
        message_id: &str,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.audit
            .log_at(event_type, message_id, &self.options.actor, details, now)?;
        Ok(())
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> Result<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Other(format!("{} lock poisoned", what)))
}

/// Message id declared in the header, if the document gets that far.
fn declared_message_id(raw: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(raw).ok()?;
    let header = xml::child(doc.root_element(), "header")?;
    xml::child_text(header, "message-id").map(str::to_string)
}
