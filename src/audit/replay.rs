//! Re-validate stored messages and return them to the pending state.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::store::MessageStore;
use super::types::MessageStatus;
use crate::error::{Error, Result};
use crate::protocol::Envelope;
use crate::validation::{EnvelopeValidator, Validation, ValidationResult};

/// Expiration window given to a replayed message when its timestamps are refreshed.
const REFRESHED_TTL_HOURS: i64 = 5;

/// Delivery-log note written for every replay.
pub const REPLAY_NOTE: &str = "Message replayed";

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOptions {
    /// Validate only; nothing is written.
    pub dry_run: bool,
    /// Forget earlier delivery attempts so the retry budget starts over.
    pub reset_retry_count: bool,
    /// Restamp header and signature with the current time.
    pub update_timestamps: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub message_id: String,
    pub success: bool,
    pub validation: Option<ValidationResult>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// The envelope to dispatch again; absent on failure and on dry runs
    #[serde(skip)]
    pub envelope: Option<Envelope>,
}

impl ReplayResult {
    fn failed(message_id: &str, error: impl Into<String>, validation: Option<ValidationResult>) -> Self {
        Self {
            message_id: message_id.to_string(),
            success: false,
            validation,
            error: Some(error.into()),
            timestamp: Utc::now(),
            envelope: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub total_replays: usize,
    /// Replays followed by a successful delivery
    pub successful_replays: usize,
    /// Replays of messages that are failed again
    pub failed_replays: usize,
}

pub struct MessageReplay<'a> {
    store: &'a MessageStore,
    validator: EnvelopeValidator,
}

impl<'a> MessageReplay<'a> {
    pub fn new(store: &'a MessageStore) -> Self {
        Self {
            store,
            validator: EnvelopeValidator::new(),
        }
    }

    /// Run the full validation pipeline over a stored message.
    pub fn validate(&self, message_id: &str) -> Result<Validation> {
        let stored = self
            .store
            .find_by_id(message_id)?
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))?;
        Ok(self.validator.validate(&stored.raw_xml))
    }

    /// Replay one message. Validation and write failures are reported in the
    /// result; `Err` is reserved for failures reading the store.
    pub fn replay(&self, message_id: &str, options: &ReplayOptions) -> Result<ReplayResult> {
        let validation = match self.validate(message_id) {
            Ok(validation) => validation,
            Err(Error::NotFound(_)) => return Ok(ReplayResult::failed(message_id, "Message not found", None)),
            Err(e) => return Err(e),
        };

        let envelope = match validation.envelope {
            Some(envelope) if validation.merged.valid => envelope,
            _ => {
                return Ok(ReplayResult::failed(
                    message_id,
                    "Validation failed",
                    Some(validation.merged),
                ))
            }
        };

        if options.dry_run {
            return Ok(ReplayResult {
                message_id: message_id.to_string(),
                success: true,
                validation: Some(validation.merged),
                error: None,
                timestamp: Utc::now(),
                envelope: None,
            });
        }

        let now = Utc::now();
        let (envelope, refreshed) = if options.update_timestamps {
            (refresh_timestamps(envelope, now), true)
        } else {
            (envelope, false)
        };
        if let Err(e) =
            self.store
                .mark_replayed(message_id, refreshed.then_some(&envelope), REPLAY_NOTE, now)
        {
            return Ok(ReplayResult::failed(
                message_id,
                e.to_string(),
                Some(validation.merged),
            ));
        }

        Ok(ReplayResult {
            message_id: message_id.to_string(),
            success: true,
            validation: Some(validation.merged),
            error: None,
            timestamp: Utc::now(),
            envelope: Some(envelope),
        })
    }

    /// Replay every message of a conversation, oldest first.
    ///
    /// Each message is replayed on its own; a storage failure is recorded in
    /// that message's result and the batch carries on.
    pub fn replay_conversation(
        &self,
        correlation_id: &str,
        options: &ReplayOptions,
    ) -> Result<Vec<ReplayResult>> {
        let messages = self.store.find_by_correlation(correlation_id)?;
        Ok(self.replay_each(messages.iter().map(|m| m.message_id.as_str()), options))
    }

    /// Replay every failed message, oldest first. Failures stay per message.
    pub fn replay_failed(&self, options: &ReplayOptions) -> Result<Vec<ReplayResult>> {
        let messages = self.store.find_by_status(MessageStatus::Failed)?;
        Ok(self.replay_each(messages.iter().map(|m| m.message_id.as_str()), options))
    }

    fn replay_each<'b>(
        &self,
        ids: impl Iterator<Item = &'b str>,
        options: &ReplayOptions,
    ) -> Vec<ReplayResult> {
        ids.map(|id| {
            self.replay(id, options)
                .unwrap_or_else(|e| ReplayResult::failed(id, e.to_string(), None))
        })
        .collect()
    }

    pub fn replay_stats(&self) -> Result<ReplayStats> {
        let conn = self.store.conn()?;
        conn.query_row(
            "SELECT COUNT(*), \
                COALESCE(SUM(CASE WHEN EXISTS (SELECT 1 FROM delivery_logs s \
                    WHERE s.message_id = r.message_id AND s.status = 'success' AND s.id > r.id) \
                    THEN 1 ELSE 0 END), 0), \
                COALESCE(SUM(CASE WHEN m.status = 'failed' THEN 1 ELSE 0 END), 0) \
             FROM delivery_logs r JOIN messages m ON m.message_id = r.message_id \
             WHERE r.attempt_number = 0 AND r.error_message LIKE '%replayed%'",
            [],
            |row| {
                Ok(ReplayStats {
                    total_replays: row.get::<_, i64>(0)? as usize,
                    successful_replays: row.get::<_, i64>(1)? as usize,
                    failed_replays: row.get::<_, i64>(2)? as usize,
                })
            },
        )
        .map_err(|e| Error::Storage(format!("sqlite replay stats: {}", e)))
    }
}

/// Restamp an envelope at `now` and re-render its wire text.
fn refresh_timestamps(mut envelope: Envelope, now: DateTime<Utc>) -> Envelope {
    envelope.timestamp = now;
    envelope.expiration = now + Duration::hours(REFRESHED_TTL_HOURS);
    envelope.signature.timestamp = now;
    envelope.raw = envelope.to_xml();
    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::types::DeliveryStatus;
    use crate::protocol::{
        format_instant, AgentRef, AgentRole, EnvelopeBuilder, MessageBody, Priority, QueryKind, Tier,
    };

    fn conversation() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn envelope(correlation: &str, timestamp: DateTime<Utc>) -> Envelope {
        EnvelopeBuilder::from(AgentRef::new("api-specialist", AgentRole::Specialist, Tier::Sonnet))
            .to(AgentRef::new("eng-coordinator", AgentRole::Coordinator, Tier::Opus))
            .correlation_id(correlation)
            .priority(Priority::Normal)
            .timestamp(timestamp)
            .body(MessageBody::query(QueryKind::AskForHelp, "schema", Priority::Normal))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_message() {
        let store = MessageStore::in_memory().unwrap();
        let replay = MessageReplay::new(&store);

        assert!(matches!(replay.validate("missing"), Err(Error::NotFound(_))));
        let result = replay.replay("missing", &ReplayOptions::default()).unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Message not found"));
        assert!(result.validation.is_none());
    }

    #[test]
    fn test_replay_returns_message_to_pending() {
        let store = MessageStore::in_memory().unwrap();
        let env = envelope(&conversation(), Utc::now());
        store.save(&env, MessageStatus::Failed).unwrap();

        let result = MessageReplay::new(&store)
            .replay(&env.message_id, &ReplayOptions::default())
            .unwrap();
        assert!(result.success);
        assert!(result.validation.unwrap().valid);
        assert_eq!(result.envelope.unwrap().message_id, env.message_id);

        let stored = store.find_by_id(&env.message_id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        let logs = store.delivery_logs(&env.message_id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].attempt_number, 0);
        assert_eq!(logs[0].status, DeliveryStatus::Retry);
        assert_eq!(logs[0].error_message.as_deref(), Some(REPLAY_NOTE));
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let store = MessageStore::in_memory().unwrap();
        let env = envelope(&conversation(), Utc::now());
        store.save(&env, MessageStatus::Failed).unwrap();

        let options = ReplayOptions {
            dry_run: true,
            ..Default::default()
        };
        let result = MessageReplay::new(&store).replay(&env.message_id, &options).unwrap();
        assert!(result.success);
        assert!(result.envelope.is_none());
        assert_eq!(
            store.find_by_id(&env.message_id).unwrap().unwrap().status,
            MessageStatus::Failed
        );
        assert!(store.delivery_logs(&env.message_id).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_stored_message_is_not_replayed() {
        let store = MessageStore::in_memory().unwrap();
        let mut env = envelope(&conversation(), Utc::now());
        env.raw = env.raw.replace("<priority>normal</priority>", "<priority>urgent</priority>");
        store.save(&env, MessageStatus::Failed).unwrap();

        let result = MessageReplay::new(&store)
            .replay(&env.message_id, &ReplayOptions::default())
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Validation failed"));
        assert!(!result.validation.unwrap().valid);
        assert_eq!(
            store.find_by_id(&env.message_id).unwrap().unwrap().status,
            MessageStatus::Failed
        );
    }

    #[test]
    fn test_update_timestamps_persists_rewritten_envelope() {
        let store = MessageStore::in_memory().unwrap();
        let old = Utc::now() - Duration::days(2);
        let env = envelope(&conversation(), old);
        store.save(&env, MessageStatus::Expired).unwrap();

        let options = ReplayOptions {
            update_timestamps: true,
            ..Default::default()
        };
        let before = Utc::now();
        let result = MessageReplay::new(&store).replay(&env.message_id, &options).unwrap();
        assert!(result.success);

        let replayed = result.envelope.unwrap();
        assert!(replayed.timestamp >= before);
        assert_eq!(replayed.expiration - replayed.timestamp, Duration::hours(5));
        assert_eq!(replayed.signature.timestamp, replayed.timestamp);

        let stored = store.find_by_id(&env.message_id).unwrap().unwrap();
        assert_eq!(stored.raw_xml, replayed.raw);
        assert_eq!(format_instant(stored.timestamp), format_instant(replayed.timestamp));
        assert!(Envelope::parse(&stored.raw_xml).unwrap().expiration > Utc::now());
    }

    #[test]
    fn test_bulk_replay_and_stats() {
        let store = MessageStore::in_memory().unwrap();
        let conv = conversation();
        let first = envelope(&conv, Utc::now() - Duration::minutes(2));
        let second = envelope(&conv, Utc::now() - Duration::minutes(1));
        let other = envelope(&conversation(), Utc::now());
        store.save(&first, MessageStatus::Failed).unwrap();
        store.save(&second, MessageStatus::Delivered).unwrap();
        store.save(&other, MessageStatus::Failed).unwrap();
        let replay = MessageReplay::new(&store);

        let failed = replay.replay_failed(&ReplayOptions::default()).unwrap();
        let ids: Vec<&str> = failed.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec![first.message_id.as_str(), other.message_id.as_str()]);

        let conversation = replay
            .replay_conversation(&conv, &ReplayOptions::default())
            .unwrap();
        assert_eq!(conversation.len(), 2);
        assert!(conversation.iter().all(|r| r.success));

        store
            .log_delivery(&first.message_id, 1, DeliveryStatus::Success, None)
            .unwrap();
        store.update_status(&other.message_id, MessageStatus::Failed).unwrap();

        let stats = replay.replay_stats().unwrap();
        assert_eq!(stats.total_replays, 4);
        // both replays of `first` precede its success
        assert_eq!(stats.successful_replays, 2);
        assert_eq!(stats.failed_replays, 1);
    }

    #[test]
    fn test_storage_failure_stays_with_its_message() {
        let store = MessageStore::in_memory().unwrap();
        let broken = envelope(&conversation(), Utc::now() - Duration::minutes(1));
        let healthy = envelope(&conversation(), Utc::now());
        store.save(&broken, MessageStatus::Failed).unwrap();
        store.save(&healthy, MessageStatus::Failed).unwrap();
        store
            .conn()
            .unwrap()
            .execute_batch(&format!(
                "CREATE TRIGGER reject_log BEFORE INSERT ON delivery_logs \
                 WHEN NEW.message_id = '{}' BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                broken.message_id
            ))
            .unwrap();

        let options = ReplayOptions {
            update_timestamps: true,
            ..Default::default()
        };
        let results = MessageReplay::new(&store).replay_failed(&options).unwrap();
        assert_eq!(results.len(), 2);

        assert_eq!(results[0].message_id, broken.message_id);
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("disk full"));
        assert!(results[0].envelope.is_none());
        assert!(results[0].validation.as_ref().unwrap().valid);
        let stored = store.find_by_id(&broken.message_id).unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Failed);
        assert_eq!(stored.raw_xml, broken.raw);

        assert_eq!(results[1].message_id, healthy.message_id);
        assert!(results[1].success);
        assert_eq!(
            store.find_by_id(&healthy.message_id).unwrap().unwrap().status,
            MessageStatus::Pending
        );
    }
}
