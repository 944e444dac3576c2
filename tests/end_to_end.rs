//! Full message lifecycle through the public API.

use std::fs;
use std::path::Path;

use chrono::Duration;
use orchestra_relay::audit::{AuditEventType, MessageReplay, MessageStatus, MessageStore};
use orchestra_relay::config::Settings;
use orchestra_relay::protocol::{
    AgentRef, AgentRole, Envelope, EnvelopeBuilder, MessageBody, Priority, QueryKind, TaskStatus,
    Tier,
};
use orchestra_relay::routing::registry::role_allows;
use orchestra_relay::routing::{AgentRegistry, MessageQueue};
use orchestra_relay::validation::{BusinessRulesValidator, EnvelopeValidator, SchemaValidator};
use orchestra_relay::{Relay, SubmitOutcome};
use tempfile::TempDir;

fn specialist() -> AgentRef {
    AgentRef::new("api-specialist", AgentRole::Specialist, Tier::Sonnet)
}

fn coordinator() -> AgentRef {
    AgentRef::new("engineering-coordinator", AgentRole::Coordinator, Tier::Opus)
}

fn status_update(priority: Priority) -> Envelope {
    EnvelopeBuilder::from(specialist())
        .to(coordinator())
        .priority(priority)
        .body(MessageBody::status_update("task-7", TaskStatus::InProgress, 50, "writing handlers"))
        .build()
        .unwrap()
}

fn write_agent(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn critical_message_is_validated_dispatched_first_and_stored() {
    let env = EnvelopeBuilder::from(specialist())
        .to(coordinator())
        .priority(Priority::Critical)
        .ttl(Duration::minutes(30))
        .body(MessageBody::query(QueryKind::AskForHelp, "production outage", Priority::Critical))
        .build()
        .unwrap();
    assert!(env.retry_policy.is_none());

    let schema = SchemaValidator::new().validate(&env.raw);
    assert!(schema.valid, "{:?}", schema.errors);
    assert!(schema.errors.is_empty());

    let parsed = Envelope::parse(&env.raw).unwrap();
    let violations = BusinessRulesValidator::new().validate_at(&parsed, parsed.timestamp);
    assert!(violations.is_empty(), "{:?}", violations);

    let mut queue = MessageQueue::new();
    for priority in [Priority::Low, Priority::Normal, Priority::High] {
        queue.enqueue(status_update(priority));
    }
    queue.enqueue(parsed.clone());
    assert_eq!(queue.dequeue().unwrap().message_id, env.message_id);
    assert_eq!(queue.dequeue().unwrap().priority, Priority::High);

    let store = MessageStore::in_memory().unwrap();
    store.save(&parsed, MessageStatus::Pending).unwrap();
    let stored = store.find_by_id(&env.message_id).unwrap().unwrap();
    assert_eq!(stored.correlation_id, env.correlation_id);
    assert_eq!(stored.status, MessageStatus::Pending);
}

#[test]
fn stored_message_revalidates_like_its_raw_envelope() {
    let store = MessageStore::in_memory().unwrap();
    let valid = status_update(Priority::Normal);
    let mut broken = status_update(Priority::Normal);
    broken.raw = broken.raw.replace("<tier>opus</tier>", "<tier>gpt</tier>");
    store.save(&valid, MessageStatus::Delivered).unwrap();
    store.save(&broken, MessageStatus::Failed).unwrap();

    let validator = EnvelopeValidator::new();
    let replay = MessageReplay::new(&store);
    for env in [&valid, &broken] {
        let direct = validator.validate(&env.raw).is_valid();
        let stored = replay.validate(&env.message_id).unwrap().is_valid();
        assert_eq!(direct, stored);
    }
    assert!(!validator.validate(&broken.raw).is_valid());
}

#[test]
fn relay_routes_retries_and_audits_a_conversation() {
    let home = TempDir::new().unwrap();
    let mut settings = Settings::with_home(home.path());
    settings.routing.enforce_registry = true;
    write_agent(
        &settings.agents_dir,
        "engineering/engineering-coordinator.md",
        "# Engineering Coordinator\n\nCoordinates the team.\ntier: opus\n",
    );
    write_agent(
        &settings.agents_dir,
        "engineering/api-specialist.md",
        "# API Specialist\n\nSpecialist in REST design.\ntier: sonnet\n",
    );

    let relay = Relay::open(&settings).unwrap();
    assert_eq!(relay.registry().unwrap().len(), 2);

    let env = status_update(Priority::High);
    let SubmitOutcome::Queued { message_id, .. } = relay.submit(&env.raw).unwrap() else {
        panic!("expected the message to be queued");
    };
    assert_eq!(message_id, env.message_id);

    let stranger = EnvelopeBuilder::from(AgentRef::new("ghost", AgentRole::Specialist, Tier::Haiku))
        .to(coordinator())
        .body(MessageBody::query(QueryKind::GetStatus, "anything", Priority::Normal))
        .build()
        .unwrap();
    assert!(!relay.submit(&stranger.raw).unwrap().is_queued());

    let delivering = relay.next_delivery().unwrap().unwrap();
    relay.record_failure(&delivering, "recipient busy").unwrap();
    assert_eq!(
        relay.store().find_by_id(&message_id).unwrap().unwrap().status,
        MessageStatus::Failed
    );

    let results = relay.replay_failed(&Default::default()).unwrap();
    assert!(results.iter().all(|r| r.success));
    let redelivered = relay.next_delivery().unwrap().unwrap();
    relay.record_success(&redelivered.message_id).unwrap();

    let stored = relay.store().find_by_id(&message_id).unwrap().unwrap();
    assert_eq!(stored.status, MessageStatus::Delivered);

    let trail: Vec<AuditEventType> = relay
        .audit()
        .trail(&message_id)
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        trail,
        vec![
            AuditEventType::MessageReceived,
            AuditEventType::ValidationPassed,
            AuditEventType::MessageQueued,
            AuditEventType::DeliveryAttempted,
            AuditEventType::DeliveryFailed,
            AuditEventType::MessageReplayed,
            AuditEventType::DeliveryAttempted,
            AuditEventType::DeliverySuccess,
        ]
    );

    let integrity = relay.audit().verify_integrity_batch(None).unwrap();
    assert_eq!(integrity.failed, 0);
    assert!(integrity.total >= trail.len());
}

#[test]
fn registry_roles_partition_the_registered_set() {
    let dir = TempDir::new().unwrap();
    write_agent(dir.path(), "ops/ops-coordinator.md", "# Ops Coordinator\n\nCoordinates ops.\n");
    write_agent(dir.path(), "ops/infra-specialist.md", "# Infra Specialist\n\nSpecialist.\n");
    write_agent(dir.path(), "leadership/cto.md", "# CTO\n\nThe orchestrator.\n");
    let registry = AgentRegistry::load(dir.path()).unwrap();

    let mut names: Vec<String> = AgentRole::ALL
        .iter()
        .flat_map(|role| registry.find_by_role(*role))
        .map(|agent| agent.name.clone())
        .collect();
    names.sort();
    let mut all: Vec<String> = registry.all().iter().map(|a| a.name.clone()).collect();
    all.sort();
    assert_eq!(names, all);

    for sender in registry.all() {
        for recipient in registry.all() {
            assert_eq!(
                registry.can_route(&sender.name, &recipient.name),
                role_allows(sender.role, recipient.role)
            );
        }
    }
    assert!(!registry.can_route("ops-coordinator", "cto"));
    assert!(!registry.can_route("ghost", "cto"));
}
