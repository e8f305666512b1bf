use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use crate::common::{Outcome, ScriptedAdapter, context, orchestrator, request};
use delivery_service::{
    clients::{
        dedup::{
            DedupConfig, DedupEngine, DuplicateCheck, NotificationKey, hash_context_data,
            hash_notification,
        },
        memory::MemoryStore,
        store::NotificationStore,
    },
    models::{
        attempt::FinalStatus, channel::Channel, log::CreateNotificationLog, status::LogStatus,
    },
    orchestrator::{REASON_DUPLICATE, REASON_WEBHOOK_DUPLICATE},
};

async fn seed_log(
    store: &MemoryStore,
    user_id: &str,
    template_code: &str,
    status: LogStatus,
    hash: &str,
    age: Duration,
) -> Result<()> {
    let created_at = Utc::now() - age;
    let log = CreateNotificationLog::new(
        user_id.to_string(),
        template_code.to_string(),
        Some(Channel::Sms),
        status,
        hash.to_string(),
    )
    .with_timestamps(created_at, Some(created_at), None);

    store.insert_log(log).await?;
    Ok(())
}

fn check<'a>(hash: &'a str, event_type: Option<&'a str>) -> DuplicateCheck<'a> {
    DuplicateCheck {
        user_id: "u1",
        template_code: "otp",
        service_instance_id: None,
        context_data_hash: hash,
        event_type,
    }
}

/// Test: Context hashing ignores key order
#[test]
fn test_context_hash_is_order_independent() {
    let forward = context(&[("a", "1"), ("b", "2")]);
    let mut reversed = std::collections::HashMap::new();
    reversed.insert("b".to_string(), "2".to_string());
    reversed.insert("a".to_string(), "1".to_string());

    assert_eq!(hash_context_data(&forward), hash_context_data(&reversed));
    assert_eq!(hash_context_data(&forward).len(), 16);
    assert_ne!(
        hash_context_data(&forward),
        hash_context_data(&context(&[("a", "1"), ("b", "3")]))
    );
}

/// Test: Notification hash changes with user, channel and correlation id
#[test]
fn test_notification_hash_is_identity_scoped() {
    let data = context(&[("code", "482913")]);
    let base = NotificationKey {
        user_id: "u1",
        template_code: "otp",
        channel: Channel::Sms,
        service_instance_id: Some("svc-1"),
        context_data: &data,
    };
    let digest = hash_notification(&base);
    assert_eq!(digest.len(), 32);

    let other_user = NotificationKey {
        user_id: "u2",
        ..base
    };
    let other_channel = NotificationKey {
        channel: Channel::Push,
        ..base
    };
    let other_instance = NotificationKey {
        service_instance_id: Some("svc-2"),
        ..base
    };

    assert_ne!(digest, hash_notification(&other_user));
    assert_ne!(digest, hash_notification(&other_channel));
    assert_ne!(digest, hash_notification(&other_instance));
    assert_eq!(digest, hash_notification(&base));
}

/// Test: Critical events use the one-minute window
#[tokio::test]
async fn test_critical_window_boundaries() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let engine = DedupEngine::new(store.clone(), DedupConfig::default());
    let hash = hash_context_data(&context(&[("code", "1")]));

    seed_log(&store, "u1", "otp", LogStatus::Sent, &hash, Duration::seconds(30)).await?;
    assert!(engine.is_duplicate(&check(&hash, Some("otp"))).await?);

    let stale_store = Arc::new(MemoryStore::new());
    let stale_engine = DedupEngine::new(stale_store.clone(), DedupConfig::default());
    seed_log(&stale_store, "u1", "otp", LogStatus::Sent, &hash, Duration::seconds(61)).await?;
    assert!(!stale_engine.is_duplicate(&check(&hash, Some("otp"))).await?);

    Ok(())
}

/// Test: Non-critical events use the five-minute window
#[tokio::test]
async fn test_default_window_boundaries() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let engine = DedupEngine::new(store.clone(), DedupConfig::default());
    let hash = hash_context_data(&context(&[("order", "42")]));

    seed_log(&store, "u1", "otp", LogStatus::Delivered, &hash, Duration::seconds(120)).await?;
    assert!(engine.is_duplicate(&check(&hash, Some("service_update"))).await?);
    assert!(engine.is_duplicate(&check(&hash, None)).await?);
    assert!(
        !engine.is_duplicate(&check(&hash, Some("otp"))).await?,
        "Two minutes is outside the critical window"
    );

    assert_eq!(engine.window_for(Some("promotion")), Duration::minutes(5));
    assert_eq!(engine.window_for(Some("receipt_delivery")), Duration::minutes(1));

    Ok(())
}

/// Test: Only successful rows count as prior deliveries
#[tokio::test]
async fn test_failed_and_skipped_rows_do_not_suppress() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let engine = DedupEngine::new(store.clone(), DedupConfig::default());
    let hash = hash_context_data(&context(&[("code", "1")]));

    seed_log(&store, "u1", "otp", LogStatus::Failed, &hash, Duration::seconds(5)).await?;
    seed_log(&store, "u1", "otp", LogStatus::Skipped, &hash, Duration::seconds(5)).await?;

    assert!(!engine.is_duplicate(&check(&hash, None)).await?);

    seed_log(&store, "u1", "otp", LogStatus::Read, &hash, Duration::seconds(5)).await?;
    assert!(engine.is_duplicate(&check(&hash, None)).await?);

    Ok(())
}

/// Test: Second identical OTP within a minute is suppressed end to end
#[tokio::test]
async fn test_repeat_delivery_is_skipped() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Sent("m1"));
    let orchestrator = orchestrator(store.clone(), &[sms.clone()]);

    let otp = request("u1", "otp")
        .with_channel(Channel::Sms)
        .with_event_type("otp")
        .with_context("code", "482913");

    let first = orchestrator.deliver_notification(&otp).await;
    assert_eq!(first.final_status, FinalStatus::Delivered);

    let second = orchestrator.deliver_notification(&otp).await;
    assert_eq!(second.final_status, FinalStatus::Skipped);
    assert!(second.attempts.is_empty());
    assert_eq!(sms.calls(), 1);

    let skipped: Vec<_> = store
        .logs()
        .into_iter()
        .filter(|log| log.status == LogStatus::Skipped)
        .collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].failure_reason.as_deref(), Some(REASON_DUPLICATE));

    Ok(())
}

/// Test: Different context data is not a duplicate
#[tokio::test]
async fn test_changed_context_is_delivered() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Sent("m1"));
    let orchestrator = orchestrator(store.clone(), &[sms.clone()]);

    let base = request("u1", "otp").with_channel(Channel::Sms).with_event_type("otp");

    orchestrator
        .deliver_notification(&base.clone().with_context("code", "111111"))
        .await;
    let result = orchestrator
        .deliver_notification(&base.with_context("code", "222222"))
        .await;

    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(sms.calls(), 2);

    Ok(())
}

/// Test: Webhook-triggered sends are suppressed by a previously seen key
#[tokio::test]
async fn test_webhook_key_suppresses_resend() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let orchestrator = orchestrator(store.clone(), &[push.clone()]);

    let mut webhook = request("u1", "receipt").with_context("receipt", "r-1");
    webhook.idempotency_key = Some("wh-evt-77".to_string());

    assert_eq!(
        orchestrator.deliver_notification(&webhook).await.final_status,
        FinalStatus::Delivered
    );

    // Context differs so only the webhook key can match.
    let replay = webhook.with_context("retry", "1");
    let result = orchestrator.deliver_notification(&replay).await;

    assert_eq!(result.final_status, FinalStatus::Skipped);
    assert_eq!(push.calls(), 1);
    assert!(
        store
            .logs()
            .iter()
            .any(|log| log.failure_reason.as_deref() == Some(REASON_WEBHOOK_DUPLICATE))
    );

    Ok(())
}

/// Test: A webhook key whose first send failed does not block the replay
#[tokio::test]
async fn test_webhook_key_replay_after_failure() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let push = ScriptedAdapter::new(Channel::Push, vec![Outcome::Fail("fcm 503"), Outcome::Sent("p2")]);
    let orchestrator = orchestrator(store.clone(), &[push.clone()]);

    let mut webhook = request("u1", "receipt").with_context("receipt", "r-2");
    webhook.idempotency_key = Some("wh-evt-88".to_string());

    let first = orchestrator.deliver_notification(&webhook).await;
    assert_eq!(first.final_status, FinalStatus::Failed);

    let replay = orchestrator.deliver_notification(&webhook).await;
    assert_eq!(replay.final_status, FinalStatus::Delivered);
    assert_eq!(push.calls(), 2);

    let third = orchestrator.deliver_notification(&webhook).await;
    assert_eq!(third.final_status, FinalStatus::Skipped);
    assert_eq!(push.calls(), 2);

    Ok(())
}
