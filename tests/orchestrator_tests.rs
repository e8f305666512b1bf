use std::{collections::HashSet, sync::Arc};

use anyhow::Result;
use crate::common::{
    BrokenStore, Outcome, ScriptedAdapter, fast_settings, orchestrator, orchestrator_with, request,
};
use delivery_service::{
    clients::{
        circuit_breaker::CircuitBreaker, dedup::DedupConfig, memory::MemoryStore,
        store::PreferenceStore,
    },
    models::{
        attempt::{AttemptStatus, FinalStatus},
        channel::Channel,
        circuit_breaker::CircuitBreakerConfig,
        request::Priority,
        status::LogStatus,
    },
    orchestrator::{
        DeliveryOrchestrator, REASON_ALL_OPTED_OUT, REASON_EVENT_OPTED_OUT,
        REASON_NO_CHANNEL_AVAILABLE, resolve_chain,
    },
};

fn channels(result: &delivery_service::models::attempt::DeliveryResult) -> Vec<Channel> {
    result.attempts.iter().map(|attempt| attempt.channel).collect()
}

/// Test: Chain rotates the preferred channel to the front
#[test]
fn test_chain_rotation() {
    let none = HashSet::new();

    assert_eq!(
        resolve_chain(Some(Channel::Whatsapp), &none),
        vec![Channel::Whatsapp, Channel::Sms, Channel::Push]
    );
    assert_eq!(
        resolve_chain(Some(Channel::Sms), &none),
        vec![Channel::Sms, Channel::Push, Channel::Whatsapp]
    );
    assert_eq!(resolve_chain(None, &none), Channel::DEFAULT_ORDER.to_vec());

    let opted_out: HashSet<Channel> = [Channel::Sms].into_iter().collect();
    assert_eq!(
        resolve_chain(Some(Channel::Sms), &opted_out),
        vec![Channel::Push, Channel::Whatsapp]
    );
}

/// Test: Unknown preferred channel strings fall back to the default order
#[test]
fn test_unknown_preferred_channel_uses_default_order() -> Result<()> {
    let request: delivery_service::models::request::NotificationRequest = serde_json::from_str(
        r#"{"user_id":"u1","template_code":"welcome","preferred_channel":"carrier_pigeon"}"#,
    )?;

    assert_eq!(request.preferred_channel, None);
    assert_eq!(
        resolve_chain(request.preferred_channel, &HashSet::new()),
        Channel::DEFAULT_ORDER.to_vec()
    );

    Ok(())
}

/// Test: First successful channel ends the chain
#[tokio::test]
async fn test_whatsapp_first_stops_on_success() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let whatsapp = ScriptedAdapter::always(Channel::Whatsapp, Outcome::Sent("w1"));
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Sent("s1"));
    let orchestrator = orchestrator(store.clone(), &[push.clone(), whatsapp.clone(), sms.clone()]);

    let result = orchestrator
        .deliver_notification(&request("u1", "welcome").with_channel(Channel::Whatsapp))
        .await;

    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(channels(&result), vec![Channel::Whatsapp]);
    assert_eq!(push.calls(), 0);
    assert_eq!(sms.calls(), 0);

    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Sent);
    assert_eq!(logs[0].channel, Some(Channel::Whatsapp));
    assert_eq!(logs[0].external_message_id.as_deref(), Some("w1"));
    assert!(logs[0].sent_at.is_some());
    assert_eq!(result.notification_log_id, Some(logs[0].id));

    Ok(())
}

/// Test: Failures fall through the rotated chain in order
#[tokio::test]
async fn test_fallback_order_after_failures() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let whatsapp = ScriptedAdapter::always(Channel::Whatsapp, Outcome::Fail("template rejected"));
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Fail("gateway 503"));
    let orchestrator = orchestrator(store.clone(), &[push.clone(), whatsapp.clone(), sms.clone()]);

    let result = orchestrator
        .deliver_notification(&request("u1", "welcome").with_channel(Channel::Whatsapp))
        .await;

    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(
        channels(&result),
        vec![Channel::Whatsapp, Channel::Whatsapp, Channel::Sms, Channel::Push]
    );
    assert_eq!(whatsapp.calls(), 2, "Chat template gets two tries");
    assert_eq!(sms.calls(), 1);

    let log = &store.logs()[0];
    assert_eq!(log.channel, Some(Channel::Push));
    assert_eq!(log.retry_count, 3);
    assert!(store.failed_notifications().is_empty());

    Ok(())
}

/// Test: Second chat-template try can succeed
#[tokio::test(start_paused = true)]
async fn test_whatsapp_retry_recovers() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let whatsapp = ScriptedAdapter::new(
        Channel::Whatsapp,
        vec![Outcome::Fail("timeout"), Outcome::Sent("w2")],
    );
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Sent("s1"));

    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let orchestrator = DeliveryOrchestrator::new(
        store.clone(),
        store.clone(),
        breaker.clone(),
        DedupConfig::default(),
        Default::default(),
    )
    .with_adapter(whatsapp.clone())
    .with_adapter(sms.clone());

    let result = orchestrator
        .deliver_notification(&request("u1", "welcome").with_channel(Channel::Whatsapp))
        .await;

    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(result.attempts.len(), 2);
    assert_eq!(result.attempts[0].status, AttemptStatus::Failed);
    assert_eq!(result.attempts[1].message_id, "w2");
    assert_eq!(sms.calls(), 0);
    assert!(
        !breaker.get_status().contains_key(&Channel::Whatsapp),
        "Success clears the failure"
    );

    Ok(())
}

/// Test: Hard opt-out of every channel short-circuits
#[tokio::test]
async fn test_all_channels_opted_out() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    for channel in Channel::DEFAULT_ORDER {
        store.set_channel_opt_out("u1", channel, true).await?;
    }

    let adapters = [
        ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1")),
        ScriptedAdapter::always(Channel::Whatsapp, Outcome::Sent("w1")),
        ScriptedAdapter::always(Channel::Sms, Outcome::Sent("s1")),
    ];
    let orchestrator = orchestrator(store.clone(), &adapters);

    let result = orchestrator.deliver_notification(&request("u1", "welcome")).await;

    assert_eq!(result.final_status, FinalStatus::Failed);
    assert!(result.attempts.is_empty());
    assert!(adapters.iter().all(|adapter| adapter.calls() == 0));

    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Skipped);
    assert_eq!(logs[0].failure_reason.as_deref(), Some(REASON_ALL_OPTED_OUT));
    assert!(store.failed_notifications().is_empty());

    Ok(())
}

/// Test: Hard opt-out removes a single channel from the chain
#[tokio::test]
async fn test_single_channel_opt_out() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set_channel_opt_out("u1", Channel::Push, true).await?;

    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let whatsapp = ScriptedAdapter::always(Channel::Whatsapp, Outcome::Sent("w1"));
    let orchestrator = orchestrator(store.clone(), &[push.clone(), whatsapp.clone()]);

    let result = orchestrator.deliver_notification(&request("u1", "welcome")).await;

    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(channels(&result), vec![Channel::Whatsapp]);
    assert_eq!(push.calls(), 0);

    Ok(())
}

/// Test: Every channel failing yields one failed record
#[tokio::test]
async fn test_total_exhaustion() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let push = ScriptedAdapter::always(Channel::Push, Outcome::Fail("fcm 500"));
    let whatsapp = ScriptedAdapter::always(Channel::Whatsapp, Outcome::Fail("meta 500"));
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Fail("gateway 502"));
    let orchestrator = orchestrator(store.clone(), &[push.clone(), whatsapp.clone(), sms.clone()]);

    let result = orchestrator
        .deliver_notification(
            &request("u1", "payout")
                .with_context("amount", "120")
                .with_service_instance("svc-9"),
        )
        .await;

    assert_eq!(result.final_status, FinalStatus::Failed);
    assert_eq!(result.attempts.len(), 4);
    assert_eq!(push.calls() + whatsapp.calls() + sms.calls(), 4);

    let failed = store.failed_notifications();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 4);
    assert_eq!(failed[0].channel, Some(Channel::Sms));
    assert_eq!(failed[0].failure_reason, "provider rejected the request: gateway 502");
    assert_eq!(failed[0].context_data.get("amount").map(String::as_str), Some("120"));
    assert_eq!(failed[0].service_instance_id.as_deref(), Some("svc-9"));

    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failed);
    assert_eq!(logs[0].retry_count, 4);
    assert!(logs[0].failed_at.is_some());
    assert_eq!(failed[0].notification_log_id, Some(logs[0].id));

    Ok(())
}

/// Test: Missing recipient data moves on without touching the breaker
#[tokio::test]
async fn test_missing_recipient_skips_channel() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let push = ScriptedAdapter::always(Channel::Push, Outcome::NoRecipient);
    let whatsapp = ScriptedAdapter::always(Channel::Whatsapp, Outcome::NoRecipient);
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Sent("s1"));
    let orchestrator = orchestrator_with(
        store.clone(),
        breaker.clone(),
        &[push.clone(), whatsapp.clone(), sms.clone()],
    );

    let result = orchestrator.deliver_notification(&request("u1", "welcome")).await;

    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(result.attempts[0].status, AttemptStatus::NoTokens);
    assert_eq!(result.attempts[1].status, AttemptStatus::NoPhone);
    assert_eq!(whatsapp.calls(), 1, "No retry without a phone number");
    assert!(breaker.get_status().is_empty());
    assert_eq!(store.logs()[0].retry_count, 0);

    Ok(())
}

/// Test: Open breaker skips its channel without recording an attempt
#[tokio::test]
async fn test_open_breaker_skips_channel() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    for _ in 0..5 {
        breaker.record_failure(Channel::Push);
    }

    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let whatsapp = ScriptedAdapter::always(Channel::Whatsapp, Outcome::Sent("w1"));
    let orchestrator = orchestrator_with(store.clone(), breaker, &[push.clone(), whatsapp.clone()]);

    let result = orchestrator.deliver_notification(&request("u1", "welcome")).await;

    assert_eq!(channels(&result), vec![Channel::Whatsapp]);
    assert_eq!(push.calls(), 0);

    Ok(())
}

/// Test: Every breaker open is a logged failure
#[tokio::test]
async fn test_all_breakers_open() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    for channel in Channel::DEFAULT_ORDER {
        for _ in 0..5 {
            breaker.record_failure(channel);
        }
    }

    let adapters = [
        ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1")),
        ScriptedAdapter::always(Channel::Whatsapp, Outcome::Sent("w1")),
        ScriptedAdapter::always(Channel::Sms, Outcome::Sent("s1")),
    ];
    let orchestrator = orchestrator_with(store.clone(), breaker, &adapters);

    let result = orchestrator.deliver_notification(&request("u1", "welcome")).await;

    assert_eq!(result.final_status, FinalStatus::Failed);
    assert!(result.attempts.is_empty());

    let failed = store.failed_notifications();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure_reason, REASON_NO_CHANNEL_AVAILABLE);
    assert_eq!(failed[0].retry_count, 0);
    assert_eq!(store.logs()[0].channel, None);

    Ok(())
}

/// Test: Five chain failures open the channel breaker
#[tokio::test]
async fn test_repeated_failures_open_breaker() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Fail("gateway 503"));
    let orchestrator = orchestrator_with(store.clone(), breaker.clone(), &[sms.clone()]);

    for i in 0..6 {
        let notification = request("u1", "welcome")
            .with_channel(Channel::Sms)
            .with_context("n", i.to_string());
        orchestrator.deliver_notification(&notification).await;
    }

    assert_eq!(sms.calls(), 5, "Sixth request is short-circuited");
    assert!(breaker.get_status()[&Channel::Sms].is_open);

    Ok(())
}

/// Test: Category opt-out is honoured for normal events
#[tokio::test]
async fn test_category_opt_out_per_channel() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set_category("u1", "marketing", Channel::Push, false);

    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let whatsapp = ScriptedAdapter::always(Channel::Whatsapp, Outcome::Sent("w1"));
    let orchestrator = orchestrator(store.clone(), &[push.clone(), whatsapp.clone()]);

    let result = orchestrator
        .deliver_notification(&request("u1", "spring_sale").with_event_type("promotion"))
        .await;

    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(result.attempts[0].status, AttemptStatus::OptedOut);
    assert_eq!(result.attempts[1].channel, Channel::Whatsapp);
    assert_eq!(push.calls(), 0);
    assert_eq!(store.logs()[0].retry_count, 0);

    Ok(())
}

/// Test: Category opt-out of every channel is a skipped failure
#[tokio::test]
async fn test_category_opt_out_everywhere() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    for channel in Channel::DEFAULT_ORDER {
        store.set_category("u1", "marketing", channel, false);
    }

    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let orchestrator = orchestrator(store.clone(), &[push.clone()]);

    let result = orchestrator
        .deliver_notification(&request("u1", "spring_sale").with_event_type("promotion"))
        .await;

    assert_eq!(result.final_status, FinalStatus::Failed);
    assert_eq!(result.attempts.len(), 3);
    assert_eq!(push.calls(), 0);

    let logs = store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Skipped);
    assert_eq!(logs[0].failure_reason.as_deref(), Some(REASON_EVENT_OPTED_OUT));
    assert!(store.failed_notifications().is_empty());

    Ok(())
}

/// Test: Critical events ignore category opt-outs but not hard opt-outs
#[tokio::test]
async fn test_critical_event_bypasses_category() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.set_category("u1", "payment_updates", Channel::Push, false);

    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Sent("s1"));
    let orchestrator = orchestrator(store.clone(), &[push.clone(), sms.clone()]);

    let result = orchestrator
        .deliver_notification(&request("u1", "paid").with_event_type("payment_confirmation"))
        .await;
    assert_eq!(channels(&result), vec![Channel::Push]);

    store.set_channel_opt_out("u2", Channel::Push, true).await?;
    let result = orchestrator
        .deliver_notification(&request("u2", "paid").with_event_type("payment_confirmation"))
        .await;
    assert_eq!(push.calls(), 1);
    assert_eq!(channels(&result), vec![Channel::Sms]);

    Ok(())
}

/// Test: OTP over SMS scenario
#[tokio::test]
async fn test_otp_sms_scenario() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Sent("m1"));
    let orchestrator = orchestrator(store.clone(), &[sms.clone()]);

    let otp = request("u1", "otp")
        .with_channel(Channel::Sms)
        .with_context("_phone", "+911234567890")
        .with_context("code", "482913")
        .with_priority(Priority::High);

    let result = orchestrator.deliver_notification(&otp).await;

    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].channel, Channel::Sms);
    assert_eq!(result.attempts[0].status, AttemptStatus::Sent);
    assert_eq!(result.attempts[0].message_id, "m1");

    let sent = sms.messages();
    assert_eq!(sent[0].template_name.as_deref(), Some("otp"));
    assert_eq!(sent[0].template_params(), vec![("code", "482913")]);
    assert_eq!(sent[0].hint("_phone"), Some("+911234567890"));

    Ok(())
}

/// Test: Persistence failures never change the delivery outcome
#[tokio::test]
async fn test_persistence_failure_is_swallowed() -> Result<()> {
    let prefs = Arc::new(MemoryStore::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Fail("down"));

    let delivering = DeliveryOrchestrator::new(
        Arc::new(BrokenStore),
        prefs.clone(),
        breaker.clone(),
        DedupConfig::default(),
        fast_settings(),
    )
    .with_adapter(push.clone());

    let result = delivering.deliver_notification(&request("u1", "welcome")).await;
    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert_eq!(result.notification_log_id, None);

    let failing = DeliveryOrchestrator::new(
        Arc::new(BrokenStore),
        prefs,
        breaker,
        DedupConfig::default(),
        fast_settings(),
    )
    .with_adapter(sms);

    let result = failing
        .deliver_notification(&request("u1", "welcome").with_channel(Channel::Sms))
        .await;
    assert_eq!(result.final_status, FinalStatus::Failed);
    assert_eq!(result.attempts.len(), 1);

    Ok(())
}

/// Test: Title and body hints shape the outbound message
#[tokio::test]
async fn test_outbound_message_uses_hints() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let push = ScriptedAdapter::always(Channel::Push, Outcome::Sent("p1"));
    let orchestrator = orchestrator(store, &[push.clone()]);

    orchestrator
        .deliver_notification(
            &request("u1", "order_shipped")
                .with_context("_title", "Your order shipped")
                .with_context("_body", "Arrives Friday")
                .with_context("order", "A-7"),
        )
        .await;

    let sent = &push.messages()[0];
    assert_eq!(sent.subject, "Your order shipped");
    assert_eq!(sent.body, "Arrives Friday");
    assert_eq!(sent.template_params(), vec![("order", "A-7")]);

    Ok(())
}

/// Test: A failed half-open trial on WhatsApp is not retried
#[tokio::test(start_paused = true)]
async fn test_half_open_whatsapp_gets_one_send() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default()));
    for _ in 0..5 {
        breaker.record_failure(Channel::Whatsapp);
    }
    tokio::time::advance(std::time::Duration::from_secs(61)).await;

    let whatsapp = ScriptedAdapter::always(Channel::Whatsapp, Outcome::Fail("template paused"));
    let sms = ScriptedAdapter::always(Channel::Sms, Outcome::Sent("s1"));
    let orchestrator = orchestrator_with(store, breaker.clone(), &[whatsapp.clone(), sms.clone()]);

    let result = orchestrator
        .deliver_notification(&request("u1", "welcome").with_channel(Channel::Whatsapp))
        .await;

    assert_eq!(whatsapp.calls(), 1);
    assert_eq!(channels(&result), vec![Channel::Whatsapp, Channel::Sms]);
    assert_eq!(result.final_status, FinalStatus::Delivered);
    assert!(!breaker.is_available(Channel::Whatsapp));

    Ok(())
}
