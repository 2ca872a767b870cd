//! End-to-end scenarios from the design doc (S1-S6), driven directly
//! against the engines with a `FakeClock` so no scenario needs a real
//! sleep longer than a few milliseconds.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use he_security_core::{
    AuditConfig, BruteForceConfig, BruteForceEngine, CsrfConfig, CsrfStore, DDoSConfig, DDoSEngine,
};
use he_security_core::{AuditSink, FakeClock};

fn clock_and_audit() -> (FakeClock, Arc<AuditSink>) {
    (FakeClock::new(), Arc::new(AuditSink::new(AuditConfig::default())))
}

/// S1: 5 failed login POSTs for "alice" from one IP are each allowed (the
/// deterrence is the 6th call); the 6th returns blocked with a message
/// containing "Too many failed attempts". After 30 minutes the next
/// attempt is admitted again.
#[tokio::test]
async fn s1_brute_force_blocks_then_recovers_after_window() {
    let (clock, audit) = clock_and_audit();
    let engine = BruteForceEngine::new(BruteForceConfig::default(), Arc::new(clock.clone()), audit);
    let ip: IpAddr = "203.0.113.1".parse().unwrap();

    for _ in 0..5 {
        assert!(engine.check_attempt(ip, "alice").await.allowed);
        engine.record_failure(ip, "alice").await;
    }

    let decision = engine.check_attempt(ip, "alice").await;
    assert!(!decision.allowed);
    assert!(decision.reason.unwrap().contains("Too many failed attempts"));

    clock.advance(Duration::from_secs(30 * 60));
    assert!(engine.check_attempt(ip, "alice").await.allowed);
}

/// S2: 101 GETs within one second from one IP; the 101st is rejected with
/// requestsLastSecond at 100; after the window rolls over one more GET is
/// admitted.
#[tokio::test]
async fn s2_per_second_limit_rejects_101st_request() {
    let (clock, audit) = clock_and_audit();
    let engine = Arc::new(DDoSEngine::new(DDoSConfig::default(), Arc::new(clock.clone()), audit));
    let ip: IpAddr = "198.51.100.7".parse().unwrap();

    let mut slots = Vec::new();
    for _ in 0..100 {
        slots.push(engine.check_request(ip).await.expect("first 100 admitted"));
    }

    let rejection = engine.check_request(ip).await.unwrap_err();
    assert!(matches!(
        rejection,
        he_security_core::DdosRejection::RateLimitExceeded { window: "second" }
    ));

    drop(slots);
    clock.advance(Duration::from_secs(1));
    assert!(engine.check_request(ip).await.is_ok());
}

/// S3: 500 GETs in one second trips the suspicious threshold and
/// auto-bans; a request one (simulated) minute later still sees "IP
/// blocked" because the default block duration is 15 minutes.
#[tokio::test]
async fn s3_suspicious_threshold_auto_bans_ip() {
    let (clock, audit) = clock_and_audit();
    let config = DDoSConfig {
        suspicious_threshold: 500,
        enable_ip_blocking: true,
        max_requests_per_second: 10_000,
        ..DDoSConfig::default()
    };
    let engine = Arc::new(DDoSEngine::new(config, Arc::new(clock.clone()), audit));
    let ip: IpAddr = "198.51.100.8".parse().unwrap();

    let mut hit_ban = false;
    for _ in 0..600 {
        if engine.check_request(ip).await.is_err() {
            hit_ban = true;
        }
    }
    assert!(hit_ban);

    clock.advance(Duration::from_secs(60));
    let rejection = engine.check_request(ip).await.unwrap_err();
    assert!(matches!(rejection, he_security_core::DdosRejection::IpBlocked { .. }));
}

/// S4: a token issued in the cookie and header validates once; a
/// mismatched header value fails; with one-time-use semantics a repeat
/// submission of the same token fails too.
#[tokio::test]
async fn s4_double_submit_validates_once() {
    let (clock, audit) = clock_and_audit();
    let store = Arc::new(CsrfStore::new(
        CsrfConfig {
            require_token_refresh: true,
            ..CsrfConfig::default()
        },
        Arc::new(clock),
        audit,
    ));
    let ip: IpAddr = "203.0.113.20".parse().unwrap();
    let token = store.generate(ip, "agent/1.0").await.unwrap();

    assert!(store.check_double_submit(&token, &token, ip, "agent/1.0").await);

    let other_token = store.generate(ip, "agent/1.0").await.unwrap();
    assert!(!store.check_double_submit(&token, &other_token, ip, "agent/1.0").await);

    store.mark_used(&token).await;
    assert!(!store.check_double_submit(&token, &token, ip, "agent/1.0").await);
}

/// S5: a whitelisted username never becomes blocked no matter how many
/// failures accumulate against it.
#[tokio::test]
async fn s5_whitelisted_username_is_never_blocked() {
    let (clock, audit) = clock_and_audit();
    let config = BruteForceConfig {
        whitelisted_usernames: vec!["admin".to_string()],
        max_failed_attempts: 3,
        ..BruteForceConfig::default()
    };
    let engine = BruteForceEngine::new(config, Arc::new(clock), audit);
    let ip: IpAddr = "203.0.113.21".parse().unwrap();

    for _ in 0..100 {
        engine.record_failure(ip, "admin").await;
    }

    assert!(engine.check_attempt(ip, "admin").await.allowed);
}

/// S6: emitting 10,001 events with a 10,000 cap leaves exactly 10,000;
/// `by_ip` returns the newest matches first.
#[tokio::test]
async fn s6_audit_ring_caps_and_orders_by_ip() {
    let sink = AuditSink::new(AuditConfig { max_events: 10_000 });

    for i in 0..10_001 {
        let ip = if i % 7 == 0 { "9.9.9.9" } else { "1.1.1.1" };
        sink.emit(
            he_security_core::EventType::Other("load".into()),
            ip,
            format!("event-{i}"),
        )
        .await;
    }

    assert_eq!(sink.len().await, 10_000);

    let by_ip = sink.by_ip("9.9.9.9", 3).await;
    assert_eq!(by_ip.len(), 3);
    for pair in by_ip.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp);
    }
}
