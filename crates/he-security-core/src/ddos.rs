//! Per-IP sliding-window rate limiter, concurrency cap, and auto-ban.
//!
//! State lives in a sharded `DashMap` keyed by IP (the teacher's
//! `ddos::DDoSProtection` pattern), so a janitor sweep of one shard never
//! blocks a request landing in another. Lock order when a request touches
//! more than one piece of global state: whitelist -> blocked_ips ->
//! per-IP record -> total_concurrent.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::audit::{AuditSink, EventType};
use crate::clock::SecurityClock;
use crate::config::DDoSConfig;
use crate::janitor::Janitor;

#[derive(Debug, Clone)]
pub struct DDoSRecord {
    pub requests_last_second: u32,
    pub requests_last_minute: u32,
    pub requests_last_hour: u32,
    pub window_start_sec: Instant,
    pub window_start_min: Instant,
    pub window_start_hr: Instant,
    pub concurrent_requests: u32,
    pub blocked: bool,
    pub block_expiry: Option<Instant>,
    pub failed_attempts: u32,
    pub suspicious_flag: bool,
    pub first_request: Instant,
    pub last_request: Instant,
}

impl DDoSRecord {
    fn new(now: Instant) -> Self {
        Self {
            requests_last_second: 0,
            requests_last_minute: 0,
            requests_last_hour: 0,
            window_start_sec: now,
            window_start_min: now,
            window_start_hr: now,
            concurrent_requests: 0,
            blocked: false,
            block_expiry: None,
            failed_attempts: 0,
            suspicious_flag: false,
            first_request: now,
            last_request: now,
        }
    }
}

/// Why `check_request` rejected an IP. `message`/`retry_after` feed the
/// orchestrator's 429 body directly.
#[derive(Debug, Clone)]
pub enum DdosRejection {
    IpBlocked { retry_after: Duration },
    ServerAtCapacity,
    RateLimitedAutoBanned { retry_after: Duration },
    RateLimitExceeded { window: &'static str },
    TooManyConcurrent,
}

impl DdosRejection {
    pub fn message(&self) -> String {
        match self {
            DdosRejection::IpBlocked { .. } => "IP blocked".to_string(),
            DdosRejection::ServerAtCapacity => "server at capacity".to_string(),
            DdosRejection::RateLimitedAutoBanned { .. } => "rate limit — IP blocked".to_string(),
            DdosRejection::RateLimitExceeded { window } => {
                format!("rate limit exceeded (per {window})")
            }
            DdosRejection::TooManyConcurrent => "too many concurrent".to_string(),
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DdosRejection::IpBlocked { retry_after } => Some(*retry_after),
            DdosRejection::RateLimitedAutoBanned { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// RAII guard returned by an admitted `check_request`. Dropping it — on
/// normal return, early `?`, or an unwinding panic in the handler — is the
/// only way a concurrency slot is released, so `release_request` runs
/// exactly once per admission no matter how the request exits.
pub struct ConcurrencySlot {
    engine: Option<Arc<DDoSEngine>>,
    ip: IpAddr,
}

impl ConcurrencySlot {
    fn tracked(engine: Arc<DDoSEngine>, ip: IpAddr) -> Self {
        Self {
            engine: Some(engine),
            ip,
        }
    }

    fn untracked(ip: IpAddr) -> Self {
        Self { engine: None, ip }
    }
}

impl Drop for ConcurrencySlot {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            engine.release_request(self.ip);
        }
    }
}

pub struct DDoSEngine {
    config: DDoSConfig,
    clock: Arc<dyn SecurityClock>,
    audit: Arc<AuditSink>,
    whitelist: Arc<RwLock<HashSet<IpAddr>>>,
    blocked_ips: Arc<RwLock<HashMap<IpAddr, Instant>>>,
    records: Arc<DashMap<IpAddr, DDoSRecord>>,
    total_concurrent: Arc<AtomicU32>,
}

impl DDoSEngine {
    pub fn new(config: DDoSConfig, clock: Arc<dyn SecurityClock>, audit: Arc<AuditSink>) -> Self {
        let whitelist = config.whitelisted_ips.iter().cloned().collect();
        Self {
            config,
            clock,
            audit,
            whitelist: Arc::new(RwLock::new(whitelist)),
            blocked_ips: Arc::new(RwLock::new(HashMap::new())),
            records: Arc::new(DashMap::new()),
            total_concurrent: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Admit or reject a request from `ip`. Admission and the counter
    /// increment happen in the same critical section: no request is ever
    /// counted without being admitted, and vice versa.
    pub async fn check_request(
        self: &Arc<Self>,
        ip: IpAddr,
    ) -> Result<ConcurrencySlot, DdosRejection> {
        if self.whitelist.read().await.contains(&ip) {
            return Ok(ConcurrencySlot::untracked(ip));
        }

        {
            let mut blocked = self.blocked_ips.write().await;
            if let Some(&expiry) = blocked.get(&ip) {
                let now = self.clock.now();
                if now < expiry {
                    return Err(DdosRejection::IpBlocked {
                        retry_after: expiry - now,
                    });
                }
                blocked.remove(&ip);
            }
        }

        if self.total_concurrent.load(Ordering::SeqCst) >= self.config.max_total_concurrent {
            return Err(DdosRejection::ServerAtCapacity);
        }

        let now = self.clock.now();
        let mut rec = self.records.entry(ip).or_insert_with(|| DDoSRecord::new(now));

        if now.saturating_duration_since(rec.window_start_sec) >= Duration::from_secs(1) {
            rec.requests_last_second = 0;
            rec.window_start_sec = now;
        }
        if now.saturating_duration_since(rec.window_start_min) >= Duration::from_secs(60) {
            rec.requests_last_minute = 0;
            rec.window_start_min = now;
        }
        if now.saturating_duration_since(rec.window_start_hr) >= Duration::from_secs(3600) {
            rec.requests_last_hour = 0;
            rec.window_start_hr = now;
        }

        if rec.requests_last_second >= self.config.max_requests_per_second {
            rec.suspicious_flag = true;
            let auto_ban = rec.requests_last_second >= self.config.suspicious_threshold
                && self.config.enable_ip_blocking;
            drop(rec);

            if auto_ban {
                self.block_ip(ip, "excessive requests per second").await;
                return Err(DdosRejection::RateLimitedAutoBanned {
                    retry_after: self.config.block_duration,
                });
            }
            return Err(DdosRejection::RateLimitExceeded { window: "second" });
        }
        if rec.requests_last_minute >= self.config.max_requests_per_minute {
            return Err(DdosRejection::RateLimitExceeded { window: "minute" });
        }
        if rec.requests_last_hour >= self.config.max_requests_per_hour {
            return Err(DdosRejection::RateLimitExceeded { window: "hour" });
        }
        if rec.concurrent_requests >= self.config.max_concurrent_per_ip {
            return Err(DdosRejection::TooManyConcurrent);
        }

        rec.requests_last_second += 1;
        rec.requests_last_minute += 1;
        rec.requests_last_hour += 1;
        rec.concurrent_requests += 1;
        if rec.first_request == rec.last_request && rec.requests_last_second == 1 {
            rec.first_request = now;
        }
        rec.last_request = now;
        drop(rec);

        self.total_concurrent.fetch_add(1, Ordering::SeqCst);
        Ok(ConcurrencySlot::tracked(self.clone(), ip))
    }

    /// Decrement the slot taken by an admitted request. Saturates at zero;
    /// must be called exactly once per admission (the `ConcurrencySlot`
    /// guard guarantees that).
    fn release_request(&self, ip: IpAddr) {
        if let Some(mut rec) = self.records.get_mut(&ip) {
            rec.concurrent_requests = rec.concurrent_requests.saturating_sub(1);
        }
        let _ = self
            .total_concurrent
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Idempotent: a repeat call while already blocked extends the expiry.
    pub async fn block_ip(&self, ip: IpAddr, reason: &str) {
        let expiry = self.clock.now() + self.config.block_duration;

        self.blocked_ips.write().await.insert(ip, expiry);

        if let Some(mut rec) = self.records.get_mut(&ip) {
            rec.blocked = true;
            rec.block_expiry = Some(expiry);
            rec.failed_attempts += 1;
        }

        self.audit
            .emit(EventType::IpBlocked, ip.to_string(), reason.to_string())
            .await;
    }

    pub async fn whitelist_ip(&self, ip: IpAddr) {
        self.whitelist.write().await.insert(ip);
    }

    /// Called by the orchestrator after a 401/403 response on a
    /// non-login endpoint. Eventually consistent with in-flight
    /// concurrency counters, since it runs after `release_request` —
    /// acceptable for counting (see design notes).
    pub async fn record_auth_failure(&self, ip: IpAddr) {
        let now = self.clock.now();
        let should_ban = {
            let mut rec = self.records.entry(ip).or_insert_with(|| DDoSRecord::new(now));
            rec.failed_attempts += 1;
            rec.failed_attempts >= self.config.ban_threshold
        };
        if should_ban && self.config.enable_ip_blocking {
            self.block_ip(ip, "authentication failure threshold exceeded")
                .await;
        }
    }

    pub fn max_request_size(&self) -> usize {
        self.config.max_request_size
    }

    pub fn max_uri_length(&self) -> usize {
        self.config.max_uri_length
    }

    pub fn total_concurrent(&self) -> u32 {
        self.total_concurrent.load(Ordering::SeqCst)
    }

    pub fn tracked_ips(&self) -> usize {
        self.records.len()
    }

    pub fn spawn_janitor(&self) -> Janitor {
        let records = self.records.clone();
        let blocked_ips = self.blocked_ips.clone();
        let interval = self.config.cleanup_interval;
        let inactivity = Duration::from_secs(5 * 60);
        let clock = self.clock.clone();

        Janitor::spawn(interval, move || {
            let records = records.clone();
            let blocked_ips = blocked_ips.clone();
            let clock = clock.clone();
            async move {
                let now = clock.now();
                records.retain(|_, rec| {
                    let block_expired = rec.block_expiry.map_or(true, |exp| now >= exp);
                    let inactive = now.saturating_duration_since(rec.last_request) > inactivity;
                    !(block_expired && inactive)
                });
                blocked_ips.write().await.retain(|_, &mut expiry| now < expiry);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::AuditConfig;

    fn engine(config: DDoSConfig) -> (Arc<DDoSEngine>, FakeClock) {
        let clock = FakeClock::new();
        let audit = Arc::new(AuditSink::new(AuditConfig::default()));
        let engine = Arc::new(DDoSEngine::new(config, Arc::new(clock.clone()), audit));
        (engine, clock)
    }

    #[tokio::test]
    async fn admits_then_rejects_at_per_second_limit() {
        let config = DDoSConfig {
            max_requests_per_second: 5,
            ..DDoSConfig::default()
        };
        let (engine, _clock) = engine(config);
        let ip: IpAddr = "198.51.100.7".parse().unwrap();

        let mut slots = Vec::new();
        for _ in 0..5 {
            slots.push(engine.check_request(ip).await.expect("should admit"));
        }

        let rejection = engine.check_request(ip).await.unwrap_err();
        assert!(matches!(rejection, DdosRejection::RateLimitExceeded { window: "second" }));
    }

    #[tokio::test]
    async fn auto_bans_above_suspicious_threshold() {
        let config = DDoSConfig {
            max_requests_per_second: 1,
            suspicious_threshold: 3,
            enable_ip_blocking: true,
            ..DDoSConfig::default()
        };
        let (engine, clock) = engine(config);
        let ip: IpAddr = "198.51.100.8".parse().unwrap();

        let _ = engine.check_request(ip).await.unwrap();
        for _ in 0..3 {
            let _ = engine.check_request(ip).await;
        }

        let rejection = engine.check_request(ip).await.unwrap_err();
        assert!(matches!(rejection, DdosRejection::IpBlocked { .. }));

        clock.advance(Duration::from_secs(60));
        let rejection = engine.check_request(ip).await.unwrap_err();
        assert!(matches!(rejection, DdosRejection::IpBlocked { .. }));
    }

    #[tokio::test]
    async fn concurrency_slot_releases_on_drop() {
        let (engine, _clock) = engine(DDoSConfig::default());
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        {
            let _slot = engine.check_request(ip).await.unwrap();
            assert_eq!(engine.total_concurrent(), 1);
        }
        assert_eq!(engine.total_concurrent(), 0);
    }

    #[tokio::test]
    async fn whitelisted_ip_is_never_blocked() {
        let config = DDoSConfig {
            max_requests_per_second: 1,
            suspicious_threshold: 1,
            whitelisted_ips: vec!["10.0.0.1".parse().unwrap()],
            ..DDoSConfig::default()
        };
        let (engine, _clock) = engine(config);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..50 {
            assert!(engine.check_request(ip).await.is_ok());
        }
    }

    #[tokio::test]
    async fn total_concurrent_never_goes_negative() {
        let (engine, _clock) = engine(DDoSConfig::default());
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        engine.release_request(ip);
        engine.release_request(ip);
        assert_eq!(engine.total_concurrent(), 0);
    }
}
