//! Credential-abuse tracker: per-IP, per-username, and per-(IP,username)
//! failure records with window reset, temporary/permanent block, and
//! progressive delay.
//!
//! The combined scope is a struct variant, `Combined(IpAddr, String)`,
//! never a colon-joined string — an IPv6 address contains colons, so
//! splitting "ip:username" back apart would be ambiguous. Keeping the two
//! fields separate side-steps the parsing question entirely.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::audit::{AuditSink, EventType};
use crate::clock::SecurityClock;
use crate::config::BruteForceConfig;
use crate::janitor::Janitor;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BruteForceScope {
    Ip(IpAddr),
    Username(String),
    Combined(IpAddr, String),
}

impl BruteForceScope {
    fn label(&self) -> String {
        match self {
            BruteForceScope::Ip(ip) => ip.to_string(),
            BruteForceScope::Username(u) => u.clone(),
            BruteForceScope::Combined(ip, u) => format!("{ip} ({u})"),
        }
    }
}

#[derive(Debug, Clone)]
struct BruteForceRecord {
    attempts: u32,
    total_failures: u32,
    first_attempt: Instant,
    last_attempt: Instant,
    blocked_until: Option<Instant>,
    permanent_block: bool,
}

impl BruteForceRecord {
    fn new(now: Instant) -> Self {
        Self {
            attempts: 0,
            total_failures: 0,
            first_attempt: now,
            last_attempt: now,
            blocked_until: None,
            permanent_block: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AttemptDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub delay: Duration,
}

impl AttemptDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            delay: Duration::ZERO,
        }
    }

    fn block(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            delay: Duration::ZERO,
        }
    }

    fn merge(self, other: AttemptDecision) -> AttemptDecision {
        if !self.allowed {
            return self;
        }
        if !other.allowed {
            return other;
        }
        AttemptDecision {
            allowed: true,
            reason: None,
            delay: self.delay.max(other.delay),
        }
    }
}

pub struct BruteForceEngine {
    config: BruteForceConfig,
    clock: Arc<dyn SecurityClock>,
    audit: Arc<AuditSink>,
    whitelisted_ips: Arc<RwLock<HashSet<IpAddr>>>,
    whitelisted_usernames: Arc<RwLock<HashSet<String>>>,
    records: Arc<DashMap<BruteForceScope, BruteForceRecord>>,
}

impl BruteForceEngine {
    pub fn new(config: BruteForceConfig, clock: Arc<dyn SecurityClock>, audit: Arc<AuditSink>) -> Self {
        let ips = config.whitelisted_ips.iter().cloned().collect();
        let names = config.whitelisted_usernames.iter().cloned().collect();
        Self {
            config,
            clock,
            audit,
            whitelisted_ips: Arc::new(RwLock::new(ips)),
            whitelisted_usernames: Arc::new(RwLock::new(names)),
            records: Arc::new(DashMap::new()),
        }
    }

    /// Evaluate all applicable scopes for (ip, username) and merge: blocked
    /// if any scope is blocked, otherwise allowed with the maximum of the
    /// per-scope progressive delays.
    pub async fn check_attempt(&self, ip: IpAddr, username: &str) -> AttemptDecision {
        if self.whitelisted_ips.read().await.contains(&ip) {
            return AttemptDecision::allow();
        }
        if !username.is_empty() && self.whitelisted_usernames.read().await.contains(username) {
            return AttemptDecision::allow();
        }

        let now = self.clock.now();
        let mut decision = AttemptDecision::allow();

        for scope in self.scopes_for(ip, username) {
            decision = decision.merge(self.check_scope(&scope, now));
        }

        decision
    }

    fn scopes_for(&self, ip: IpAddr, username: &str) -> Vec<BruteForceScope> {
        let mut scopes = Vec::with_capacity(3);
        if self.config.track_by_ip {
            scopes.push(BruteForceScope::Ip(ip));
        }
        if self.config.track_by_username && !username.is_empty() {
            scopes.push(BruteForceScope::Username(username.to_string()));
        }
        if self.config.track_by_ip_and_username && !username.is_empty() {
            scopes.push(BruteForceScope::Combined(ip, username.to_string()));
        }
        scopes
    }

    fn check_scope(&self, scope: &BruteForceScope, now: Instant) -> AttemptDecision {
        let Some(mut rec) = self.records.get_mut(scope) else {
            return AttemptDecision::allow();
        };

        if rec.permanent_block {
            return AttemptDecision::block(format!("Permanently blocked ({})", scope.label()));
        }

        if let Some(until) = rec.blocked_until {
            if now < until {
                let remaining = until - now;
                return AttemptDecision::block(format!(
                    "Temporarily blocked ({}) — {}s remaining",
                    scope.label(),
                    remaining.as_secs()
                ));
            }
            rec.attempts = 0;
            rec.blocked_until = None;
        }

        if now.saturating_duration_since(rec.first_attempt) > self.config.failure_window {
            rec.attempts = 0;
            rec.first_attempt = now;
            return AttemptDecision::allow();
        }

        if rec.attempts >= self.config.max_failed_attempts {
            return AttemptDecision::block(format!("Too many failed attempts ({})", scope.label()));
        }

        if self.config.enable_progressive_delay && rec.attempts > 0 {
            let factor = 1u32 << (rec.attempts - 1).min(30);
            let delay = (self.config.base_delay * factor).min(self.config.max_delay);
            return AttemptDecision {
                allowed: true,
                reason: None,
                delay,
            };
        }

        AttemptDecision::allow()
    }

    /// Whitelisted identifiers bypass all checks and are never recorded
    /// (§3): a whitelisted ip or username skips the scope writes below
    /// entirely, not just the `check_attempt` short-circuit.
    pub async fn record_failure(&self, ip: IpAddr, username: &str) {
        if self.whitelisted_ips.read().await.contains(&ip) {
            return;
        }
        if !username.is_empty() && self.whitelisted_usernames.read().await.contains(username) {
            return;
        }

        let now = self.clock.now();
        for scope in self.scopes_for(ip, username) {
            let mut rec = self
                .records
                .entry(scope.clone())
                .or_insert_with(|| BruteForceRecord::new(now));

            if now.saturating_duration_since(rec.first_attempt) > self.config.failure_window {
                rec.attempts = 0;
                rec.first_attempt = now;
            }

            rec.attempts += 1;
            rec.total_failures += 1;
            rec.last_attempt = now;

            if rec.attempts >= self.config.max_failed_attempts {
                rec.blocked_until = Some(now + self.config.block_duration);
            }
            if rec.total_failures >= self.config.permanent_block_threshold {
                rec.permanent_block = true;
            }
        }

        self.audit
            .emit(
                EventType::FailedLoginAttempt,
                ip.to_string(),
                format!("failed login for {username}"),
            )
            .await;
    }

    /// Clears all three records for (ip, username): an attacker's eventual
    /// success resets counters entirely.
    pub async fn record_success(&self, ip: IpAddr, username: &str) {
        self.records.remove(&BruteForceScope::Ip(ip));
        if !username.is_empty() {
            self.records.remove(&BruteForceScope::Username(username.to_string()));
            self.records.remove(&BruteForceScope::Combined(ip, username.to_string()));
        }
    }

    pub fn unblock_ip(&self, ip: IpAddr) {
        self.records.remove(&BruteForceScope::Ip(ip));
        self.records.retain(|scope, _| !matches!(scope, BruteForceScope::Combined(rec_ip, _) if *rec_ip == ip));
    }

    pub fn unblock_username(&self, username: &str) {
        self.records.remove(&BruteForceScope::Username(username.to_string()));
        self.records
            .retain(|scope, _| !matches!(scope, BruteForceScope::Combined(_, rec_user) if rec_user == username));
    }

    pub async fn whitelist_ip(&self, ip: IpAddr) {
        self.whitelisted_ips.write().await.insert(ip);
    }

    pub async fn whitelist_username(&self, username: impl Into<String>) {
        self.whitelisted_usernames.write().await.insert(username.into());
    }

    pub fn block_duration(&self) -> Duration {
        self.config.block_duration
    }

    pub fn spawn_janitor(&self) -> Janitor {
        let records = self.records.clone();
        let failure_window = self.config.failure_window;
        let clock = self.clock.clone();
        let interval = self.config.cleanup_interval;

        Janitor::spawn(interval, move || {
            let records = records.clone();
            let clock = clock.clone();
            async move {
                let now = clock.now();
                records.retain(|_, rec| {
                    if rec.permanent_block {
                        return true;
                    }
                    let block_expired = rec.blocked_until.map_or(true, |until| now >= until);
                    let inactive = now.saturating_duration_since(rec.last_attempt) > failure_window;
                    !(block_expired && inactive)
                });
            }
        })
    }
}
