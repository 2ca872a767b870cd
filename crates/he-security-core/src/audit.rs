//! Audit sink: a bounded, append-only ring of security events with a
//! deterministic severity/action classifier and async callback fan-out.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::config::AuditConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Allowed,
    Suspicious,
    Blocked,
}

/// Event types the engines emit. `Other` covers anything the host
/// application wants to audit that this crate doesn't itself produce;
/// classification falls back to `(Info, Allowed)` for those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    IpBlocked,
    BruteForceDetected,
    FailedLoginAttempt,
    CsrfDetected,
    InvalidToken,
    CsrfTokenGenerationFailed,
    RequestBlocked,
    RateLimitExceeded,
    SuspiciousActivity,
    RequestTooLarge,
    UriTooLong,
    Other(String),
}

impl EventType {
    fn classify(&self) -> (Severity, Action) {
        use Action::*;
        use EventType::*;
        use Severity::*;
        match self {
            IpBlocked | BruteForceDetected | CsrfDetected | InvalidToken => (Critical, Blocked),
            RequestBlocked | RateLimitExceeded => (Warning, Blocked),
            SuspiciousActivity | RequestTooLarge | UriTooLong => (Warning, Suspicious),
            FailedLoginAttempt | CsrfTokenGenerationFailed | Other(_) => (Info, Allowed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub ip: String,
    pub details: String,
    pub severity: Severity,
    pub action: Action,
}

impl AuditEvent {
    fn new(event_type: EventType, ip: String, details: String) -> Self {
        let (severity, action) = event_type.classify();
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            ip,
            details,
            severity,
            action,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total: usize,
    pub info: usize,
    pub warning: usize,
    pub critical: usize,
    pub allowed: usize,
    pub suspicious: usize,
    pub blocked: usize,
    pub unique_ips: usize,
}

type Callback = dyn Fn(AuditEvent) + Send + Sync;

pub struct AuditSink {
    config: AuditConfig,
    ring: RwLock<VecDeque<AuditEvent>>,
    callbacks: RwLock<Vec<Arc<Callback>>>,
}

impl AuditSink {
    pub fn new(config: AuditConfig) -> Self {
        Self {
            config,
            ring: RwLock::new(VecDeque::new()),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback invoked for every future event. Never invoked
    /// while the ring's lock is held: each dispatch is its own task, so a
    /// slow callback can never stall producers.
    pub async fn register<F>(&self, cb: F)
    where
        F: Fn(AuditEvent) + Send + Sync + 'static,
    {
        self.callbacks.write().await.push(Arc::new(cb));
    }

    pub async fn emit(
        &self,
        event_type: EventType,
        ip: impl Into<String>,
        details: impl Into<String>,
    ) {
        let event = AuditEvent::new(event_type, ip.into(), details.into());

        if event.severity == Severity::Critical {
            error!(
                event_type = ?event.event_type,
                ip = %event.ip,
                "SECURITY: {}",
                event.details
            );
        }

        {
            let mut ring = self.ring.write().await;
            ring.push_back(event.clone());
            while ring.len() > self.config.max_events {
                ring.pop_front();
            }
        }

        let callbacks = self.callbacks.read().await;
        for cb in callbacks.iter() {
            let cb = cb.clone();
            let event = event.clone();
            tokio::spawn(async move { (cb)(event) });
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let ring = self.ring.read().await;
        ring.iter().rev().take(limit).cloned().collect()
    }

    pub async fn by_ip(&self, ip: &str, limit: usize) -> Vec<AuditEvent> {
        let ring = self.ring.read().await;
        ring.iter()
            .rev()
            .filter(|e| e.ip == ip)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn by_type(&self, event_type: &EventType, limit: usize) -> Vec<AuditEvent> {
        let ring = self.ring.read().await;
        ring.iter()
            .rev()
            .filter(|e| &e.event_type == event_type)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn stats(&self, recent_count: usize) -> AuditStats {
        let ring = self.ring.read().await;
        let mut stats = AuditStats::default();
        let mut ips = std::collections::HashSet::new();

        for event in ring.iter().rev().take(recent_count) {
            stats.total += 1;
            match event.severity {
                Severity::Info => stats.info += 1,
                Severity::Warning => stats.warning += 1,
                Severity::Critical => stats.critical += 1,
            }
            match event.action {
                Action::Allowed => stats.allowed += 1,
                Action::Suspicious => stats.suspicious += 1,
                Action::Blocked => stats.blocked += 1,
            }
            ips.insert(event.ip.clone());
        }
        stats.unique_ips = ips.len();
        stats
    }

    pub async fn len(&self) -> usize {
        self.ring.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ring.read().await.is_empty()
    }
}
