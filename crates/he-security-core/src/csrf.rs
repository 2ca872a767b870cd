//! Double-submit CSRF token store: CSPRNG tokens bound to (IP, User-Agent),
//! one-time-use, capacity-capped with LRU-by-creation eviction.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::audit::AuditSink;
use crate::clock::SecurityClock;
use crate::config::CsrfConfig;

#[derive(Debug, Clone)]
struct CsrfToken {
    created_at: Instant,
    expires_at: Instant,
    used: bool,
    ip: IpAddr,
    user_agent: String,
}

pub struct CsrfStore {
    config: CsrfConfig,
    clock: Arc<dyn SecurityClock>,
    audit: Arc<AuditSink>,
    tokens: DashMap<String, CsrfToken>,
}

impl CsrfStore {
    pub fn new(config: CsrfConfig, clock: Arc<dyn SecurityClock>, audit: Arc<AuditSink>) -> Self {
        Self {
            config,
            clock,
            audit,
            tokens: DashMap::new(),
        }
    }

    /// CSPRNG-derived, base64url-encoded, at least `token_length` bytes of
    /// entropy (>= 256 bits at the default of 32). Returns `None` only if
    /// the process's RNG itself is unusable — the orchestrator treats that
    /// as a transient entropy failure.
    pub async fn generate(&self, ip: IpAddr, user_agent: &str) -> Option<String> {
        let len = self.config.token_length.max(32);
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        let value = URL_SAFE_NO_PAD.encode(&bytes);

        let now = self.clock.now();
        self.evict_if_full();
        self.tokens.insert(
            value.clone(),
            CsrfToken {
                created_at: now,
                expires_at: now + self.config.token_lifetime,
                used: false,
                ip,
                user_agent: user_agent.to_string(),
            },
        );

        Some(value)
    }

    fn evict_if_full(&self) {
        if self.tokens.len() < self.config.max_tokens {
            return;
        }
        if let Some(oldest_key) = self
            .tokens
            .iter()
            .min_by_key(|entry| entry.value().created_at)
            .map(|entry| entry.key().clone())
        {
            self.tokens.remove(&oldest_key);
        }
    }

    /// Store-level validation: token exists, unexpired, unused, and (when
    /// `require_match`) bound to this exact (ip, user_agent).
    pub async fn validate(
        &self,
        value: &str,
        ip: IpAddr,
        user_agent: &str,
        require_match: bool,
    ) -> bool {
        let Some(token) = self.tokens.get(value) else {
            return false;
        };
        let now = self.clock.now();

        if token.used || now >= token.expires_at {
            return false;
        }
        if require_match && (token.ip != ip || token.user_agent != user_agent) {
            return false;
        }
        true
    }

    pub async fn mark_used(&self, value: &str) {
        if let Some(mut token) = self.tokens.get_mut(value) {
            token.used = true;
        }
    }

    /// Double-submit check: constant-time compare of the cookie value
    /// against the submitted value, then store-level validation. The
    /// caller (the orchestrator) is responsible for emitting `CsrfDetected`
    /// on any failure so every rejection path — mismatch or store-level
    /// invalid — is audited exactly once.
    pub async fn check_double_submit(
        &self,
        cookie_value: &str,
        submitted_value: &str,
        ip: IpAddr,
        user_agent: &str,
    ) -> bool {
        let equal: bool = cookie_value
            .as_bytes()
            .ct_eq(submitted_value.as_bytes())
            .into();
        if !equal {
            return false;
        }

        self.validate(cookie_value, ip, user_agent, true).await
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn cookie_name(&self) -> &str {
        &self.config.cookie_name
    }

    pub fn header_name(&self) -> &str {
        &self.config.header_name
    }

    pub fn form_field_name(&self) -> &str {
        &self.config.form_field_name
    }

    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Governs *validation* skipping: a state-changing request to an
    /// excluded path, or using an excluded method, is not checked at all.
    pub fn is_excluded(&self, path: &str, method: &str) -> bool {
        self.config.exclude_methods.iter().any(|m| m.eq_ignore_ascii_case(method))
            || self.config.exclude_paths.iter().any(|p| p == path)
    }

    /// Governs *issuance* on safe methods: `exclude_methods` (GET/HEAD/
    /// OPTIONS by default) names the methods that skip validation, not the
    /// methods that should never receive a fresh token, so issuance is
    /// gated on the path alone.
    pub fn is_path_excluded(&self, path: &str) -> bool {
        self.config.exclude_paths.iter().any(|p| p == path)
    }
}

/// A free function, not a `&self` method, because the sweep closure needs
/// to own a clone of the store (via `Arc`), not a borrow — mirrors the
/// DDoS/brute-force engines' `Arc<DashMap<..>>` janitor closures.
pub fn spawn_csrf_janitor(store: &Arc<CsrfStore>) -> crate::janitor::Janitor {
    let store = store.clone();
    let interval = store.config.token_lifetime.min(Duration::from_secs(5 * 60));

    crate::janitor::Janitor::spawn(interval, move || {
        let store = store.clone();
        async move {
            let now = store.clock.now();
            store.tokens.retain(|_, token| now < token.expires_at);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::AuditConfig;

    fn store(config: CsrfConfig) -> (Arc<CsrfStore>, FakeClock) {
        let clock = FakeClock::new();
        let audit = Arc::new(AuditSink::new(AuditConfig::default()));
        let store = Arc::new(CsrfStore::new(config, Arc::new(clock.clone()), audit));
        (store, clock)
    }

    #[tokio::test]
    async fn token_validates_once_when_refresh_required() {
        let (store, _clock) = store(CsrfConfig::default());
        let ip: IpAddr = "203.0.113.10".parse().unwrap();
        let token = store.generate(ip, "ua-1").await.unwrap();

        assert!(store.check_double_submit(&token, &token, ip, "ua-1").await);
        store.mark_used(&token).await;
        assert!(!store.check_double_submit(&token, &token, ip, "ua-1").await);
    }

    #[tokio::test]
    async fn token_bound_to_ip_and_ua_rejects_mismatch() {
        let (store, _clock) = store(CsrfConfig::default());
        let ip1: IpAddr = "203.0.113.11".parse().unwrap();
        let ip2: IpAddr = "203.0.113.12".parse().unwrap();
        let token = store.generate(ip1, "ua-a").await.unwrap();

        assert!(!store.check_double_submit(&token, &token, ip2, "ua-a").await);
        assert!(!store.check_double_submit(&token, &token, ip1, "ua-b").await);
    }

    #[tokio::test]
    async fn mismatched_submitted_value_fails_before_store_lookup() {
        let (store, _clock) = store(CsrfConfig::default());
        let ip: IpAddr = "203.0.113.13".parse().unwrap();
        let token = store.generate(ip, "ua").await.unwrap();

        assert!(!store.check_double_submit(&token, "not-the-token", ip, "ua").await);
    }

    #[tokio::test]
    async fn expired_token_fails_validation() {
        let (store, clock) = store(CsrfConfig {
            token_lifetime: Duration::from_secs(60),
            ..CsrfConfig::default()
        });
        let ip: IpAddr = "203.0.113.14".parse().unwrap();
        let token = store.generate(ip, "ua").await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert!(!store.check_double_submit(&token, &token, ip, "ua").await);
    }

    #[tokio::test]
    async fn capacity_cap_evicts_oldest_token() {
        let (store, clock) = store(CsrfConfig {
            max_tokens: 2,
            ..CsrfConfig::default()
        });
        let ip: IpAddr = "203.0.113.15".parse().unwrap();

        let first = store.generate(ip, "ua").await.unwrap();
        clock.advance(Duration::from_millis(1));
        let _second = store.generate(ip, "ua").await.unwrap();
        clock.advance(Duration::from_millis(1));
        let _third = store.generate(ip, "ua").await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(!store.validate(&first, ip, "ua", true).await);
    }
}
