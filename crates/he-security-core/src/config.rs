//! Typed configuration for every engine, with `default` and `strict` presets.
//!
//! Loading these values from the environment or a config file is the host
//! application's job; this module only defines the shape and sane defaults,
//! the same split the teacher's `RateLimitConfig`/`DDoSConfig` draw.

use std::net::IpAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DDoSConfig {
    pub max_requests_per_second: u32,
    pub max_requests_per_minute: u32,
    pub max_requests_per_hour: u32,
    pub burst_size: u32,
    pub max_concurrent_per_ip: u32,
    pub max_total_concurrent: u32,
    pub max_request_size: usize,
    pub max_uri_length: usize,
    pub request_timeout: Duration,
    pub slowloris_timeout: Duration,
    pub enable_ip_blocking: bool,
    pub block_duration: Duration,
    pub suspicious_threshold: u32,
    pub ban_threshold: u32,
    pub cleanup_interval: Duration,
    pub whitelisted_ips: Vec<IpAddr>,
}

impl Default for DDoSConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 100,
            max_requests_per_minute: 2000,
            max_requests_per_hour: 20000,
            burst_size: 20,
            max_concurrent_per_ip: 50,
            max_total_concurrent: 10_000,
            max_request_size: 10 * 1024 * 1024,
            max_uri_length: 2048,
            request_timeout: Duration::from_secs(30),
            slowloris_timeout: Duration::from_secs(30),
            enable_ip_blocking: true,
            block_duration: Duration::from_secs(15 * 60),
            suspicious_threshold: 500,
            ban_threshold: 5,
            cleanup_interval: Duration::from_secs(60),
            whitelisted_ips: Vec::new(),
        }
    }
}

impl DDoSConfig {
    pub fn strict() -> Self {
        Self {
            max_requests_per_second: 20,
            max_requests_per_minute: 300,
            max_requests_per_hour: 3000,
            burst_size: 5,
            max_concurrent_per_ip: 10,
            max_total_concurrent: 2_000,
            suspicious_threshold: 100,
            ban_threshold: 3,
            block_duration: Duration::from_secs(60 * 60),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct BruteForceConfig {
    pub max_failed_attempts: u32,
    pub failure_window: Duration,
    pub block_duration: Duration,
    pub permanent_block_threshold: u32,
    pub enable_progressive_delay: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub enable_account_lockout: bool,
    pub lockout_duration: Duration,
    pub track_by_ip: bool,
    pub track_by_username: bool,
    pub track_by_ip_and_username: bool,
    pub whitelisted_ips: Vec<IpAddr>,
    pub whitelisted_usernames: Vec<String>,
    pub captcha_threshold: u32,
    pub cleanup_interval: Duration,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            failure_window: Duration::from_secs(15 * 60),
            block_duration: Duration::from_secs(30 * 60),
            permanent_block_threshold: 50,
            enable_progressive_delay: true,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            enable_account_lockout: true,
            lockout_duration: Duration::from_secs(30 * 60),
            track_by_ip: true,
            track_by_username: true,
            track_by_ip_and_username: true,
            whitelisted_ips: Vec::new(),
            whitelisted_usernames: Vec::new(),
            captcha_threshold: 3,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl BruteForceConfig {
    pub fn strict() -> Self {
        Self {
            max_failed_attempts: 3,
            failure_window: Duration::from_secs(10 * 60),
            block_duration: Duration::from_secs(60 * 60),
            permanent_block_threshold: 15,
            captcha_threshold: 2,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Debug, Clone)]
pub struct CsrfConfig {
    pub token_length: usize,
    pub token_lifetime: Duration,
    pub cookie_name: String,
    pub header_name: String,
    pub form_field_name: String,
    pub cookie_path: String,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub cookie_http_only: bool,
    pub cookie_same_site: SameSite,
    pub require_token_refresh: bool,
    pub enable_double_submit: bool,
    pub max_tokens: usize,
    pub exclude_paths: Vec<String>,
    pub exclude_methods: Vec<String>,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            token_length: 32,
            token_lifetime: Duration::from_secs(60 * 60),
            cookie_name: "csrf_token".to_string(),
            header_name: "X-CSRF-Token".to_string(),
            form_field_name: "csrf_token".to_string(),
            cookie_path: "/".to_string(),
            cookie_domain: None,
            cookie_secure: true,
            cookie_http_only: true,
            cookie_same_site: SameSite::Lax,
            require_token_refresh: true,
            enable_double_submit: true,
            max_tokens: 100_000,
            exclude_paths: vec!["/api/health".to_string(), "/api/metrics".to_string()],
            exclude_methods: vec![
                "GET".to_string(),
                "HEAD".to_string(),
                "OPTIONS".to_string(),
            ],
        }
    }
}

impl CsrfConfig {
    pub fn strict() -> Self {
        Self {
            token_lifetime: Duration::from_secs(15 * 60),
            cookie_same_site: SameSite::Strict,
            require_token_refresh: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub max_events: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { max_events: 10_000 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub ddos: DDoSConfig,
    pub brute_force: BruteForceConfig,
    pub csrf: CsrfConfig,
    pub audit: AuditConfig,
}

impl SecurityConfig {
    pub fn strict() -> Self {
        Self {
            ddos: DDoSConfig::strict(),
            brute_force: BruteForceConfig::strict(),
            csrf: CsrfConfig::strict(),
            audit: AuditConfig::default(),
        }
    }
}
