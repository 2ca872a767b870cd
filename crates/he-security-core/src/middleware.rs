//! C6 — composes the DDoS, brute-force, and CSRF engines into a single
//! `actix-web` middleware, in the fixed order the spec mandates: size
//! checks, then DDoS admission, then CSRF, then brute-force pre-check,
//! then the handler, then response classification.
//!
//! Username extraction does not re-read the request body: the host
//! application is expected to run an upstream extractor that inserts a
//! [`RequestCredentials`] into the request's extensions before this
//! middleware runs (request-body parsing happens once, in that pre-stage).
//! The same applies to a CSRF value carried in a form field or JSON body —
//! insert it as a [`CsrfSubmission`] extension; the header is always
//! checked first.

use std::future::{ready, Ready};
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use actix_web::body::{EitherBody, MessageBody};
use actix_web::cookie::{Cookie, SameSite as ActixSameSite};
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::{Method, StatusCode};
use actix_web::{Error, HttpMessage, HttpResponse};
use futures_util::future::LocalBoxFuture;

use crate::audit::{AuditSink, EventType};
use crate::bruteforce::BruteForceEngine;
use crate::clock::{SecurityClock, SystemClock};
use crate::config::{SameSite, SecurityConfig};
use crate::csrf::CsrfStore;
use crate::ddos::DDoSEngine;
use crate::janitor::Janitor;
use crate::responses::{BruteForceBody, CsrfFailureBody, RateLimitedBody, SizeViolationBody};

/// Set by a pre-stage extractor; read, never re-parsed, by this middleware.
#[derive(Debug, Clone, Default)]
pub struct RequestCredentials {
    pub username: Option<String>,
}

/// A CSRF value carried in a form field or JSON body, set by a pre-stage
/// body parser. The header is checked first; this is the fallback.
#[derive(Debug, Clone, Default)]
pub struct CsrfSubmission(pub Option<String>);

/// Owns the three engines plus the audit sink and their janitors. One
/// instance per server; share it via `actix_web::web::Data`.
pub struct SecurityCore {
    pub ddos: Arc<DDoSEngine>,
    pub brute_force: Arc<BruteForceEngine>,
    pub csrf: Arc<CsrfStore>,
    pub audit: Arc<AuditSink>,
    login_paths: Vec<String>,
    trust_forwarded_headers: bool,
    janitors: std::sync::Mutex<Vec<Janitor>>,
}

impl SecurityCore {
    pub fn new(config: SecurityConfig, login_paths: Vec<String>, trust_forwarded_headers: bool) -> Arc<Self> {
        Self::with_clock(config, login_paths, trust_forwarded_headers, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SecurityConfig,
        login_paths: Vec<String>,
        trust_forwarded_headers: bool,
        clock: Arc<dyn SecurityClock>,
    ) -> Arc<Self> {
        let audit = Arc::new(AuditSink::new(config.audit.clone()));
        let ddos = Arc::new(DDoSEngine::new(config.ddos, clock.clone(), audit.clone()));
        let brute_force = Arc::new(BruteForceEngine::new(config.brute_force, clock.clone(), audit.clone()));
        let csrf = Arc::new(CsrfStore::new(config.csrf, clock, audit.clone()));

        let ddos_janitor = ddos.spawn_janitor();
        let bf_janitor = brute_force.spawn_janitor();
        let csrf_janitor = crate::csrf::spawn_csrf_janitor(&csrf);

        Arc::new(Self {
            ddos,
            brute_force,
            csrf,
            audit,
            login_paths,
            trust_forwarded_headers,
            janitors: std::sync::Mutex::new(vec![ddos_janitor, bf_janitor, csrf_janitor]),
        })
    }

    /// Stop all three janitors and wait for them to return. Call during
    /// server shutdown; `SecurityCore` is otherwise not meant to be torn
    /// down mid-process.
    pub async fn shutdown(&self) {
        let janitors = std::mem::take(&mut *self.janitors.lock().unwrap());
        for janitor in janitors {
            janitor.shutdown().await;
        }
    }

    fn is_login_endpoint(&self, path: &str) -> bool {
        self.login_paths.iter().any(|p| p == path)
    }

    fn brute_force_retry_hint(&self) -> u64 {
        self.brute_force.block_duration().as_secs()
    }
}

pub struct SecurityMiddleware {
    core: Arc<SecurityCore>,
}

impl SecurityMiddleware {
    pub fn new(core: Arc<SecurityCore>) -> Self {
        Self { core }
    }
}

impl<S, B> Transform<S, ServiceRequest> for SecurityMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = SecurityMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SecurityMiddlewareService {
            service: Rc::new(service),
            core: self.core.clone(),
        }))
    }
}

pub struct SecurityMiddlewareService<S> {
    service: Rc<S>,
    core: Arc<SecurityCore>,
}

impl<S, B> Service<ServiceRequest> for SecurityMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let core = self.core.clone();
        let service = self.service.clone();

        Box::pin(async move {
            // Step 1: size checks.
            let content_length = req
                .headers()
                .get(actix_web::http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            let uri_length = req.uri().to_string().len();

            if content_length > core.ddos.max_request_size() {
                core.audit
                    .emit(EventType::RequestTooLarge, client_ip(&req, core.trust_forwarded_headers).to_string(), "content-length exceeded".to_string())
                    .await;
                let response = HttpResponse::build(StatusCode::PAYLOAD_TOO_LARGE)
                    .json(SizeViolationBody {
                        error: "request entity too large".to_string(),
                    });
                return Ok(req.into_response(response).map_into_right_body());
            }
            if uri_length > core.ddos.max_uri_length() {
                core.audit
                    .emit(EventType::UriTooLong, client_ip(&req, core.trust_forwarded_headers).to_string(), "request-uri exceeded limit".to_string())
                    .await;
                let response = HttpResponse::build(StatusCode::URI_TOO_LONG)
                    .json(SizeViolationBody {
                        error: "request-uri too long".to_string(),
                    });
                return Ok(req.into_response(response).map_into_right_body());
            }

            // Step 2: client IP.
            let ip = client_ip(&req, core.trust_forwarded_headers);

            // Step 3: DDoS admission.
            let slot = match core.ddos.check_request(ip).await {
                Ok(slot) => slot,
                Err(rejection) => {
                    core.audit
                        .emit(EventType::RequestBlocked, ip.to_string(), rejection.message())
                        .await;
                    let retry_after = rejection.retry_after().unwrap_or(Duration::ZERO).as_secs();
                    let response = HttpResponse::build(StatusCode::TOO_MANY_REQUESTS).json(RateLimitedBody {
                        error: rejection.message(),
                        retry_after,
                    });
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };

            let method = req.method().clone();
            let path = req.path().to_string();
            let user_agent = req
                .headers()
                .get(actix_web::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            // Step 4: CSRF. State-changing methods validate against an
            // excluded path/method; safe methods on a non-excluded path
            // mint a fresh token regardless of `exclude_methods` (that
            // config only skips validation, not issuance), attached to the
            // response once the handler returns.
            let path_excluded = core.csrf.is_excluded(&path, method.as_str());
            let mut mint_fresh_token = !is_state_changing(&method)
                && core.csrf.config().enable_double_submit
                && !core.csrf.is_path_excluded(&path);

            if is_state_changing(&method) && !path_excluded {
                let cookie_value = req
                    .cookie(core.csrf.cookie_name())
                    .map(|c| c.value().to_string());
                let submitted = req
                    .headers()
                    .get(core.csrf.header_name())
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string())
                    .or_else(|| req.extensions().get::<CsrfSubmission>().and_then(|s| s.0.clone()));

                let valid = match (&cookie_value, &submitted) {
                    (Some(cookie), Some(submitted)) => {
                        core.csrf
                            .check_double_submit(cookie, submitted, ip, &user_agent)
                            .await
                    }
                    _ => false,
                };

                if !valid {
                    drop(slot);
                    core.audit
                        .emit(EventType::CsrfDetected, ip.to_string(), "CSRF double-submit validation failed".to_string())
                        .await;
                    let response = HttpResponse::build(StatusCode::FORBIDDEN).json(CsrfFailureBody::default());
                    return Ok(req.into_response(response).map_into_right_body());
                }

                if core.csrf.config().require_token_refresh {
                    if let Some(cookie) = cookie_value {
                        core.csrf.mark_used(&cookie).await;
                    }
                    mint_fresh_token = true;
                }
            }

            // Step 5: brute-force pre-check on login endpoints.
            let mut delay = Duration::ZERO;
            let username = req
                .extensions()
                .get::<RequestCredentials>()
                .and_then(|c| c.username.clone())
                .unwrap_or_default();

            if core.is_login_endpoint(&path) {
                let decision = core.brute_force.check_attempt(ip, &username).await;
                if !decision.allowed {
                    drop(slot);
                    core.audit
                        .emit(EventType::BruteForceDetected, ip.to_string(), decision.reason.clone().unwrap_or_default())
                        .await;
                    let response = HttpResponse::build(StatusCode::TOO_MANY_REQUESTS).json(BruteForceBody {
                        error: "Too many failed attempts".to_string(),
                        reason: decision.reason.unwrap_or_default(),
                        retry_after: core.brute_force_retry_hint(),
                    });
                    return Ok(req.into_response(response).map_into_right_body());
                }
                delay = decision.delay;
            }

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            // Step 6: downstream handler. The slot stays alive across this
            // await and is released by its `Drop` impl no matter how the
            // future below completes or is cancelled.
            let is_login = core.is_login_endpoint(&path);
            let mut res = service.call(req).await?;
            drop(slot);

            // Step 8: response classification.
            let status = res.status();
            if is_login {
                if status == StatusCode::OK || status == StatusCode::CREATED {
                    core.brute_force.record_success(ip, &username).await;
                } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    core.brute_force.record_failure(ip, &username).await;
                }
            } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                core.ddos.record_auth_failure(ip).await;
            }

            if mint_fresh_token && status.is_success() {
                if let Some(fresh) = core.csrf.generate(ip, &user_agent).await {
                    let cookie = csrf_set_cookie_header(&core.csrf, &fresh);
                    if let Ok(value) = actix_web::http::header::HeaderValue::from_str(&cookie.to_string()) {
                        res.response_mut()
                            .headers_mut()
                            .insert(actix_web::http::header::SET_COOKIE, value);
                    }
                } else {
                    core.audit
                        .emit(
                            EventType::CsrfTokenGenerationFailed,
                            ip.to_string(),
                            "CSPRNG unavailable while minting refresh token".to_string(),
                        )
                        .await;
                }
            }

            Ok(res.map_into_left_body())
        })
    }
}

fn is_state_changing(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH | Method::DELETE)
}

/// X-Forwarded-For (first parseable entry) -> X-Real-IP -> socket address.
/// The first two are honoured only when the caller configured
/// `trust_forwarded_headers` (i.e. a reverse-proxy allow-list is in
/// place) — otherwise a client could forge its own IP.
fn client_ip(req: &ServiceRequest, trust_forwarded_headers: bool) -> IpAddr {
    if trust_forwarded_headers {
        if let Some(xff) = req.headers().get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
            for candidate in xff.split(',') {
                if let Ok(ip) = candidate.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
        if let Some(xri) = req.headers().get("X-Real-IP").and_then(|v| v.to_str().ok()) {
            if let Ok(ip) = xri.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    req.peer_addr()
        .map(|addr| addr.ip())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]))
}

pub fn csrf_set_cookie_header(store: &CsrfStore, value: &str) -> Cookie<'static> {
    let config = store.config();
    let same_site = match config.cookie_same_site {
        SameSite::Strict => ActixSameSite::Strict,
        SameSite::Lax => ActixSameSite::Lax,
        SameSite::None => ActixSameSite::None,
    };

    let mut builder = Cookie::build(config.cookie_name.clone(), value.to_string())
        .path(config.cookie_path.clone())
        .secure(config.cookie_secure)
        .http_only(config.cookie_http_only)
        .same_site(same_site)
        .max_age(actix_web::cookie::time::Duration::seconds(config.token_lifetime.as_secs() as i64));

    if let Some(domain) = &config.cookie_domain {
        builder = builder.domain(domain.clone());
    }

    builder.finish()
}
