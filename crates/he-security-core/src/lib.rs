//! In-process security enforcement for the HTTP request path: rate
//! limiting and DDoS mitigation, brute-force credential tracking, CSRF
//! double-submit tokens, and an audit sink, composed by a single
//! `actix-web` middleware.
//!
//! Construct one [`middleware::SecurityCore`] per server and wrap routes
//! with [`middleware::SecurityMiddleware`]:
//!
//! ```ignore
//! let core = SecurityCore::new(SecurityConfig::default(), vec!["/login".into()], false);
//! App::new().wrap(SecurityMiddleware::new(core.clone()))
//! ```

pub mod audit;
pub mod bruteforce;
pub mod clock;
pub mod config;
pub mod csrf;
pub mod ddos;
pub mod error;
pub mod janitor;
pub mod middleware;
pub mod responses;

pub use audit::{Action, AuditEvent, AuditSink, AuditStats, EventType, Severity};
pub use bruteforce::{AttemptDecision, BruteForceEngine, BruteForceScope};
pub use clock::{FakeClock, SecurityClock, SystemClock};
pub use config::{AuditConfig, BruteForceConfig, CsrfConfig, DDoSConfig, SameSite, SecurityConfig};
pub use csrf::CsrfStore;
pub use ddos::{ConcurrencySlot, DDoSEngine, DdosRejection};
pub use error::{SecurityError, SecurityResult};
pub use janitor::Janitor;
pub use middleware::{RequestCredentials, SecurityCore, SecurityMiddleware};
