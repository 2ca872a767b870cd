//! JSON bodies for the rejection responses the orchestrator produces.
//! Kept separate from `middleware.rs` so the wire shape can be unit-tested
//! without spinning up an actix service.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RateLimitedBody {
    pub error: String,
    pub retry_after: u64,
}

#[derive(Debug, Serialize)]
pub struct BruteForceBody {
    pub error: String,
    pub reason: String,
    pub retry_after: u64,
}

#[derive(Debug, Serialize)]
pub struct CsrfFailureBody {
    pub error: String,
}

impl Default for CsrfFailureBody {
    fn default() -> Self {
        Self {
            error: "CSRF token validation failed".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SizeViolationBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rate_limited_body_serializes_expected_shape() {
        let body = RateLimitedBody {
            error: "rate limit exceeded (per second)".to_string(),
            retry_after: 0,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "rate limit exceeded (per second)");
        assert_eq!(json["retry_after"], 0);
    }

    #[test]
    fn brute_force_body_matches_spec_field_names() {
        let body = BruteForceBody {
            error: "Too many failed attempts".to_string(),
            reason: "ip".to_string(),
            retry_after: 1800,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "Too many failed attempts");
        assert_eq!(json["reason"], "ip");
        assert_eq!(json["retry_after"], 1800);
    }
}
