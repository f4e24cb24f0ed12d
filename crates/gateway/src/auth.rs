use std::sync::Arc;

use {
    axum::{
        extract::{Request, State},
        http::header::AUTHORIZATION,
        middleware::Next,
        response::Response,
    },
    secrecy::{ExposeSecret, Secret},
    tracing::debug,
};

use crate::{error::ApiError, state::GatewayState};

// ── Types ────────────────────────────────────────────────────────────────────

/// Resolved API auth configuration.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    /// `None` leaves the API open.
    pub token: Option<Secret<String>>,
}

/// Result of an authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub ok: bool,
    pub reason: Option<&'static str>,
}

impl AuthResult {
    fn allow() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn deny(reason: &'static str) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // XOR each byte and accumulate; any difference makes result non-zero.
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// Check an `Authorization` header value against the configured token.
pub fn authorize(auth: &ResolvedAuth, header: Option<&str>) -> AuthResult {
    let Some(expected) = auth.token.as_ref() else {
        return AuthResult::allow();
    };
    let Some(header) = header else {
        return AuthResult::deny("token_missing");
    };
    let Some(given) = bearer_token(header) else {
        return AuthResult::deny("token_malformed");
    };
    if !safe_equal(given, expected.expose_secret()) {
        return AuthResult::deny("token_mismatch");
    }
    AuthResult::allow()
}

/// Middleware guarding the `/api` routes.
pub async fn require_token(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let result = authorize(&state.auth, header);
    if !result.ok {
        let reason = result.reason.unwrap_or("unauthorized");
        debug!(reason, path = %request.uri().path(), "rejected api request");
        return Err(ApiError::Unauthorized(reason));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_token(token: &str) -> ResolvedAuth {
        ResolvedAuth {
            token: Some(Secret::new(token.to_string())),
        }
    }

    #[test]
    fn open_when_no_token_configured() {
        assert!(authorize(&ResolvedAuth::default(), None).ok);
    }

    #[test]
    fn bearer_token_checked() {
        let auth = with_token("s3cret");
        assert!(authorize(&auth, Some("Bearer s3cret")).ok);
        assert!(authorize(&auth, Some("bearer s3cret")).ok);
        assert_eq!(authorize(&auth, None).reason, Some("token_missing"));
        assert_eq!(authorize(&auth, Some("s3cret")).reason, Some("token_malformed"));
        assert_eq!(authorize(&auth, Some("Basic s3cret")).reason, Some("token_malformed"));
        assert_eq!(authorize(&auth, Some("Bearer nope")).reason, Some("token_mismatch"));
        assert_eq!(
            authorize(&auth, Some("Bearer s3cret2")).reason,
            Some("token_mismatch")
        );
    }

    #[test]
    fn safe_equal_compares_content() {
        assert!(safe_equal("abc", "abc"));
        assert!(!safe_equal("abc", "abd"));
        assert!(!safe_equal("abc", "ab"));
    }
}
