use {axum::http::HeaderMap, clawgate_config::ClawgateConfig, serde::Serialize};

/// Environment override for `gateway.auth.token`.
pub const TOKEN_ENV: &str = "CLAWGATE_TOKEN";

// ── Types ────────────────────────────────────────────────────────────────────

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailure {
    TokenMissing,
    TokenMismatch,
}

impl AuthFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenMissing => "token_missing",
            Self::TokenMismatch => "token_mismatch",
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
pub fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// `Authorization: Bearer <token>`, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// The token guarding `/rpc` and `/ws`: config first, then the environment.
pub fn resolve_token(config: &ClawgateConfig) -> Option<String> {
    config
        .gateway
        .auth
        .token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()))
}

/// Check a presented token against the expected one. No expected token means
/// the gateway is open. Loopback callers get no exemption.
pub fn authorize(expected: Option<&str>, provided: Option<&str>) -> Result<(), AuthFailure> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let Some(given) = provided else {
        return Err(AuthFailure::TokenMissing);
    };
    if !safe_equal(given, expected) {
        return Err(AuthFailure::TokenMismatch);
    }
    Ok(())
}
