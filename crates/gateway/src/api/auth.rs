//! Bearer-token auth.
//!
//! Tokens are read from the environment once at startup and kept only as
//! SHA-256 hashes; request tokens are hashed and compared in constant
//! time. An unset token means dev mode: the check passes.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Hash the token held in `env_var`, if set and non-empty.
pub fn hash_from_env(env_var: &str) -> Option<Vec<u8>> {
    match std::env::var(env_var) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var, "bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(env_var, "bearer-token auth DISABLED — set {env_var} to enable");
            None
        }
    }
}

/// Check the `Authorization: Bearer` header against a startup-computed
/// hash. `None` hash = dev mode, always authorized.
pub fn bearer_authorized(headers: &HeaderMap, expected: &Option<Vec<u8>>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    let got = Sha256::digest(token.as_bytes());
    got.as_slice().ct_eq(expected.as_slice()).into()
}

/// Middleware protecting the RPC surface.
pub async fn require_api_auth(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if bearer_authorized(req.headers(), &state.api_token_hash) {
        next.run(req).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid or missing bearer token" })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::AUTHORIZATION;

    fn headers_with(token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        h
    }

    #[test]
    fn dev_mode_allows_everything() {
        assert!(bearer_authorized(&HeaderMap::new(), &None));
    }

    #[test]
    fn correct_token_passes() {
        let hash = Some(Sha256::digest(b"secret").to_vec());
        assert!(bearer_authorized(&headers_with("secret"), &hash));
    }

    #[test]
    fn wrong_or_missing_token_fails() {
        let hash = Some(Sha256::digest(b"secret").to_vec());
        assert!(!bearer_authorized(&headers_with("nope"), &hash));
        assert!(!bearer_authorized(&HeaderMap::new(), &hash));
    }
}
