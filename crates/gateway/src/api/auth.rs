//! Bearer-token gate for the listing endpoints.
//!
//! The token comes from the env var named by `server.api_token_env` and only
//! its SHA-256 digest is kept in [`AppState`]. No digest means the listings
//! are open.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub fn hash_token(token: &str) -> Vec<u8> {
    Sha256::digest(token.as_bytes()).to_vec()
}

/// Token from `Authorization: Bearer <token>`. The scheme is matched
/// case-insensitively.
fn bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

fn token_matches(expected: &[u8], provided: Option<&str>) -> bool {
    let Some(provided) = provided else {
        return false;
    };
    hash_token(provided).ct_eq(expected).into()
}

/// Attach with `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = &state.api_token_hash else {
        return next.run(req).await;
    };
    if token_matches(expected, bearer(req.headers())) {
        return next.run(req).await;
    }

    tracing::warn!(path = %req.uri().path(), "listing request without a valid API token");
    let mut resp = (
        StatusCode::UNAUTHORIZED,
        axum::Json(json!({ "error": "invalid or missing API token" })),
    )
        .into_response();
    resp.headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer(&headers("Bearer abc")), Some("abc"));
        assert_eq!(bearer(&headers("bearer  abc ")), Some("abc"));
        assert_eq!(bearer(&headers("Basic abc")), None);
        assert_eq!(bearer(&headers("Bearer ")), None);
        assert_eq!(bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn only_the_configured_token_matches() {
        let expected = hash_token("api-secret");
        assert!(token_matches(&expected, Some("api-secret")));
        assert!(!token_matches(&expected, Some("api-secret2")));
        assert!(!token_matches(&expected, None));
    }
}
