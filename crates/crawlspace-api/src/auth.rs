//! Request authentication and context extraction.
//!
//! `Authorization: Bearer <token>` is the primary credential; a `token=`
//! query parameter is accepted for browser contexts that cannot set headers
//! (the log streaming upgrade). Tokens resolve in order: provisioned API
//! keys (recognized by their `cp_` prefix) and session tokens through the
//! auth collaborator, then per-run tokens through the coordination store.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequestParts, State};
use axum::http::header::HeaderName;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use ulid::Ulid;

use crawlspace_core::Principal;

use crate::error::ApiError;
use crate::server::AppState;

/// Header name for request correlation.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request context derived from authentication.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The authenticated caller.
    pub principal: Principal,
    /// Request ID for tracing/correlation.
    pub request_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(existing) = parts.extensions.get::<Self>() {
            return Ok(existing.clone());
        }

        let request_id = header_string(&parts.headers, REQUEST_ID_HEADER)
            .unwrap_or_else(|| Ulid::new().to_string());

        let token = bearer_token(&parts.headers)
            .or_else(|| token_from_query(parts.uri.query()))
            .ok_or_else(|| ApiError::unauthenticated("Authorization header required"))?;

        let principal = resolve_token(state, &token).await?;
        let ctx = Self {
            principal,
            request_id,
        };
        parts.extensions.insert(ctx.clone());
        Ok(ctx)
    }
}

async fn resolve_token(state: &AppState, token: &str) -> Result<Principal, ApiError> {
    if let Some(principal) = state.authenticator.authenticate(token).await? {
        return Ok(principal);
    }
    if let Some(principal) = state.engine.runs().resolve_run_token(token).await? {
        return Ok(principal);
    }
    Err(ApiError::unauthenticated("invalid bearer token"))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_string(headers, "authorization")?;
    raw.strip_prefix("Bearer ").map(str::to_string)
}

fn token_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Authentication middleware.
///
/// Verifies the token before any handler runs, injects the
/// [`RequestContext`], and reflects the request ID on the response.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let ctx = match RequestContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };

    let request_id = ctx.request_id.clone();
    let mut req = Request::from_parts(parts, body);
    req.extensions_mut().insert(ctx);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_query_extraction() {
        assert_eq!(
            token_from_query(Some("a=1&token=abc&b=2")),
            Some("abc".to_string())
        );
        assert_eq!(token_from_query(Some("a=1")), None);
        assert_eq!(token_from_query(Some("token=")), None);
        assert_eq!(token_from_query(None), None);
    }
}
