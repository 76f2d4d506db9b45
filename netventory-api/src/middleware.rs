//! Axum Middleware for Site-Key Authentication
//!
//! Sync endpoints authenticate the calling site by the `Site-ID` and
//! `API-Key` headers against the `site_keys` table. The middleware
//! injects a [`SiteContext`] into request extensions on success and
//! returns 401 on any failure; the [`SiteExtractor`] makes the context
//! available to handlers through the type system.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use netventory_sync::authenticate;

use crate::error::ApiError;
use crate::state::AppState;

/// Authenticated site identity for one request.
#[derive(Debug, Clone)]
pub struct SiteContext {
    pub site_id: i64,
    pub site_name: String,
}

/// Axum middleware enforcing site-key authentication.
///
/// 1. Extracts the `Site-ID` and `API-Key` headers
/// 2. Verifies them against the site-key registry (constant-time compare,
///    active flag, `last_used_at` touch)
/// 3. Injects [`SiteContext`] into request extensions
/// 4. Returns 401 for any missing or invalid credential
pub async fn site_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let site_id = request
        .headers()
        .get("site-id")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing Site-ID header"))?
        .parse::<i64>()
        .map_err(|_| ApiError::unauthorized("Site-ID header must be an integer"))?;

    let api_key = request
        .headers()
        .get("api-key")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing API-Key header"))?
        .to_string();

    let key = authenticate(&state.db, site_id, &api_key, Utc::now()).await?;

    request.extensions_mut().insert(SiteContext {
        site_id: key.site_id,
        site_name: key.site_name,
    });

    Ok(next.run(request).await)
}

/// Generate a site api key: `nv_` followed by 40 random alphanumerics.
pub fn generate_site_key() -> String {
    use rand::Rng;

    const PREFIX: &str = "nv_";
    const KEY_LENGTH: usize = 40;
    const CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

    let mut rng = rand::rng();
    let key: String = (0..KEY_LENGTH)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect();

    format!("{}{}", PREFIX, key)
}

/// Typed extractor for the authenticated site context.
///
/// Using this in a handler signature guarantees at compile time that the
/// route sits behind the authentication middleware.
pub struct SiteExtractor(pub SiteContext);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for SiteExtractor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SiteContext>()
            .cloned()
            .map(SiteExtractor)
            .ok_or_else(|| {
                ApiError::internal_error("SiteContext missing: handler mounted without auth")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_site_key_shape() {
        let key = generate_site_key();
        assert!(key.starts_with("nv_"));
        assert_eq!(key.len(), 3 + 40);
        assert!(key[3..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_site_keys_are_unique() {
        assert_ne!(generate_site_key(), generate_site_key());
    }
}
