//! Request extractors.

use crate::handlers::ErrorResponse;
use axum::{extract::FromRequestParts, http::request::Parts, http::StatusCode, Json};
use order_core::CartToken;

/// Header carrying the shopper's cart token
pub const CART_TOKEN_HEADER: &str = "x-cart-token";

/// The cart named by the `X-Cart-Token` header.
///
/// Missing or malformed tokens are rejected with 400 before the handler runs.
#[derive(Debug, Clone)]
pub struct CartSession(pub CartToken);

impl<S> FromRequestParts<S> for CartSession
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(CART_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse::new("Missing X-Cart-Token header", 400)),
                )
            })?;

        CartToken::parse(raw).map(CartSession).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(e.to_string(), 400)),
            )
        })
    }
}
