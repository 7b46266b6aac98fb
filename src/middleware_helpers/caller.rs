use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use std::convert::Infallible;

/// Header carrying the username resolved by the upstream session layer.
pub const CALLER_HEADER: &str = "x-user";

/// Identity of whoever is placing an order.
///
/// Session handling happens upstream; this core only trusts the forwarded
/// username. A request without it is a guest checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    Guest,
    User(String),
}

impl Caller {
    pub fn username(&self) -> Option<&str> {
        match self {
            Caller::Guest => None,
            Caller::User(name) => Some(name),
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Caller::User(v.to_string()))
            .unwrap_or(Caller::Guest);
        Ok(caller)
    }
}
