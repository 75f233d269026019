//! Bearer-token authorization.

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

/// Authorize a request against an endpoint's token.
///
/// An endpoint with no token accepts everything. Otherwise the
/// `Authorization` header must carry a Bearer token the endpoint accepts.
/// How a failure surfaces is up to the caller: OPTIONS swallows it,
/// everything else maps it to 403.
pub fn authorize(endpoint: &Endpoint, authorization: Option<&str>) -> Result<()> {
    let Some(token) = &endpoint.token else {
        return Ok(());
    };
    let presented = authorization
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or(Error::Unauthorized)?;
    if token.accepts(presented) {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}
