//! The network seam under the cache controller.

use async_trait::async_trait;
use posa_core::{Error, ResponseSnapshot};

use crate::request::Request;

/// Something that can perform a request against the origin.
///
/// Any HTTP status is a successful fetch. Only failures to obtain a
/// response at all (offline, refused, timed out) are errors, reported as
/// `NETWORK_UNAVAILABLE`.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, Error>;
}
