//! Retrieval transport for manifests and segments.
//!
//! The engine talks to origins through the `SegmentFetch` trait so retrieval
//! logic can be exercised against a scripted fetcher in tests. The production
//! implementation is a thin layer over a shared `reqwest` client.

pub mod http;
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;

pub use http::HttpSegmentFetcher;

use crate::session::SessionError;

/// Fetches one artifact from an origin by absolute URL.
#[async_trait]
pub trait SegmentFetch: Send + Sync + 'static {
    /// Retrieves the full body at `url`.
    ///
    /// # Errors
    /// - `SessionError::FetchFailed` - origin answered with non-success
    /// - `SessionError::Http` - transport-level failure
    async fn fetch(&self, url: &str) -> Result<Bytes, SessionError>;
}
