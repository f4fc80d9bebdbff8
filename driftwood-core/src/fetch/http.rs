//! HTTP origin fetcher backed by a shared client.

use async_trait::async_trait;
use bytes::Bytes;

use super::SegmentFetch;
use crate::config::FetchConfig;
use crate::session::SessionError;

/// Production fetcher over a pooled `reqwest` client.
///
/// The client carries no request timeout of its own; the engine bounds each
/// fetch with its idle window so a stalled origin is handled uniformly with
/// a slow one.
#[derive(Debug, Clone)]
pub struct HttpSegmentFetcher {
    client: reqwest::Client,
}

impl HttpSegmentFetcher {
    /// Builds the fetcher and its underlying connection pool.
    ///
    /// # Errors
    /// - `SessionError::Http` - TLS backend or client initialization failed
    pub fn new(config: &FetchConfig) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SegmentFetch for HttpSegmentFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, SessionError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::FetchFailed {
                url: url.to_string(),
                status,
            });
        }
        Ok(response.bytes().await?)
    }
}
