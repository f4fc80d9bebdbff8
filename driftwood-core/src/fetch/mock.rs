//! Scripted fetcher for tests and simulated origins.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::SegmentFetch;
use crate::session::SessionError;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Deliver this body with a success status.
    Body(Bytes),
    /// Answer with a non-success status.
    Status(reqwest::StatusCode),
    /// Never answer; lets tests drive the idle-timeout path.
    Hang,
}

/// Fetcher that answers from per-URL scripts and records every request.
///
/// Scripted outcomes are consumed in order; once a URL's queue is empty the
/// sticky outcome for that URL applies, then the default outcome.
#[derive(Clone, Default)]
pub struct MockFetcher {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    queues: HashMap<String, VecDeque<MockOutcome>>,
    sticky: HashMap<String, MockOutcome>,
    requests: Vec<String>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an outcome for one future request to `url`.
    pub fn enqueue(&self, url: &str, outcome: MockOutcome) {
        self.inner
            .lock()
            .queues
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Sets the outcome used whenever `url`'s queue is empty.
    pub fn set_sticky(&self, url: &str, outcome: MockOutcome) {
        self.inner.lock().sticky.insert(url.to_string(), outcome);
    }

    /// All requested URLs in order.
    pub fn requests(&self) -> Vec<String> {
        self.inner.lock().requests.clone()
    }

    /// How many times `url` was requested.
    pub fn request_count(&self, url: &str) -> usize {
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|r| r.as_str() == url)
            .count()
    }

    fn next_outcome(&self, url: &str) -> MockOutcome {
        let mut state = self.inner.lock();
        state.requests.push(url.to_string());
        if let Some(queue) = state.queues.get_mut(url)
            && let Some(outcome) = queue.pop_front()
        {
            return outcome;
        }
        state
            .sticky
            .get(url)
            .cloned()
            .unwrap_or_else(|| MockOutcome::Body(Bytes::from_static(b"mock-data")))
    }
}

#[async_trait]
impl SegmentFetch for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, SessionError> {
        match self.next_outcome(url) {
            MockOutcome::Body(body) => Ok(body),
            MockOutcome::Status(status) => Err(SessionError::FetchFailed {
                url: url.to_string(),
                status,
            }),
            MockOutcome::Hang => {
                futures::future::pending::<()>().await;
                unreachable!("pending future never resolves")
            }
        }
    }
}
