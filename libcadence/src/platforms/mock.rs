//! Mock network implementation for testing
//!
//! [`MockNetwork`] implements [`NetworkApi`] in memory. Outcomes can be
//! scripted per call, latency can be simulated, and every request is recorded
//! so tests can assert on what the adapters sent. It is compiled into normal
//! builds so integration tests and the daemon's `--dry-run` mode can use it.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PublishError, PublishResult};
use crate::platforms::{NetworkApi, PublishRequest};
use crate::types::{AccessToken, PostMetrics};

#[derive(Default)]
struct MockState {
    /// Consumed front to back; empty means success
    script: VecDeque<PublishResult<()>>,
    create_calls: usize,
    lookup_calls: usize,
    metrics_calls: usize,
    requests: Vec<PublishRequest>,
    /// Idempotency key -> platform post id, for successful creates
    published: HashMap<String, String>,
    metrics: HashMap<String, PostMetrics>,
    metrics_error: Option<PublishError>,
}

/// In-memory network
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<MockState>>,
    delay: Duration,
    lookup: bool,
}

impl MockNetwork {
    /// A network that accepts every post
    pub fn success() -> Self {
        Self::default()
    }

    /// A network that returns `error` for every post
    pub fn failing(error: PublishError) -> Self {
        let network = Self::default();
        // Large enough that no test runs out of script
        for _ in 0..64 {
            network.push_outcome(Err(error.clone()));
        }
        network
    }

    /// A network whose first calls follow `outcomes`, then succeed
    pub fn scripted(outcomes: impl IntoIterator<Item = PublishResult<()>>) -> Self {
        let network = Self::default();
        for outcome in outcomes {
            network.push_outcome(outcome);
        }
        network
    }

    /// Simulate latency on every create call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Support lookup of earlier posts by idempotency key
    pub fn with_lookup(mut self) -> Self {
        self.lookup = true;
        self
    }

    pub fn push_outcome(&self, outcome: PublishResult<()>) {
        self.state.lock().unwrap().script.push_back(outcome);
    }

    pub fn set_metrics(&self, platform_post_id: &str, metrics: PostMetrics) {
        self.state
            .lock()
            .unwrap()
            .metrics
            .insert(platform_post_id.to_string(), metrics);
    }

    pub fn fail_metrics(&self, error: PublishError) {
        self.state.lock().unwrap().metrics_error = Some(error);
    }

    /// Pretend a post with this idempotency key already went out
    pub fn mark_published(&self, idempotency_key: &str, platform_post_id: &str) {
        self.state
            .lock()
            .unwrap()
            .published
            .insert(idempotency_key.to_string(), platform_post_id.to_string());
    }

    pub fn create_call_count(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    pub fn lookup_call_count(&self) -> usize {
        self.state.lock().unwrap().lookup_calls
    }

    pub fn metrics_call_count(&self) -> usize {
        self.state.lock().unwrap().metrics_calls
    }

    /// Every request passed to `create_post`, in call order
    pub fn requests(&self) -> Vec<PublishRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Number of distinct posts that went live
    pub fn published_count(&self) -> usize {
        self.state.lock().unwrap().published.len()
    }
}

#[async_trait]
impl NetworkApi for MockNetwork {
    async fn create_post(&self, request: &PublishRequest) -> PublishResult<String> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            state.requests.push(request.clone());
            state.script.pop_front().unwrap_or(Ok(()))
        };

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        outcome?;

        let platform_post_id = format!("{}:mock-{}", request.network, uuid::Uuid::new_v4());
        self.state
            .lock()
            .unwrap()
            .published
            .insert(request.idempotency_key.clone(), platform_post_id.clone());

        Ok(platform_post_id)
    }

    fn supports_lookup(&self) -> bool {
        self.lookup
    }

    async fn find_post(&self, request: &PublishRequest) -> PublishResult<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.lookup_calls += 1;
        if !self.lookup {
            return Ok(None);
        }
        Ok(state.published.get(&request.idempotency_key).cloned())
    }

    async fn fetch_metrics(
        &self,
        _access_token: &AccessToken,
        platform_post_id: &str,
    ) -> PublishResult<PostMetrics> {
        let mut state = self.state.lock().unwrap();
        state.metrics_calls += 1;
        if let Some(error) = &state.metrics_error {
            return Err(error.clone());
        }
        Ok(state
            .metrics
            .get(platform_post_id)
            .cloned()
            .unwrap_or_default())
    }
}
