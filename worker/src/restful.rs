//! Pool HTTP client: block fetch and key-batch submission, with the
//! response-code classification the orchestration loop acts on.

use std::time::Duration;

use async_trait::async_trait;
use shared::{
    interaction::{ApiError, BlockResponse, SubmitKeys},
    types::{Address, BlockAssignment, KeyRange, PrivateKey},
    utils::snippet,
};
use tracing::*;

use crate::config::{Config, RejectionMatcher};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = "gpu-pool-worker/1.3";

/// Extra attempts for a submission the pool called incompatible before
/// the batch is given up on.
const INCOMPATIBLE_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Block(BlockAssignment),
    /// Terminal: the pool reports every block solved.
    AllSolved,
    /// 409 without the all-solved marker; retryable.
    NoRange(String),
    /// 5xx or connection failure; retryable with longer backoff.
    Offline(String),
    /// Any other non-200 outcome; retryable.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// 5xx; transient, caller keeps the batch.
    Offline(String),
    /// The pool rejected the batch as belonging to a stale or foreign
    /// block, repeatedly. The whole ledger must be discarded.
    Incompatible,
    /// The pool has no active block for this worker.
    NoTargetBlock(String),
    /// Connection-level failure; caller keeps the batch.
    NetworkError(String),
    /// Generic rejection; caller keeps the batch.
    Error(String),
}

#[async_trait]
pub trait PoolClient: Send + Sync {
    async fn fetch_block(&self) -> FetchOutcome;
    async fn submit_keys(&self, keys: &[PrivateKey]) -> SubmitOutcome;
}

pub struct PoolApi {
    url: String,
    token: String,
    block_length: Option<String>,
    matcher: RejectionMatcher,
    client: reqwest::Client,
}

impl PoolApi {
    pub fn new(config: &Config) -> PoolApi {
        PoolApi {
            url: config.api_url.trim_end_matches('/').to_string(),
            token: config.pool_token.clone(),
            block_length: config.block_length.clone(),
            matcher: config.matcher.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn submit_url(&self) -> String {
        format!("{}/submit", self.url)
    }

    async fn post_batch(&self, payload: &SubmitKeys) -> Result<reqwest::Response, reqwest::Error> {
        self.client
            .post(self.submit_url())
            .header("pool-token", &self.token)
            .header("ngrok-skip-browser-warning", "true")
            .header("User-Agent", USER_AGENT)
            .timeout(SUBMIT_TIMEOUT)
            .json(payload)
            .send()
            .await
    }
}

#[async_trait]
impl PoolClient for PoolApi {
    async fn fetch_block(&self) -> FetchOutcome {
        info!("fetching block from {}", self.url);
        let mut request = self
            .client
            .get(&self.url)
            .header("pool-token", &self.token)
            .header("ngrok-skip-browser-warning", "true")
            .header("User-Agent", USER_AGENT)
            .timeout(FETCH_TIMEOUT);
        if let Some(length) = &self.block_length {
            request = request.query(&[("length", length.as_str())]);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => return FetchOutcome::Offline(format!("connection error: {err}")),
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status.as_u16() == 200 {
            let block: BlockResponse = match serde_json::from_str(&text) {
                Ok(block) => block,
                Err(err) => {
                    return FetchOutcome::Error(format!(
                        "invalid block response: {err}, body: {}",
                        snippet(&text, 120)
                    ))
                }
            };
            let range = match KeyRange::from_hex(&block.range.start, &block.range.end) {
                Some(range) => range,
                None => return FetchOutcome::Error("block range is not valid hex".to_string()),
            };
            return FetchOutcome::Block(BlockAssignment {
                addresses: block.checkwork_addresses.into_iter().map(Address).collect(),
                range,
            });
        }

        if status.as_u16() == 409 {
            let message = serde_json::from_str::<ApiError>(&text)
                .map(|e| e.error)
                .unwrap_or_else(|_| text.trim().to_string());
            if message.trim().to_lowercase() == "all blocks are solved" {
                return FetchOutcome::AllSolved;
            }
            return FetchOutcome::NoRange(message);
        }

        if status.is_server_error() {
            return FetchOutcome::Offline(format!("server error {status}"));
        }

        FetchOutcome::Error(format!("status {status}, body: {}", snippet(&text, 120)))
    }

    async fn submit_keys(&self, keys: &[PrivateKey]) -> SubmitOutcome {
        let payload = SubmitKeys {
            private_keys: keys.iter().map(|k| k.as_str().to_string()).collect(),
        };
        info!("posting batch of {} private keys", keys.len());

        let response = match self.post_batch(&payload).await {
            Ok(response) => response,
            Err(err) => return SubmitOutcome::NetworkError(format!("{err}")),
        };

        let status = response.status();
        if status.as_u16() == 200 {
            return SubmitOutcome::Accepted;
        }

        let text = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            warn!("submit failed with {status}: {}", snippet(&text, 120));
            return SubmitOutcome::Offline(format!("server error {status}"));
        }

        if self.matcher.is_incompatible(&text) {
            // the rejection is sometimes spurious; the same payload can
            // go through on a later attempt
            for attempt in 1..=INCOMPATIBLE_RETRIES {
                warn!("incompatible batch, retry {attempt}/{INCOMPATIBLE_RETRIES}");
                if let Ok(retry) = self.post_batch(&payload).await {
                    if retry.status().as_u16() == 200 {
                        return SubmitOutcome::Accepted;
                    }
                }
            }
            error!("pool reports incompatible private keys after retries");
            return SubmitOutcome::Incompatible;
        }

        if self.matcher.is_no_block(&text) {
            return SubmitOutcome::NoTargetBlock(snippet(&text, 120));
        }

        SubmitOutcome::Error(format!("status {status}, body: {}", snippet(&text, 120)))
    }
}
