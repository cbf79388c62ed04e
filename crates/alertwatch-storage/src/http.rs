use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode, Url};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Capped exponential backoff shared by request retries and structural re-requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    /// Politeness limit applied per target host. Requests from different
    /// adapters hitting the same host share one bucket.
    pub per_host: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            per_host: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if self.refill_every.is_zero() {
                state.tokens = self.capacity;
            } else if elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_until = state.last_refill + self.refill_every;
            drop(state);
            tokio::time::sleep_until(sleep_until).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url {0:?}")]
    InvalidUrl(String),
}

/// The two request shapes the adapters need. `HttpFetcher` is the production
/// implementation; tests substitute canned pages.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn get(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError>;

    async fn post_form(
        &self,
        source_id: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    per_host_config: Option<TokenBucketConfig>,
    per_host: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        // ASP.NET sessions pair the view state with a session cookie.
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            per_host_config: config.per_host,
            per_host: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn host_bucket(&self, url: &Url) -> Option<Arc<SimpleTokenBucket>> {
        let config = self.per_host_config?;
        let host = url.host_str()?.to_ascii_lowercase();
        let mut map = self.per_host.lock().await;
        Some(
            map.entry(host)
                .or_insert_with(|| Arc::new(SimpleTokenBucket::new(config)))
                .clone(),
        )
    }

    async fn send_with_retries<F>(&self, url: &Url, build: F) -> Result<FetchedResponse, FetchError>
    where
        F: Fn() -> RequestBuilder,
    {
        let bucket = self.host_bucket(url).await;
        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &bucket {
                bucket.take().await;
            }

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))
}

#[async_trait]
impl PageTransport for HttpFetcher {
    async fn get(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let parsed = parse_url(url)?;
        let span = info_span!("http_get", source_id, url);
        self.send_with_retries(&parsed, || self.client.get(parsed.clone()))
            .instrument(span)
            .await
    }

    async fn post_form(
        &self,
        source_id: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let parsed = parse_url(url)?;
        let span = info_span!("http_post_form", source_id, url, fields = form.len());
        self.send_with_retries(&parsed, || self.client.post(parsed.clone()).form(form))
            .instrument(span)
            .await
    }
}
