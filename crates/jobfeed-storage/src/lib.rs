//! Rate-limited HTTP fetching and flat-file persistence for the job feed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use jobfeed_core::{Coordinates, JobListing};
pub use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-storage";

/// On-disk shape of the location cache: `"{company}, {location}"` -> coordinates.
pub type LocationCacheMap = BTreeMap<String, Coordinates>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Only throttling and temporary unavailability are worth waiting out.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts per call, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fixed wait after a transport failure (no response at all).
    pub network_retry_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            network_retry_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
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
    /// Minimum spacing between the starts of two consecutive requests.
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            min_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            default_headers: Vec::new(),
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
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Throttled { status: StatusCode, url: String },
}

/// Why a fetch produced no response once every attempt was spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exhausted {
    /// The last attempt was still answered with 429/503.
    #[error("still throttled (http {status}) after retries")]
    Throttled { status: StatusCode },
    /// The last attempt got no response at all.
    #[error("no response after retries")]
    Unreachable,
}

/// Outbound GET with pacing and retry applied.
///
/// Implementations never fail past this boundary with a transport error: an
/// `Err` means every attempt was exhausted and the caller should skip the unit
/// of work and keep going.
#[async_trait]
pub trait HttpGet: Send + Sync {
    async fn fetch_with_policy(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, Exhausted>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    backoff: BackoffPolicy,
    default_headers: Vec<(String, String)>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            min_interval: config.min_interval,
            last_request: Mutex::new(None),
            backoff: config.backoff,
            default_headers: config.default_headers,
        })
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn send_once(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in &self.default_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if classify_status(status) == RetryDisposition::Retryable {
            return Err(FetchError::Throttled {
                status,
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, Exhausted> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last = Exhausted::Unreachable;

        for attempt in 1..=max_attempts {
            self.pace().await;

            let wait = match self.send_once(url, headers).await {
                Ok(resp) => {
                    debug!(status = %resp.status, bytes = resp.body.len(), attempt, "fetched");
                    return Ok(resp);
                }
                Err(FetchError::Throttled { status, url: final_url }) => {
                    warn!(%status, final_url = %final_url, attempt, max_attempts, "throttled by remote");
                    last = Exhausted::Throttled { status };
                    self.backoff.delay_for_attempt(attempt - 1)
                }
                Err(err) => {
                    warn!(error = %err, attempt, max_attempts, "request failed without a response");
                    last = Exhausted::Unreachable;
                    self.backoff.network_retry_delay
                }
            };

            if attempt < max_attempts {
                tokio::time::sleep(wait).await;
            }
        }

        warn!(attempts = max_attempts, reason = %last, "giving up after exhausting retries");
        Err(last)
    }
}

#[async_trait]
impl HttpGet for HttpFetcher {
    async fn fetch_with_policy(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, Exhausted> {
        self.fetch_with_retries(url, headers)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// The two flat files the pipeline owns: the listing feed and the location cache.
///
/// Both are read whole at start-up and rewritten whole at checkpoints. There is
/// no locking; runs must not overlap.
#[derive(Debug, Clone)]
pub struct FeedStore {
    jobs_path: PathBuf,
    cache_path: PathBuf,
}

impl FeedStore {
    pub fn new(jobs_path: impl Into<PathBuf>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            jobs_path: jobs_path.into(),
            cache_path: cache_path.into(),
        }
    }

    pub fn jobs_path(&self) -> &Path {
        &self.jobs_path
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Prior listings; a missing or unreadable file yields an empty feed.
    pub async fn load_jobs(&self) -> Vec<JobListing> {
        match try_load_json::<Vec<JobListing>>(&self.jobs_path).await {
            Ok(Some(jobs)) => {
                info!(count = jobs.len(), path = %self.jobs_path.display(), "loaded existing listings");
                jobs
            }
            Ok(None) => {
                info!(path = %self.jobs_path.display(), "no listing file yet, starting empty");
                Vec::new()
            }
            Err(err) => {
                warn!(error = %err, "could not read existing listings, starting fresh");
                Vec::new()
            }
        }
    }

    pub async fn load_location_cache(&self) -> LocationCacheMap {
        match try_load_json::<LocationCacheMap>(&self.cache_path).await {
            Ok(Some(cache)) => {
                info!(entries = cache.len(), path = %self.cache_path.display(), "loaded location cache");
                cache
            }
            Ok(None) => {
                info!(path = %self.cache_path.display(), "no location cache yet, starting empty");
                LocationCacheMap::new()
            }
            Err(err) => {
                warn!(error = %err, "could not parse location cache, starting fresh");
                LocationCacheMap::new()
            }
        }
    }

    pub async fn save_jobs(&self, jobs: &[JobListing]) -> anyhow::Result<()> {
        write_json_atomic(&self.jobs_path, jobs).await
    }

    pub async fn save_location_cache(&self, cache: &LocationCacheMap) -> anyhow::Result<()> {
        write_json_atomic(&self.cache_path, cache).await
    }

    pub async fn save_all(&self, jobs: &[JobListing], cache: &LocationCacheMap) -> anyhow::Result<()> {
        self.save_jobs(jobs).await?;
        self.save_location_cache(cache).await?;
        debug!(jobs = jobs.len(), cache_entries = cache.len(), "persisted feed files");
        Ok(())
    }
}

async fn try_load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Pretty-print (two-space indent) to a temp file beside `path`, then rename over it.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
