//! Ingestion pipeline orchestration: crawl, dedupe, geocode, checkpoint and persist.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfeed_adapters::{adapter_for_source, ListingSource};
use jobfeed_core::{sort_by_date_desc, JobListing};
use jobfeed_geocode::{GeocodeResolver, Geocoder, LocationCache, NominatimGeocoder, ResolutionTier};
use jobfeed_storage::{BackoffPolicy, Exhausted, FeedStore, HttpClientConfig, HttpFetcher, HttpGet};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-sync";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const GEOCODER_USER_AGENT: &str = "jobfeed/0.1 (portfolio job map)";

/// What to crawl: one listing source, one keyword, locations in priority order.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRegistry {
    pub source_id: String,
    pub keyword: String,
    pub locations: Vec<String>,
}

impl SearchRegistry {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if registry.locations.is_empty() {
            bail!("{} lists no target locations", path.display());
        }
        Ok(registry)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub jobs_file: PathBuf,
    pub cache_file: PathBuf,
    pub targets_file: PathBuf,
    pub repo_root: PathBuf,
    pub listing_user_agent: String,
    pub geocoder_user_agent: String,
    pub listing_delay: Duration,
    pub geocoder_delay: Duration,
    pub backoff_base: Duration,
    pub network_retry_delay: Duration,
    pub http_timeout: Duration,
    /// Pagination stops once the next offset would reach this value.
    pub max_offset: u32,
    /// Upper bound on external geocoder lookups per run.
    pub geocode_cap: usize,
    /// Persist and synchronise after this many external matches; 0 disables checkpoints.
    pub checkpoint_every: usize,
    pub git_sync_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            jobs_file: PathBuf::from("public/jobs.json"),
            cache_file: PathBuf::from("public/location-cache.json"),
            targets_file: PathBuf::from("targets.yaml"),
            repo_root: PathBuf::from("."),
            listing_user_agent: BROWSER_USER_AGENT.to_string(),
            geocoder_user_agent: GEOCODER_USER_AGENT.to_string(),
            listing_delay: Duration::from_millis(2000),
            geocoder_delay: Duration::from_millis(1100),
            backoff_base: Duration::from_secs(5),
            network_retry_delay: Duration::from_secs(2),
            http_timeout: Duration::from_secs(20),
            max_offset: 1000,
            geocode_cap: 300,
            checkpoint_every: 25,
            git_sync_enabled: false,
            sync_cron_1: "0 0 6 * * *".to_string(),
            sync_cron_2: "0 0 18 * * *".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            jobs_file: env_string("JOBFEED_JOBS_FILE").map(PathBuf::from).unwrap_or(d.jobs_file),
            cache_file: env_string("JOBFEED_CACHE_FILE").map(PathBuf::from).unwrap_or(d.cache_file),
            targets_file: env_string("JOBFEED_TARGETS_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.targets_file),
            repo_root: env_string("JOBFEED_REPO_ROOT").map(PathBuf::from).unwrap_or(d.repo_root),
            listing_user_agent: env_string("JOBFEED_LISTING_USER_AGENT").unwrap_or(d.listing_user_agent),
            geocoder_user_agent: env_string("JOBFEED_GEOCODER_USER_AGENT")
                .unwrap_or(d.geocoder_user_agent),
            listing_delay: env_millis("JOBFEED_LISTING_DELAY_MS").unwrap_or(d.listing_delay),
            geocoder_delay: env_millis("JOBFEED_GEOCODER_DELAY_MS").unwrap_or(d.geocoder_delay),
            backoff_base: env_millis("JOBFEED_BACKOFF_BASE_MS").unwrap_or(d.backoff_base),
            network_retry_delay: env_millis("JOBFEED_NETWORK_RETRY_MS").unwrap_or(d.network_retry_delay),
            http_timeout: env_parse::<u64>("JOBFEED_HTTP_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.http_timeout),
            max_offset: env_parse("JOBFEED_MAX_OFFSET").unwrap_or(d.max_offset),
            geocode_cap: env_parse("JOBFEED_GEOCODE_CAP").unwrap_or(d.geocode_cap),
            checkpoint_every: env_parse("JOBFEED_CHECKPOINT_EVERY").unwrap_or(d.checkpoint_every),
            git_sync_enabled: env_flag("JOBFEED_GIT_SYNC").unwrap_or(d.git_sync_enabled),
            sync_cron_1: env_string("JOBFEED_SYNC_CRON_1").unwrap_or(d.sync_cron_1),
            sync_cron_2: env_string("JOBFEED_SYNC_CRON_2").unwrap_or(d.sync_cron_2),
        }
    }

    pub fn cron_expressions(&self) -> Vec<String> {
        vec![self.sync_cron_1.clone(), self.sync_cron_2.clone()]
    }

    fn http_config(&self, user_agent: &str, min_interval: Duration) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(user_agent.to_string()),
            min_interval,
            backoff: BackoffPolicy {
                base_delay: self.backoff_base,
                network_retry_delay: self.network_retry_delay,
                ..BackoffPolicy::default()
            },
            default_headers: Vec::new(),
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

fn env_flag(name: &str) -> Option<bool> {
    env_string(name).map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

/// Best-effort publication of the feed files between scheduled runs.
#[async_trait]
pub trait SyncPort: Send + Sync {
    async fn synchronize(&self, message: &str) -> Result<()>;
}

#[derive(Default)]
pub struct NoopSync;

#[async_trait]
impl SyncPort for NoopSync {
    async fn synchronize(&self, _message: &str) -> Result<()> {
        Ok(())
    }
}

fn resolve_against(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Pull (rebase), stage the feed files, commit and push with the `git` CLI.
pub struct GitSync {
    repo_root: PathBuf,
    paths: Vec<PathBuf>,
}

impl GitSync {
    pub fn new(repo_root: impl Into<PathBuf>, paths: Vec<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            paths,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .with_context(|| format!("running git {}", args.join(" ")))
    }

    async fn git_checked(&self, args: &[&str]) -> Result<()> {
        let output = self.git(args).await?;
        if !output.status.success() {
            bail!(
                "git {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl SyncPort for GitSync {
    async fn synchronize(&self, message: &str) -> Result<()> {
        self.git_checked(&["pull", "--rebase", "--autostash"]).await?;

        let mut add = vec!["add".to_string(), "--".to_string()];
        add.extend(self.paths.iter().map(|p| p.display().to_string()));
        let add: Vec<&str> = add.iter().map(String::as_str).collect();
        self.git_checked(&add).await?;

        // exit 0 means the index matches HEAD
        if self.git(&["diff", "--cached", "--quiet"]).await?.status.success() {
            info!("feed files unchanged, nothing to commit");
            return Ok(());
        }

        self.git_checked(&["commit", "-m", message]).await?;
        self.git_checked(&["push"]).await?;
        info!(message, "feed files pushed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Crawl, geocode, persist.
    Full,
    CrawlOnly,
    GeocodeOnly,
}

impl RunMode {
    fn crawls(self) -> bool {
        !matches!(self, RunMode::GeocodeOnly)
    }

    fn geocodes(self) -> bool {
        !matches!(self, RunMode::CrawlOnly)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub locations_crawled: usize,
    pub pages_fetched: usize,
    pub pages_skipped: usize,
    pub listings_parsed: usize,
    pub new_listings: usize,
    pub total_listings: usize,
    pub pending_keys: usize,
    pub resolved_from_cache: usize,
    pub resolved_from_gazetteer: usize,
    pub external_lookups: usize,
    pub external_matches: usize,
    pub deferred_keys: usize,
    pub checkpoints: usize,
    pub nothing_to_do: bool,
}

impl SyncRunSummary {
    fn new(run_id: Uuid, mode: RunMode) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            mode,
            started_at: now,
            finished_at: now,
            locations_crawled: 0,
            pages_fetched: 0,
            pages_skipped: 0,
            listings_parsed: 0,
            new_listings: 0,
            total_listings: 0,
            pending_keys: 0,
            resolved_from_cache: 0,
            resolved_from_gazetteer: 0,
            external_lookups: 0,
            external_matches: 0,
            deferred_keys: 0,
            checkpoints: 0,
            nothing_to_do: false,
        }
    }
}

/// Listings sharing one `(company, location)` pair, resolved together.
struct PendingKey {
    company: String,
    location: String,
    members: Vec<usize>,
}

pub struct IngestPipeline {
    config: PipelineConfig,
    registry: SearchRegistry,
    store: FeedStore,
    source: Box<dyn ListingSource>,
    listing_http: Arc<dyn HttpGet>,
    geocoder: Arc<dyn Geocoder>,
    sync: Box<dyn SyncPort>,
}

impl IngestPipeline {
    pub fn new(config: PipelineConfig, registry: SearchRegistry) -> Result<Self> {
        let source = adapter_for_source(&registry.source_id)
            .with_context(|| format!("no adapter registered for {}", registry.source_id))?;
        let listing_http = HttpFetcher::new(
            config.http_config(&config.listing_user_agent, config.listing_delay),
        )
        .context("building listing client")?;
        let geocoder_http = HttpFetcher::new(
            config.http_config(&config.geocoder_user_agent, config.geocoder_delay),
        )
        .context("building geocoder client")?;
        let sync: Box<dyn SyncPort> = if config.git_sync_enabled {
            // git runs inside repo_root; feed paths are relative to the process
            let cwd = std::env::current_dir().context("resolving working directory")?;
            Box::new(GitSync::new(
                config.repo_root.clone(),
                vec![
                    resolve_against(&cwd, &config.jobs_file),
                    resolve_against(&cwd, &config.cache_file),
                ],
            ))
        } else {
            Box::<NoopSync>::default()
        };

        Ok(Self {
            store: FeedStore::new(config.jobs_file.clone(), config.cache_file.clone()),
            source,
            listing_http: Arc::new(listing_http),
            geocoder: Arc::new(NominatimGeocoder::new(Arc::new(geocoder_http))),
            sync,
            config,
            registry,
        })
    }

    pub fn with_listing_http(mut self, http: Arc<dyn HttpGet>) -> Self {
        self.listing_http = http;
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn with_sync(mut self, sync: Box<dyn SyncPort>) -> Self {
        self.sync = sync;
        self
    }

    pub async fn run(&self, mode: RunMode) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        self.run_phases(run_id, mode)
            .instrument(info_span!("ingest_run", %run_id, ?mode))
            .await
    }

    async fn run_phases(&self, run_id: Uuid, mode: RunMode) -> Result<SyncRunSummary> {
        let mut summary = SyncRunSummary::new(run_id, mode);
        info!("starting job feed run");

        let (mut jobs, mut seen) = self.load_listings().await;
        let mut cache = LocationCache::from_map(self.store.load_location_cache().await);

        if mode.crawls() {
            for location in &self.registry.locations {
                self.crawl_location(location, &mut jobs, &mut seen, &mut summary)
                    .await?;
            }
            info!(
                total = jobs.len(),
                new = summary.new_listings,
                "crawl finished"
            );
        }

        if mode.geocodes() {
            let mut resolver = GeocodeResolver::new(cache, self.geocoder.clone())
                .with_external_budget(self.config.geocode_cap);
            let pending = self
                .resolve_listings(&mut jobs, &mut resolver, &mut summary)
                .await?;
            if pending == 0 && mode == RunMode::GeocodeOnly {
                info!("every listing already has coordinates, nothing to do");
                summary.nothing_to_do = true;
                summary.total_listings = jobs.len();
                summary.finished_at = Utc::now();
                return Ok(summary);
            }
            cache = resolver.into_cache();
        }

        sort_by_date_desc(&mut jobs);
        self.store
            .save_all(&jobs, cache.as_map())
            .await
            .context("persisting feed files")?;
        self.publish(&format!(
            "chore(jobs): update feed ({} listings, {} new)",
            jobs.len(),
            summary.new_listings
        ))
        .await;

        summary.total_listings = jobs.len();
        summary.finished_at = Utc::now();
        info!(
            total = summary.total_listings,
            new = summary.new_listings,
            geocoded = summary.external_matches,
            cache_entries = cache.len(),
            path = %self.store.jobs_path().display(),
            "saved job feed"
        );
        Ok(summary)
    }

    /// Prior listings plus the set of ids already taken. Legacy records get an id;
    /// a duplicate id keeps only its first occurrence.
    async fn load_listings(&self) -> (Vec<JobListing>, HashSet<String>) {
        let mut jobs = self.store.load_jobs().await;
        let mut seen = HashSet::with_capacity(jobs.len());
        let before = jobs.len();
        let mut backfilled = 0usize;

        jobs.retain_mut(|job| {
            if job.backfill_id() {
                backfilled += 1;
            }
            seen.insert(job.id.clone())
        });

        if backfilled > 0 {
            info!(backfilled, "derived ids for legacy listings");
        }
        if jobs.len() < before {
            warn!(dropped = before - jobs.len(), "dropped duplicate listings from existing feed");
        }
        (jobs, seen)
    }

    async fn crawl_location(
        &self,
        location: &str,
        jobs: &mut Vec<JobListing>,
        seen: &mut HashSet<String>,
        summary: &mut SyncRunSummary,
    ) -> Result<()> {
        info!(location, "fetching listings for location");
        summary.locations_crawled += 1;
        let page_size = self.source.page_size().max(1);
        let mut offset = 0u32;

        while offset < self.config.max_offset {
            let url = self
                .source
                .search_url(&self.registry.keyword, location, offset)
                .with_context(|| format!("building search url for {location}"))?;

            let resp = match self
                .listing_http
                .fetch_with_policy(&url, self.source.request_headers())
                .await
            {
                Ok(resp) => resp,
                Err(Exhausted::Throttled { status }) => {
                    warn!(location, offset, %status, "listing provider is rate limiting, stopping this location");
                    break;
                }
                Err(Exhausted::Unreachable) => {
                    warn!(location, offset, "no response for page, skipping it");
                    summary.pages_skipped += 1;
                    offset = offset.saturating_add(page_size);
                    continue;
                }
            };
            summary.pages_fetched += 1;

            if !resp.is_success() {
                warn!(location, offset, status = %resp.status, "listing provider returned an error, stopping this location");
                break;
            }
            let html = resp.text();
            if html.trim().is_empty() {
                info!(location, offset, "empty page, no more listings for this location");
                break;
            }

            let listings = self.source.parse_listing(&html)?;
            info!(location, offset, found = listings.len(), "parsed page");
            if listings.is_empty() {
                break;
            }

            summary.listings_parsed += listings.len();
            for listing in listings {
                if seen.insert(listing.id.clone()) {
                    jobs.push(listing);
                    summary.new_listings += 1;
                }
            }

            offset = offset.saturating_add(page_size);
        }
        Ok(())
    }

    /// Returns how many listings lacked coordinates once cached values were applied.
    async fn resolve_listings(
        &self,
        jobs: &mut [JobListing],
        resolver: &mut GeocodeResolver,
        summary: &mut SyncRunSummary,
    ) -> Result<usize> {
        for job in jobs.iter_mut().filter(|j| j.needs_coordinates()) {
            if let Some(coords) = resolver.cache_lookup(&job.company, &job.location) {
                if !coords.is_sentinel() {
                    job.set_coordinates(coords);
                }
            }
        }

        let mut pending: Vec<PendingKey> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        for (idx, job) in jobs.iter().enumerate() {
            if !job.needs_coordinates() {
                continue;
            }
            let key = job.cache_key();
            match by_key.get(&key) {
                Some(&slot) => pending[slot].members.push(idx),
                None => {
                    by_key.insert(key, pending.len());
                    pending.push(PendingKey {
                        company: job.company.clone(),
                        location: job.location.clone(),
                        members: vec![idx],
                    });
                }
            }
        }

        let listings_pending: usize = pending.iter().map(|p| p.members.len()).sum();
        if listings_pending == 0 {
            return Ok(0);
        }
        summary.pending_keys = pending.len();
        info!(listings = listings_pending, keys = pending.len(), "resolving coordinates");

        for key in &pending {
            let Some(resolution) = resolver.resolve(&key.company, &key.location).await else {
                summary.deferred_keys += 1;
                continue;
            };

            for &idx in &key.members {
                jobs[idx].set_coordinates(resolution.coordinates);
            }

            match resolution.tier {
                ResolutionTier::Cache => summary.resolved_from_cache += 1,
                ResolutionTier::Gazetteer => summary.resolved_from_gazetteer += 1,
                ResolutionTier::External => {
                    summary.external_lookups += 1;
                    if !resolution.is_sentinel() {
                        summary.external_matches += 1;
                        if self.config.checkpoint_every > 0
                            && summary.external_matches % self.config.checkpoint_every == 0
                        {
                            self.checkpoint(jobs, resolver.cache(), summary).await?;
                        }
                    }
                }
            }
        }

        info!(
            lookups = summary.external_lookups,
            matches = summary.external_matches,
            gazetteer = summary.resolved_from_gazetteer,
            "geocoding complete"
        );
        if summary.deferred_keys > 0 {
            info!(
                deferred = summary.deferred_keys,
                cap = self.config.geocode_cap,
                "geocode cap reached, remaining locations roll over to the next run"
            );
        }
        Ok(listings_pending)
    }

    /// Persist both files, then publish them. Write failures are fatal; publication
    /// failures are logged and the run carries on.
    async fn checkpoint(
        &self,
        jobs: &[JobListing],
        cache: &LocationCache,
        summary: &mut SyncRunSummary,
    ) -> Result<()> {
        let mut snapshot = jobs.to_vec();
        sort_by_date_desc(&mut snapshot);
        self.store
            .save_all(&snapshot, cache.as_map())
            .await
            .context("persisting checkpoint")?;
        summary.checkpoints += 1;

        let message = format!(
            "chore(jobs): checkpoint {} ({} locations geocoded)",
            summary.checkpoints, summary.external_matches
        );
        self.publish(&message).await;
        info!(checkpoint = summary.checkpoints, "checkpoint written");
        Ok(())
    }

    async fn publish(&self, message: &str) {
        if let Err(err) = self.sync.synchronize(message).await {
            warn!(error = ?err, "feed synchronisation failed, continuing");
        }
    }
}

/// Cron-driven runs. A tick that fires while the previous run is still going is skipped.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>, crons: &[String]) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));

    for cron in crons {
        let pipeline = pipeline.clone();
        let running = running.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let running = running.clone();
            Box::pin(async move {
                let Ok(_guard) = running.try_lock() else {
                    warn!("previous run still in progress, skipping this tick");
                    return;
                };
                match pipeline.run(RunMode::Full).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        total = summary.total_listings,
                        new = summary.new_listings,
                        "scheduled run complete"
                    ),
                    Err(err) => error!(error = ?err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use jobfeed_core::{cache_key, Coordinates};
    use jobfeed_geocode::GeocodeOutcome;
    use jobfeed_storage::{FetchedResponse, LocationCacheMap, StatusCode};

    type Page = Result<FetchedResponse, Exhausted>;
    use tempfile::{tempdir, TempDir};

    const HSR: &str = "HSR Layout, Bengaluru, Karnataka, India";

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/linkedin/sample")
            .join(name);
        std::fs::read_to_string(path).expect("read fixture")
    }

    fn ok_page(body: &str) -> Page {
        Ok(FetchedResponse {
            status: StatusCode::OK,
            final_url: "https://www.linkedin.com/".to_string(),
            body: body.as_bytes().to_vec(),
        })
    }

    /// Serves canned pages keyed by the `start=` offset of the request.
    struct FixturePages {
        pages: HashMap<u32, Page>,
        fallback: Page,
        urls: StdMutex<Vec<String>>,
    }

    impl FixturePages {
        fn new(pages: Vec<(u32, Page)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
                fallback: ok_page(""),
                urls: StdMutex::new(Vec::new()),
            }
        }

        fn always(page: Page) -> Self {
            Self {
                pages: HashMap::new(),
                fallback: page,
                urls: StdMutex::new(Vec::new()),
            }
        }

        fn offline() -> Arc<Self> {
            Arc::new(Self::always(Err(Exhausted::Unreachable)))
        }

        fn requests(&self) -> Vec<String> {
            self.urls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpGet for FixturePages {
        async fn fetch_with_policy(&self, url: &str, _headers: &[(&str, &str)]) -> Page {
            self.urls.lock().unwrap().push(url.to_string());
            let offset = url
                .rsplit("start=")
                .next()
                .and_then(|s| s.parse::<u32>().ok())
                .unwrap_or(0);
            self.pages
                .get(&offset)
                .cloned()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    struct CountingGeocoder {
        calls: AtomicUsize,
        outcome: GeocodeOutcome,
    }

    impl CountingGeocoder {
        fn new(outcome: GeocodeOutcome) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        async fn geocode(&self, _query: &str) -> GeocodeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    #[derive(Default)]
    struct RecordingSync {
        messages: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl SyncPort for RecordingSync {
        async fn synchronize(&self, message: &str) -> Result<()> {
            self.messages.lock().unwrap().push(message.to_string());
            if self.fail {
                bail!("remote rejected push");
            }
            Ok(())
        }
    }

    fn registry(locations: &[&str]) -> SearchRegistry {
        SearchRegistry {
            source_id: "linkedin".to_string(),
            keyword: "Frontend Engineer".to_string(),
            locations: locations.iter().map(ToString::to_string).collect(),
        }
    }

    fn config_in(dir: &TempDir) -> PipelineConfig {
        PipelineConfig {
            jobs_file: dir.path().join("public/jobs.json"),
            cache_file: dir.path().join("public/location-cache.json"),
            repo_root: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        }
    }

    fn store_in(dir: &TempDir) -> FeedStore {
        FeedStore::new(
            dir.path().join("public/jobs.json"),
            dir.path().join("public/location-cache.json"),
        )
    }

    fn listing(id: &str, company: &str, location: &str, date: Option<&str>) -> JobListing {
        JobListing {
            id: id.to_string(),
            title: "Frontend Engineer".to_string(),
            company: company.to_string(),
            location: location.to_string(),
            date: date.map(ToString::to_string),
            link: format!("https://in.linkedin.com/jobs/view/{id}"),
            logo: None,
            lat: 0.0,
            lng: 0.0,
        }
    }

    fn pipeline(
        config: PipelineConfig,
        locations: &[&str],
        pages: Arc<FixturePages>,
        geocoder: Arc<CountingGeocoder>,
    ) -> IngestPipeline {
        IngestPipeline::new(config, registry(locations))
            .unwrap()
            .with_listing_http(pages)
            .with_geocoder(geocoder)
    }

    #[tokio::test]
    async fn two_page_crawl_stops_after_empty_page() {
        let dir = tempdir().unwrap();
        let pages = Arc::new(FixturePages::new(vec![
            (0, ok_page(&fixture("page-1.html"))),
            (25, ok_page(&fixture("page-2.html"))),
        ]));
        let geocoder = CountingGeocoder::new(GeocodeOutcome::NotFound);
        let p = pipeline(config_in(&dir), &[HSR], pages.clone(), geocoder.clone());

        let summary = p.run(RunMode::Full).await.unwrap();

        let requests = pages.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].ends_with("start=0"));
        assert!(requests[1].ends_with("start=25"));
        assert_eq!(summary.new_listings, 3);
        assert_eq!(summary.total_listings, 3);

        let saved = store_in(&dir).load_jobs().await;
        assert_eq!(saved.len(), 3);
        let companies: Vec<_> = saved.iter().map(|j| j.company.as_str()).collect();
        assert_eq!(companies, vec!["Globex", "Acme Labs", "Initech"]);

        // HSR and Koramangala come from the gazetteer; only Initech goes external.
        assert_eq!(summary.resolved_from_gazetteer, 2);
        assert_eq!(geocoder.calls(), 1);
        assert!(saved[0].coordinates().is_some());
        assert!(saved[2].coordinates().is_none());

        let cache = store_in(&dir).load_location_cache().await;
        assert_eq!(
            cache.get("Initech, Bengaluru East, Karnataka, India"),
            Some(&Coordinates::SENTINEL)
        );
    }

    #[tokio::test]
    async fn previously_seen_ids_are_not_duplicated() {
        let dir = tempdir().unwrap();
        let mut known = listing("urn:li:jobPosting:3812345601", "Acme Labs", HSR, Some("2024-01-02"));
        known.set_coordinates(Coordinates::new(12.5, 77.5));
        store_in(&dir).save_jobs(&[known]).await.unwrap();

        let pages = Arc::new(FixturePages::new(vec![(0, ok_page(&fixture("page-1.html")))]));
        let p = pipeline(
            config_in(&dir),
            &[HSR, "Bengaluru, Karnataka, India"],
            pages,
            CountingGeocoder::new(GeocodeOutcome::NotFound),
        );

        let summary = p.run(RunMode::CrawlOnly).await.unwrap();

        assert_eq!(summary.new_listings, 2);
        let saved = store_in(&dir).load_jobs().await;
        assert_eq!(saved.len(), 3);
        let ids: HashSet<_> = saved.iter().map(|j| j.id.clone()).collect();
        assert_eq!(ids.len(), saved.len());
        let acme = saved.iter().find(|j| j.company == "Acme Labs").unwrap();
        assert_eq!(acme.coordinates(), Some(Coordinates::new(12.5, 77.5)));
    }

    #[tokio::test]
    async fn rate_limited_location_is_abandoned_and_next_one_crawled() {
        let dir = tempdir().unwrap();
        let pages = Arc::new(FixturePages::always(Err(Exhausted::Throttled {
            status: StatusCode::TOO_MANY_REQUESTS,
        })));
        let p = pipeline(
            config_in(&dir),
            &[HSR, "Bengaluru, Karnataka, India"],
            pages.clone(),
            CountingGeocoder::new(GeocodeOutcome::NotFound),
        );

        let summary = p.run(RunMode::CrawlOnly).await.unwrap();

        assert_eq!(pages.requests().len(), 2);
        assert_eq!(summary.locations_crawled, 2);
        assert_eq!(summary.total_listings, 0);
    }

    #[tokio::test]
    async fn page_without_response_is_skipped_and_pagination_continues() {
        let dir = tempdir().unwrap();
        let pages = Arc::new(FixturePages::new(vec![
            (0, Err(Exhausted::Unreachable)),
            (25, ok_page(&fixture("page-1.html"))),
        ]));
        let p = pipeline(
            config_in(&dir),
            &[HSR],
            pages.clone(),
            CountingGeocoder::new(GeocodeOutcome::NotFound),
        );

        let summary = p.run(RunMode::CrawlOnly).await.unwrap();

        let requests = pages.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].ends_with("start=25"));
        assert!(requests[2].ends_with("start=50"));
        assert_eq!(summary.pages_skipped, 1);
        assert_eq!(summary.total_listings, 3);
    }

    #[tokio::test]
    async fn finished_run_publishes_feed_without_a_checkpoint() {
        let dir = tempdir().unwrap();
        let messages = Arc::new(StdMutex::new(Vec::new()));
        let sync = RecordingSync {
            messages: messages.clone(),
            fail: false,
        };
        let pages = Arc::new(FixturePages::new(vec![(0, ok_page(&fixture("page-1.html")))]));
        let geocoder = CountingGeocoder::new(GeocodeOutcome::Found(Coordinates::new(12.99, 77.7)));
        let p = pipeline(config_in(&dir), &[HSR], pages, geocoder).with_sync(Box::new(sync));

        let summary = p.run(RunMode::Full).await.unwrap();

        assert_eq!(summary.new_listings, 3);
        assert_eq!(summary.external_matches, 1);
        assert_eq!(summary.checkpoints, 0);
        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].contains("3 new"));
    }

    #[tokio::test]
    async fn error_status_ends_pagination() {
        let dir = tempdir().unwrap();
        let pages = Arc::new(FixturePages::always(Ok(FetchedResponse {
            status: StatusCode::BAD_REQUEST,
            final_url: "https://www.linkedin.com/".to_string(),
            body: Vec::new(),
        })));
        let p = pipeline(
            config_in(&dir),
            &[HSR],
            pages.clone(),
            CountingGeocoder::new(GeocodeOutcome::NotFound),
        );

        p.run(RunMode::CrawlOnly).await.unwrap();

        assert_eq!(pages.requests().len(), 1);
    }

    #[tokio::test]
    async fn pagination_stops_at_offset_ceiling() {
        let dir = tempdir().unwrap();
        let pages = Arc::new(FixturePages::always(ok_page(&fixture("page-1.html"))));
        let config = PipelineConfig {
            max_offset: 75,
            ..config_in(&dir)
        };
        let p = pipeline(config, &[HSR], pages.clone(), CountingGeocoder::new(GeocodeOutcome::NotFound));

        let summary = p.run(RunMode::CrawlOnly).await.unwrap();

        assert_eq!(pages.requests().len(), 3);
        assert_eq!(summary.listings_parsed, 9);
        assert_eq!(summary.total_listings, 3);
    }

    #[tokio::test]
    async fn checkpoints_fire_per_batch_and_survive_sync_failure() {
        let dir = tempdir().unwrap();
        let jobs = vec![
            listing("1", "Acme", "Pune, Maharashtra, India", Some("2024-01-01")),
            listing("2", "Globex", "Chennai, Tamil Nadu, India", Some("2024-01-03")),
            listing("3", "Initech", "Hyderabad, Telangana, India", None),
        ];
        store_in(&dir).save_jobs(&jobs).await.unwrap();

        let messages = Arc::new(StdMutex::new(Vec::new()));
        let sync = RecordingSync {
            messages: messages.clone(),
            fail: true,
        };
        let config = PipelineConfig {
            checkpoint_every: 2,
            ..config_in(&dir)
        };
        let geocoder = CountingGeocoder::new(GeocodeOutcome::Found(Coordinates::new(17.5, 78.5)));
        let p = pipeline(config, &[HSR], FixturePages::offline(), geocoder.clone())
            .with_sync(Box::new(sync));

        let summary = p.run(RunMode::GeocodeOnly).await.unwrap();

        assert_eq!(geocoder.calls(), 3);
        assert_eq!(summary.external_matches, 3);
        assert_eq!(summary.checkpoints, 1);
        // one checkpoint plus the end-of-run publish
        assert_eq!(messages.lock().unwrap().len(), 2);

        let saved = store_in(&dir).load_jobs().await;
        assert!(saved.iter().all(|j| j.coordinates().is_some()));
        assert_eq!(saved[0].id, "2");
        assert_eq!(store_in(&dir).load_location_cache().await.len(), 3);
    }

    #[tokio::test]
    async fn geocode_cap_defers_remaining_keys() {
        let dir = tempdir().unwrap();
        let jobs = vec![
            listing("1", "Acme", "Pune, Maharashtra, India", None),
            listing("2", "Acme", "Pune, Maharashtra, India", None),
            listing("3", "Globex", "Chennai, Tamil Nadu, India", None),
        ];
        store_in(&dir).save_jobs(&jobs).await.unwrap();
        let config = PipelineConfig {
            geocode_cap: 1,
            ..config_in(&dir)
        };
        let geocoder = CountingGeocoder::new(GeocodeOutcome::Found(Coordinates::new(18.5, 73.8)));
        let p = pipeline(config, &[HSR], FixturePages::offline(), geocoder.clone());

        let summary = p.run(RunMode::GeocodeOnly).await.unwrap();

        assert_eq!(geocoder.calls(), 1);
        assert_eq!(summary.pending_keys, 2);
        assert_eq!(summary.deferred_keys, 1);
        let saved = store_in(&dir).load_jobs().await;
        let pune: Vec<_> = saved.iter().filter(|j| j.company == "Acme").collect();
        assert!(pune.iter().all(|j| j.coordinates() == Some(Coordinates::new(18.5, 73.8))));
        let cache = store_in(&dir).load_location_cache().await;
        assert!(!cache.contains_key(&cache_key("Globex", "Chennai, Tamil Nadu, India")));
    }

    #[tokio::test]
    async fn sentinel_in_cache_file_prevents_requery_across_runs() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        store
            .save_jobs(&[listing("1", "Nowhere Inc", "Atlantis", None)])
            .await
            .unwrap();
        let mut cache = LocationCacheMap::new();
        cache.insert(cache_key("Nowhere Inc", "Atlantis"), Coordinates::SENTINEL);
        store.save_location_cache(&cache).await.unwrap();

        let geocoder = CountingGeocoder::new(GeocodeOutcome::Found(Coordinates::new(1.0, 1.0)));
        let p = pipeline(config_in(&dir), &[HSR], FixturePages::offline(), geocoder.clone());

        let summary = p.run(RunMode::GeocodeOnly).await.unwrap();

        assert_eq!(geocoder.calls(), 0);
        assert_eq!(summary.resolved_from_cache, 1);
    }

    #[tokio::test]
    async fn geocode_only_with_nothing_pending_leaves_files_alone() {
        let dir = tempdir().unwrap();
        let store = store_in(&dir);
        let mut placed = listing("1", "Acme", "Pune", None);
        placed.set_coordinates(Coordinates::new(18.5, 73.8));
        store.save_jobs(&[placed]).await.unwrap();
        let before = std::fs::read(store.jobs_path()).unwrap();

        let geocoder = CountingGeocoder::new(GeocodeOutcome::NotFound);
        let p = pipeline(config_in(&dir), &[HSR], FixturePages::offline(), geocoder.clone());

        let summary = p.run(RunMode::GeocodeOnly).await.unwrap();

        assert!(summary.nothing_to_do);
        assert_eq!(geocoder.calls(), 0);
        assert_eq!(std::fs::read(store.jobs_path()).unwrap(), before);
        assert!(!store.cache_path().exists());
    }

    #[tokio::test]
    async fn repository_targets_file_loads_in_priority_order() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../targets.yaml");
        let registry = SearchRegistry::load(path).await.unwrap();
        assert_eq!(registry.source_id, "linkedin");
        assert_eq!(registry.locations.first().map(String::as_str), Some(HSR));
        assert_eq!(
            registry.locations.last().map(String::as_str),
            Some("Bengaluru, Karnataka, India")
        );
    }

    #[tokio::test]
    async fn unknown_source_is_rejected() {
        let mut registry = registry(&[HSR]);
        registry.source_id = "monster".to_string();
        assert!(IngestPipeline::new(PipelineConfig::default(), registry).is_err());
    }

    #[tokio::test]
    async fn git_sync_outside_a_repository_fails() {
        let dir = tempdir().unwrap();
        let sync = GitSync::new(dir.path(), vec![PathBuf::from("jobs.json")]);
        assert!(sync.synchronize("chore(jobs): test").await.is_err());
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let out = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    fn remote_commit_count(remote: &Path) -> usize {
        git(remote, &["rev-list", "--all", "--count"]).parse().unwrap()
    }

    #[tokio::test]
    async fn git_sync_pushes_changes_and_skips_clean_index() {
        let dir = tempdir().unwrap();
        let remote = dir.path().join("remote.git");
        let work = dir.path().join("work");
        git(dir.path(), &["init", "--bare", "remote.git"]);
        git(dir.path(), &["clone", "remote.git", "work"]);
        git(&work, &["config", "user.name", "Feed Bot"]);
        git(&work, &["config", "user.email", "feed-bot@example.com"]);
        git(&work, &["config", "commit.gpgsign", "false"]);
        std::fs::write(work.join("README.md"), "feed\n").unwrap();
        git(&work, &["add", "README.md"]);
        git(&work, &["commit", "-m", "initial"]);
        git(&work, &["push", "-u", "origin", "HEAD"]);
        assert_eq!(remote_commit_count(&remote), 1);

        let jobs_file = work.join("public/jobs.json");
        let cache_file = work.join("public/location-cache.json");
        let store = FeedStore::new(&jobs_file, &cache_file);
        store
            .save_all(&[listing("1", "Acme", "Pune", None)], &LocationCacheMap::new())
            .await
            .unwrap();

        let sync = GitSync::new(&work, vec![jobs_file, cache_file]);
        sync.synchronize("chore(jobs): update feed").await.unwrap();

        assert_eq!(remote_commit_count(&remote), 2);
        assert_eq!(
            git(&remote, &["log", "-1", "--format=%s", "--all"]),
            "chore(jobs): update feed"
        );

        sync.synchronize("chore(jobs): update feed again").await.unwrap();
        assert_eq!(remote_commit_count(&remote), 2);
    }

    #[test]
    fn relative_feed_paths_resolve_against_working_directory() {
        let cwd = Path::new("/srv/site");
        assert_eq!(
            resolve_against(cwd, Path::new("public/jobs.json")),
            PathBuf::from("/srv/site/public/jobs.json")
        );
        assert_eq!(
            resolve_against(cwd, Path::new("/data/jobs.json")),
            PathBuf::from("/data/jobs.json")
        );
    }
}
