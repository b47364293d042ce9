//! Harvest orchestration
//!
//! One sequential control loop per source:
//! - rate-limiter gate, then page load with retry
//! - extraction and dedup admission
//! - contacts, stats and cursor committed together before moving on
//! - circuit evaluation and budget check after every page
//!
//! A page's contacts and the cursor past it are committed as one unit, so
//! a crash or cancellation at any point resumes from the last complete
//! page and refetched pages are counted exactly once.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::Config;
use crate::dedup::{Admission, DedupGate, DomainBlocklist};
use crate::driver::http::HttpDriverConfig;
use crate::driver::{
    load_page, BlockDetector, BrowserlessPageDriver, FetchOptions, HttpPageDriver, PageDriver, PageRequest,
    RenderedPage, RoutingPageDriver,
};
use crate::error::{ErrorKind, FetchError, HarvestError, Result};
use crate::extractor::{self, Extraction};
use crate::metrics::{self, FetchTimer};
use crate::notifier::{self, notify_quietly, LogNotifier, Notifier};
use crate::pattern::{PaginationStrategy, PatternEntry, PatternRegistry};
use crate::progress::{self, FailedPage, ProgressTracker};
use crate::rate_limiter::{DelayProfile, SourceRateLimiter};
use crate::schemas::{CandidateRecord, CircuitState, ContactRecord, ProgressCursor, RunOutcome, RunSummary, SourceStats};
use crate::store::{self, PersistenceSink};

/// Retry schedule for failed page loads
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after a timeout or connection failure
    pub transient_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            transient_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(15000),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.5)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Tunables shared by every source run
#[derive(Debug, Clone)]
pub struct HarvesterSettings {
    pub delays: DelayProfile,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub notify_timeout: Duration,
}

impl Default for HarvesterSettings {
    fn default() -> Self {
        Self {
            delays: DelayProfile::from_millis(1750, 1000),
            request_timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
            breaker: CircuitBreakerConfig::default(),
            notify_timeout: Duration::from_secs(10),
        }
    }
}

impl HarvesterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            delays: DelayProfile::from_millis(config.base_delay_ms, config.jitter_ms),
            request_timeout: config.request_timeout(),
            retry: RetryPolicy {
                transient_retries: config.transient_retries,
                initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
                max_delay: Duration::from_millis(config.retry_max_delay_ms),
            },
            breaker: CircuitBreakerConfig {
                empty_threshold: config.empty_threshold,
                purge_policy: config.purge_policy,
            },
            notify_timeout: Duration::from_secs(config.notify_timeout_secs),
        }
    }
}

/// Per-invocation options
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Page loads allowed in this invocation
    pub max_urls: u32,
    /// Skip every write: contacts, cursor, stats, trip side effects
    pub dry_run: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_urls: 100,
            dry_run: false,
        }
    }
}

/// Everything `status` reports for one source
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub pattern: PatternEntry,
    pub cursor: ProgressCursor,
    pub stats: SourceStats,
    pub contacts: u64,
}

enum PageLoad {
    Loaded(RenderedPage),
    /// Retries used up; counts as an empty observation
    Failed(FetchError),
    Blocked(FetchError),
    Cancelled,
}

/// What one processed URL contributes to stats and the corpus
struct Observation {
    admitted: Vec<ContactRecord>,
    /// No candidate passed validation
    empty: bool,
    records: usize,
    paused: bool,
}

/// Contact harvester with politeness, dedup and circuit breaking
pub struct Harvester {
    run_id: String,
    settings: HarvesterSettings,
    sink: Arc<dyn PersistenceSink>,
    registry: PatternRegistry,
    driver: Arc<dyn PageDriver>,
    rate_limiter: SourceRateLimiter,
    blocklist: DomainBlocklist,
    progress: ProgressTracker,
    breaker: CircuitBreaker,
    notifier: Box<dyn Notifier>,
}

impl Harvester {
    pub fn new(
        run_id: &str,
        sink: Arc<dyn PersistenceSink>,
        driver: Arc<dyn PageDriver>,
        blocklist: DomainBlocklist,
        settings: HarvesterSettings,
    ) -> Self {
        let registry = PatternRegistry::new(sink.clone());
        Self {
            run_id: run_id.to_string(),
            rate_limiter: SourceRateLimiter::new(settings.delays),
            progress: ProgressTracker::new(sink.clone()),
            breaker: CircuitBreaker::new(settings.breaker.clone(), sink.clone(), registry.clone()),
            registry,
            sink,
            driver,
            blocklist,
            settings,
            notifier: Box::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Wires sink, drivers and notifier from configuration
    #[instrument(skip(config), fields(run_id = %run_id))]
    pub async fn from_config(config: &Config, run_id: &str) -> Result<Self> {
        info!("Initializing harvester...");

        let sink = store::create_sink(config).await?;

        let http = HttpPageDriver::new(HttpDriverConfig {
            user_agent: config.user_agent.clone(),
            challenge_markers: config.captcha_markers.clone(),
            block_status_streak: config.block_status_streak,
            ..Default::default()
        })?;

        let browser: Option<Arc<dyn PageDriver>> = match config.browserless_url.as_deref() {
            Some(url) => {
                let detector = BlockDetector::new(&config.captcha_markers, config.block_status_streak);
                let driver = BrowserlessPageDriver::new(url, config.browserless_token.as_deref(), detector)?;
                info!(url = %url, "Browser driver initialized");
                Some(Arc::new(driver) as Arc<dyn PageDriver>)
            }
            None => {
                info!("No BROWSERLESS_URL configured, browser-rendered sources unavailable");
                None
            }
        };
        let driver = Arc::new(RoutingPageDriver::new(Arc::new(http), browser));

        let domains = config
            .load_domain_blocklist()
            .map_err(|e| HarvestError::InvalidConfig(format!("failed to load domain blocklist: {}", e)))?;
        let blocklist = DomainBlocklist::new(domains);
        info!(blocked_domains = blocklist.len(), "Domain blocklist loaded");

        let renders_js = driver.renders_js();
        let harvester = Self::new(run_id, sink, driver, blocklist, HarvesterSettings::from_config(config))
            .with_notifier(notifier::from_config(config.notify_webhook_url.as_deref()));

        if !renders_js {
            for pattern in harvester.registry.list().await? {
                if pattern.needs_browser() && pattern.is_productive() {
                    warn!(
                        source = %pattern.source_id,
                        "Source needs a browser driver and will be skipped until BROWSERLESS_URL is set"
                    );
                }
            }
        }
        Ok(harvester)
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    pub fn sink(&self) -> &Arc<dyn PersistenceSink> {
        &self.sink
    }

    /// Harvests every registered source, one after another
    #[instrument(skip(self, cancel), fields(run_id = %self.run_id))]
    pub async fn run_all(&self, options: RunOptions, cancel: &CancellationToken) -> Result<Vec<RunSummary>> {
        let patterns = self.registry.list().await?;
        info!(sources = patterns.len(), "Harvesting all sources");

        let mut summaries = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            if cancel.is_cancelled() {
                info!("Cancelled, skipping remaining sources");
                break;
            }
            match self.run_source(&pattern.source_id, options, cancel).await {
                Ok(summary) => summaries.push(summary),
                // One misconfigured source must not stop the others
                Err(HarvestError::InvalidConfig(reason)) => {
                    warn!(source = %pattern.source_id, reason = %reason, "Skipping source");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summaries)
    }

    /// Harvests one source until its budget, exhaustion, a trip, a block,
    /// a persistently failing page, or cancellation. Persistence failures
    /// and a source this configuration cannot fetch surface as `Err`.
    #[instrument(skip(self, cancel), fields(run_id = %self.run_id))]
    pub async fn run_source(&self, source_id: &str, options: RunOptions, cancel: &CancellationToken) -> Result<RunSummary> {
        let mut summary = RunSummary::new(&self.run_id, source_id, options.dry_run);

        let outcome = match self.harvest(source_id, options, &mut summary, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(source = %source_id, error = %e, "Run aborted");
                if matches!(e, HarvestError::Persistence(_) | HarvestError::DatabaseError(_) | HarvestError::IoError(_)) {
                    metrics::record_error(source_id, ErrorKind::PersistenceFailure.as_str());
                }
                return Err(e);
            }
        };

        summary.finish(outcome);
        metrics::record_run(source_id, outcome.as_str());
        info!(
            source = %source_id,
            outcome = outcome.as_str(),
            urls_visited = summary.urls_visited,
            contacts_found = summary.contacts_found,
            duplicates = summary.duplicates,
            duration_ms = summary.duration_ms,
            "Run finished"
        );

        notify_quietly(self.notifier.as_ref(), &summary, self.settings.notify_timeout).await;
        Ok(summary)
    }

    async fn harvest(
        &self,
        source_id: &str,
        options: RunOptions,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let pattern = self.registry.get(source_id).await?;
        let mut stats = self.breaker.load_stats(source_id).await?;

        if stats.is_tripped() || !pattern.is_productive() {
            info!(source = %source_id, "Circuit is tripped, skipping source");
            return Ok(RunOutcome::SkippedTripped);
        }

        let mut cursor = self.progress.load(source_id).await?;
        progress::begin(&mut cursor, &pattern);
        if cursor.exhausted {
            info!(source = %source_id, "Source already exhausted");
            return Ok(RunOutcome::AlreadyExhausted);
        }
        if pattern.needs_browser() && !self.driver.renders_js() {
            return Err(HarvestError::InvalidConfig(format!(
                "source {} needs a browser driver (set BROWSERLESS_URL)",
                source_id
            )));
        }

        // Fresh working set per run; the corpus covers earlier runs
        let gate = DedupGate::new(self.sink.clone(), self.blocklist.clone());
        let profile = self.rate_limiter.profile_for(pattern.rate_limit.as_ref());
        let fetch_options = FetchOptions {
            render_js: pattern.render_js,
            timeout: self.settings.request_timeout,
            wait_for: pattern.wait_for.clone(),
        };
        let mut fetched: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if fetched >= options.max_urls {
                info!(source = %source_id, max_urls = options.max_urls, "URL budget reached");
                return Ok(RunOutcome::BudgetExhausted);
            }

            match self.rate_limiter.wait(source_id, profile, cancel).await {
                Ok(()) => {}
                Err(HarvestError::Cancelled) => return Ok(RunOutcome::Cancelled),
                Err(e) => return Err(e),
            }

            let request = pattern.build_request(&cursor);
            let loaded = match self.load_with_retry(source_id, &request, &fetch_options, summary, cancel).await {
                PageLoad::Loaded(page) => Ok(page),
                PageLoad::Failed(e) => Err(e),
                PageLoad::Blocked(e) => {
                    warn!(source = %source_id, url = %request.url(), error = %e, "Source is blocking us, ending run");
                    return Ok(RunOutcome::Blocked);
                }
                PageLoad::Cancelled => return Ok(RunOutcome::Cancelled),
            };
            fetched += 1;

            let observation = match &loaded {
                Ok(page) => self.observe_page(page, &pattern, &mut cursor, &gate, summary).await?,
                Err(e) => {
                    let step = progress::fail_page(&mut cursor, &pattern, e);
                    warn!(
                        source = %source_id,
                        url = %request.url(),
                        error = %e,
                        step = ?step,
                        "Page failed after retries, counted as empty"
                    );
                    Observation {
                        admitted: Vec::new(),
                        empty: true,
                        records: 0,
                        paused: step == FailedPage::Paused,
                    }
                }
            };

            if summary.urls_visited == 0 {
                stats.runs += 1;
            }
            summary.urls_visited += 1;
            if observation.empty {
                summary.empty_urls += 1;
            }
            self.breaker.record(&mut stats, 1, observation.admitted.len() as u64, observation.empty);

            let new_contacts = if options.dry_run {
                observation.admitted.len() as u64
            } else {
                self.sink.commit_page(&observation.admitted, &cursor, &stats).await?
            };
            summary.contacts_found += new_contacts;
            metrics::record_contacts(source_id, "admitted", new_contacts);

            let page_outcome = match (loaded.is_ok(), observation.empty) {
                (false, _) => "failed",
                (true, true) => "empty",
                (true, false) => "productive",
            };
            metrics::record_page(source_id, page_outcome);
            debug!(
                source = %source_id,
                url = %request.url(),
                records = observation.records,
                new_contacts,
                outcome = page_outcome,
                "Page processed"
            );

            if self.breaker.evaluate(&stats) == CircuitState::Tripped {
                if options.dry_run {
                    info!(source = %source_id, "Circuit would trip; dry run leaves state untouched");
                } else {
                    let purged = self.breaker.trip(&mut stats).await?;
                    summary.purged = purged;
                    metrics::record_circuit_trip(source_id, purged);
                }
                return Ok(RunOutcome::CircuitTripped);
            }

            if observation.paused {
                info!(source = %source_id, url = %request.url(), "Page keeps failing, pausing source on it");
                return Ok(RunOutcome::Paused);
            }
            if cursor.exhausted {
                info!(source = %source_id, "All categories walked to the end");
                return Ok(RunOutcome::Exhausted);
            }
        }
    }

    /// Extracts and screens a loaded page, then moves the cursor past it
    async fn observe_page(
        &self,
        page: &RenderedPage,
        pattern: &PatternEntry,
        cursor: &mut ProgressCursor,
        gate: &DedupGate,
        summary: &mut RunSummary,
    ) -> Result<Observation> {
        let source_id = pattern.source_id.as_str();
        let mut extraction = extractor::extract(page, pattern);
        if extraction.structural_mismatch {
            warn!(source = %source_id, url = %page.url, "Record selector matched nothing");
            summary.record_error(ErrorKind::StructuralMismatch);
            metrics::record_error(source_id, ErrorKind::StructuralMismatch.as_str());
        }
        guard_token_loop(&mut extraction, pattern, cursor);

        let records = extraction.candidates.len();
        let (admitted, valid) = self.admit(gate, std::mem::take(&mut extraction.candidates), summary).await?;

        progress::advance_page(cursor, pattern, &extraction);
        if !extraction.has_next_page {
            progress::advance_category(cursor, pattern);
        }

        Ok(Observation {
            admitted,
            empty: valid == 0,
            records,
            paused: false,
        })
    }

    /// Screens a page of candidates and tallies rejections. Returns the
    /// admitted contacts and how many candidates passed validation,
    /// duplicates included.
    async fn admit(
        &self,
        gate: &DedupGate,
        candidates: Vec<CandidateRecord>,
        summary: &mut RunSummary,
    ) -> Result<(Vec<ContactRecord>, u64)> {
        let source_id = summary.source_id.clone();
        let mut admitted = Vec::new();
        let (mut duplicates, mut invalid) = (0u64, 0u64);

        for admission in gate.admit_batch(candidates).await? {
            match admission {
                Admission::Admit(contact) => admitted.push(contact),
                Admission::RejectDuplicate => duplicates += 1,
                Admission::RejectInvalid(_) => {
                    invalid += 1;
                    summary.record_error(ErrorKind::InvalidCandidate);
                }
            }
        }

        summary.duplicates += duplicates;
        metrics::record_contacts(&source_id, "duplicate", duplicates);
        metrics::record_contacts(&source_id, "invalid", invalid);
        let valid = admitted.len() as u64 + duplicates;
        Ok((admitted, valid))
    }

    /// Loads one page, retrying transient failures with backoff and an
    /// HTTP error status once. Challenges are never retried.
    async fn load_with_retry(
        &self,
        source_id: &str,
        request: &PageRequest,
        options: &FetchOptions,
        summary: &mut RunSummary,
        cancel: &CancellationToken,
    ) -> PageLoad {
        let _timer = FetchTimer::new(source_id);
        let mut backoff = self.settings.retry.backoff();
        let mut transient_failures = 0u32;
        let mut status_retried = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match load_page(self.driver.as_ref(), request, options, cancel).await {
                None => return PageLoad::Cancelled,
                Some(Ok(page)) => return PageLoad::Loaded(page),
                Some(Err(e)) => e,
            };

            summary.record_error(err.kind());
            metrics::record_error(source_id, err.kind().as_str());

            let retry = match &err {
                FetchError::Blocked(_) => return PageLoad::Blocked(err),
                FetchError::HttpStatus(_) => !std::mem::replace(&mut status_retried, true),
                FetchError::Timeout | FetchError::Network(_) => {
                    transient_failures += 1;
                    transient_failures <= self.settings.retry.transient_retries
                }
            };

            if !retry {
                warn!(
                    source = %source_id,
                    url = %request.url(),
                    attempt,
                    error = %err,
                    "Giving up on page"
                );
                return PageLoad::Failed(err);
            }

            let delay = backoff.next_backoff().unwrap_or(self.settings.retry.max_delay);
            warn!(
                source = %source_id,
                url = %request.url(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Fetch failed, will retry"
            );

            tokio::select! {
                _ = cancel.cancelled() => return PageLoad::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Cursor, stats and contact count of one source
    pub async fn status(&self, source_id: &str) -> Result<SourceStatus> {
        let pattern = self.registry.get(source_id).await?;
        Ok(SourceStatus {
            cursor: self.progress.load(source_id).await?,
            stats: self.breaker.load_stats(source_id).await?,
            contacts: self.sink.count_contacts(source_id).await?,
            pattern,
        })
    }

    pub async fn status_all(&self) -> Result<Vec<SourceStatus>> {
        let mut statuses = Vec::new();
        for pattern in self.registry.list().await? {
            statuses.push(self.status(&pattern.source_id).await?);
        }
        Ok(statuses)
    }

    /// Operator re-enable: clears the trip and, if asked, rewinds the cursor
    #[instrument(skip(self))]
    pub async fn reset(&self, source_id: &str, stats: bool, cursor: bool) -> Result<()> {
        if stats {
            self.breaker.reset(source_id).await?;
        }
        if cursor {
            self.progress.reset(source_id).await?;
            info!(source = %source_id, "Cursor rewound to the beginning");
        }
        Ok(())
    }
}

/// A token that points back at the page just read would loop forever
fn guard_token_loop(extraction: &mut Extraction, pattern: &PatternEntry, cursor: &ProgressCursor) {
    if !matches!(pattern.pagination, PaginationStrategy::TokenBased { .. }) || !extraction.has_next_page {
        return;
    }
    let repeated = match extraction.next_token.as_deref() {
        None => true,
        Some(next) => cursor.current_page_token.as_deref() == Some(next),
    };
    if repeated {
        debug!(source = %cursor.source_id, "Next-page token missing or repeated, ending category");
        extraction.has_next_page = false;
        extraction.next_token = None;
    }
}
