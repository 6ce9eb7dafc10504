//! Sync pipeline orchestration: fetch -> normalize -> reconcile, once per office.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use jobtrack_adapters::{
    normalize_posting, AdapterContext, BoardAdapter, GreenhouseAdapter, NormalizeOptions,
    RawPosting,
};
use jobtrack_core::{load_profile, AppConfig, ConfigError, OfficeProfile, Posting, TrackerProfile};
use jobtrack_storage::{
    HttpClientConfig, HttpFetcher, NotionConfig, NotionStore, RecordStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod reconcile;

pub use reconcile::{
    close_patch, create_patch, dedupe_postings, sync_fingerprint, update_patch, ReconcileReport,
    Reconciler, RecordWriteError, WriteOp,
};

pub const CRATE_NAME: &str = "jobtrack-sync";

const SUMMARY_FILE: &str = "sync_summary.json";
const BRIEF_FILE: &str = "sync_brief.md";

/// Errors that end a run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("authentication against the remote store failed: {0}")]
    Auth(#[source] StoreError),

    #[error("remote store unreachable: {0}")]
    Store(#[source] StoreError),

    #[error("querying existing records for office {office} failed: {source}")]
    Query {
        office: String,
        #[source]
        source: StoreError,
    },

    #[error("building http client: {0}")]
    Client(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    PartialSuccess,
    Failure,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success | ExitStatus::PartialSuccess => 0,
            ExitStatus::Failure => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OfficeStatus {
    Completed,
    FetchFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedWrite {
    pub req_id: String,
    pub operation: WriteOp,
    pub error: String,
}

impl From<&RecordWriteError> for FailedWrite {
    fn from(err: &RecordWriteError) -> Self {
        Self {
            req_id: err.req_id.clone(),
            operation: err.operation,
            error: err.source.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficeSummary {
    pub office: String,
    pub status: OfficeStatus,
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub reopened: usize,
    pub unchanged: usize,
    pub closed: usize,
    pub already_closed: usize,
    pub failed_writes: Vec<FailedWrite>,
}

impl OfficeSummary {
    fn fetch_failed(office: &str, error: String) -> Self {
        Self {
            office: office.to_string(),
            status: OfficeStatus::FetchFailed { error },
            fetched: 0,
            created: 0,
            updated: 0,
            reopened: 0,
            unchanged: 0,
            closed: 0,
            already_closed: 0,
            failed_writes: Vec::new(),
        }
    }

    fn from_report(report: &ReconcileReport) -> Self {
        Self {
            office: report.office.clone(),
            status: OfficeStatus::Completed,
            fetched: report.fetched,
            created: report.created,
            updated: report.updated,
            reopened: report.reopened,
            unchanged: report.unchanged,
            closed: report.closed,
            already_closed: report.already_closed,
            failed_writes: report.failures.iter().map(FailedWrite::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub board: String,
    pub store_backend: String,
    pub offices: Vec<OfficeSummary>,
}

impl SyncRunSummary {
    pub fn created(&self) -> usize {
        self.offices.iter().map(|o| o.created).sum()
    }

    pub fn updated(&self) -> usize {
        self.offices.iter().map(|o| o.updated).sum()
    }

    pub fn unchanged(&self) -> usize {
        self.offices.iter().map(|o| o.unchanged).sum()
    }

    pub fn closed(&self) -> usize {
        self.offices.iter().map(|o| o.closed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.offices.iter().map(|o| o.failed_writes.len()).sum()
    }

    pub fn failed_offices(&self) -> Vec<&str> {
        self.offices
            .iter()
            .filter(|o| matches!(o.status, OfficeStatus::FetchFailed { .. }))
            .map(|o| o.office.as_str())
            .collect()
    }

    /// Any failed office is fatal. Write failures are tolerated while at
    /// least one write went through.
    pub fn exit_status(&self) -> ExitStatus {
        if !self.failed_offices().is_empty() {
            return ExitStatus::Failure;
        }
        let skipped = self.skipped();
        if skipped == 0 {
            return ExitStatus::Success;
        }
        let succeeded = self.created() + self.updated() + self.closed();
        if succeeded == 0 {
            ExitStatus::Failure
        } else {
            ExitStatus::PartialSuccess
        }
    }
}

pub struct SyncPipeline {
    adapter: Box<dyn BoardAdapter>,
    store: Arc<dyn RecordStore>,
    http: HttpFetcher,
    profile: TrackerProfile,
    options: NormalizeOptions,
    today: Option<NaiveDate>,
}

impl SyncPipeline {
    pub fn new(
        adapter: Box<dyn BoardAdapter>,
        store: Arc<dyn RecordStore>,
        http: HttpFetcher,
        profile: TrackerProfile,
        options: NormalizeOptions,
    ) -> Self {
        Self {
            adapter,
            store,
            http,
            profile,
            options,
            today: None,
        }
    }

    /// Wire the Greenhouse board and the Notion database from `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, SyncError> {
        let profile = load_profile(config.profile_path.as_deref())?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })
        .map_err(SyncError::Client)?;
        let store = NotionStore::new(NotionConfig {
            api_base: config.notion_api_base.clone(),
            api_key: config.notion_api_key.clone(),
            database_id: config.notion_database_id.clone(),
            notion_version: config.notion_version.clone(),
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })
        .map_err(SyncError::Auth)?;
        let adapter = GreenhouseAdapter::new(&config.board_api_base, &config.board_token);

        Ok(Self::new(
            Box::new(adapter),
            Arc::new(store),
            http,
            profile,
            NormalizeOptions {
                summary_chars: config.summary_chars,
            },
        ))
    }

    /// Pin the date written to first-seen and closed-on.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn profile(&self) -> &TrackerProfile {
        &self.profile
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary, SyncError> {
        let ctx = AdapterContext::new();
        let started_at = ctx.fetched_at;
        let today = self.today.unwrap_or_else(|| started_at.date_naive());
        let span = info_span!("sync_run", run_id = %ctx.run_id, backend = self.store.backend());

        async {
            self.store.verify_access().await.map_err(|err| {
                if err.is_auth() {
                    SyncError::Auth(err)
                } else {
                    SyncError::Store(err)
                }
            })?;

            let reconciler = Reconciler::new(self.store.as_ref(), today);
            let mut offices = Vec::with_capacity(self.profile.offices.len());
            for office in &self.profile.offices {
                let summary = self
                    .sync_office(&ctx, office, &reconciler)
                    .instrument(info_span!("office", office = %office.label))
                    .await?;
                offices.push(summary);
            }

            let summary = SyncRunSummary {
                run_id: ctx.run_id,
                started_at,
                finished_at: Utc::now(),
                board: self.adapter.listing_url(),
                store_backend: self.store.backend().to_string(),
                offices,
            };
            info!(
                created = summary.created(),
                updated = summary.updated(),
                unchanged = summary.unchanged(),
                closed = summary.closed(),
                skipped = summary.skipped(),
                failed_offices = summary.failed_offices().len(),
                outcome = ?summary.exit_status(),
                "sync run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn sync_office(
        &self,
        ctx: &AdapterContext,
        office: &OfficeProfile,
        reconciler: &Reconciler<'_>,
    ) -> Result<OfficeSummary, SyncError> {
        let raw = match self.adapter.fetch_office(&self.http, ctx, office).await {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = %err, "fetch failed; office skipped");
                return Ok(OfficeSummary::fetch_failed(&office.label, err.to_string()));
            }
        };

        let postings = self.normalize_owned(office, &raw);
        if postings.is_empty() {
            warn!("board returned no postings for office");
        }

        let report = reconciler
            .reconcile(&office.label, postings)
            .await
            .map_err(|source| SyncError::Query {
                office: office.label.clone(),
                source,
            })?;
        info!(
            fetched = report.fetched,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            closed = report.closed,
            skipped = report.failures.len(),
            "office reconciled"
        );
        Ok(OfficeSummary::from_report(&report))
    }

    /// Fetch and normalize without touching the store.
    pub async fn preview(&self, office_label: Option<&str>) -> Result<Vec<Posting>> {
        let ctx = AdapterContext::new();
        let offices: Vec<&OfficeProfile> = match office_label {
            Some(label) => vec![self
                .profile
                .office(label)
                .with_context(|| format!("office {label} is not in the tracker profile"))?],
            None => self.profile.offices.iter().collect(),
        };

        let mut postings = Vec::new();
        for office in offices {
            let raw = self
                .adapter
                .fetch_office(&self.http, &ctx, office)
                .await
                .with_context(|| format!("fetching postings for {}", office.label))?;
            postings.extend(self.normalize_owned(office, &raw));
        }
        Ok(postings)
    }

    /// Normalize the postings whose home office is `office`. A posting listed
    /// in several tracked offices belongs to the first one only, so its
    /// `Office` value is the same on every run.
    fn normalize_owned(&self, office: &OfficeProfile, raw: &[RawPosting]) -> Vec<Posting> {
        raw.iter()
            .filter(|r| {
                let names = r.place_names();
                match self.profile.home_office(&names, r.department_name()) {
                    Some(home) if home.label != office.label => {
                        debug!(
                            req_id = %r.req_id(),
                            home = %home.label,
                            "posting belongs to another office"
                        );
                        false
                    }
                    _ => true,
                }
            })
            .map(|r| normalize_posting(r, office, &self.profile, &self.options))
            .collect()
    }
}

/// One full run from configuration, writing reports when a directory is set.
pub async fn run_sync_once_from_config(config: &AppConfig) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::from_config(config)?;
    let summary = pipeline.run_once().await?;

    if let Some(dir) = &config.reports_dir {
        match write_reports(&summary, dir).await {
            Ok(path) => info!(path = %path.display(), "run report written"),
            Err(err) => warn!(error = %err, "writing run report failed"),
        }
    }
    Ok(summary)
}

pub fn render_brief(summary: &SyncRunSummary) -> String {
    let mut lines = vec![
        "# Careers Sync Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Board: {}", summary.board),
        format!("- Outcome: {:?}", summary.exit_status()),
        format!(
            "- Totals: created {}, updated {}, unchanged {}, closed {}, skipped {}",
            summary.created(),
            summary.updated(),
            summary.unchanged(),
            summary.closed(),
            summary.skipped()
        ),
        String::new(),
        "## Offices".to_string(),
    ];
    for office in &summary.offices {
        match &office.status {
            OfficeStatus::Completed => lines.push(format!(
                "- {}: fetched {}, created {}, updated {}, unchanged {}, closed {}, skipped {}",
                office.office,
                office.fetched,
                office.created,
                office.updated,
                office.unchanged,
                office.closed,
                office.failed_writes.len()
            )),
            OfficeStatus::FetchFailed { error } => {
                lines.push(format!("- {}: fetch failed ({error})", office.office))
            }
        }
        for failed in &office.failed_writes {
            lines.push(format!(
                "  - {} {} skipped: {}",
                failed.operation, failed.req_id, failed.error
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

pub async fn write_reports(summary: &SyncRunSummary, reports_root: &Path) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;
    fs::write(run_dir.join(BRIEF_FILE), render_brief(summary))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    Ok(run_dir)
}

/// Markdown digest of the most recent `runs` reports under `reports_root`.
pub fn report_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path().join(SUMMARY_FILE);
        if !path.is_file() {
            continue;
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let summary: SyncRunSummary = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        summaries.push(summary);
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Careers Sync Runs".to_string(), String::new()];
    for summary in summaries.iter().take(runs) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- outcome: {:?}", summary.exit_status()));
        lines.push(format!(
            "- created {} / updated {} / unchanged {} / closed {} / skipped {}",
            summary.created(),
            summary.updated(),
            summary.unchanged(),
            summary.closed(),
            summary.skipped()
        ));
        let failed = summary.failed_offices();
        if !failed.is_empty() {
            lines.push(format!("- failed offices: {}", failed.join(", ")));
        }
        lines.push(String::new());
    }
    if summaries.is_empty() {
        lines.push("_no runs recorded_".to_string());
    }

    Ok(lines.join("\n"))
}
