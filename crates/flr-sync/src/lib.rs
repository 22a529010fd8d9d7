//! Ingestion pipeline: snapshot, farmers, land mapping, bank details.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flr_adapters::{
    HttpUpstream, SourceRegistry, UpstreamApi, UpstreamEndpoints, MAPPING_DETAIL_BASE_URL,
    PAYMENT_OPTIONS_BASE_URL,
};
use flr_core::FarmerKey;
use flr_storage::{
    Datastore, HttpClientConfig, HttpFetcher, SnapshotManager, SnapshotOutcome,
    BROWSER_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod bank_details;
pub mod farmer_ingestion;
pub mod land_mapping;

pub const CRATE_NAME: &str = "flr-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub db_name: String,
    pub backup_keep: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub mapping_timeout_secs: u64,
    pub sources_file: Option<PathBuf>,
    pub mapping_base_url: String,
    pub payment_options_base_url: String,
    pub reports_dir: PathBuf,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    /// Defaults rooted at `data_dir`, ignoring the environment.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            reports_dir: data_dir.join("reports"),
            data_dir,
            db_name: "farmer_land_records.db".to_string(),
            backup_keep: SnapshotManager::DEFAULT_KEEP,
            user_agent: BROWSER_USER_AGENT.to_string(),
            http_timeout_secs: 120,
            mapping_timeout_secs: 30,
            sources_file: None,
            mapping_base_url: MAPPING_DETAIL_BASE_URL.to_string(),
            payment_options_base_url: PAYMENT_OPTIONS_BASE_URL.to_string(),
        }
    }

    /// Reads `FLR_*` from the process environment. Loading `.env` is left to the binary.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("FLR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let defaults = Self::for_data_dir(&data_dir);
        Self {
            db_name: std::env::var("FLR_DB_NAME").unwrap_or(defaults.db_name),
            backup_keep: env_or("FLR_BACKUP_KEEP", defaults.backup_keep),
            user_agent: std::env::var("FLR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("FLR_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            mapping_timeout_secs: env_or("FLR_MAPPING_TIMEOUT_SECS", defaults.mapping_timeout_secs),
            sources_file: std::env::var("FLR_SOURCES_FILE").ok().map(PathBuf::from),
            mapping_base_url: std::env::var("FLR_MAPPING_BASE_URL")
                .unwrap_or(defaults.mapping_base_url),
            payment_options_base_url: std::env::var("FLR_PAYMENT_OPTIONS_BASE_URL")
                .unwrap_or(defaults.payment_options_base_url),
            reports_dir: std::env::var("FLR_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            data_dir,
        }
    }

    pub fn datastore_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_name)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn datastore(&self) -> Datastore {
        Datastore::new(self.datastore_path())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            ..HttpClientConfig::default()
        }
    }

    pub fn upstream_endpoints(&self) -> UpstreamEndpoints {
        UpstreamEndpoints {
            mapping_base_url: self.mapping_base_url.clone(),
            payment_options_base_url: self.payment_options_base_url.clone(),
            mapping_timeout: Duration::from_secs(self.mapping_timeout_secs),
        }
    }
}

/// Result of one unit of work inside a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Succeeded,
    Failed(String),
    Skipped(&'static str),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duplicates_dropped: usize,
    /// Rows written by the succeeded units.
    pub written: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl StageReport {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, outcome: StageOutcome) {
        match outcome {
            StageOutcome::Succeeded => self.succeeded += 1,
            StageOutcome::Skipped(reason) => {
                info!(stage = %self.stage, reason, "skipped");
                self.skipped += 1;
            }
            StageOutcome::Failed(message) => {
                error!(stage = %self.stage, error = %message, "unit of work failed; continuing");
                self.failed += 1;
                self.failures.push(message);
            }
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    fn log_progress(&self, done: usize, total: usize) {
        info!(stage = %self.stage, "{done} of {total} processed");
    }
}

/// Persisted farmers for the per-farmer stages. A listing failure is recorded
/// on the report and leaves the stage with nothing to do.
async fn persisted_farmers(datastore: &Datastore, report: &mut StageReport) -> Vec<FarmerKey> {
    match datastore.list_persisted_farmers().await {
        Ok(farmers) => {
            info!(stage = %report.stage, count = farmers.len(), "farmers to process");
            farmers
        }
        Err(err) => {
            report.record(StageOutcome::Failed(format!("listing persisted farmers: {err}")));
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `HH:MM:SS`
    pub elapsed: String,
    pub snapshot: Option<SnapshotOutcome>,
    pub farmers: StageReport,
    pub lands: StageReport,
    pub bank_details: StageReport,
    pub interrupted: bool,
    pub reports_dir: Option<PathBuf>,
}

pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// State of a run in flight; survives an interrupted stage.
struct RunProgress {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    snapshot: Option<SnapshotOutcome>,
    farmers: StageReport,
    lands: StageReport,
    bank_details: StageReport,
}

impl RunProgress {
    fn start() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            clock: Instant::now(),
            snapshot: None,
            farmers: StageReport::new(farmer_ingestion::STAGE),
            lands: StageReport::new(land_mapping::STAGE),
            bank_details: StageReport::new(bank_details::STAGE),
        }
    }

    fn finish(self, interrupted: bool) -> SyncRunSummary {
        SyncRunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed: format_elapsed(self.clock.elapsed()),
            snapshot: self.snapshot,
            farmers: self.farmers,
            lands: self.lands,
            bank_details: self.bank_details,
            interrupted,
            reports_dir: None,
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    datastore: Datastore,
    snapshots: SnapshotManager,
    upstream: Box<dyn UpstreamApi>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let upstream = HttpUpstream::new(fetcher, config.upstream_endpoints());
        Ok(Self {
            datastore: config.datastore(),
            snapshots: SnapshotManager::new(config.backup_dir(), config.backup_keep),
            upstream: Box::new(upstream),
            config,
        })
    }

    pub fn with_upstream(mut self, upstream: Box<dyn UpstreamApi>) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let mut progress = RunProgress::start();
        self.run_stages(&mut progress).await?;
        Ok(self.complete(progress, false).await)
    }

    /// [`run_once`](Self::run_once), stopped early by Ctrl-C.
    pub async fn run_until_interrupted(&self) -> Result<SyncRunSummary> {
        self.run_until(interrupt_signal()).await
    }

    /// Runs until the stages finish or `shutdown` resolves. A stopped run still
    /// produces a summary of what finished before it, flagged `interrupted`.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<SyncRunSummary> {
        let mut progress = RunProgress::start();
        let interrupted = tokio::select! {
            result = self.run_stages(&mut progress) => {
                result?;
                false
            }
            _ = shutdown => {
                warn!("interrupt received; stopping sync gracefully");
                true
            }
        };
        Ok(self.complete(progress, interrupted).await)
    }

    async fn run_stages(&self, progress: &mut RunProgress) -> Result<()> {
        info!(run_id = %progress.run_id, "sync started");
        let sources = SourceRegistry::load(self.config.sources_file.as_deref())?.enabled();

        let snapshot = self
            .snapshots
            .rotate_and_reset(&self.datastore)
            .await
            .context("preparing datastore")?;
        progress.snapshot = Some(snapshot);

        info!(sources = sources.len(), "fetching farmers from all sources");
        let fetched = farmer_ingestion::fetch_all_unique(self.upstream.as_ref(), &sources).await;
        farmer_ingestion::store_into(&self.datastore, fetched, &mut progress.farmers).await;

        info!("fetching land mapping details");
        land_mapping::process_into(&self.datastore, self.upstream.as_ref(), &mut progress.lands)
            .await;

        info!("fetching bank details");
        bank_details::process_into(
            &self.datastore,
            self.upstream.as_ref(),
            &mut progress.bank_details,
        )
        .await;
        Ok(())
    }

    async fn complete(&self, progress: RunProgress, interrupted: bool) -> SyncRunSummary {
        let mut summary = progress.finish(interrupted);
        match write_reports(&self.config.reports_dir, &summary).await {
            Ok(dir) => summary.reports_dir = Some(dir),
            Err(err) => warn!(error = %err, "failed to write run report"),
        }
        info!(
            run_id = %summary.run_id,
            elapsed = %summary.elapsed,
            interrupted = summary.interrupted,
            "sync finished"
        );
        summary
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupt_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
}

pub async fn run_sync_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_until_interrupted().await
}

fn stage_line(report: &StageReport) -> String {
    format!(
        "- {}: {} succeeded, {} failed, {} skipped, {} rows written{}",
        report.stage,
        report.succeeded,
        report.failed,
        report.skipped,
        report.written,
        if report.duplicates_dropped > 0 {
            format!(", {} duplicates dropped", report.duplicates_dropped)
        } else {
            String::new()
        }
    )
}

fn run_brief(summary: &SyncRunSummary) -> String {
    let backup = summary
        .snapshot
        .as_ref()
        .and_then(|s| s.backup_path.as_ref())
        .map(|p| format!("`{}`", p.display()))
        .unwrap_or_else(|| "none".to_string());
    format!(
        "# FLR Sync Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Elapsed: {}\n- Interrupted: {}\n- Backup: {}\n\n## Stages\n{}\n{}\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.elapsed,
        summary.interrupted,
        backup,
        stage_line(&summary.farmers),
        stage_line(&summary.lands),
        stage_line(&summary.bank_details),
    )
}

async fn write_reports(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run report")?;
    fs::write(dir.join("run_report.json"), json)
        .await
        .context("writing run_report.json")?;
    fs::write(dir.join("run_brief.md"), run_brief(summary))
        .await
        .context("writing run_brief.md")?;
    Ok(dir)
}

/// Markdown digest of the `runs` most recent run reports, newest first.
pub fn recent_runs_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_report.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# FLR Recent Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let path = dir.path().join("run_report.json");
        let summary: SyncRunSummary = serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- elapsed: {}", summary.elapsed));
        if summary.interrupted {
            lines.push("- interrupted: yes".to_string());
        }
        lines.push(stage_line(&summary.farmers));
        lines.push(stage_line(&summary.lands));
        lines.push(stage_line(&summary.bank_details));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use flr_adapters::{AdapterError, BankPayload, FarmerPayload, LandPayload, SourceEndpoint};
    use flr_core::encrypt_account_no;
    use flr_storage::FetchError;
    use serde_json::json;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::{ConnectOptions, Connection};
    use tempfile::tempdir;
    use tokio::sync::Notify;

    fn farmer_payload(id: i64, name: &str) -> FarmerPayload {
        serde_json::from_value(json!({"FarmerId": id, "FarmerName": name, "verifystatus": "False"}))
            .expect("farmer payload")
    }

    fn land_payload(upstream_id: i64, kanal: f64) -> LandPayload {
        serde_json::from_value(json!({
            "Id": upstream_id, "OwnerName": "owner", "Kanal": kanal, "Marle": 0, "Sarsai": 0, "Owner_Area": "1.5"
        }))
        .expect("land payload")
    }

    fn bank_payload(account_no: &str) -> BankPayload {
        serde_json::from_value(json!({
            "BankId": 12, "AccountHolderName": "holder", "AccountNo": encrypt_account_no(account_no),
            "IFSCCode": "PUNB0123400", "BranchName": "Khanna"
        }))
        .expect("bank payload")
    }

    #[derive(Default)]
    struct FakeUpstream {
        farmers: HashMap<String, Vec<FarmerPayload>>,
        lands: HashMap<i64, Vec<LandPayload>>,
        failing_lands: Vec<i64>,
        banks: HashMap<i64, BankPayload>,
        land_calls: Mutex<Vec<i64>>,
        /// Land fetches signal this and then never return.
        stall_lands: Option<Arc<Notify>>,
        /// Deletes this farmer's rows from the datastore right before its land fetch answers.
        vanish_before_lands: Option<(PathBuf, i64)>,
    }

    async fn delete_farmer_rows(db: &Path, farmer_id: i64) {
        let mut conn = SqliteConnectOptions::new()
            .filename(db)
            .connect()
            .await
            .expect("connect");
        sqlx::query("DELETE FROM farmers WHERE farmer_id = ?")
            .bind(farmer_id)
            .execute(&mut conn)
            .await
            .expect("delete");
        conn.close().await.expect("close");
    }

    #[async_trait]
    impl UpstreamApi for FakeUpstream {
        async fn fetch_farmers(&self, source: &SourceEndpoint) -> Option<Vec<FarmerPayload>> {
            self.farmers.get(&source.name).cloned()
        }

        async fn fetch_land_mapping(
            &self,
            farmer_id: i64,
        ) -> Result<Option<Vec<LandPayload>>, AdapterError> {
            self.land_calls.lock().expect("lock").push(farmer_id);
            if let Some(stalled) = &self.stall_lands {
                stalled.notify_one();
                std::future::pending::<()>().await;
            }
            if let Some((db, vanishing)) = &self.vanish_before_lands {
                if *vanishing == farmer_id {
                    delete_farmer_rows(db, farmer_id).await;
                }
            }
            if self.failing_lands.contains(&farmer_id) {
                return Err(AdapterError::Fetch(FetchError::HttpStatus {
                    status: 503,
                    url: format!("http://fake/mapping/{farmer_id}"),
                }));
            }
            Ok(self.lands.get(&farmer_id).cloned())
        }

        async fn fetch_bank_details(&self, farmer_id: i64) -> Option<BankPayload> {
            self.banks.get(&farmer_id).cloned()
        }
    }

    fn scenario() -> FakeUpstream {
        let mut upstream = FakeUpstream::default();
        upstream.farmers.insert(
            "PNC".into(),
            vec![farmer_payload(100, "Gurpreet"), farmer_payload(100, "Gurpreet"), farmer_payload(200, "Amrit")],
        );
        upstream.farmers.insert("PM".into(), vec![farmer_payload(100, "Gurpreet")]);
        upstream.farmers.insert("ATC".into(), Vec::new());
        upstream.lands.insert(100, vec![land_payload(1, 8.0), land_payload(2, 4.0)]);
        upstream.failing_lands.push(200);
        upstream.banks.insert(100, bank_payload("123456789012"));
        upstream
    }

    #[test]
    fn elapsed_is_formatted_as_clock_time() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(3_723)), "01:02:03");
        assert_eq!(format_elapsed(Duration::from_millis(59_999)), "00:00:59");
    }

    #[test]
    fn stage_report_counts_each_outcome() {
        let mut report = StageReport::new("lands");
        report.record(StageOutcome::Succeeded);
        report.record(StageOutcome::Skipped("no data"));
        report.record(StageOutcome::Failed("boom".into()));
        report.record(StageOutcome::Succeeded);
        assert_eq!((report.succeeded, report.failed, report.skipped), (2, 1, 1));
        assert_eq!(report.processed(), 4);
        assert_eq!(report.failures, vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn dedup_is_scoped_to_the_source() {
        let upstream = scenario();
        let sources = SourceRegistry::builtin().enabled();
        let fetched = farmer_ingestion::fetch_all_unique(&upstream, &sources).await;

        let keys = fetched
            .farmers
            .iter()
            .map(|f| (f.farmer_id, f.source_api.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(keys, vec![(100, "PNC"), (200, "PNC"), (100, "PM")]);
        assert_eq!(fetched.duplicates_dropped, 1);
        // ATC is empty; BTC, STC-RPP and STC-BHU return nothing.
        assert_eq!(fetched.sources_skipped, 4);
        assert_eq!(fetched.farmers[0].verify_status, "false");
    }

    #[tokio::test]
    async fn full_run_links_lands_and_bank_to_surrogate_ids() {
        let dir = tempdir().expect("tempdir");
        let config = SyncConfig::for_data_dir(dir.path());
        let pipeline = SyncPipeline::new(config.clone())
            .expect("pipeline")
            .with_upstream(Box::new(scenario()));

        let summary = pipeline.run_once().await.expect("run");
        assert!(!summary.interrupted);
        assert_eq!(summary.farmers.succeeded, 3);
        assert_eq!(summary.farmers.duplicates_dropped, 1);
        assert_eq!(summary.farmers.skipped, 4);
        // Farmer 200 fails its mapping fetch; both copies of farmer 100 succeed.
        assert_eq!((summary.lands.succeeded, summary.lands.failed), (2, 1));
        assert_eq!(summary.lands.written, 4);
        assert_eq!((summary.bank_details.succeeded, summary.bank_details.skipped), (2, 1));

        let store = pipeline.datastore();
        let keys = store.list_persisted_farmers().await.expect("keys");
        assert_eq!(keys.len(), 3);
        let pnc_100 = keys
            .iter()
            .find(|k| k.farmer_id == 100 && k.source_api == "PNC")
            .expect("PNC farmer 100");
        let pnc_200 = keys.iter().find(|k| k.farmer_id == 200).expect("farmer 200");

        let detail = store.get_farmer(pnc_100.id).await.expect("get").expect("exists");
        assert_eq!(detail.farmer.source_api, "PNC");
        assert_eq!(detail.lands.len(), 2);
        assert!(detail.lands.iter().all(|l| l.farmer_id == pnc_100.id));
        assert_eq!(detail.total_area_acres, 1.5);
        let bank = detail.bank_detail.expect("bank row");
        assert_eq!(bank.account_no.as_deref(), Some("123456789012"));

        let failed = store.get_farmer(pnc_200.id).await.expect("get").expect("exists");
        assert!(failed.lands.is_empty());
        assert!(failed.bank_detail.is_none());

        let reports_dir = summary.reports_dir.expect("reports written");
        assert!(reports_dir.join("run_report.json").exists());
        let brief = std::fs::read_to_string(reports_dir.join("run_brief.md")).expect("brief");
        assert!(brief.contains("- lands: 2 succeeded, 1 failed"));
    }

    #[tokio::test]
    async fn rerun_replaces_dataset_and_keeps_backup() {
        let dir = tempdir().expect("tempdir");
        let config = SyncConfig::for_data_dir(dir.path());
        let pipeline = SyncPipeline::new(config.clone())
            .expect("pipeline")
            .with_upstream(Box::new(scenario()));

        pipeline.run_once().await.expect("first run");
        let second = pipeline.run_once().await.expect("second run");

        let backup = second
            .snapshot
            .as_ref()
            .and_then(|s| s.backup_path.clone())
            .expect("backup of first run");
        assert!(backup.starts_with(config.backup_dir()));
        assert_eq!(pipeline.datastore().stats().await.expect("stats").total_farmers, 3);

        let digest = recent_runs_markdown(&config.reports_dir, 5).expect("digest");
        assert_eq!(digest.matches("## Run `").count(), 2);
        assert!(digest.contains(&second.run_id.to_string()));
    }

    #[tokio::test]
    async fn land_stage_attempts_every_farmer_once() {
        let dir = tempdir().expect("tempdir");
        let store = Datastore::new(dir.path().join("flr.db"));
        store.reset_schema().await.expect("schema");
        let upstream = scenario();

        let fetched =
            farmer_ingestion::fetch_all_unique(&upstream, &SourceRegistry::builtin().enabled()).await;
        let farmers = farmer_ingestion::store_all(&store, fetched).await;
        assert_eq!(farmers.succeeded, 3);

        let report = land_mapping::process_all(&store, &upstream).await;
        assert_eq!(report.processed(), 3);
        assert_eq!(*upstream.land_calls.lock().expect("lock"), vec![100, 200, 100]);

        let banks = bank_details::process_all(&store, &upstream).await;
        assert_eq!(banks.written, 2);
    }

    #[tokio::test]
    async fn unreadable_sources_file_fails_before_touching_data() {
        let dir = tempdir().expect("tempdir");
        let mut config = SyncConfig::for_data_dir(dir.path());
        config.sources_file = Some(dir.path().join("missing.yaml"));
        let pipeline = SyncPipeline::new(config)
            .expect("pipeline")
            .with_upstream(Box::new(FakeUpstream::default()));
        assert!(pipeline.run_once().await.is_err());
        assert!(!pipeline.datastore().path().exists());
    }

    #[tokio::test]
    async fn farmer_save_failure_is_counted_and_the_rest_still_stored() {
        let dir = tempdir().expect("tempdir");
        let store = Datastore::new(dir.path().join("flr.db"));
        store.reset_schema().await.expect("schema");

        // The second copy of farmer 1 hits the (farmer_id, source_api) unique key.
        let fetched = farmer_ingestion::FetchedFarmers {
            farmers: vec![
                farmer_payload(1, "Baljit").into_new_farmer("PNC"),
                farmer_payload(1, "Baljit Kaur").into_new_farmer("PNC"),
                farmer_payload(2, "Navdeep").into_new_farmer("PNC"),
            ],
            ..Default::default()
        };
        let report = farmer_ingestion::store_all(&store, fetched).await;
        assert_eq!((report.succeeded, report.failed, report.written), (2, 1, 2));
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("farmer 1 (PNC)"), "{}", report.failures[0]);

        let ids = store
            .list_persisted_farmers()
            .await
            .expect("keys")
            .into_iter()
            .map(|k| k.farmer_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn land_save_failure_is_counted_and_later_farmers_still_processed() {
        let dir = tempdir().expect("tempdir");
        let store = Datastore::new(dir.path().join("flr.db"));
        store.reset_schema().await.expect("schema");

        let mut upstream = scenario();
        upstream.failing_lands.clear();
        upstream.lands.insert(200, vec![land_payload(3, 2.0)]);
        upstream.vanish_before_lands = Some((store.path().to_path_buf(), 200));

        let fetched =
            farmer_ingestion::fetch_all_unique(&upstream, &SourceRegistry::builtin().enabled()).await;
        farmer_ingestion::store_all(&store, fetched).await;

        // Farmer 200 is gone by the time its batch is written, so the foreign key rejects it.
        let report = land_mapping::process_all(&store, &upstream).await;
        assert_eq!((report.succeeded, report.failed), (2, 1));
        assert_eq!(report.written, 4);
        assert!(
            report.failures[0].contains("saving land records for farmer 200"),
            "{}",
            report.failures[0]
        );
        assert_eq!(*upstream.land_calls.lock().expect("lock"), vec![100, 200, 100]);
        assert_eq!(store.stats().await.expect("stats").total_lands, 4);
    }

    #[tokio::test]
    async fn shutdown_mid_run_keeps_partial_counts() {
        let dir = tempdir().expect("tempdir");
        let config = SyncConfig::for_data_dir(dir.path());
        let stalled = Arc::new(Notify::new());
        let mut upstream = scenario();
        upstream.stall_lands = Some(stalled.clone());
        let pipeline = SyncPipeline::new(config)
            .expect("pipeline")
            .with_upstream(Box::new(upstream));

        let summary = pipeline
            .run_until(async move { stalled.notified().await })
            .await
            .expect("run");
        assert!(summary.interrupted);
        assert_eq!((summary.farmers.succeeded, summary.farmers.written), (3, 3));
        assert_eq!(summary.lands.processed(), 0);
        assert_eq!(summary.bank_details.processed(), 0);
        assert_eq!(pipeline.datastore().stats().await.expect("stats").total_farmers, 3);

        let report_path = summary.reports_dir.expect("reports written").join("run_report.json");
        let saved: SyncRunSummary =
            serde_json::from_str(&std::fs::read_to_string(report_path).expect("read"))
                .expect("parse");
        assert!(saved.interrupted);
        assert_eq!(saved.farmers.succeeded, 3);
    }
}
