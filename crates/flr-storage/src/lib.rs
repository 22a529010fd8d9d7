//! Datastore, snapshot rotation, and HTTP fetch utilities for FLR.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use flr_core::{
    decrypt_account_no, FarmerKey, LandArea, NewBankDetail, NewFarmer, NewLandRecord,
};
use rand::Rng;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, ORIGIN, REFERER,
};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as JsonValue;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection, FromRow, QueryBuilder, Sqlite};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "flr-storage";

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

// ---------------------------------------------------------------------------
// HTTP fetching
// ---------------------------------------------------------------------------

/// Origin the upstream APIs expect in `Origin`/`Referer`.
pub const UPSTREAM_ORIGIN: &str = "https://apifarmerlandmapping.emandikaran-pb.in";

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
    /// Upper bound (exclusive) of the uniform jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^attempt_index + max_jitter * jitter`, with `jitter` in `[0, 1)`.
    pub fn delay_for_attempt(&self, attempt_index: usize, jitter: f64) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        self.base_delay.saturating_mul(factor) + self.max_jitter.mul_f64(jitter)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_for_attempt(attempt_index, jitter)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub origin: Option<String>,
    pub referer: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: BROWSER_USER_AGENT.to_string(),
            origin: Some(UPSTREAM_ORIGIN.to_string()),
            referer: Some(format!("{UPSTREAM_ORIGIN}/")),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not json: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// JSON GET client that looks like a browser to the upstream.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            HeaderName::from_static("sec-fetch-dest"),
            HeaderValue::from_static("empty"),
        );
        headers.insert(
            HeaderName::from_static("sec-fetch-mode"),
            HeaderValue::from_static("cors"),
        );
        headers.insert(
            HeaderName::from_static("sec-fetch-site"),
            HeaderValue::from_static("same-origin"),
        );
        if let Some(origin) = &config.origin {
            headers.insert(
                ORIGIN,
                HeaderValue::from_str(origin).with_context(|| format!("invalid origin {origin}"))?,
            );
        }
        if let Some(referer) = &config.referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer)
                    .with_context(|| format!("invalid referer {referer}"))?,
            );
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Fetch with retries. Exhausted retries are logged and reported as `None`.
    pub async fn fetch_json(&self, url: &str) -> Option<JsonValue> {
        self.fetch_json_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }

    /// Single attempt with the client's default timeout.
    pub async fn fetch_once(&self, url: &str) -> Result<JsonValue, FetchError> {
        self.request(url, None).await
    }

    /// Single attempt with a per-request timeout override.
    pub async fn fetch_once_with_timeout(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<JsonValue, FetchError> {
        self.request(url, Some(timeout)).await
    }

    async fn fetch_json_with_retries(&self, url: &str) -> Option<JsonValue> {
        let max_attempts = self.backoff.max_attempts.max(1);
        for attempt in 0..max_attempts {
            match self.request(url, None).await {
                Ok(value) => return Some(value),
                Err(err) if attempt + 1 < max_attempts => {
                    let delay = self.backoff.jittered_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "fetch attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(attempts = max_attempts, error = %err, "fetch failed after retries");
                }
            }
        }
        None
    }

    async fn request(&self, url: &str, timeout: Option<Duration>) -> Result<JsonValue, FetchError> {
        let mut request = self.client.get(url);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        resp.json::<JsonValue>()
            .await
            .map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
    }
}

// ---------------------------------------------------------------------------
// Datastore
// ---------------------------------------------------------------------------

/// Written by `store_farmer` and read back by `FarmerRow`, in this order.
pub const FARMER_COLUMNS: &[&str] = &[
    "farmer_id",
    "farmer_name",
    "father_name",
    "grandfather_name",
    "mobile_number",
    "aadhar_number",
    "village_name",
    "district_name",
    "city_name",
    "owner_area",
    "final_owner_area",
    "update_owner_area",
    "owner_type",
    "verify_status",
    "auction",
    "source_api",
];

/// Written by `store_land_records_bulk` and read back by `LandRecordRow`, in this order.
pub const LAND_COLUMNS: &[&str] = &[
    "upstream_id",
    "farmer_id",
    "sr_no",
    "owner_id",
    "owner_name",
    "revenue_village_id",
    "village_name",
    "city_name",
    "district_name",
    "area_type",
    "owner_area",
    "land_owner_area_k",
    "land_owner_area_m",
    "land_owner_area_sarsai",
    "owner_type",
    "khewat_no",
    "khasra_no",
    "period",
    "type",
    "kanal",
    "marle",
    "sarsai",
    "mapped_area",
    "license_id",
    "verify_status",
    "kanal1",
    "marle1",
    "sarsai1",
    "commodity_id",
    "min_land",
    "auction",
];

/// Written by `upsert_bank_detail` and read back by `BankDetailRow`, in this order.
pub const BANK_COLUMNS: &[&str] = &[
    "farmer_id",
    "bank_id",
    "account_holder_name",
    "account_no_encrypted",
    "ifsc_code",
    "branch_name",
];

const FARMER_SEARCH_COLUMNS: &[&str] = &["farmer_name", "father_name", "mobile_number", "aadhar_number"];
const LAND_SEARCH_COLUMNS: &[&str] = &["owner_name", "village_name", "sr_no", "district_name", "city_name"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("schema migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("datastore not initialised at {0}; run a sync first")]
    NotInitialised(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BankUpsert {
    Inserted,
    Updated,
}

/// Handle to the SQLite datastore file.
///
/// No connection is held between calls: every operation opens its own
/// connection, runs in one transaction, and closes it before returning.
/// Only [`Datastore::reset_schema`] creates the file.
#[derive(Debug, Clone)]
pub struct Datastore {
    path: PathBuf,
    options: SqliteConnectOptions,
}

impl Datastore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .foreign_keys(true)
            .disable_statement_logging();
        Self { path, options }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem used to name backups, e.g. `farmer_land_records`.
    pub fn dataset_name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "datastore".to_string())
    }

    pub fn extension(&self) -> String {
        self.path
            .extension()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "db".to_string())
    }

    async fn connect(&self) -> Result<SqliteConnection, StoreError> {
        if !fs::try_exists(&self.path).await? {
            return Err(StoreError::NotInitialised(self.path.clone()));
        }
        Ok(self.options.connect().await?)
    }

    /// Create every table on a fresh datastore file.
    pub async fn reset_schema(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut conn = self.options.clone().create_if_missing(true).connect().await?;
        MIGRATOR.run(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }

    /// Insert one farmer and return its surrogate id. Never checks for an
    /// existing row: the datastore is rebuilt before every run.
    pub async fn store_farmer(&self, farmer: &NewFarmer) -> Result<i64, StoreError> {
        let sql = insert_statement("farmers", FARMER_COLUMNS);
        let now = Utc::now();

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let result = sqlx::query(&sql)
            .bind(farmer.farmer_id)
            .bind(&farmer.farmer_name)
            .bind(&farmer.father_name)
            .bind(&farmer.grandfather_name)
            .bind(farmer.mobile_number.as_deref())
            .bind(farmer.aadhar_number.as_deref())
            .bind(&farmer.village_name)
            .bind(&farmer.district_name)
            .bind(&farmer.city_name)
            .bind(farmer.owner_area.as_deref())
            .bind(farmer.final_owner_area.as_deref())
            .bind(farmer.update_owner_area.as_deref())
            .bind(farmer.owner_type)
            .bind(&farmer.verify_status)
            .bind(farmer.auction)
            .bind(&farmer.source_api)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        conn.close().await?;
        Ok(result.last_insert_rowid())
    }

    /// Insert all land records for one farmer atomically: either every row
    /// commits or none does.
    pub async fn store_land_records_bulk(
        &self,
        records: &[NewLandRecord],
        farmer_pk: i64,
    ) -> Result<usize, StoreError> {
        let sql = insert_statement("land_records", LAND_COLUMNS);
        let now = Utc::now();

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        for record in records {
            sqlx::query(&sql)
                .bind(record.upstream_id)
                .bind(farmer_pk)
                .bind(record.sr_no.as_deref())
                .bind(record.owner_id)
                .bind(&record.owner_name)
                .bind(record.revenue_village_id)
                .bind(&record.village_name)
                .bind(&record.city_name)
                .bind(&record.district_name)
                .bind(&record.area_type)
                .bind(&record.owner_area)
                .bind(record.land_owner_area_k)
                .bind(record.land_owner_area_m)
                .bind(record.land_owner_area_sarsai)
                .bind(record.owner_type.as_deref())
                .bind(&record.khewat_no)
                .bind(&record.khasra_no)
                .bind(&record.period)
                .bind(record.land_type.as_deref())
                .bind(record.kanal)
                .bind(record.marle)
                .bind(record.sarsai)
                .bind(record.mapped_area)
                .bind(record.license_id)
                .bind(record.verify_status)
                .bind(record.kanal1)
                .bind(record.marle1)
                .bind(record.sarsai1)
                .bind(record.commodity_id)
                .bind(record.min_land)
                .bind(record.auction)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        conn.close().await?;
        Ok(records.len())
    }

    /// Get-or-create the single bank row for a farmer and overwrite its fields.
    pub async fn upsert_bank_detail(
        &self,
        detail: &NewBankDetail,
        farmer_pk: i64,
    ) -> Result<BankUpsert, StoreError> {
        let now = Utc::now();

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM farmer_bank_details WHERE farmer_id = ?")
                .bind(farmer_pk)
                .fetch_optional(&mut *tx)
                .await?;

        let outcome = match existing {
            Some(id) => {
                let assignments = BANK_COLUMNS[1..]
                    .iter()
                    .map(|column| format!("{column} = ?"))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "UPDATE farmer_bank_details SET {assignments}, updated_at = ? WHERE id = ?"
                );
                sqlx::query(&sql)
                    .bind(detail.bank_id)
                    .bind(&detail.account_holder_name)
                    .bind(&detail.account_no_encrypted)
                    .bind(&detail.ifsc_code)
                    .bind(&detail.branch_name)
                    .bind(now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                BankUpsert::Updated
            }
            None => {
                let sql = insert_statement("farmer_bank_details", BANK_COLUMNS);
                sqlx::query(&sql)
                    .bind(farmer_pk)
                    .bind(detail.bank_id)
                    .bind(&detail.account_holder_name)
                    .bind(&detail.account_no_encrypted)
                    .bind(&detail.ifsc_code)
                    .bind(&detail.branch_name)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                BankUpsert::Inserted
            }
        };
        tx.commit().await?;
        conn.close().await?;
        Ok(outcome)
    }

    /// Every persisted (surrogate id, external id, source), ordered by surrogate id.
    pub async fn list_persisted_farmers(&self) -> Result<Vec<FarmerKey>, StoreError> {
        let mut conn = self.connect().await?;
        let rows: Vec<(i64, i64, String)> = sqlx::query_as(
            "SELECT DISTINCT id, farmer_id, source_api FROM farmers ORDER BY id",
        )
        .fetch_all(&mut conn)
        .await?;
        conn.close().await?;
        Ok(rows
            .into_iter()
            .map(|(id, farmer_id, source_api)| FarmerKey {
                id,
                farmer_id,
                source_api,
            })
            .collect())
    }

    pub async fn list_distinct_farmer_ids(&self) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.connect().await?;
        let ids = sqlx::query_scalar("SELECT DISTINCT farmer_id FROM farmers ORDER BY farmer_id")
            .fetch_all(&mut conn)
            .await?;
        conn.close().await?;
        Ok(ids)
    }

    pub async fn list_farmers(&self, query: &FarmerQuery) -> Result<Page<FarmerSummary>, StoreError> {
        let (page, per_page) = query.paging.normalized();
        let mut conn = self.connect().await?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM farmers f");
        push_farmer_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&mut conn).await?;

        let mut select = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT f.id, f.farmer_id, f.farmer_name, f.father_name, f.grandfather_name,
                   f.mobile_number, f.aadhar_number, f.village_name, f.source_api,
                   f.owner_area, f.final_owner_area, f.created_at, f.updated_at,
                   (SELECT COUNT(*) FROM land_records lr WHERE lr.farmer_id = f.id) AS total_land_records,
                   (SELECT COALESCE(SUM(lr.kanal), 0.0) FROM land_records lr WHERE lr.farmer_id = f.id) AS total_kanal,
                   (SELECT COALESCE(SUM(lr.marle), 0.0) FROM land_records lr WHERE lr.farmer_id = f.id) AS total_marle,
                   (SELECT COALESCE(SUM(lr.sarsai), 0.0) FROM land_records lr WHERE lr.farmer_id = f.id) AS total_sarsai,
                   fbd.bank_id, fbd.account_holder_name, fbd.account_no_encrypted,
                   fbd.ifsc_code, fbd.branch_name
              FROM farmers f
              LEFT JOIN farmer_bank_details fbd ON fbd.farmer_id = f.id
            "#,
        );
        push_farmer_filters(&mut select, query);
        select
            .push(" ORDER BY f.id LIMIT ")
            .push_bind(per_page as i64)
            .push(" OFFSET ")
            .push_bind(((page - 1) * per_page) as i64);
        let rows: Vec<FarmerSummaryRow> = select.build_query_as().fetch_all(&mut conn).await?;
        conn.close().await?;

        let data = rows.into_iter().map(FarmerSummary::from).collect();
        Ok(Page::new(data, total.max(0) as usize, page, per_page))
    }

    pub async fn get_farmer(&self, farmer_pk: i64) -> Result<Option<FarmerDetail>, StoreError> {
        let mut conn = self.connect().await?;

        let farmer_sql = format!(
            "SELECT id, {}, created_at, updated_at FROM farmers WHERE id = ?",
            FARMER_COLUMNS.join(", ")
        );
        let Some(farmer) = sqlx::query_as::<_, FarmerRow>(&farmer_sql)
            .bind(farmer_pk)
            .fetch_optional(&mut conn)
            .await?
        else {
            conn.close().await?;
            return Ok(None);
        };

        let land_sql = format!(
            "SELECT id, {}, created_at, updated_at FROM land_records WHERE farmer_id = ? ORDER BY id",
            LAND_COLUMNS.join(", ")
        );
        let lands = sqlx::query_as::<_, LandRecordRow>(&land_sql)
            .bind(farmer_pk)
            .fetch_all(&mut conn)
            .await?;

        let bank_sql = format!(
            "SELECT id, {}, created_at, updated_at FROM farmer_bank_details WHERE farmer_id = ?",
            BANK_COLUMNS.join(", ")
        );
        let bank = sqlx::query_as::<_, BankDetailRow>(&bank_sql)
            .bind(farmer_pk)
            .fetch_optional(&mut conn)
            .await?;
        conn.close().await?;

        let mut area = LandArea::default();
        for land in &lands {
            area += LandArea::new(
                land.kanal.unwrap_or_default(),
                land.marle.unwrap_or_default(),
                land.sarsai.unwrap_or_default(),
            );
        }

        Ok(Some(FarmerDetail {
            farmer,
            total_area_acres: area.to_acres(),
            lands,
            bank_detail: bank.map(BankDetailView::from),
        }))
    }

    pub async fn list_lands(&self, query: &LandQuery) -> Result<Page<LandSummary>, StoreError> {
        let (page, per_page) = query.paging.normalized();
        let mut conn = self.connect().await?;

        let mut count = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM land_records lr LEFT JOIN farmers f ON f.id = lr.farmer_id",
        );
        push_land_filters(&mut count, query);
        let total: i64 = count.build_query_scalar().fetch_one(&mut conn).await?;

        let mut select = QueryBuilder::<Sqlite>::new(LAND_SUMMARY_SELECT);
        push_land_filters(&mut select, query);
        select
            .push(" ORDER BY lr.id LIMIT ")
            .push_bind(per_page as i64)
            .push(" OFFSET ")
            .push_bind(((page - 1) * per_page) as i64);
        let rows: Vec<LandSummaryRow> = select.build_query_as().fetch_all(&mut conn).await?;
        conn.close().await?;

        let data = rows.into_iter().map(LandSummary::from).collect();
        Ok(Page::new(data, total.max(0) as usize, page, per_page))
    }

    pub async fn get_land(&self, land_id: i64) -> Result<Option<LandSummary>, StoreError> {
        let mut conn = self.connect().await?;
        let mut select = QueryBuilder::<Sqlite>::new(LAND_SUMMARY_SELECT);
        select.push(" WHERE lr.id = ").push_bind(land_id);
        let row: Option<LandSummaryRow> = select.build_query_as().fetch_optional(&mut conn).await?;
        conn.close().await?;
        Ok(row.map(LandSummary::from))
    }

    /// Returns `false` when no land record has this id.
    pub async fn update_land(&self, land_id: i64, update: &LandUpdate) -> Result<bool, StoreError> {
        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE land_records
               SET type = ?,
                   land_owner_area_k = ?,
                   land_owner_area_m = ?,
                   land_owner_area_sarsai = ?,
                   khewat_no = ?,
                   updated_at = ?
             WHERE id = ?
            "#,
        )
        .bind(update.land_type.as_deref())
        .bind(update.land_owner_area_k)
        .bind(update.land_owner_area_m)
        .bind(update.land_owner_area_sarsai)
        .bind(update.khewat_no.as_deref())
        .bind(Utc::now())
        .bind(land_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        conn.close().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn stats(&self) -> Result<Stats, StoreError> {
        let mut conn = self.connect().await?;
        let total_farmers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM farmers")
            .fetch_one(&mut conn)
            .await?;
        let total_lands: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM land_records")
            .fetch_one(&mut conn)
            .await?;
        let total_area: f64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(CAST(owner_area AS REAL)), 0.0) FROM land_records",
        )
        .fetch_one(&mut conn)
        .await?;
        conn.close().await?;
        Ok(Stats {
            total_farmers,
            total_lands,
            total_area,
        })
    }
}

fn insert_statement(table: &str, columns: &[&str]) -> String {
    let placeholders = vec!["?"; columns.len() + 2].join(", ");
    format!(
        "INSERT INTO {table} ({}, created_at, updated_at) VALUES ({placeholders})",
        columns.join(", ")
    )
}

fn like_pattern(search: Option<&str>) -> Option<String> {
    search
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", s.to_lowercase()))
}

fn push_farmer_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &FarmerQuery) {
    builder.push(" WHERE 1 = 1");
    if let Some(pattern) = like_pattern(query.search.as_deref()) {
        builder.push(" AND (");
        for (idx, column) in FARMER_SEARCH_COLUMNS.iter().enumerate() {
            if idx > 0 {
                builder.push(" OR ");
            }
            builder
                .push(format!("LOWER(f.{column}) LIKE "))
                .push_bind(pattern.clone());
        }
        builder.push(")");
    }
    if let Some(source_api) = query.source_api.as_deref().filter(|s| !s.is_empty()) {
        builder
            .push(" AND f.source_api = ")
            .push_bind(source_api.to_string());
    }
    if query.without_land {
        builder.push(" AND NOT EXISTS (SELECT 1 FROM land_records lr WHERE lr.farmer_id = f.id)");
    }
}

fn push_land_filters(builder: &mut QueryBuilder<'_, Sqlite>, query: &LandQuery) {
    let Some(pattern) = like_pattern(query.search.as_deref()) else {
        return;
    };
    builder.push(" WHERE (");
    for column in LAND_SEARCH_COLUMNS {
        builder
            .push(format!("LOWER(lr.{column}) LIKE "))
            .push_bind(pattern.clone())
            .push(" OR ");
    }
    builder
        .push("LOWER(f.farmer_name) LIKE ")
        .push_bind(pattern)
        .push(")");
}

const LAND_SUMMARY_SELECT: &str = r#"
    SELECT lr.id, lr.farmer_id, lr.sr_no, lr.district_name, lr.city_name, lr.village_name,
           lr.owner_name, lr.khewat_no, lr.kanal, lr.marle, lr.sarsai, lr.type, lr.min_land,
           lr.land_owner_area_k, lr.land_owner_area_m, lr.land_owner_area_sarsai,
           lr.verify_status AS status, lr.created_at, lr.updated_at,
           f.farmer_name, f.mobile_number AS farmer_phone
      FROM land_records lr
      LEFT JOIN farmers f ON f.id = lr.farmer_id
"#;

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

fn serialize_timestamp<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.format("%Y-%m-%d %H:%M:%S").to_string())
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Paging {
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl Paging {
    pub const DEFAULT_PER_PAGE: usize = 10;
    pub const MAX_PER_PAGE: usize = 200;

    pub fn new(page: usize, per_page: usize) -> Self {
        Self {
            page: Some(page),
            per_page: Some(per_page),
        }
    }

    /// 1-based page and a bounded page size.
    pub fn normalized(&self) -> (usize, usize) {
        let page = self.page.unwrap_or(1).max(1);
        let per_page = self
            .per_page
            .unwrap_or(Self::DEFAULT_PER_PAGE)
            .clamp(1, Self::MAX_PER_PAGE);
        (page, per_page)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FarmerQuery {
    pub paging: Paging,
    pub search: Option<String>,
    pub source_api: Option<String>,
    /// Only farmers with no land records.
    pub without_land: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LandQuery {
    pub paging: Paging,
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: usize, page: usize, per_page: usize) -> Self {
        Self {
            data,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FarmerRow {
    pub id: i64,
    pub farmer_id: i64,
    pub farmer_name: Option<String>,
    pub father_name: Option<String>,
    pub grandfather_name: Option<String>,
    pub mobile_number: Option<String>,
    pub aadhar_number: Option<String>,
    pub village_name: Option<String>,
    pub district_name: Option<String>,
    pub city_name: Option<String>,
    pub owner_area: Option<String>,
    pub final_owner_area: Option<String>,
    pub update_owner_area: Option<String>,
    pub owner_type: Option<i64>,
    pub verify_status: Option<String>,
    pub auction: Option<i64>,
    pub source_api: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LandRecordRow {
    pub id: i64,
    pub upstream_id: Option<i64>,
    pub farmer_id: i64,
    pub sr_no: Option<String>,
    pub owner_id: Option<i64>,
    pub owner_name: Option<String>,
    pub revenue_village_id: Option<i64>,
    pub village_name: Option<String>,
    pub city_name: Option<String>,
    pub district_name: Option<String>,
    pub area_type: Option<String>,
    pub owner_area: Option<String>,
    pub land_owner_area_k: Option<f64>,
    pub land_owner_area_m: Option<f64>,
    pub land_owner_area_sarsai: Option<f64>,
    pub owner_type: Option<String>,
    pub khewat_no: Option<String>,
    pub khasra_no: Option<String>,
    pub period: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub land_type: Option<String>,
    pub kanal: Option<f64>,
    pub marle: Option<f64>,
    pub sarsai: Option<f64>,
    pub mapped_area: Option<f64>,
    pub license_id: Option<i64>,
    pub verify_status: Option<i64>,
    pub kanal1: Option<f64>,
    pub marle1: Option<f64>,
    pub sarsai1: Option<f64>,
    pub commodity_id: Option<i64>,
    pub min_land: Option<f64>,
    pub auction: Option<i64>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct BankDetailRow {
    pub id: i64,
    pub farmer_id: i64,
    pub bank_id: Option<i64>,
    pub account_holder_name: Option<String>,
    pub account_no_encrypted: Option<String>,
    pub ifsc_code: Option<String>,
    pub branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bank detail as rendered: the account number is decrypted here and nowhere
/// else. `account_no` is `"N/A"` without ciphertext and `None` when the
/// ciphertext does not decrypt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BankDetailView {
    pub bank_id: Option<i64>,
    pub bank_name: Option<String>,
    pub account_holder_name: Option<String>,
    pub account_no: Option<String>,
    pub ifsc_code: Option<String>,
    pub branch_name: Option<String>,
}

impl BankDetailView {
    fn reveal(
        bank_id: Option<i64>,
        account_holder_name: Option<String>,
        account_no_encrypted: Option<&str>,
        ifsc_code: Option<String>,
        branch_name: Option<String>,
    ) -> Self {
        let account_no = match account_no_encrypted.map(str::trim).filter(|c| !c.is_empty()) {
            Some(ciphertext) => decrypt_account_no(ciphertext),
            None => Some("N/A".to_string()),
        };
        Self {
            bank_id,
            bank_name: None,
            account_holder_name,
            account_no,
            ifsc_code,
            branch_name,
        }
    }
}

impl From<BankDetailRow> for BankDetailView {
    fn from(row: BankDetailRow) -> Self {
        Self::reveal(
            row.bank_id,
            row.account_holder_name,
            row.account_no_encrypted.as_deref(),
            row.ifsc_code,
            row.branch_name,
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmerDetail {
    #[serde(flatten)]
    pub farmer: FarmerRow,
    pub lands: Vec<LandRecordRow>,
    pub bank_detail: Option<BankDetailView>,
    pub total_area_acres: f64,
}

#[derive(Debug, Clone, FromRow)]
struct FarmerSummaryRow {
    id: i64,
    farmer_id: i64,
    farmer_name: Option<String>,
    father_name: Option<String>,
    grandfather_name: Option<String>,
    mobile_number: Option<String>,
    aadhar_number: Option<String>,
    village_name: Option<String>,
    source_api: String,
    owner_area: Option<String>,
    final_owner_area: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    total_land_records: i64,
    total_kanal: f64,
    total_marle: f64,
    total_sarsai: f64,
    bank_id: Option<i64>,
    account_holder_name: Option<String>,
    account_no_encrypted: Option<String>,
    ifsc_code: Option<String>,
    branch_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FarmerSummary {
    pub id: i64,
    pub farmer_id: i64,
    pub farmer_name: Option<String>,
    pub father_name: Option<String>,
    pub grandfather_name: Option<String>,
    pub mobile_number: Option<String>,
    pub aadhar_number: Option<String>,
    pub village_name: Option<String>,
    pub source_api: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub updated_at: DateTime<Utc>,
    pub total_land_records: i64,
    pub total_land: Option<String>,
    pub area_under_cultivation: Option<String>,
    pub total_area_acres: f64,
    pub bank_detail: Option<BankDetailView>,
}

impl From<FarmerSummaryRow> for FarmerSummary {
    fn from(row: FarmerSummaryRow) -> Self {
        let has_ciphertext = row
            .account_no_encrypted
            .as_deref()
            .is_some_and(|c| !c.trim().is_empty());
        let bank_detail = has_ciphertext.then(|| {
            BankDetailView::reveal(
                row.bank_id,
                row.account_holder_name.clone(),
                row.account_no_encrypted.as_deref(),
                row.ifsc_code.clone(),
                row.branch_name.clone(),
            )
        });
        Self {
            id: row.id,
            farmer_id: row.farmer_id,
            farmer_name: row.farmer_name,
            father_name: row.father_name,
            grandfather_name: row.grandfather_name,
            mobile_number: row.mobile_number,
            aadhar_number: row.aadhar_number,
            village_name: row.village_name,
            source_api: row.source_api,
            created_at: row.created_at,
            updated_at: row.updated_at,
            total_land_records: row.total_land_records,
            total_land: row.owner_area,
            area_under_cultivation: row.final_owner_area,
            total_area_acres: LandArea::new(row.total_kanal, row.total_marle, row.total_sarsai)
                .to_acres(),
            bank_detail,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct LandSummaryRow {
    id: i64,
    farmer_id: i64,
    sr_no: Option<String>,
    district_name: Option<String>,
    city_name: Option<String>,
    village_name: Option<String>,
    owner_name: Option<String>,
    khewat_no: Option<String>,
    kanal: Option<f64>,
    marle: Option<f64>,
    sarsai: Option<f64>,
    #[sqlx(rename = "type")]
    land_type: Option<String>,
    min_land: Option<f64>,
    land_owner_area_k: Option<f64>,
    land_owner_area_m: Option<f64>,
    land_owner_area_sarsai: Option<f64>,
    status: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    farmer_name: Option<String>,
    farmer_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LandSummary {
    pub id: i64,
    pub farmer_id: i64,
    pub farmer_name: String,
    pub farmer_phone: Option<String>,
    pub sr_no: Option<String>,
    pub owner_name: Option<String>,
    pub district_name: Option<String>,
    pub city_name: Option<String>,
    pub village_name: Option<String>,
    pub khewat_no: Option<String>,
    pub kanal: f64,
    pub marle: f64,
    pub sarsai: f64,
    pub land_owner_area_k: f64,
    pub land_owner_area_m: f64,
    pub land_owner_area_sarsai: f64,
    #[serde(rename = "type")]
    pub land_type: Option<String>,
    pub min_land: Option<f64>,
    pub status: Option<i64>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl From<LandSummaryRow> for LandSummary {
    fn from(row: LandSummaryRow) -> Self {
        Self {
            id: row.id,
            farmer_id: row.farmer_id,
            farmer_name: row
                .farmer_name
                .unwrap_or_else(|| "Unknown Farmer".to_string()),
            farmer_phone: row.farmer_phone,
            sr_no: row.sr_no,
            owner_name: row.owner_name,
            district_name: row.district_name,
            city_name: row.city_name,
            village_name: row.village_name,
            khewat_no: row.khewat_no,
            kanal: row.kanal.unwrap_or_default(),
            marle: row.marle.unwrap_or_default(),
            sarsai: row.sarsai.unwrap_or_default(),
            land_owner_area_k: row.land_owner_area_k.unwrap_or_default(),
            land_owner_area_m: row.land_owner_area_m.unwrap_or_default(),
            land_owner_area_sarsai: row.land_owner_area_sarsai.unwrap_or_default(),
            land_type: row.land_type,
            min_land: row.min_land,
            status: row.status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Editable land fields. Absent fields are written as NULL.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LandUpdate {
    #[serde(rename = "type")]
    pub land_type: Option<String>,
    pub land_owner_area_k: Option<f64>,
    pub land_owner_area_m: Option<f64>,
    pub land_owner_area_sarsai: Option<f64>,
    pub khewat_no: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stats {
    pub total_farmers: i64,
    pub total_lands: i64,
    pub total_area: f64,
}

// ---------------------------------------------------------------------------
// Snapshot rotation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneOutcome {
    pub removed: Vec<PathBuf>,
    pub failures: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotOutcome {
    pub backup_path: Option<PathBuf>,
    pub pruned: Vec<PathBuf>,
    pub prune_failures: usize,
    pub removed_existing: bool,
}

/// Backs up, prunes, and recreates the datastore file before a run.
#[derive(Debug, Clone)]
pub struct SnapshotManager {
    backup_dir: PathBuf,
    keep: usize,
}

impl SnapshotManager {
    pub const DEFAULT_KEEP: usize = 5;

    pub fn new(backup_dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            keep,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// `<dataset>_<YYYYMMDD_HHMMSS>.<ext>` inside the backup directory.
    pub fn backup_path_for(&self, datastore: &Datastore, at: DateTime<Local>) -> PathBuf {
        let stamp = at.format("%Y%m%d_%H%M%S");
        self.backup_dir.join(format!(
            "{}_{stamp}.{}",
            datastore.dataset_name(),
            datastore.extension()
        ))
    }

    /// Copy the datastore file aside. `Ok(None)` when there is nothing to copy.
    pub async fn backup(&self, datastore: &Datastore) -> anyhow::Result<Option<PathBuf>> {
        let source = datastore.path();
        if !fs::try_exists(source)
            .await
            .with_context(|| format!("checking datastore path {}", source.display()))?
        {
            info!(path = %source.display(), "no existing datastore; starting without backup");
            return Ok(None);
        }

        fs::create_dir_all(&self.backup_dir)
            .await
            .with_context(|| format!("creating backup directory {}", self.backup_dir.display()))?;
        let target = self.backup_path_for(datastore, Local::now());
        fs::copy(source, &target).await.with_context(|| {
            format!("copying {} -> {}", source.display(), target.display())
        })?;
        info!(path = %target.display(), "datastore backed up");
        Ok(Some(target))
    }

    /// Backups of this datastore, oldest modification time first.
    pub fn list_backups(&self, datastore: &Datastore) -> anyhow::Result<Vec<PathBuf>> {
        if !self.backup_dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", datastore.dataset_name());
        let suffix = format!(".{}", datastore.extension());
        let mut entries = std::fs::read_dir(&self.backup_dir)
            .with_context(|| format!("reading {}", self.backup_dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.starts_with(&prefix) && name.ends_with(&suffix)
            })
            .collect::<Vec<_>>();
        entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
        Ok(entries.into_iter().map(|e| e.path()).collect())
    }

    /// Keep the `keep` most recently modified backups and delete the rest.
    pub fn prune(&self, datastore: &Datastore) -> PruneOutcome {
        let backups = match self.list_backups(datastore) {
            Ok(backups) => backups,
            Err(err) => {
                error!(error = %err, "listing backups failed; skipping prune");
                return PruneOutcome {
                    removed: Vec::new(),
                    failures: 1,
                };
            }
        };

        let excess = backups.len().saturating_sub(self.keep);
        let mut outcome = PruneOutcome::default();
        for old in backups.into_iter().take(excess) {
            match std::fs::remove_file(&old) {
                Ok(()) => {
                    info!(path = %old.display(), "removed old backup");
                    outcome.removed.push(old);
                }
                Err(err) => {
                    warn!(path = %old.display(), error = %err, "failed to remove old backup");
                    outcome.failures += 1;
                }
            }
        }
        outcome
    }

    /// Delete the datastore file and its SQLite sidecar files.
    pub async fn remove_datastore(&self, datastore: &Datastore) -> anyhow::Result<bool> {
        let path = datastore.path();
        let existed = fs::try_exists(path)
            .await
            .with_context(|| format!("checking datastore path {}", path.display()))?;
        if existed {
            fs::remove_file(path)
                .await
                .with_context(|| format!("removing {}", path.display()))?;
            info!(path = %path.display(), "existing datastore removed");
        } else {
            info!(path = %path.display(), "no existing datastore to remove");
        }

        for suffix in ["-wal", "-shm", "-journal"] {
            let mut sidecar = path.as_os_str().to_owned();
            sidecar.push(suffix);
            let sidecar = PathBuf::from(sidecar);
            if sidecar.exists() {
                if let Err(err) = fs::remove_file(&sidecar).await {
                    warn!(path = %sidecar.display(), error = %err, "failed to remove sidecar file");
                }
            }
        }
        Ok(existed)
    }

    /// Back up, prune, delete, and recreate. Only schema recreation can fail
    /// the call; every other step is logged and recorded in the outcome.
    pub async fn rotate_and_reset(&self, datastore: &Datastore) -> anyhow::Result<SnapshotOutcome> {
        let backup_path = self.backup(datastore).await.unwrap_or_else(|err| {
            error!(error = %err, "datastore backup failed; continuing");
            None
        });
        let prune = self.prune(datastore);
        let removed_existing = self.remove_datastore(datastore).await.unwrap_or_else(|err| {
            error!(error = %err, "removing datastore failed; continuing");
            false
        });

        datastore
            .reset_schema()
            .await
            .with_context(|| format!("recreating schema in {}", datastore.path().display()))?;

        Ok(SnapshotOutcome {
            backup_path,
            pruned: prune.removed,
            prune_failures: prune.failures,
            removed_existing,
        })
    }
}
