use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::error::IngestError;

pub const DEFAULT_RAW_DATASET: &str = "raw";
pub const DEFAULT_LOCATION: &str = "southamerica-east1";
pub const RESERVOIR_TABLE: &str = "gold.dados_reservatorios_completo";
pub const RESERVOIR_DATE_COLUMN: &str = "ena_data";
pub const MAX_PAGE_SIZE: u32 = 1000;

pub const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";

#[derive(Error, Debug)]
pub enum WarehouseError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("missing project id")]
    MissingProject,

    #[error("BigQuery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("BigQuery returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("query did not complete in time")]
    Incomplete,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn table_exists(&self, dataset: &str, table: &str) -> Result<bool, WarehouseError>;

    async fn value_exists(
        &self,
        dataset: &str,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<bool, WarehouseError>;

    async fn query_page(
        &self,
        table: &str,
        date_column: &str,
        query: &ReservoirQuery,
    ) -> Result<ReservoirPage, WarehouseError>;
}

/// Raw table of a package: every non-alphanumeric character becomes `_`.
pub fn raw_table_name(package: &str) -> String {
    package
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn quote_identifier(ident: &str) -> Result<String, WarehouseError> {
    let valid = !ident.is_empty()
        && ident
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    if valid {
        Ok(format!("`{ident}`"))
    } else {
        Err(WarehouseError::InvalidIdentifier(ident.to_string()))
    }
}

/// Best-effort existence check used to skip already ingested files.
///
/// A missing raw table means nothing was loaded yet. Any other warehouse error
/// is logged and reported as "not found": re-ingesting is harmless, skipping is not.
pub struct DedupCheck {
    warehouse: Arc<dyn Warehouse>,
    dataset: String,
}

impl DedupCheck {
    pub fn new(warehouse: Arc<dyn Warehouse>, dataset: impl Into<String>) -> Self {
        Self {
            warehouse,
            dataset: dataset.into(),
        }
    }

    pub async fn raw_table_has_value(&self, package: &str, column: &str, value: &str) -> bool {
        let table = raw_table_name(package);

        match self.warehouse.table_exists(&self.dataset, &table).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Raw table {}.{} does not exist yet", self.dataset, table);
                return false;
            }
            Err(e) => {
                warn!("Could not check raw table {}.{}: {}", self.dataset, table, e);
                return false;
            }
        }

        match self
            .warehouse
            .value_exists(&self.dataset, &table, column, value)
            .await
        {
            Ok(found) => {
                debug!("{}.{}.{} = {:?}: {}", self.dataset, table, column, value, found);
                found
            }
            Err(WarehouseError::TableNotFound(_)) => false,
            Err(e) => {
                warn!("Dedup query on {}.{} failed: {}", self.dataset, table, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservoirQuery {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub page: u32,
    pub page_size: u32,
}

impl ReservoirQuery {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.start_date > self.end_date {
            return Err(IngestError::InvalidQuery(
                "start date must be before end date".to_string(),
            ));
        }
        if self.page < 1 {
            return Err(IngestError::InvalidQuery("page must be at least 1".to_string()));
        }
        if self.page_size < 1 || self.page_size > MAX_PAGE_SIZE {
            return Err(IngestError::InvalidQuery(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservoirPage {
    pub data: Vec<Map<String, Value>>,
    pub total_records: u64,
    pub page: u32,
    pub page_size: u32,
}

/// Reads one page of the curated reservoir table.
pub async fn fetch_reservoir_page(
    warehouse: &dyn Warehouse,
    query: &ReservoirQuery,
) -> Result<ReservoirPage, IngestError> {
    query.validate()?;
    info!(
        "Fetching reservoir data from {} to {} (page {}, size {})",
        query.start_date, query.end_date, query.page, query.page_size
    );
    Ok(warehouse
        .query_page(RESERVOIR_TABLE, RESERVOIR_DATE_COLUMN, query)
        .await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
struct TableField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Value,
}

impl QueryResponse {
    fn records(self) -> Vec<Map<String, Value>> {
        let names: Vec<String> = self
            .schema
            .map(|s| s.fields.into_iter().map(|f| f.name).collect())
            .unwrap_or_default();
        self.rows
            .into_iter()
            .map(|row| names.iter().cloned().zip(row.f.into_iter().map(|c| c.v)).collect())
            .collect()
    }

    fn first_count(&self) -> u64 {
        self.rows
            .first()
            .and_then(|row| row.f.first())
            .and_then(|cell| match &cell.v {
                Value::String(s) => s.parse().ok(),
                Value::Number(n) => n.as_u64(),
                _ => None,
            })
            .unwrap_or(0)
    }
}

/// BigQuery over its REST API. Credentials are a pre-issued OAuth bearer token.
pub struct BigQueryWarehouse {
    client: reqwest::Client,
    api_base: String,
    project_id: Option<String>,
    location: String,
    access_token: Option<String>,
}

impl BigQueryWarehouse {
    pub fn new(
        project_id: Option<String>,
        location: impl Into<String>,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, WarehouseError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: BIGQUERY_API.to_string(),
            project_id: project_id.filter(|p| !p.trim().is_empty()),
            location: location.into(),
            access_token: access_token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Sends requests to `api_base` instead of the public BigQuery endpoint.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn project(&self) -> Result<&str, WarehouseError> {
        self.project_id.as_deref().ok_or(WarehouseError::MissingProject)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn run_query(&self, sql: &str, params: Vec<Value>) -> Result<QueryResponse, WarehouseError> {
        let project = self.project()?;
        let url = format!("{}/projects/{project}/queries", self.api_base);
        debug!("Running BigQuery query: {}", sql);

        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "location": self.location,
            "parameterMode": "NAMED",
            "queryParameters": params,
        });

        let resp = self.authorize(self.client.post(&url)).json(&body).send().await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(WarehouseError::TableNotFound(resp.text().await.unwrap_or_default()));
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(WarehouseError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: QueryResponse = resp.json().await?;
        if !parsed.job_complete {
            return Err(WarehouseError::Incomplete);
        }
        Ok(parsed)
    }
}

fn param(name: &str, kind: &str, value: &str) -> Value {
    json!({
        "name": name,
        "parameterType": {"type": kind},
        "parameterValue": {"value": value},
    })
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn table_exists(&self, dataset: &str, table: &str) -> Result<bool, WarehouseError> {
        let project = self.project()?;
        let url = format!(
            "{}/projects/{project}/datasets/{dataset}/tables/{table}",
            self.api_base
        );

        let resp = self.authorize(self.client.get(&url)).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(true)
        } else if status == StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(WarehouseError::Status {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            })
        }
    }

    async fn value_exists(
        &self,
        dataset: &str,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<bool, WarehouseError> {
        let target = quote_identifier(&format!("{}.{}.{}", self.project()?, dataset, table))?;
        let column = quote_identifier(column)?;
        let sql = format!("SELECT 1 FROM {target} WHERE CAST({column} AS STRING) = @value LIMIT 1");

        let resp = self.run_query(&sql, vec![param("value", "STRING", value)]).await?;
        Ok(!resp.rows.is_empty())
    }

    async fn query_page(
        &self,
        table: &str,
        date_column: &str,
        query: &ReservoirQuery,
    ) -> Result<ReservoirPage, WarehouseError> {
        let target = quote_identifier(&format!("{}.{}", self.project()?, table))?;
        let column = quote_identifier(date_column)?;
        let filter = format!("WHERE {column} >= @start_date AND {column} <= @end_date");
        let params = || {
            vec![
                param("start_date", "DATE", &query.start_date.to_string()),
                param("end_date", "DATE", &query.end_date.to_string()),
            ]
        };

        let count_sql = format!("SELECT COUNT(*) AS total FROM {target} {filter}");
        let total_records = self.run_query(&count_sql, params()).await?.first_count();

        let page_sql = format!(
            "SELECT * FROM {target} {filter} ORDER BY {column} ASC LIMIT {} OFFSET {}",
            query.page_size,
            query.offset()
        );
        let data = self.run_query(&page_sql, params()).await?.records();

        info!("Query returned {} rows of {} total", data.len(), total_records);
        Ok(ReservoirPage {
            data,
            total_records,
            page: query.page,
            page_size: query.page_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeWarehouse {
        tables: Vec<String>,
        values: Vec<String>,
        fail_lookup: bool,
        lookups: Mutex<usize>,
    }

    #[async_trait]
    impl Warehouse for FakeWarehouse {
        async fn table_exists(&self, _dataset: &str, table: &str) -> Result<bool, WarehouseError> {
            Ok(self.tables.iter().any(|t| t == table))
        }

        async fn value_exists(
            &self,
            _dataset: &str,
            _table: &str,
            _column: &str,
            value: &str,
        ) -> Result<bool, WarehouseError> {
            *self.lookups.lock().unwrap() += 1;
            if self.fail_lookup {
                return Err(WarehouseError::Status {
                    status: 500,
                    message: "backend error".to_string(),
                });
            }
            Ok(self.values.iter().any(|v| v == value))
        }

        async fn query_page(
            &self,
            _table: &str,
            _date_column: &str,
            query: &ReservoirQuery,
        ) -> Result<ReservoirPage, WarehouseError> {
            Ok(ReservoirPage {
                data: Vec::new(),
                total_records: 0,
                page: query.page,
                page_size: query.page_size,
            })
        }
    }

    #[test]
    fn raw_table_name_replaces_separators() {
        assert_eq!(raw_table_name("ear-diario-por-reservatorio"), "ear_diario_por_reservatorio");
        assert_eq!(raw_table_name("a.b c"), "a_b_c");
    }

    #[test]
    fn identifiers_are_validated() {
        assert_eq!(quote_identifier("ear_data").unwrap(), "`ear_data`");
        assert_eq!(quote_identifier("my-proj.raw.t").unwrap(), "`my-proj.raw.t`");
        assert_matches!(quote_identifier("x`; DROP"), Err(WarehouseError::InvalidIdentifier(_)));
        assert_matches!(quote_identifier(""), Err(WarehouseError::InvalidIdentifier(_)));
    }

    #[tokio::test]
    async fn missing_table_is_not_a_match() {
        let warehouse = Arc::new(FakeWarehouse::default());
        let dedup = DedupCheck::new(warehouse.clone(), "raw");

        assert!(!dedup.raw_table_has_value("pkg", "ear_data", "2023-01-01").await);
        assert_eq!(*warehouse.lookups.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn existing_value_is_a_match() {
        let warehouse = Arc::new(FakeWarehouse {
            tables: vec!["my_pkg".to_string()],
            values: vec!["2023-01-01".to_string()],
            ..Default::default()
        });
        let dedup = DedupCheck::new(warehouse, "raw");

        assert!(dedup.raw_table_has_value("my-pkg", "ear_data", "2023-01-01").await);
        assert!(!dedup.raw_table_has_value("my-pkg", "ear_data", "2023-01-02").await);
    }

    #[tokio::test]
    async fn lookup_errors_are_not_a_match() {
        let warehouse = Arc::new(FakeWarehouse {
            tables: vec!["pkg".to_string()],
            values: vec!["2023-01-01".to_string()],
            fail_lookup: true,
            ..Default::default()
        });
        let dedup = DedupCheck::new(warehouse, "raw");

        assert!(!dedup.raw_table_has_value("pkg", "ear_data", "2023-01-01").await);
    }

    #[tokio::test]
    async fn reservoir_query_is_validated() {
        let warehouse = FakeWarehouse::default();
        let date = |d: &str| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap();
        let mut query = ReservoirQuery {
            start_date: date("2023-02-01"),
            end_date: date("2023-01-01"),
            page: 1,
            page_size: 100,
        };
        assert_matches!(
            fetch_reservoir_page(&warehouse, &query).await,
            Err(IngestError::InvalidQuery(_))
        );

        query.end_date = date("2023-03-01");
        query.page_size = MAX_PAGE_SIZE + 1;
        assert_matches!(
            fetch_reservoir_page(&warehouse, &query).await,
            Err(IngestError::InvalidQuery(_))
        );

        query.page = 3;
        query.page_size = 50;
        assert_eq!(query.offset(), 100);
        let page = fetch_reservoir_page(&warehouse, &query).await.unwrap();
        assert_eq!(page.page, 3);
        assert_eq!(page.page_size, 50);
    }

    #[test]
    fn query_response_rows_become_records() {
        let body = r#"{
            "jobComplete": true,
            "schema": {"fields": [{"name": "ena_data", "type": "DATE"}, {"name": "val", "type": "FLOAT"}]},
            "rows": [{"f": [{"v": "2023-01-01"}, {"v": "1.5"}]}, {"f": [{"v": "2023-01-02"}, {"v": null}]}]
        }"#;
        let resp: QueryResponse = serde_json::from_str(body).unwrap();
        let records = resp.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["ena_data"], "2023-01-01");
        assert_eq!(records[1]["val"], Value::Null);

        let count: QueryResponse =
            serde_json::from_str(r#"{"jobComplete": true, "rows": [{"f": [{"v": "42"}]}]}"#).unwrap();
        assert_eq!(count.first_count(), 42);
    }
}
