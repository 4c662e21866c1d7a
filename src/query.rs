//! Running SQL against a tabular query service.
//!
//! The pipeline only needs "run this query, give me rows", so that is all `QueryService` offers.
//! `BigQuery` is the real thing, `MemoryService` answers from a fixed set of tables, and `Offline`
//! refuses everything (for runs that must only use snapshots).
use crate::{config::Config, table, table::RowSet};
use qu::ick_use::*;
use reqwest::blocking::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    cell::Cell,
    collections::BTreeMap,
    env,
    time::{Duration, Instant},
};

/// Environment variable holding the OAuth access token for BigQuery.
pub const TOKEN_ENV: &str = "BIGQUERY_ACCESS_TOKEN";

pub trait QueryService {
    /// Run `sql` and return every result row.
    fn execute(&self, sql: &str) -> Result<RowSet>;
}

/// Client for the BigQuery REST API (v2).
pub struct BigQuery {
    client: Client,
    endpoint: String,
    project_id: String,
    location: Option<String>,
    token: Option<String>,
    timeout: Duration,
}

impl BigQuery {
    /// The token is only checked when a query actually runs, so runs served entirely from
    /// snapshots work without one.
    pub fn new(config: &Config, token: Option<String>) -> Result<Self> {
        config.validate()?;
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_owned(),
            project_id: config.project_id.clone(),
            location: config.location.clone(),
            token,
            timeout,
        })
    }

    /// Like `new`, taking the token from `BIGQUERY_ACCESS_TOKEN`.
    pub fn from_env(config: &Config) -> Result<Self> {
        Self::new(config, env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty()))
    }

    fn token(&self) -> Result<&str> {
        self.token
            .as_deref()
            .ok_or_else(|| format_err!("no BigQuery access token, set {}", TOKEN_ENV))
    }

    /// `jobs.query`: start the query and get the first page, if it finishes in time.
    fn start(&self, sql: &str) -> Result<QueryResponse> {
        let url = format!("{}/projects/{}/queries", self.endpoint, self.project_id);
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            timeout_ms: poll_ms(self.timeout),
            location: self.location.as_deref(),
        };
        send(
            self.client
                .post(url)
                .bearer_auth(self.token()?)
                .json(&request),
        )
    }

    /// `jobs.getQueryResults`: wait for the job and/or get the next page.
    fn results(&self, job: &JobReference, page_token: Option<&str>) -> Result<QueryResponse> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.endpoint, self.project_id, job.job_id
        );
        let mut params = vec![("timeoutMs", poll_ms(self.timeout).to_string())];
        if let Some(location) = job.location.as_deref().or(self.location.as_deref()) {
            params.push(("location", location.to_owned()));
        }
        if let Some(page_token) = page_token {
            params.push(("pageToken", page_token.to_owned()));
        }
        send(
            self.client
                .get(url)
                .bearer_auth(self.token()?)
                .query(&params),
        )
    }
}

impl QueryService for BigQuery {
    fn execute(&self, sql: &str) -> Result<RowSet> {
        fn inner(this: &BigQuery, sql: &str) -> Result<RowSet> {
            let deadline = Instant::now()
                .checked_add(this.timeout)
                .ok_or_else(|| format_err!("query timeout of {:?} is too long", this.timeout))?;
            let mut response = this.start(sql)?;
            let job = response
                .job_reference
                .clone()
                .ok_or_else(|| format_err!("query response had no job reference"))?;
            let mut pages = Pages::default();
            loop {
                if !response.job_complete {
                    ensure!(
                        Instant::now() < deadline,
                        "query did not complete within {}s",
                        this.timeout.as_secs()
                    );
                    event!(Level::DEBUG, "waiting for job {}", job.job_id);
                    response = this.results(&job, None)?;
                    continue;
                }
                let next = response.page_token.take();
                pages.add(response)?;
                match next {
                    Some(token) => response = this.results(&job, Some(&token))?,
                    None => break,
                }
            }
            pages.finish()
        }

        event!(
            Level::INFO,
            "running query in project \"{}\"",
            self.project_id
        );
        let rows = inner(self, sql).context("query service request failed")?;
        event!(Level::INFO, "query returned {} rows", rows.len());
        Ok(rows)
    }
}

fn send<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let response = request
        .send()
        .context("could not reach the query service")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        bail!("query service returned {}: {}", status, body.trim());
    }
    response
        .json()
        .context("could not decode the query service response")
}

/// How long a single request asks the server to wait before replying.
fn poll_ms(timeout: Duration) -> u64 {
    timeout.as_millis().min(10_000) as u64
}

// Wire format

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: serde_json::Value,
}

/// Collects the pages of a finished query.
#[derive(Default)]
struct Pages {
    schema: Option<TableSchema>,
    rows: Vec<Vec<table::Cell>>,
}

impl Pages {
    fn add(&mut self, page: QueryResponse) -> Result {
        if self.schema.is_none() {
            if let Some(schema) = page.schema {
                if let Some(field) = schema
                    .fields
                    .iter()
                    .find(|f| matches!(f.mode.as_deref(), Some("REPEATED")))
                {
                    bail!("column \"{}\" is repeated, which is not supported", field.name);
                }
                self.schema = Some(schema);
            }
        }
        for row in page.rows {
            let row = row
                .f
                .into_iter()
                .map(|cell| match cell.v {
                    serde_json::Value::Null => Ok(None),
                    serde_json::Value::String(s) => Ok(Some(s.into())),
                    other => Err(format_err!("unsupported nested value {}", other)),
                })
                .collect::<Result<Vec<_>>>()?;
            self.rows.push(row);
        }
        Ok(())
    }

    fn finish(self) -> Result<RowSet> {
        let schema = self
            .schema
            .ok_or_else(|| format_err!("query result had no schema"))?;
        RowSet::from_rows(schema.fields.into_iter().map(|f| f.name), self.rows)
    }
}

/// Answers queries from a fixed set of tables, keyed by exact query text.
///
/// Any other query fails as if the service could not be reached.
#[derive(Default)]
pub struct MemoryService {
    tables: BTreeMap<String, RowSet>,
    calls: Cell<usize>,
}

impl MemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, sql: impl Into<String>, rows: RowSet) -> Self {
        self.tables.insert(sql.into(), rows);
        self
    }

    /// How many times `execute` has been called.
    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl QueryService for MemoryService {
    fn execute(&self, sql: &str) -> Result<RowSet> {
        self.calls.set(self.calls.get() + 1);
        self.tables
            .get(sql)
            .cloned()
            .ok_or_else(|| format_err!("query service unavailable: no result for this query"))
    }
}

/// A service that is never reachable.
pub struct Offline;

impl QueryService for Offline {
    fn execute(&self, _sql: &str) -> Result<RowSet> {
        bail!("running offline, queries are disabled")
    }
}

#[cfg(test)]
mod test {
    use super::{BigQuery, MemoryService, Offline, Pages, QueryResponse, QueryService};
    use crate::{config::Config, table::RowSet};

    fn page(json: &str) -> QueryResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn pages_join_up() {
        let mut pages = Pages::default();
        pages
            .add(page(
                r#"{
                    "jobComplete": true,
                    "jobReference": {"projectId": "p", "jobId": "j1", "location": "EU"},
                    "schema": {"fields": [
                        {"name": "bnf_code", "type": "STRING"},
                        {"name": "items", "type": "INTEGER"}
                    ]},
                    "rows": [{"f": [{"v": "0101010A0"}, {"v": "500"}]}],
                    "pageToken": "next",
                    "totalRows": "2"
                }"#,
            ))
            .unwrap();
        pages
            .add(page(
                r#"{
                    "jobComplete": true,
                    "rows": [{"f": [{"v": "0202020B0"}, {"v": null}]}]
                }"#,
            ))
            .unwrap();
        let rows = pages.finish().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.get(0, "items"), Some("500"));
        assert_eq!(rows.get(1, "bnf_code"), Some("0202020B0"));
        assert_eq!(rows.get(1, "items"), None);
    }

    #[test]
    fn empty_result_keeps_columns() {
        let mut pages = Pages::default();
        pages
            .add(page(
                r#"{"jobComplete": true, "schema": {"fields": [{"name": "a"}]}}"#,
            ))
            .unwrap();
        let rows = pages.finish().unwrap();
        assert!(rows.is_empty());
        assert_eq!(rows.headers().len(), 1);
    }

    #[test]
    fn nested_values_rejected() {
        let mut pages = Pages::default();
        let res = pages.add(page(
            r#"{"jobComplete": true, "schema": {"fields": [{"name": "a"}]},
                "rows": [{"f": [{"v": {"f": []}}]}]}"#,
        ));
        assert!(res.is_err());

        let mut pages = Pages::default();
        let res = pages.add(page(
            r#"{"jobComplete": true,
                "schema": {"fields": [{"name": "a", "mode": "REPEATED"}]}}"#,
        ));
        assert!(res.is_err());
    }

    #[test]
    fn memory_service() {
        let rows = RowSet::from_text(&["a"], [&["1"][..]]).unwrap();
        let service = MemoryService::new().with_table("SELECT 1 AS a", rows.clone());
        assert_eq!(service.execute("SELECT 1 AS a").unwrap(), rows);
        assert!(service.execute("SELECT 2").is_err());
        assert_eq!(service.calls(), 2);
        assert!(Offline.execute("SELECT 1 AS a").is_err());
    }

    #[test]
    fn oversized_timeout_rejected() {
        let config = Config {
            timeout_secs: u64::MAX,
            ..Config::default()
        };
        assert!(BigQuery::new(&config, Some("token".into())).is_err());
    }
}
