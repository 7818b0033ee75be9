//! HTTP client for the data.gov.sg v2 real-time weather API.
//!
//! One call to [`WeatherApi::fetch`] returns the whole day of one dataset:
//! every page behind `paginationToken` is requested and its `items`,
//! `records` or `readings` list appended to the first page's `data`.
//! Every page request is bounded by a connect timeout and a whole-request
//! timeout; a timed-out page is retried like any transient failure.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FetchError;
use crate::models::Parameter;

// ---

/// Source of raw weather documents.
#[async_trait]
pub trait WeatherApi: Send + Sync {
    /// The aggregated `data` object of `parameter` for `date`.
    async fn fetch(&self, parameter: Parameter, date: NaiveDate) -> Result<Value, FetchError>;
}

const PAGINATED_KEYS: [&str; 3] = ["items", "records", "readings"];
const TOKEN_KEY: &str = "paginationToken";

/// Accumulates the pages of one paginated response.
#[derive(Debug)]
struct Pages {
    data: Map<String, Value>,
    key: Option<&'static str>,
    seen: HashSet<String>,
    count: u32,
}

impl Pages {
    // ---
    fn new(first: Map<String, Value>) -> Self {
        // ---
        let key = PAGINATED_KEYS.into_iter().find(|k| first.contains_key(*k));
        let mut seen = HashSet::new();
        if let Some(token) = token_of(&first) {
            seen.insert(token);
        }
        Pages {
            data: first,
            key,
            seen,
            count: 1,
        }
    }

    /// Token of the last page, if pagination should continue.
    fn next_token(&self) -> Option<String> {
        // ---
        self.key?;
        token_of(&self.data)
    }

    /// Append the list of `page`. Returns `false` when pagination must stop:
    /// the page is missing the paginated list, or its token was seen before.
    fn push(&mut self, mut page: Map<String, Value>) -> bool {
        // ---
        let Some(key) = self.key else {
            return false;
        };
        let Some(Value::Array(items)) = page.remove(key) else {
            warn!("Page {} has no `{}` list, stopping pagination", self.count + 1, key);
            self.data.remove(TOKEN_KEY);
            return false;
        };

        if let Some(Value::Array(all)) = self.data.get_mut(key) {
            all.extend(items);
        }
        self.count += 1;

        match token_of(&page) {
            Some(token) if !self.seen.insert(token.clone()) => {
                warn!("Duplicate pagination token at page {}, stopping", self.count);
                self.data.remove(TOKEN_KEY);
                false
            }
            Some(token) => {
                self.data.insert(TOKEN_KEY.to_string(), Value::String(token));
                true
            }
            None => {
                self.data.remove(TOKEN_KEY);
                false
            }
        }
    }

    fn finish(mut self) -> Value {
        // ---
        self.data.remove(TOKEN_KEY);
        Value::Object(self.data)
    }
}

fn token_of(data: &Map<String, Value>) -> Option<String> {
    // ---
    data.get(TOKEN_KEY)
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Retry `operation` with exponential backoff while `retryable` says so.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut retries: u32,
    base_delay_ms: u64,
    retryable: impl Fn(&E) -> bool,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    // ---
    let mut delay = base_delay_ms;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if retries == 0 || !retryable(&e) {
                    return Err(e);
                }
                debug!("Retrying in {} ms after: {}", delay, e);
                retries -= 1;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = delay.saturating_mul(2);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    max_pages: u32,
    max_retries: u32,
    retry_base_ms: u64,
}

impl HttpClient {
    // ---
    pub fn new(
        base_url: &str,
        max_pages: u32,
        max_retries: u32,
        retry_base_ms: u64,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, FetchError> {
        // ---
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(FetchError::Client)?;
        Ok(HttpClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_pages: max_pages.max(1),
            max_retries,
            retry_base_ms,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, FetchError> {
        // ---
        HttpClient::new(
            &cfg.api_url,
            cfg.api_max_pages,
            cfg.api_max_retries,
            cfg.api_retry_base_ms,
            Duration::from_secs(cfg.api_timeout_secs),
            Duration::from_secs(cfg.api_connect_timeout_secs),
        )
    }

    /// One page, unwrapped from the `{code, errorMsg, data}` envelope.
    async fn request_page(
        &self,
        url: &str,
        parameter: Parameter,
        date: NaiveDate,
        token: Option<&str>,
    ) -> Result<Map<String, Value>, FetchError> {
        // ---
        let mut query = vec![("date", date.format("%Y-%m-%d").to_string())];
        if let Some(api) = parameter.api_query() {
            query.push(("api", api.to_string()));
        }
        if let Some(token) = token {
            query.push((TOKEN_KEY, token.to_string()));
        }

        let request_err = |source: reqwest::Error| {
            if source.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    source,
                }
            } else {
                FetchError::Request {
                    url: url.to_string(),
                    source,
                }
            }
        };
        let response = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(request_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status,
            });
        }

        let mut envelope: Value = response.json().await.map_err(request_err)?;
        let code = envelope.get("code").and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            let message = envelope
                .get("errorMsg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(FetchError::Api {
                url: url.to_string(),
                code,
                message,
            });
        }

        match envelope.get_mut("data").map(Value::take) {
            Some(Value::Object(data)) => Ok(data),
            _ => Err(FetchError::MissingData {
                url: url.to_string(),
            }),
        }
    }

    async fn page(
        &self,
        url: &str,
        parameter: Parameter,
        date: NaiveDate,
        token: Option<&str>,
    ) -> Result<Map<String, Value>, FetchError> {
        // ---
        retry_with_backoff(
            self.max_retries,
            self.retry_base_ms,
            FetchError::is_retryable,
            || self.request_page(url, parameter, date, token),
        )
        .await
    }
}

#[async_trait]
impl WeatherApi for HttpClient {
    // ---
    #[tracing::instrument(skip_all, fields(parameter = %parameter, date = %date))]
    async fn fetch(&self, parameter: Parameter, date: NaiveDate) -> Result<Value, FetchError> {
        // ---
        let url = format!("{}{}", self.base_url, parameter.endpoint());
        let mut pages = Pages::new(self.page(&url, parameter, date, None).await?);

        while let Some(token) = pages.next_token() {
            if pages.count >= self.max_pages {
                debug!(
                    "Hit page limit of {}, stopping pagination for {}",
                    self.max_pages, url
                );
                break;
            }
            let next = self.page(&url, parameter, date, Some(&token)).await?;
            if !pages.push(next) {
                break;
            }
        }

        info!("Fetched {} page(s) from {}", pages.count, url);
        Ok(pages.finish())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn object(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_pages_aggregate_until_token_runs_out() {
        // ---
        let mut pages = Pages::new(object(json!({
            "stations": [{"id": "S109"}],
            "readings": [{"timestamp": "t1"}],
            "readingUnit": "deg C",
            "paginationToken": "a"
        })));
        assert_eq!(pages.next_token().as_deref(), Some("a"));

        assert!(pages.push(object(json!({"readings": [{"timestamp": "t2"}], "paginationToken": "b"}))));
        assert!(!pages.push(object(json!({"readings": [{"timestamp": "t3"}]}))));
        assert_eq!(pages.next_token(), None);

        let data = pages.finish();
        assert_eq!(data["readings"].as_array().unwrap().len(), 3);
        assert_eq!(data["readingUnit"], "deg C");
        assert!(data.get("paginationToken").is_none());
    }

    #[test]
    fn test_duplicate_token_stops_pagination() {
        // ---
        let mut pages = Pages::new(object(json!({"items": [1], "paginationToken": "a"})));
        assert!(pages.push(object(json!({"items": [2], "paginationToken": "b"}))));
        assert!(!pages.push(object(json!({"items": [3], "paginationToken": "a"}))));

        let data = pages.finish();
        assert_eq!(data["items"], json!([1, 2, 3]));
        assert!(data.get("paginationToken").is_none());
    }

    #[test]
    fn test_unpaginated_document_is_returned_as_is() {
        // ---
        let pages = Pages::new(object(json!({"area_metadata": [], "paginationToken": "x"})));
        assert_eq!(pages.next_token(), None);
        assert_eq!(pages.finish(), json!({"area_metadata": []}));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        // ---
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(2, 1, |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("boom".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        // ---
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(5, 1, |e: &String| e != "404", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err("503".to_string())
            } else {
                Err("404".to_string())
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), "404");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_silent_server_times_out_as_retryable() {
        // ---
        // accepted by the kernel backlog, never answered
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let client = HttpClient::new(
            &base,
            1,
            1,
            1,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();

        let started = std::time::Instant::now();
        let err = client
            .fetch(Parameter::Psi, NaiveDate::from_ymd_opt(2024, 7, 19).unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Timeout { .. }), "unexpected error {:?}", err);
        assert!(err.is_retryable());
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }
}
