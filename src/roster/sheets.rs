//! Google Sheets roster source.
//!
//! Reads one column of a worksheet through the Sheets v4 values API and
//! classifies failures for the cache's retry policy.

use super::{FetchError, RosterSource};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Header carrying the API key. Keeping the key out of the URL keeps it out
/// of `reqwest::Error` messages too.
const API_KEY_HEADER: &str = "x-goog-api-key";

/// Configuration for the Sheets source.
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    /// API root, overridable for tests and proxies.
    pub base_url: String,
    /// Spreadsheet id from the sheet URL.
    pub spreadsheet_id: String,
    /// Worksheet (tab) name.
    pub worksheet: String,
    /// Column letter, e.g. `AA`.
    pub column: String,
    /// API key, sent in the `x-goog-api-key` header.
    pub api_key: Option<String>,
    /// OAuth access token for private sheets, sent as a bearer token.
    pub bearer_token: Option<String>,
    /// Timeout for one request.
    pub timeout: Duration,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sheets.googleapis.com".to_string(),
            spreadsheet_id: String::new(),
            worksheet: "Form Responses 1".to_string(),
            column: "AA".to_string(),
            api_key: None,
            bearer_token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Body of a `values.get` response.
#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Roster source backed by one Sheets column.
pub struct SheetsRosterSource {
    config: SheetsConfig,
    client: reqwest::Client,
    url: Url,
}

impl SheetsRosterSource {
    /// Create a new Sheets source.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: SheetsConfig) -> Result<Self> {
        let url = values_url(&config)?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(Self {
            config,
            client,
            url,
        })
    }

    /// The range read, in A1 notation.
    #[must_use]
    pub fn range(&self) -> String {
        a1_range(&self.config)
    }
}

fn a1_range(config: &SheetsConfig) -> String {
    format!("{}!{col}:{col}", config.worksheet, col = config.column)
}

fn values_url(config: &SheetsConfig) -> Result<Url> {
    let mut url = Url::parse(&config.base_url).map_err(|e| Error::Config(e.to_string()))?;
    let range = a1_range(config);
    url.path_segments_mut()
        .map_err(|()| Error::Config(format!("base url cannot be a base: {}", config.base_url)))?
        .pop_if_empty()
        .extend(["v4", "spreadsheets", &config.spreadsheet_id, "values", &range]);
    url.query_pairs_mut().append_pair("majorDimension", "COLUMNS");
    Ok(url)
}

fn classify_status(status: StatusCode, body: &str) -> FetchError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::NOT_FOUND => FetchError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited(detail),
        _ => FetchError::Other(detail),
    }
}

fn classify_transport(e: reqwest::Error) -> FetchError {
    let transient = e.is_timeout() || e.is_connect();
    let detail = e.without_url().to_string();
    if transient {
        FetchError::Network(detail)
    } else {
        FetchError::Other(detail)
    }
}

fn first_column(body: ValueRange) -> Vec<String> {
    body.values.into_iter().next().unwrap_or_default()
}

#[async_trait]
impl RosterSource for SheetsRosterSource {
    async fn fetch(&self) -> std::result::Result<Vec<String>, FetchError> {
        let mut request = self.client.get(self.url.clone());
        if let Some(key) = &self.config.api_key {
            request = request.header(API_KEY_HEADER, key);
        }
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body: ValueRange = response.json().await.map_err(classify_transport)?;
        let column = first_column(body);
        debug!("Fetched {} roster cells from {}", column.len(), self.range());
        Ok(column)
    }

    fn describe(&self) -> String {
        format!("sheets {} ({})", self.config.spreadsheet_id, self.range())
    }
}
