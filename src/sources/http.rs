use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::AllocationRecord;
use crate::sources::{parse_records, ReportSource};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

pub const AUTH_HEADER: &str = "x-auth-token";

/// Fetches reports from the reporting API at `{endpoint}/v1/reports/{query}`.
pub struct HttpSource {
    client: Client,
    endpoint: Url,
    token: Option<String>,
}

impl HttpSource {
    pub fn new(cfg: &AppConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            endpoint: Url::parse(&cfg.endpoint)?,
            token: cfg.token.clone().filter(|t| !t.is_empty()),
        })
    }

    pub fn report_url(endpoint: &Url, query: &str) -> Result<Url, AppError> {
        let mut base = endpoint.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(&format!("v1/reports/{}", query.trim_start_matches('/')))?)
    }
}

#[async_trait]
impl ReportSource for HttpSource {
    fn name(&self) -> &'static str {
        "reporting-api"
    }

    async fn fetch_records(&self, query: &str) -> Result<Vec<AllocationRecord>, AppError> {
        let url = Self::report_url(&self.endpoint, query)?;
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.header(AUTH_HEADER, token);
        }

        let response = req.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::Report(
                "reporting API rejected token (unauthorized).".into(),
            ));
        }
        if !status.is_success() {
            return Err(AppError::Report(format!(
                "reporting API request for '{query}' failed with HTTP status {status}."
            )));
        }

        let body: Value = response.json().await?;
        parse_records(body)
    }
}
