use crate::billing::{bill, BillingSummary};
use crate::config::AppConfig;
use crate::dimension::{resolve_dimensions, service_units_dimension, ResourceDimension};
use crate::error::AppError;
use crate::integrator::{compute_time_series, compute_usage, integrate_over_window};
use crate::models::{AllocationRecord, TimeSeries, TimeWindow, UsageResult};
use crate::sources::file::FileSource;
use crate::sources::http::HttpSource;
use crate::sources::ReportSource;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// Resource-hours under the step series within `window`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IntegralReport {
    pub window: TimeWindow,
    pub resource_hours: BTreeMap<String, f64>,
}

pub struct ReportService {
    source: Box<dyn ReportSource + Send + Sync>,
    dimensions: Vec<ResourceDimension>,
    su: ResourceDimension,
    su_price: f64,
    history_months: u32,
}

impl ReportService {
    pub fn new(
        source: Box<dyn ReportSource + Send + Sync>,
        dimensions: Vec<ResourceDimension>,
        cfg: &AppConfig,
    ) -> Self {
        Self {
            source,
            dimensions,
            su: service_units_dimension(&cfg.su_scale),
            su_price: cfg.su_price,
            history_months: cfg.history_months,
        }
    }

    /// Reads from `input` when given, otherwise from the reporting API.
    /// `dimension_keys` overrides the configured dimensions when non-empty.
    pub fn from_config(
        cfg: &AppConfig,
        input: Option<&Path>,
        dimension_keys: &[String],
    ) -> Result<Self, AppError> {
        let keys = if dimension_keys.is_empty() {
            cfg.dimensions.as_slice()
        } else {
            dimension_keys
        };
        let dimensions = resolve_dimensions(keys, &cfg.custom_dimensions, &cfg.su_scale)?;
        let source: Box<dyn ReportSource + Send + Sync> = match input {
            Some(path) => Box::new(FileSource::new(path)),
            None => Box::new(HttpSource::new(cfg)?),
        };
        Ok(Self::new(source, dimensions, cfg))
    }

    pub fn dimensions(&self) -> &[ResourceDimension] {
        &self.dimensions
    }

    pub async fn records(&self, query: &str) -> Result<Vec<AllocationRecord>, AppError> {
        let started = Instant::now();
        let records = self.source.fetch_records(query).await?;
        info!(
            source = self.source.name(),
            query,
            records = records.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "fetched report"
        );
        Ok(records)
    }

    pub async fn usage(
        &self,
        query: &str,
        window: TimeWindow,
        now: i64,
    ) -> Result<UsageResult, AppError> {
        let records = self.records(query).await?;
        Ok(compute_usage(&records, window, &self.dimensions, now))
    }

    pub async fn series(&self, query: &str, now: Option<i64>) -> Result<TimeSeries, AppError> {
        let records = self.records(query).await?;
        Ok(compute_time_series(&records, &self.dimensions, now))
    }

    pub async fn integrate(
        &self,
        query: &str,
        window: TimeWindow,
        now: i64,
    ) -> Result<IntegralReport, AppError> {
        let series = self.series(query, Some(now)).await?;
        Ok(IntegralReport {
            window,
            resource_hours: integrate_over_window(&series, window),
        })
    }

    pub async fn bill(
        &self,
        query: &str,
        window: TimeWindow,
        price: Option<f64>,
        history_months: Option<u32>,
        now: i64,
    ) -> Result<BillingSummary, AppError> {
        let records = self.records(query).await?;
        Ok(bill(
            &records,
            window,
            &self.su,
            price.unwrap_or(self.su_price),
            history_months.unwrap_or(self.history_months),
            now,
        ))
    }
}
