pub mod billing;
pub mod config;
pub mod dimension;
pub mod error;
pub mod integrator;
pub mod models;
pub mod service;
pub mod sources;

pub use dimension::ResourceDimension;
pub use error::AppError;
pub use integrator::{compute_time_series, compute_usage, integrate_over_window};
pub use models::{AllocationRecord, TimeSeries, TimeWindow, UsageResult};
