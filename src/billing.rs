use crate::dimension::ResourceDimension;
use crate::integrator::compute_usage;
use crate::models::{first_of_month, AllocationRecord, TimeWindow, WorkingRecord};
use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyUsage {
    /// `YYYY-MM`
    pub month: String,
    pub window: TimeWindow,
    pub su_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingSummary {
    pub window: TimeWindow,
    pub su_hours: f64,
    pub price: f64,
    pub cost: f64,
    pub working_set: Vec<WorkingRecord>,
    pub history: Vec<MonthlyUsage>,
}

fn month_start_ms(date: chrono::NaiveDate) -> Option<i64> {
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?).timestamp_millis())
}

/// Months between the oldest known creation and `anchor`, at most `limit`.
fn months_of_history(records: &[AllocationRecord], anchor: DateTime<Utc>, limit: u32) -> u32 {
    let Some(oldest) = records.iter().filter_map(|r| r.created).min() else {
        return 0;
    };
    let span = (anchor.year() - oldest.year()) * 12 + anchor.month() as i32
        - oldest.month() as i32;
    span.clamp(0, limit as i32) as u32
}

/// Service-unit hours for each full calendar month before the one containing
/// `anchor_ms`, oldest first.
pub fn monthly_history(
    records: &[AllocationRecord],
    anchor_ms: i64,
    su: &ResourceDimension,
    limit: u32,
    now: i64,
) -> Vec<MonthlyUsage> {
    let Some(anchor) = DateTime::<Utc>::from_timestamp_millis(anchor_ms) else {
        return vec![];
    };
    let months = months_of_history(records, anchor, limit);
    let Some(mut month) = first_of_month(anchor.date_naive())
        .and_then(|d| d.checked_sub_months(Months::new(months)))
    else {
        return vec![];
    };

    let dimensions = std::slice::from_ref(su);
    let mut out = Vec::with_capacity(months as usize);
    for _ in 0..months {
        let Some(next) = month.checked_add_months(Months::new(1)) else {
            break;
        };
        let (Some(start), Some(end)) = (month_start_ms(month), month_start_ms(next)) else {
            break;
        };
        let window = TimeWindow::new(start, end);
        let usage = compute_usage(records, window, dimensions, now);
        out.push(MonthlyUsage {
            month: month.format("%Y-%m").to_string(),
            window,
            su_hours: usage.totals.get(su.key()).copied().unwrap_or(0.0),
        });
        month = next;
    }
    out
}

/// Bill for `window`: service-unit hours, their cost at `price` per SU-hour,
/// and the preceding months for comparison.
pub fn bill(
    records: &[AllocationRecord],
    window: TimeWindow,
    su: &ResourceDimension,
    price: f64,
    history_months: u32,
    now: i64,
) -> BillingSummary {
    let usage = compute_usage(records, window, std::slice::from_ref(su), now);
    let su_hours = usage.totals.get(su.key()).copied().unwrap_or(0.0);
    let history = if window.is_empty() {
        vec![]
    } else {
        monthly_history(records, window.start, su, history_months, now)
    };

    tracing::info!(
        su_hours,
        price,
        months = history.len(),
        "computed bill"
    );

    BillingSummary {
        window,
        su_hours,
        price,
        cost: su_hours * price,
        working_set: usage.working_set,
        history,
    }
}
