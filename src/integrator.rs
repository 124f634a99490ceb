//! Resource-hour integration over allocation records.
//!
//! Windows are half-open `[start, end)` in epoch milliseconds. A record is in
//! the working set when `created < end && deleted >= start`; unknown creation
//! counts as the beginning of time and unknown deletion as still active.
//! Active records are never credited past `now`.

use crate::dimension::ResourceDimension;
use crate::models::{
    AllocationRecord, EventKind, PointEvent, SeriesPoint, TimeSeries, TimeWindow, UsageResult,
    WorkingRecord, MS_PER_HOUR,
};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, trace};

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn unique_dimensions(dimensions: &[ResourceDimension]) -> Vec<&ResourceDimension> {
    let mut out: Vec<&ResourceDimension> = Vec::with_capacity(dimensions.len());
    for dimension in dimensions {
        if !out.iter().any(|d| d.key() == dimension.key()) {
            out.push(dimension);
        }
    }
    out
}

fn zeroed(dimensions: &[&ResourceDimension]) -> BTreeMap<String, f64> {
    dimensions
        .iter()
        .map(|d| (d.key().to_string(), 0.0))
        .collect()
}

fn span_hours(from: i64, to: i64) -> f64 {
    if to <= from {
        return 0.0;
    }
    (to as f64 - from as f64) / MS_PER_HOUR
}

/// Hours `record` was active inside `window`, never extrapolated past `now`.
pub fn clamped_hours(record: &AllocationRecord, window: TimeWindow, now: i64) -> f64 {
    let lower = window.start.max(record.created_ms());
    let upper = window.end.min(record.deleted_ms()).min(now);
    span_hours(lower, upper)
}

fn overlaps(record: &AllocationRecord, window: TimeWindow) -> bool {
    record.created_ms() < window.end && record.deleted_ms() >= window.start
}

/// Resource-hours per dimension for records active in `window`.
///
/// Every requested dimension key is present in `totals`. The working set
/// holds clones of the included records; the inputs are not touched.
pub fn compute_usage(
    records: &[AllocationRecord],
    window: TimeWindow,
    dimensions: &[ResourceDimension],
    now: i64,
) -> UsageResult {
    let dimensions = unique_dimensions(dimensions);
    let mut totals = zeroed(&dimensions);
    let mut per_record_hours = BTreeMap::new();

    if window.is_empty() {
        debug!(start = window.start, end = window.end, "empty window, usage is zero");
        return UsageResult {
            window,
            totals,
            per_record_hours,
            working_set: vec![],
        };
    }

    let working_set: Vec<WorkingRecord> = records
        .iter()
        .filter(|r| overlaps(r, window))
        .map(|r| WorkingRecord {
            record: r.clone(),
            hours: clamped_hours(r, window, now),
        })
        .collect();

    for entry in &working_set {
        *per_record_hours.entry(entry.record.id.clone()).or_insert(0.0) += entry.hours;
    }

    for dimension in &dimensions {
        let total: f64 = working_set
            .iter()
            .map(|w| w.hours * dimension.per_unit_value(&w.record))
            .sum();
        totals.insert(dimension.key().to_string(), total);
    }

    debug!(
        records = records.len(),
        working_set = working_set.len(),
        start = window.start,
        end = window.end,
        "computed usage"
    );

    UsageResult {
        window,
        totals,
        per_record_hours,
        working_set,
    }
}

struct Event<'a> {
    time: i64,
    sign: f64,
    kind: EventKind,
    record: &'a AllocationRecord,
}

/// Cumulative step series of allocations across all records.
///
/// Records with unknown creation are folded into `initial`. A deletion
/// earlier than its creation is moved onto the creation time. Events sharing a
/// timestamp collapse into one point holding the value after all of them.
/// With `now`, a synthetic point at `now` extends the last value and the
/// series' horizon is set so integration stops there.
pub fn compute_time_series(
    records: &[AllocationRecord],
    dimensions: &[ResourceDimension],
    now: Option<i64>,
) -> TimeSeries {
    let dimensions = unique_dimensions(dimensions);
    let mut initial = zeroed(&dimensions);
    let mut events: Vec<Event<'_>> = Vec::with_capacity(records.len() * 2);

    for record in records {
        let created = record.created.map(|ts| ts.timestamp_millis());
        match created {
            Some(time) => events.push(Event {
                time,
                sign: 1.0,
                kind: EventKind::Created,
                record,
            }),
            None => {
                trace!(record = %record.id, "no creation time, counted from the start");
                for dimension in &dimensions {
                    if let Some(value) = initial.get_mut(dimension.key()) {
                        *value += dimension.per_unit_value(record);
                    }
                }
            }
        }
        if let Some(ts) = record.deleted {
            // a deletion before creation cancels out at the creation point
            let deleted = ts.timestamp_millis();
            let time = created.map_or(deleted, |c| c.max(deleted));
            events.push(Event {
                time,
                sign: -1.0,
                kind: EventKind::Deleted,
                record,
            });
        }
    }

    // stable: ties keep record order, creation before deletion
    events.sort_by_key(|e| e.time);

    let mut running = initial.clone();
    let mut points: Vec<SeriesPoint> = Vec::new();
    for event in events {
        for dimension in &dimensions {
            if let Some(value) = running.get_mut(dimension.key()) {
                *value += event.sign * dimension.per_unit_value(event.record);
            }
        }
        let point_event = PointEvent {
            record_id: event.record.id.clone(),
            kind: event.kind,
        };
        match points.last_mut() {
            Some(last) if last.time == event.time => {
                last.values.clone_from(&running);
                last.events.push(point_event);
            }
            _ => points.push(SeriesPoint {
                time: event.time,
                values: running.clone(),
                events: vec![point_event],
                synthetic: false,
            }),
        }
    }

    if let (Some(now), Some(last)) = (now, points.last()) {
        if now > last.time {
            let values = last.values.clone();
            points.push(SeriesPoint {
                time: now,
                values,
                events: vec![],
                synthetic: true,
            });
        }
    }

    debug!(
        records = records.len(),
        points = points.len(),
        "computed time series"
    );

    TimeSeries {
        dimensions: dimensions.iter().map(|d| d.key().to_string()).collect(),
        initial,
        points,
        horizon: now,
    }
}

fn accumulate(out: &mut BTreeMap<String, f64>, values: &BTreeMap<String, f64>, hours: f64) {
    if hours <= 0.0 {
        return;
    }
    for (key, total) in out.iter_mut() {
        *total += values.get(key).copied().unwrap_or(0.0) * hours;
    }
}

/// Definite integral of `series` over `window`, in resource-hours.
///
/// The value in force at `window.start` is found by binary search, so a
/// window lying entirely between two points still integrates that segment.
/// Synthetic points are ignored and the window is cut at the series horizon.
pub fn integrate_over_window(series: &TimeSeries, window: TimeWindow) -> BTreeMap<String, f64> {
    let mut out: BTreeMap<String, f64> = series
        .dimensions
        .iter()
        .map(|k| (k.clone(), 0.0))
        .collect();

    let end = series.horizon.map_or(window.end, |h| window.end.min(h));
    if end <= window.start {
        return out;
    }

    let points = series.real_points();
    let first_after = points.partition_point(|p| p.time <= window.start);
    let mut current = match first_after {
        0 => &series.initial,
        idx => &points[idx - 1].values,
    };
    let mut cursor = window.start;

    for point in &points[first_after..] {
        if point.time >= end {
            break;
        }
        accumulate(&mut out, current, span_hours(cursor, point.time));
        cursor = point.time;
        current = &point.values;
    }
    accumulate(&mut out, current, span_hours(cursor, end));

    out
}
