use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MS_PER_HOUR: f64 = 3_600_000.0;

/// One resource-consuming entity (instance or volume) as reported upstream.
///
/// `created`/`deleted` are `None` when the report omits them or carries
/// something unparseable such as `"None"`. Every other field is kept verbatim
/// in `fields` for dimension accessors to read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub deleted: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl AllocationRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created: None,
            deleted: None,
            fields: Map::new(),
        }
    }

    pub fn created_at_ms(mut self, ms: i64) -> Self {
        self.created = DateTime::<Utc>::from_timestamp_millis(ms);
        self
    }

    pub fn deleted_at_ms(mut self, ms: i64) -> Self {
        self.deleted = DateTime::<Utc>::from_timestamp_millis(ms);
        self
    }

    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Creation time in epoch ms, `i64::MIN` when unknown.
    pub fn created_ms(&self) -> i64 {
        self.created.map_or(i64::MIN, |ts| ts.timestamp_millis())
    }

    /// Deletion time in epoch ms, `i64::MAX` while still active.
    pub fn deleted_ms(&self) -> i64 {
        self.deleted.map_or(i64::MAX, |ts| ts.timestamp_millis())
    }

    /// Numeric field value; numeric strings are accepted, anything else is 0.
    pub fn number(&self, field: &str) -> f64 {
        let raw = match self.fields.get(field) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
            Some(Value::Bool(true)) => 1.0,
            _ => 0.0,
        };
        if raw.is_finite() {
            raw
        } else {
            0.0
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

fn lenient_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(parse_timestamp(&value))
}

/// Parses a reporting-API timestamp: epoch milliseconds (number or numeric
/// string), RFC 3339, or a naive date/datetime taken as UTC.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            if let Some(ms) = n.as_i64() {
                return DateTime::<Utc>::from_timestamp_millis(ms);
            }
            n.as_f64()
                .filter(|ms| ms.is_finite())
                .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms as i64))
        }
        Value::String(s) => parse_timestamp_str(s),
        _ => None,
    }
}

pub fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// Half-open query window `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(start.timestamp_millis(), end.timestamp_millis())
    }

    /// Degenerate or inverted windows cover nothing.
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Calendar month containing `at`, as `[first of month, first of next month)`.
pub fn month_window(at: DateTime<Utc>) -> Option<TimeWindow> {
    let first = first_of_month(at.date_naive())?;
    let next = first.checked_add_months(Months::new(1))?;
    Some(TimeWindow::between(
        Utc.from_utc_datetime(&first.and_hms_opt(0, 0, 0)?),
        Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0)?),
    ))
}

pub fn first_of_month(date: NaiveDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WindowPreset {
    OneDay,
    SevenDays,
    ThirtyDays,
    Month,
}

impl WindowPreset {
    pub const ALL: [WindowPreset; 4] = [
        WindowPreset::OneDay,
        WindowPreset::SevenDays,
        WindowPreset::ThirtyDays,
        WindowPreset::Month,
    ];

    pub fn as_label(self) -> &'static str {
        match self {
            WindowPreset::OneDay => "1d",
            WindowPreset::SevenDays => "7d",
            WindowPreset::ThirtyDays => "30d",
            WindowPreset::Month => "month",
        }
    }

    pub fn from_label(input: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_label() == input.trim())
    }

    pub fn resolve(self, now: DateTime<Utc>) -> Option<TimeWindow> {
        let hours = match self {
            WindowPreset::OneDay => 24,
            WindowPreset::SevenDays => 24 * 7,
            WindowPreset::ThirtyDays => 24 * 30,
            WindowPreset::Month => return month_window(now),
        };
        Some(TimeWindow::between(now - Duration::hours(hours), now))
    }
}

/// A working-set record with the hours it was active inside the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkingRecord {
    pub record: AllocationRecord,
    pub hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageResult {
    pub window: TimeWindow,
    pub totals: BTreeMap<String, f64>,
    pub per_record_hours: BTreeMap<String, f64>,
    pub working_set: Vec<WorkingRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointEvent {
    pub record_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesPoint {
    pub time: i64,
    pub values: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<PointEvent>,
    /// Set on the trailing "now" point, which carries no new information.
    #[serde(default)]
    pub synthetic: bool,
}

/// Cumulative step function over allocation events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeries {
    pub dimensions: Vec<String>,
    /// Value in force before the first point.
    pub initial: BTreeMap<String, f64>,
    pub points: Vec<SeriesPoint>,
    pub horizon: Option<i64>,
}

impl TimeSeries {
    /// Points backed by real events, excluding any synthetic tail.
    pub fn real_points(&self) -> &[SeriesPoint] {
        match self.points.iter().position(|p| p.synthetic) {
            Some(idx) => &self.points[..idx],
            None => &self.points,
        }
    }
}
