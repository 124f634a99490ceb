use crate::error::AppError;
use crate::models::AllocationRecord;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

pub mod file;
pub mod http;

/// Kind of allocation report to request for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Instance,
    Volume,
}

impl RecordKind {
    pub fn from_label(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "instance" | "instances" => Some(RecordKind::Instance),
            "volume" | "volumes" => Some(RecordKind::Volume),
            _ => None,
        }
    }

    pub fn report_name(self) -> &'static str {
        match self {
            RecordKind::Instance => "instance",
            RecordKind::Volume => "volume",
        }
    }
}

/// Report query for every record of `kind` belonging to `project_id`.
/// The id is form-encoded so `&`, `#` and spaces survive the request.
pub fn project_query(kind: RecordKind, project_id: &str) -> String {
    let params = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("project_id", project_id.trim())
        .finish();
    format!("{}?{params}", kind.report_name())
}

#[async_trait]
pub trait ReportSource {
    fn name(&self) -> &'static str;

    async fn fetch_records(&self, query: &str) -> Result<Vec<AllocationRecord>, AppError>;
}

/// Accepts a bare JSON array or an object wrapping it under `data`. Rows that
/// are not records are skipped; rows without an id are named after their
/// position so their hours are not merged.
pub fn parse_records(body: Value) -> Result<Vec<AllocationRecord>, AppError> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(AppError::Report(
                    "expected a JSON array of records".into(),
                ))
            }
        },
        _ => {
            return Err(AppError::Report(
                "expected a JSON array of records".into(),
            ))
        }
    };

    let mut out = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        match serde_json::from_value::<AllocationRecord>(item) {
            Ok(mut record) => {
                if record.id.is_empty() {
                    record.id = format!("row-{idx}");
                    warn!(row = idx, id = %record.id, "record has no id, using row position");
                }
                out.push(record);
            }
            Err(e) => warn!(row = idx, error = %e, "skipping malformed record"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_records_accepts_array_and_data_wrapper() {
        let bare = parse_records(json!([{ "id": "a" }, { "id": 2 }])).expect("array");
        assert_eq!(bare.len(), 2);
        assert_eq!(bare[1].id, "2");

        let wrapped = parse_records(json!({ "data": [{ "id": "a" }] })).expect("wrapped");
        assert_eq!(wrapped.len(), 1);
    }

    #[test]
    fn parse_records_skips_rows_that_are_not_objects() {
        let rows = parse_records(json!([{ "id": "a" }, 7, "x"])).expect("array");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn parse_records_rejects_other_shapes() {
        let err = parse_records(json!({ "rows": [] })).expect_err("not an array");
        assert!(err.to_string().contains("expected a JSON array"));
        assert!(parse_records(json!(3)).is_err());
    }

    #[test]
    fn rows_without_id_get_distinct_names() {
        let rows = parse_records(json!([
            { "vcpus": 1 },
            { "id": "a" },
            { "id": null },
            { "id": ["x"] }
        ]))
        .expect("array");
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["row-0", "a", "row-2", "row-3"]);
    }

    #[test]
    fn project_query_encodes_reserved_characters() {
        assert_eq!(
            project_query(RecordKind::Volume, "a&b#c d"),
            "volume?project_id=a%26b%23c+d"
        );
    }

    #[test]
    fn project_query_uses_report_name() {
        assert_eq!(
            project_query(RecordKind::Instance, " abc "),
            "instance?project_id=abc"
        );
        assert_eq!(RecordKind::from_label("Volumes"), Some(RecordKind::Volume));
        assert_eq!(RecordKind::from_label("flavour"), None);
    }
}
