use crate::config::{normalize_dimension_key, CustomDimension};
use crate::error::AppError;
use crate::models::AllocationRecord;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type Accessor = Arc<dyn Fn(&AllocationRecord) -> f64 + Send + Sync>;

/// A named quantity tracked per record, e.g. `vcpus` or `memory`.
#[derive(Clone)]
pub struct ResourceDimension {
    key: String,
    accessor: Accessor,
}

impl fmt::Debug for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDimension")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl ResourceDimension {
    pub fn new<F>(key: impl Into<String>, accessor: F) -> Self
    where
        F: Fn(&AllocationRecord) -> f64 + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            accessor: Arc::new(accessor),
        }
    }

    /// Dimension reading a single numeric field.
    pub fn field(key: impl Into<String>, field: &str) -> Self {
        let field = field.to_string();
        Self::new(key, move |r| r.number(&field))
    }

    /// Dimension summing several numeric fields, then scaling.
    pub fn sum_of_fields(key: impl Into<String>, fields: Vec<String>, scale: f64) -> Self {
        Self::new(key, move |r| {
            fields.iter().map(|f| r.number(f)).sum::<f64>() * scale
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Per-unit quantity of this dimension held by `record`. Negative and
    /// non-finite accessor results count as zero.
    pub fn per_unit_value(&self, record: &AllocationRecord) -> f64 {
        let value = (self.accessor)(record);
        if value.is_finite() && value > 0.0 {
            value
        } else {
            0.0
        }
    }
}

/// Scaling factor for a record's availability zone(s); the largest factor
/// wins and anything non-positive falls back to 1.
pub fn su_scale_for(record: &AllocationRecord, scale: &HashMap<String, f64>) -> f64 {
    let zones: Vec<&str> = match record.fields.get("host_aggregates") {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => record.text("availability_zone").into_iter().collect(),
    };
    let factor = zones
        .iter()
        .filter_map(|zone| scale.get(&normalize_dimension_key(zone)).copied())
        .fold(f64::NAN, f64::max);
    if factor > 0.0 {
        factor
    } else {
        1.0
    }
}

/// Service units: 1 SU ~ 1 vcpu or 4 GiB of memory, whichever is larger.
pub fn service_units(record: &AllocationRecord, scale: &HashMap<String, f64>) -> f64 {
    let by_cpu = record.number("vcpus");
    let by_memory = (record.number("memory") / 1024.0 / 4.0).ceil();
    su_scale_for(record, scale) * by_cpu.max(by_memory)
}

pub fn service_units_dimension(scale: &HashMap<String, f64>) -> ResourceDimension {
    let scale = scale.clone();
    ResourceDimension::new("su", move |r| service_units(r, &scale))
}

pub fn built_in_dimensions(su_scale: &HashMap<String, f64>) -> Vec<ResourceDimension> {
    vec![
        ResourceDimension::field("vcpus", "vcpus"),
        ResourceDimension::field("memory", "memory"),
        ResourceDimension::sum_of_fields("local", vec!["root".into(), "ephemeral".into()], 1.0),
        ResourceDimension::field("volume", "size"),
        ResourceDimension::new("instances", |_| 1.0),
        service_units_dimension(su_scale),
    ]
}

pub fn resolve_dimension(
    key: &str,
    custom: &[CustomDimension],
    su_scale: &HashMap<String, f64>,
) -> Option<ResourceDimension> {
    let key = normalize_dimension_key(key);
    if let Some(def) = custom.iter().find(|c| normalize_dimension_key(&c.key) == key) {
        return Some(ResourceDimension::sum_of_fields(
            key,
            def.fields.clone(),
            def.scale,
        ));
    }

    built_in_dimensions(su_scale)
        .into_iter()
        .find(|d| d.key() == key)
}

/// Resolves each requested key once, in order.
pub fn resolve_dimensions(
    keys: &[String],
    custom: &[CustomDimension],
    su_scale: &HashMap<String, f64>,
) -> Result<Vec<ResourceDimension>, AppError> {
    let mut out: Vec<ResourceDimension> = Vec::with_capacity(keys.len());
    for key in keys {
        let dimension = resolve_dimension(key, custom, su_scale)
            .ok_or_else(|| AppError::Config(format!("Unknown dimension '{}'.", key.trim())))?;
        if !out.iter().any(|d| d.key() == dimension.key()) {
            out.push(dimension);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(vcpus: f64, memory: f64) -> AllocationRecord {
        AllocationRecord::new("i-1")
            .with_field("vcpus", vcpus)
            .with_field("memory", memory)
    }

    #[test]
    fn per_unit_value_floors_negative_and_nan_to_zero() {
        let record = instance(-2.0, 0.0);
        assert_eq!(ResourceDimension::field("vcpus", "vcpus").per_unit_value(&record), 0.0);
        let nan = ResourceDimension::new("nan", |_| f64::NAN);
        assert_eq!(nan.per_unit_value(&record), 0.0);
    }

    #[test]
    fn local_storage_sums_root_and_ephemeral() {
        let record = AllocationRecord::new("i-1")
            .with_field("root", 10)
            .with_field("ephemeral", "30");
        let local = resolve_dimension("local", &[], &HashMap::new()).expect("built in");
        assert_eq!(local.per_unit_value(&record), 40.0);
    }

    #[test]
    fn service_units_take_larger_of_cpu_and_memory() {
        let scale = HashMap::new();
        assert_eq!(service_units(&instance(2.0, 4096.0), &scale), 2.0);
        assert_eq!(service_units(&instance(1.0, 16384.0), &scale), 4.0);
        assert_eq!(service_units(&instance(1.0, 4097.0), &scale), 2.0);
    }

    #[test]
    fn service_units_apply_zone_scale() {
        let scale = HashMap::from([("tasmania".to_string(), 0.5), ("qld".to_string(), 2.0)]);
        let record = instance(4.0, 0.0).with_field("availability_zone", "Tasmania");
        assert_eq!(service_units(&record, &scale), 2.0);

        let record = instance(4.0, 0.0).with_field(
            "host_aggregates",
            serde_json::json!(["tasmania", "qld"]),
        );
        assert_eq!(service_units(&record, &scale), 8.0);

        let record = instance(4.0, 0.0).with_field("availability_zone", "nowhere");
        assert_eq!(service_units(&record, &scale), 4.0);
    }

    #[test]
    fn custom_dimension_overrides_built_in() {
        let custom = vec![CustomDimension {
            key: "vcpus".into(),
            fields: vec!["vcpus".into()],
            scale: 0.5,
        }];
        let dim = resolve_dimension("VCPUS", &custom, &HashMap::new()).expect("custom");
        assert_eq!(dim.key(), "vcpus");
        assert_eq!(dim.per_unit_value(&instance(8.0, 0.0)), 4.0);
    }

    #[test]
    fn resolve_dimensions_rejects_unknown_and_dedupes() {
        let keys = vec!["vcpus".to_string(), " VCPUS".to_string(), "memory".to_string()];
        let dims = resolve_dimensions(&keys, &[], &HashMap::new()).expect("resolve");
        let names: Vec<&str> = dims.iter().map(ResourceDimension::key).collect();
        assert_eq!(names, vec!["vcpus", "memory"]);

        let err = resolve_dimensions(&["gpus".to_string()], &[], &HashMap::new())
            .expect_err("unknown key");
        assert!(err.to_string().contains("Unknown dimension 'gpus'"));
    }
}
