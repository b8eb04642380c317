//! Metrics and plots files
//!
//! Metrics are JSON or YAML documents; nested numeric values are flattened
//! to dotted keys (`{"train": {"loss": 0.2}}` -> `train.loss`).

use std::collections::BTreeSet;
use std::path::Path;

use dvx_core::{Error, MetricDiff, MetricRecord, Result};
use serde_json::Value;

/// Parse a JSON or YAML document, picking the parser by extension
fn load_document(path: &Path) -> Result<Value> {
    let data = std::fs::read(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        Ok(serde_yaml::from_slice(&data)?)
    } else {
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Load a metrics file as a flat record
pub fn load_metrics(path: &Path) -> Result<MetricRecord> {
    Ok(flatten_metrics(&load_document(path)?))
}

/// Flatten nested numeric values to dotted keys
///
/// Booleans count as 0/1; strings and nulls are ignored.
pub fn flatten_metrics(value: &Value) -> MetricRecord {
    let mut record = MetricRecord::new();
    flatten_into(String::new(), value, &mut record);
    record
}

fn flatten_into(prefix: String, value: &Value, record: &mut MetricRecord) {
    let child = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    };

    match value {
        Value::Object(map) => {
            for (key, v) in map {
                flatten_into(child(key), v, record);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(child(&i.to_string()), v, record);
            }
        }
        Value::Number(n) if !prefix.is_empty() => {
            if let Some(f) = n.as_f64() {
                record.insert(prefix, f);
            }
        }
        Value::Bool(b) if !prefix.is_empty() => {
            record.insert(prefix, if *b { 1.0 } else { 0.0 });
        }
        _ => {}
    }
}

/// Compare two metric records
///
/// Every key of either record appears once, in key order. `change` is set
/// only when both sides have a value.
pub fn diff_metrics(old: &MetricRecord, new: &MetricRecord) -> Vec<MetricDiff> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .map(|key| {
            let old_value = old.get(key).copied();
            let new_value = new.get(key).copied();
            MetricDiff {
                key: key.clone(),
                old: old_value,
                new: new_value,
                change: old_value.zip(new_value).map(|(o, n)| n - o),
            }
        })
        .collect()
}

/// Only the entries whose value changed (or that exist on one side only)
pub fn changed_only(diffs: Vec<MetricDiff>) -> Vec<MetricDiff> {
    diffs
        .into_iter()
        .filter(|d| d.change.map(|c| c != 0.0).unwrap_or(true))
        .collect()
}

/// Load the data series of a plots file
///
/// Accepts a top-level array of records or an object holding exactly one
/// array (`{"train": [{..}, ..]}`).
pub fn load_plot_series(path: &Path) -> Result<Vec<Value>> {
    match load_document(path)? {
        Value::Array(items) => Ok(items),
        Value::Object(map) if map.len() == 1 => match map.into_iter().next() {
            Some((_, Value::Array(items))) => Ok(items),
            _ => Err(not_a_series(path)),
        },
        _ => Err(not_a_series(path)),
    }
}

fn not_a_series(path: &Path) -> Error {
    Error::InvalidTarget {
        target: path.display().to_string(),
        reason: "plots file must hold an array of records".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, f64)]) -> MetricRecord {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_flatten_nested_json() {
        let value = serde_json::json!({
            "train": {"loss": 0.25, "acc": 0.9},
            "epochs": 3,
            "converged": true,
            "note": "ignored",
            "per_class": [0.5, 0.75]
        });
        let flat = flatten_metrics(&value);
        assert_eq!(flat["train.loss"], 0.25);
        assert_eq!(flat["epochs"], 3.0);
        assert_eq!(flat["converged"], 1.0);
        assert_eq!(flat["per_class.1"], 0.75);
        assert!(!flat.contains_key("note"));
    }

    #[test]
    fn test_load_yaml_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.yaml");
        std::fs::write(&path, "eval:\n  auc: 0.81\n").unwrap();
        assert_eq!(load_metrics(&path).unwrap(), record(&[("eval.auc", 0.81)]));
    }

    #[test]
    fn test_diff_metrics() {
        let old = record(&[("loss", 0.5), ("acc", 0.8)]);
        let new = record(&[("loss", 0.25), ("f1", 0.7)]);
        let diffs = diff_metrics(&old, &new);

        assert_eq!(diffs.len(), 3);
        assert_eq!(diffs[0].key, "acc");
        assert_eq!(diffs[0].new, None);
        assert_eq!(diffs[0].change, None);
        assert_eq!(diffs[1].key, "f1");
        assert_eq!(diffs[1].old, None);
        assert_eq!(diffs[2].key, "loss");
        assert_eq!(diffs[2].change, Some(-0.25));
    }

    #[test]
    fn test_changed_only() {
        let old = record(&[("loss", 0.5), ("acc", 0.8)]);
        let new = record(&[("loss", 0.5), ("acc", 0.9)]);
        let changed = changed_only(diff_metrics(&old, &new));
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].key, "acc");
    }

    #[test]
    fn test_plot_series() {
        let dir = tempfile::tempdir().unwrap();
        let flat = dir.path().join("loss.json");
        std::fs::write(&flat, r#"[{"step": 0, "loss": 1.0}, {"step": 1, "loss": 0.5}]"#).unwrap();
        assert_eq!(load_plot_series(&flat).unwrap().len(), 2);

        let wrapped = dir.path().join("acc.json");
        std::fs::write(&wrapped, r#"{"train": [{"step": 0, "acc": 0.1}]}"#).unwrap();
        assert_eq!(load_plot_series(&wrapped).unwrap().len(), 1);

        let scalar = dir.path().join("bad.json");
        std::fs::write(&scalar, r#"{"loss": 0.1}"#).unwrap();
        assert!(load_plot_series(&scalar).is_err());
    }
}
