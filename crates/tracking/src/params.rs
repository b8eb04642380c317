//! Parameter files
//!
//! Stages depend on individual keys of a YAML parameter file rather than on
//! the whole file, so tweaking one hyperparameter only invalidates the
//! stages that read it.

use std::collections::BTreeMap;
use std::path::Path;

use dvx_core::{Error, Result};
use serde_yaml::Value;

/// Parameter file used when a stage names bare keys
pub const DEFAULT_PARAMS_FILE: &str = "params.yaml";

/// Values of the parameters a stage depends on, per file
pub type ParamValues = BTreeMap<String, BTreeMap<String, Value>>;

/// A single parameter dependency
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ParamRef {
    /// Parameter file, relative to the workspace
    pub file: String,

    /// Dotted key inside the file
    pub key: String,
}

impl ParamRef {
    /// Key in the default parameter file
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            file: DEFAULT_PARAMS_FILE.to_string(),
            key: key.into(),
        }
    }
}

/// Parse a parameter file
pub fn load_params(path: &Path) -> Result<Value> {
    let data = std::fs::read(path)?;
    Ok(serde_yaml::from_slice(&data)?)
}

/// Look up a dotted key (`train.lr`)
pub fn lookup<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    key.split('.').try_fold(value, |node, part| match node {
        Value::Mapping(map) => map.get(part),
        Value::Sequence(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Read every referenced parameter below `root`
pub fn read_params(root: &Path, refs: &[ParamRef]) -> Result<ParamValues> {
    let mut values = ParamValues::new();
    let mut files: BTreeMap<&str, Value> = BTreeMap::new();

    for param in refs {
        if !files.contains_key(param.file.as_str()) {
            files.insert(&param.file, load_params(&root.join(&param.file))?);
        }
        let document = &files[param.file.as_str()];
        let value = lookup(document, &param.key).ok_or_else(|| Error::InvalidPipeline {
            message: format!("parameter '{}' not found in {}", param.key, param.file),
        })?;
        values
            .entry(param.file.clone())
            .or_default()
            .insert(param.key.clone(), value.clone());
    }
    Ok(values)
}

/// Flatten a parameter document to dotted keys with scalar values
pub fn flatten_params(value: &Value) -> BTreeMap<String, Value> {
    let mut flat = BTreeMap::new();
    flatten_into(String::new(), value, &mut flat);
    flat
}

fn flatten_into(prefix: String, value: &Value, flat: &mut BTreeMap<String, Value>) {
    match value {
        Value::Mapping(map) => {
            for (key, child) in map {
                let Some(key) = scalar_key(key) else { continue };
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(path, child, flat);
            }
        }
        _ if !prefix.is_empty() => {
            flat.insert(prefix, value.clone());
        }
        _ => {}
    }
}

fn scalar_key(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Render a parameter value on one line
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Flatten per-file parameter values into `file:key -> rendered value`
///
/// Keys from the default parameter file are left unprefixed.
pub fn render_param_values(values: &ParamValues) -> BTreeMap<String, String> {
    values
        .iter()
        .flat_map(|(file, keys)| {
            keys.iter().map(move |(key, value)| {
                let name = if file == DEFAULT_PARAMS_FILE {
                    key.clone()
                } else {
                    format!("{}:{}", file, key)
                };
                (name, render_value(value))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: &str = "train:\n  lr: 0.01\n  epochs: 10\n  layers: [64, 32]\nseed: 42\n";

    #[test]
    fn test_lookup_dotted_keys() {
        let value: Value = serde_yaml::from_str(PARAMS).unwrap();
        assert_eq!(lookup(&value, "train.epochs"), Some(&Value::from(10)));
        assert_eq!(lookup(&value, "train.layers.1"), Some(&Value::from(32)));
        assert_eq!(lookup(&value, "seed"), Some(&Value::from(42)));
        assert!(lookup(&value, "train.momentum").is_none());
    }

    #[test]
    fn test_read_params_from_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("params.yaml"), PARAMS).unwrap();
        std::fs::write(dir.path().join("eval.yaml"), "threshold: 0.5\n").unwrap();

        let refs = vec![
            ParamRef::new("train.lr"),
            ParamRef {
                file: "eval.yaml".to_string(),
                key: "threshold".to_string(),
            },
        ];
        let values = read_params(dir.path(), &refs).unwrap();
        assert_eq!(values["params.yaml"]["train.lr"], Value::from(0.01));

        let rendered = render_param_values(&values);
        assert_eq!(rendered["train.lr"], "0.01");
        assert_eq!(rendered["eval.yaml:threshold"], "0.5");
    }

    #[test]
    fn test_missing_param_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("params.yaml"), PARAMS).unwrap();
        let result = read_params(dir.path(), &[ParamRef::new("train.dropout")]);
        assert!(matches!(result, Err(Error::InvalidPipeline { .. })));
    }

    #[test]
    fn test_flatten_params() {
        let value: Value = serde_yaml::from_str(PARAMS).unwrap();
        let flat = flatten_params(&value);
        assert_eq!(flat.len(), 4);
        assert_eq!(flat["train.lr"], Value::from(0.01));
        assert!(flat.contains_key("train.layers"));
    }
}
