//! Declarative field mapping.
//!
//! A [`MappingSchema`] maps target field names to [`FieldRule`]s. Rules read
//! values by dot path (`customer.emails.0`), compute them from the whole
//! record, or combine a path with a transform, a default and a required flag.
//!
//! ```toml
//! [sources.mapping]
//! id = "contact_id"
//! email = { source = "profile.email", transform = "lowercase", required = true }
//! tier = { source = "plan.tier", default = "free" }
//! ```

use crate::{ConnectorError, ConnectorResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Function from one JSON value to another.
pub type ValueFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Value transform applied after extraction.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Lowercase,
    Uppercase,
    Trim,
    ToString,
    ToNumber,
    ToBool,
    #[serde(skip)]
    Custom(ValueFn),
}

impl Transform {
    pub fn apply(&self, value: &Value) -> Value {
        match self {
            Transform::Lowercase => map_str(value, |s| s.to_lowercase()),
            Transform::Uppercase => map_str(value, |s| s.to_uppercase()),
            Transform::Trim => map_str(value, |s| s.trim().to_string()),
            Transform::ToString => match value {
                Value::String(_) | Value::Null => value.clone(),
                other => Value::String(other.to_string()),
            },
            Transform::ToNumber => match value {
                Value::Number(_) => value.clone(),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| s.trim().parse::<f64>().map(Value::from))
                    .unwrap_or(Value::Null),
                Value::Bool(b) => Value::from(u8::from(*b)),
                _ => Value::Null,
            },
            Transform::ToBool => match value {
                Value::Bool(_) => value.clone(),
                Value::String(s) => {
                    Value::Bool(matches!(s.to_lowercase().as_str(), "true" | "1" | "yes"))
                }
                Value::Number(n) => Value::Bool(n.as_f64().is_some_and(|f| f != 0.0)),
                _ => Value::Bool(false),
            },
            Transform::Custom(f) => f(value),
        }
    }
}

fn map_str(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        other => other.clone(),
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::Lowercase => f.write_str("Lowercase"),
            Transform::Uppercase => f.write_str("Uppercase"),
            Transform::Trim => f.write_str("Trim"),
            Transform::ToString => f.write_str("ToString"),
            Transform::ToNumber => f.write_str("ToNumber"),
            Transform::ToBool => f.write_str("ToBool"),
            Transform::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Path, transform, default and required flag for one field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetailedRule {
    /// Dot path in the source record; the target name when unset
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default, rename = "default")]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// How one target field is produced.
#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldRule {
    Path(String),
    Detailed(DetailedRule),
    /// Computed from the whole record
    #[serde(skip)]
    Computed(ValueFn),
}

impl FieldRule {
    pub fn computed(f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        FieldRule::Computed(Arc::new(f))
    }
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRule::Path(path) => f.debug_tuple("Path").field(path).finish(),
            FieldRule::Detailed(rule) => f.debug_tuple("Detailed").field(rule).finish(),
            FieldRule::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Target field name to rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingSchema {
    pub fields: BTreeMap<String, FieldRule>,
}

impl MappingSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, target: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.insert(target.into(), rule);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Result of [`FieldMapper::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub missing: Vec<String>,
}

/// Applies mapping schemas and checks required fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMapper;

impl FieldMapper {
    /// Map a record, or every record of an array, through `schema`.
    pub fn normalize(&self, data: &Value, schema: &MappingSchema) -> ConnectorResult<Value> {
        match data {
            Value::Array(items) => items
                .iter()
                .map(|item| self.normalize_record(item, schema))
                .collect::<ConnectorResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(_) => self.normalize_record(data, schema),
            other => Err(ConnectorError::invalid_data(
                format!("cannot map a non-object value: {other}"),
                other.to_string().into_bytes(),
            )),
        }
    }

    fn normalize_record(&self, record: &Value, schema: &MappingSchema) -> ConnectorResult<Value> {
        let mut out = Value::Object(Map::new());

        for (target, rule) in &schema.fields {
            let value = match rule {
                FieldRule::Path(path) => get_path(record, path).cloned(),
                FieldRule::Computed(f) => Some(f(record)),
                FieldRule::Detailed(rule) => {
                    let path = rule.source.as_deref().unwrap_or(target);
                    let found = get_path(record, path)
                        .filter(|v| !v.is_null())
                        .map(|v| match &rule.transform {
                            Some(transform) => transform.apply(v),
                            None => v.clone(),
                        });

                    match found.or_else(|| rule.default_value.clone()) {
                        Some(value) => Some(value),
                        None if rule.required => {
                            return Err(ConnectorError::invalid_data(
                                format!("required field '{target}' missing at '{path}'"),
                                record.to_string().into_bytes(),
                            ));
                        }
                        None => None,
                    }
                }
            };

            if let Some(value) = value {
                set_path(&mut out, target, value);
            }
        }

        Ok(out)
    }

    /// Report which of `required_fields` are missing or null.
    ///
    /// For arrays each item is checked and missing entries are prefixed
    /// with the item index.
    pub fn validate(&self, data: &Value, required_fields: &[String]) -> ValidationReport {
        let mut missing = Vec::new();

        match data {
            Value::Array(items) => {
                for (idx, item) in items.iter().enumerate() {
                    for field in required_fields {
                        if !is_present(item, field) {
                            missing.push(format!("{idx}.{field}"));
                        }
                    }
                }
            }
            other => {
                for field in required_fields {
                    if !is_present(other, field) {
                        missing.push(field.clone());
                    }
                }
            }
        }

        ValidationReport {
            valid: missing.is_empty(),
            missing,
        }
    }
}

fn is_present(value: &Value, path: &str) -> bool {
    get_path(value, path).is_some_and(|v| !v.is_null())
}

/// Resolve a dot path; numeric segments index arrays.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at a dot path, creating intermediate objects.
fn set_path(target: &mut Value, path: &str, value: Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(map) = target else {
        return;
    };

    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_path(child, rest, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contact() -> Value {
        json!({
            "contact_id": 7,
            "profile": {"email": "  Ada@Example.COM ", "tags": ["vip", "beta"]},
            "plan": {"tier": null}
        })
    }

    #[test]
    fn test_path_and_nested_targets() {
        let schema = MappingSchema::new()
            .field("id", FieldRule::Path("contact_id".into()))
            .field("meta.first_tag", FieldRule::Path("profile.tags.0".into()))
            .field("absent", FieldRule::Path("nope.nothing".into()));

        let out = FieldMapper.normalize(&contact(), &schema).unwrap();
        assert_eq!(out, json!({"id": 7, "meta": {"first_tag": "vip"}}));
    }

    #[test]
    fn test_detailed_rules() {
        let schema = MappingSchema::new()
            .field(
                "email",
                FieldRule::Detailed(DetailedRule {
                    source: Some("profile.email".into()),
                    transform: Some(Transform::Custom(Arc::new(|v| {
                        Transform::Lowercase.apply(&Transform::Trim.apply(v))
                    }))),
                    ..DetailedRule::default()
                }),
            )
            .field(
                "tier",
                FieldRule::Detailed(DetailedRule {
                    source: Some("plan.tier".into()),
                    default_value: Some(json!("free")),
                    ..DetailedRule::default()
                }),
            );

        let out = FieldMapper.normalize(&contact(), &schema).unwrap();
        assert_eq!(out["email"], "ada@example.com");
        assert_eq!(out["tier"], "free");
    }

    #[test]
    fn test_required_field_missing_is_an_error() {
        let schema = MappingSchema::new().field(
            "owner",
            FieldRule::Detailed(DetailedRule {
                required: true,
                ..DetailedRule::default()
            }),
        );

        let err = FieldMapper.normalize(&contact(), &schema).unwrap_err();
        assert!(err.is_invalid_data());
    }

    #[test]
    fn test_computed_and_arrays() {
        let schema = MappingSchema::new().field(
            "tag_count",
            FieldRule::computed(|record| {
                json!(record["profile"]["tags"].as_array().map_or(0, Vec::len))
            }),
        );

        let out = FieldMapper
            .normalize(&json!([contact(), {"profile": {"tags": []}}]), &schema)
            .unwrap();
        assert_eq!(out, json!([{"tag_count": 2}, {"tag_count": 0}]));
    }

    #[test]
    fn test_schema_from_toml() {
        let schema: MappingSchema = toml::from_str(
            r#"
id = "contact_id"
email = { source = "profile.email", transform = "trim", required = true }
tier = { source = "plan.tier", default = "free" }
"#,
        )
        .unwrap();

        let out = FieldMapper.normalize(&contact(), &schema).unwrap();
        assert_eq!(
            out,
            json!({"id": 7, "email": "Ada@Example.COM", "tier": "free"})
        );
    }

    #[test]
    fn test_named_transforms() {
        assert_eq!(Transform::ToNumber.apply(&json!(" 42 ")), json!(42));
        assert_eq!(Transform::ToNumber.apply(&json!("4.5")), json!(4.5));
        assert_eq!(Transform::ToString.apply(&json!(3)), json!("3"));
        assert_eq!(Transform::ToBool.apply(&json!("Yes")), json!(true));
        assert_eq!(Transform::Uppercase.apply(&json!("ab")), json!("AB"));
    }

    #[test]
    fn test_validate() {
        let required = vec!["contact_id".to_string(), "plan.tier".to_string()];
        let report = FieldMapper.validate(&contact(), &required);
        assert!(!report.valid);
        assert_eq!(report.missing, vec!["plan.tier".to_string()]);

        let report = FieldMapper.validate(&json!([{"contact_id": 1}, {}]), &required[..1]);
        assert_eq!(report.missing, vec!["1.contact_id".to_string()]);
    }
}
