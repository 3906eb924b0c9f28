//! Typed argument schemas for skills.
//!
//! A schema is a map of field name → [`FieldSpec`]. It is interpreted by a
//! single generic validator instead of per-skill parsing code, and rendered
//! as JSON Schema when capabilities are shown to a planner.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::sandbox::normalize_logical;

/// Expected type of an argument, with its constraints.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    String {
        #[serde(default)]
        min_len: Option<usize>,
        #[serde(default)]
        max_len: Option<usize>,
    },
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Boolean,
    Enum {
        values: Vec<String>,
    },
    /// A workspace-relative path. Normalized during validation.
    Path,
    Array {
        items: Box<FieldKind>,
    },
    Object,
}

impl FieldKind {
    pub fn string() -> Self {
        Self::String {
            min_len: None,
            max_len: None,
        }
    }

    pub fn integer(min: Option<i64>, max: Option<i64>) -> Self {
        Self::Integer { min, max }
    }

    fn check(&self) -> Result<(), String> {
        match self {
            Self::String {
                min_len: Some(min),
                max_len: Some(max),
            } if min > max => Err(format!("min_len {min} exceeds max_len {max}")),
            Self::Integer {
                min: Some(min),
                max: Some(max),
            } if min > max => Err(format!("min {min} exceeds max {max}")),
            Self::Number { min, max } => {
                if min.is_some_and(f64::is_nan) || max.is_some_and(f64::is_nan) {
                    return Err("bounds must be numbers".to_string());
                }
                match (min, max) {
                    (Some(min), Some(max)) if min > max => {
                        Err(format!("min {min} exceeds max {max}"))
                    }
                    _ => Ok(()),
                }
            }
            Self::Enum { values } => {
                if values.is_empty() {
                    return Err("enum declares no values".to_string());
                }
                let mut seen = HashSet::new();
                match values.iter().find(|v| !seen.insert(v.as_str())) {
                    Some(dup) => Err(format!("enum value '{dup}' declared twice")),
                    None => Ok(()),
                }
            }
            Self::Array { items } => items.check().map_err(|e| format!("items: {e}")),
            _ => Ok(()),
        }
    }

    /// Every path this kind carries in `value`, including array items.
    pub fn paths<'v>(&self, value: &'v Value) -> Vec<&'v str> {
        match (self, value) {
            (Self::Path, Value::String(s)) => vec![s.as_str()],
            (Self::Array { items }, Value::Array(values)) => {
                values.iter().flat_map(|v| items.paths(v)).collect()
            }
            _ => vec![],
        }
    }

    /// Checks `value` against this kind and returns its normalized form.
    fn accept(&self, value: &Value) -> Result<Value, String> {
        match self {
            Self::String { min_len, max_len } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| expected("string", value))?;
                let len = s.chars().count();
                if let Some(min) = min_len {
                    if len < *min {
                        return Err(format!("must be at least {min} characters"));
                    }
                }
                if let Some(max) = max_len {
                    if len > *max {
                        return Err(format!("must be at most {max} characters"));
                    }
                }
                Ok(value.clone())
            }
            Self::Integer { min, max } => {
                let n = value.as_i64().ok_or_else(|| expected("integer", value))?;
                if let Some(min) = min {
                    if n < *min {
                        return Err(format!("must be >= {min}"));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(format!("must be <= {max}"));
                    }
                }
                Ok(value.clone())
            }
            Self::Number { min, max } => {
                let n = value.as_f64().ok_or_else(|| expected("number", value))?;
                if let Some(min) = min {
                    if n < *min {
                        return Err(format!("must be >= {min}"));
                    }
                }
                if let Some(max) = max {
                    if n > *max {
                        return Err(format!("must be <= {max}"));
                    }
                }
                Ok(value.clone())
            }
            Self::Boolean => {
                if value.is_boolean() {
                    Ok(value.clone())
                } else {
                    Err(expected("boolean", value))
                }
            }
            Self::Enum { values } => {
                let s = value.as_str().ok_or_else(|| expected("string", value))?;
                if values.iter().any(|v| v == s) {
                    Ok(value.clone())
                } else {
                    Err(format!("must be one of: {}", values.join(", ")))
                }
            }
            Self::Path => {
                let s = value.as_str().ok_or_else(|| expected("path", value))?;
                if s.trim().is_empty() {
                    return Err("path must not be empty".to_string());
                }
                let normalized = normalize_logical(s).map_err(|v| v.to_string())?;
                let text = normalized.to_string_lossy();
                Ok(Value::String(if text.is_empty() {
                    ".".to_string()
                } else {
                    text.into_owned()
                }))
            }
            Self::Array { items } => {
                let array = value.as_array().ok_or_else(|| expected("array", value))?;
                array
                    .iter()
                    .enumerate()
                    .map(|(i, item)| items.accept(item).map_err(|e| format!("item {i}: {e}")))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            Self::Object => {
                if value.is_object() {
                    Ok(value.clone())
                } else {
                    Err(expected("object", value))
                }
            }
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            Self::String { min_len, max_len } => {
                let mut schema = json!({ "type": "string" });
                if let Some(min) = min_len {
                    schema["minLength"] = json!(min);
                }
                if let Some(max) = max_len {
                    schema["maxLength"] = json!(max);
                }
                schema
            }
            Self::Integer { min, max } => {
                let mut schema = json!({ "type": "integer" });
                if let Some(min) = min {
                    schema["minimum"] = json!(min);
                }
                if let Some(max) = max {
                    schema["maximum"] = json!(max);
                }
                schema
            }
            Self::Number { min, max } => {
                let mut schema = json!({ "type": "number" });
                if let Some(min) = min {
                    schema["minimum"] = json!(min);
                }
                if let Some(max) = max {
                    schema["maximum"] = json!(max);
                }
                schema
            }
            Self::Boolean => json!({ "type": "boolean" }),
            Self::Enum { values } => json!({ "type": "string", "enum": values }),
            Self::Path => json!({ "type": "string", "format": "workspace-path" }),
            Self::Array { items } => json!({ "type": "array", "items": items.json_schema() }),
            Self::Object => json!({ "type": "object" }),
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn expected(what: &str, value: &Value) -> String {
    format!("expected {what}, got {}", type_name(value))
}

/// One declared argument.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldSpec {
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

/// An argument that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgError {
    pub field: String,
    pub reason: String,
}

impl ArgError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Declared arguments of a skill.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgSchema {
    fields: BTreeMap<String, FieldSpec>,
    allow_extra: bool,
}

impl ArgSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(fields: BTreeMap<String, FieldSpec>, allow_extra: bool) -> Self {
        Self {
            fields,
            allow_extra,
        }
    }

    pub fn required(self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.field(name, kind, true, description)
    }

    pub fn optional(self, name: &str, kind: FieldKind, description: &str) -> Self {
        self.field(name, kind, false, description)
    }

    fn field(mut self, name: &str, kind: FieldKind, required: bool, description: &str) -> Self {
        self.fields.insert(
            name.to_string(),
            FieldSpec {
                kind,
                required,
                description: description.to_string(),
            },
        );
        self
    }

    /// Accept undeclared arguments and pass them through unchanged.
    pub fn allow_extra(mut self) -> Self {
        self.allow_extra = true;
        self
    }

    pub fn allows_extra(&self) -> bool {
        self.allow_extra
    }

    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Well-formedness check, run once at registration.
    pub fn check(&self) -> Result<(), String> {
        for (name, spec) in &self.fields {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(format!("invalid field name '{name}'"));
            }
            spec.kind
                .check()
                .map_err(|e| format!("field '{name}': {e}"))?;
        }
        Ok(())
    }

    /// Validates raw plan arguments, returning the normalized argument map.
    ///
    /// `null` stands for "no arguments". An optional field set to `null` is
    /// treated as absent.
    pub fn validate(&self, args: &Value) -> Result<Map<String, Value>, ArgError> {
        let empty = Map::new();
        let raw = match args {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(ArgError::new(
                    "args",
                    format!("arguments must be an object, got {}", type_name(other)),
                ))
            }
        };

        let mut out = Map::new();
        for (name, spec) in &self.fields {
            match raw.get(name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        return Err(ArgError::new(name, "missing required argument"));
                    }
                }
                Some(value) => {
                    let accepted = spec
                        .kind
                        .accept(value)
                        .map_err(|reason| ArgError::new(name, reason))?;
                    out.insert(name.clone(), accepted);
                }
            }
        }

        for (name, value) in raw {
            if self.fields.contains_key(name) {
                continue;
            }
            if !self.allow_extra {
                return Err(ArgError::new(name, "unexpected argument"));
            }
            out.insert(name.clone(), value.clone());
        }

        Ok(out)
    }

    /// JSON Schema rendering for planners.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.fields {
            let mut prop = spec.kind.json_schema();
            if !spec.description.is_empty() {
                prop["description"] = json!(spec.description);
            }
            properties.insert(name.clone(), prop);
            if spec.required {
                required.push(json!(name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": self.allow_extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file_schema() -> ArgSchema {
        ArgSchema::new()
            .required("path", FieldKind::Path, "File to write")
            .required("content", FieldKind::string(), "File content")
            .optional("mode", FieldKind::Enum {
                values: vec!["overwrite".to_string(), "append".to_string()],
            }, "")
    }

    #[test]
    fn test_validate_accepts_complete_args() {
        let schema = write_file_schema();
        let args = schema
            .validate(&json!({"path": "./docs/a.txt", "content": "hi"}))
            .unwrap();
        assert_eq!(args["path"], "docs/a.txt");
        assert_eq!(args["content"], "hi");
        assert!(!args.contains_key("mode"));
    }

    #[test]
    fn test_validate_missing_required() {
        let err = write_file_schema()
            .validate(&json!({"path": "a.txt"}))
            .unwrap_err();
        assert_eq!(err.field, "content");
        assert_eq!(err.reason, "missing required argument");
    }

    #[test]
    fn test_validate_null_optional_is_absent() {
        let args = write_file_schema()
            .validate(&json!({"path": "a", "content": "", "mode": null}))
            .unwrap();
        assert!(!args.contains_key("mode"));
    }

    #[test]
    fn test_validate_type_mismatch() {
        let err = write_file_schema()
            .validate(&json!({"path": "a.txt", "content": 42}))
            .unwrap_err();
        assert_eq!(err.field, "content");
        assert_eq!(err.reason, "expected string, got integer");
    }

    #[test]
    fn test_validate_enum_membership() {
        let err = write_file_schema()
            .validate(&json!({"path": "a", "content": "x", "mode": "truncate"}))
            .unwrap_err();
        assert_eq!(err.field, "mode");
        assert!(err.reason.contains("overwrite, append"));
    }

    #[test]
    fn test_validate_rejects_extra_by_default() {
        let err = write_file_schema()
            .validate(&json!({"path": "a", "content": "x", "color": "red"}))
            .unwrap_err();
        assert_eq!(err.field, "color");
        assert_eq!(err.reason, "unexpected argument");
    }

    #[test]
    fn test_validate_passthrough_when_allowed() {
        let args = write_file_schema()
            .allow_extra()
            .validate(&json!({"path": "a", "content": "x", "color": "red"}))
            .unwrap();
        assert_eq!(args["color"], "red");
    }

    #[test]
    fn test_validate_path_escape() {
        let err = write_file_schema()
            .validate(&json!({"path": "../../etc/passwd", "content": "x"}))
            .unwrap_err();
        assert_eq!(err.field, "path");
        assert_eq!(err.reason, "path escapes the workspace");

        let err = write_file_schema()
            .validate(&json!({"path": "/etc/passwd", "content": "x"}))
            .unwrap_err();
        assert_eq!(err.reason, "absolute paths are not allowed");
    }

    #[test]
    fn test_validate_integer_bounds() {
        let schema = ArgSchema::new().required(
            "timeout_secs",
            FieldKind::integer(Some(1), Some(600)),
            "",
        );
        assert!(schema.validate(&json!({"timeout_secs": 30})).is_ok());
        let err = schema.validate(&json!({"timeout_secs": 0})).unwrap_err();
        assert_eq!(err.reason, "must be >= 1");
        let err = schema.validate(&json!({"timeout_secs": 1.5})).unwrap_err();
        assert_eq!(err.reason, "expected integer, got number");
        // Numeric strings are not coerced
        let err = schema.validate(&json!({"timeout_secs": "30"})).unwrap_err();
        assert_eq!(err.reason, "expected integer, got string");
    }

    #[test]
    fn test_validate_number_accepts_integers() {
        let schema = ArgSchema::new().required(
            "ratio",
            FieldKind::Number {
                min: Some(0.0),
                max: Some(1.0),
            },
            "",
        );
        assert!(schema.validate(&json!({"ratio": 1})).is_ok());
        assert!(schema.validate(&json!({"ratio": 0.25})).is_ok());
        assert!(schema.validate(&json!({"ratio": 1.5})).is_err());
    }

    #[test]
    fn test_validate_array_items() {
        let schema = ArgSchema::new().required(
            "files",
            FieldKind::Array {
                items: Box::new(FieldKind::Path),
            },
            "",
        );
        let args = schema
            .validate(&json!({"files": ["a/./b", "c"]}))
            .unwrap();
        assert_eq!(args["files"], json!(["a/b", "c"]));

        let err = schema.validate(&json!({"files": ["ok", 3]})).unwrap_err();
        assert_eq!(err.reason, "item 1: expected path, got integer");
    }

    #[test]
    fn test_validate_non_object_args() {
        let err = write_file_schema().validate(&json!(["a"])).unwrap_err();
        assert_eq!(err.field, "args");

        let empty = ArgSchema::new().validate(&Value::Null).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_check_rejects_malformed_schemas() {
        let bad_name = ArgSchema::new().required("bad name", FieldKind::Boolean, "");
        assert!(bad_name.check().unwrap_err().contains("bad name"));

        let empty_enum = ArgSchema::new().required("m", FieldKind::Enum { values: vec![] }, "");
        assert!(empty_enum.check().unwrap_err().contains("no values"));

        let inverted = ArgSchema::new().required("n", FieldKind::integer(Some(5), Some(1)), "");
        assert!(inverted.check().unwrap_err().contains("exceeds"));

        let nested = ArgSchema::new().required(
            "xs",
            FieldKind::Array {
                items: Box::new(FieldKind::String {
                    min_len: Some(3),
                    max_len: Some(2),
                }),
            },
            "",
        );
        assert!(nested.check().unwrap_err().contains("items"));

        assert!(write_file_schema().check().is_ok());
    }

    #[test]
    fn test_paths_collects_nested_items() {
        let kind = FieldKind::Array {
            items: Box::new(FieldKind::Path),
        };
        assert_eq!(kind.paths(&json!(["a.txt", "src/lib.rs"])), vec!["a.txt", "src/lib.rs"]);
        assert_eq!(FieldKind::Path.paths(&json!("notes")), vec!["notes"]);
        assert!(FieldKind::string().paths(&json!("notes")).is_empty());
    }

    #[test]
    fn test_json_schema_rendering() {
        let schema = write_file_schema().to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["content"]["type"], "string");
        assert_eq!(schema["properties"]["path"]["description"], "File to write");
        assert_eq!(schema["properties"]["mode"]["enum"], json!(["overwrite", "append"]));
        assert_eq!(schema["required"], json!(["content", "path"]));
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn test_field_spec_from_toml() {
        let spec: FieldSpec = toml::from_str(
            r#"
            type = "integer"
            min = 1
            required = true
            description = "Line count"
            "#,
        )
        .unwrap();
        assert_eq!(spec.kind, FieldKind::integer(Some(1), None));
        assert!(spec.required);
        assert_eq!(spec.description, "Line count");
    }
}
