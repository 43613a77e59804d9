//! Declarative argument schemas for tools.
//!
//! Each tool describes its parameters as an `ArgSchema`. At registration the
//! schema is checked and compiled into a JSON Schema validator; at invocation
//! the raw arguments get defaults applied and are validated before the typed
//! decode step in the registry.

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use crate::error::SandboxError;

/// Kind of a single tool parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
    /// Octal permission string such as `"0755"`. Parsed leniently.
    OctalString,
    /// Whole seconds.
    Duration,
    /// List of TCP ports.
    PortList,
    /// Flat string-to-string object, e.g. environment variables.
    StringMap,
}

impl ParamKind {
    fn json_schema(self) -> Value {
        match self {
            Self::String | Self::OctalString => json!({ "type": "string" }),
            Self::Integer => json!({ "type": "integer" }),
            Self::Boolean => json!({ "type": "boolean" }),
            Self::Duration => json!({ "type": "integer", "minimum": 0 }),
            Self::PortList => json!({
                "type": "array",
                "items": { "type": "integer", "minimum": 1, "maximum": 65535 }
            }),
            Self::StringMap => json!({
                "type": "object",
                "additionalProperties": { "type": "string" }
            }),
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String | Self::OctalString => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Duration => value.is_u64(),
            Self::PortList => value
                .as_array()
                .is_some_and(|ports| ports.iter().all(|p| p.as_u64().is_some_and(|n| (1..=65535).contains(&n)))),
            Self::StringMap => value
                .as_object()
                .is_some_and(|map| map.values().all(Value::is_string)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    pub description: &'static str,
}

/// Ordered parameter list for one tool.
#[derive(Debug, Clone, Default)]
pub struct ArgSchema {
    params: Vec<ParamSpec>,
}

impl ArgSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        self.params.push(ParamSpec {
            name,
            kind,
            required: true,
            default: None,
            description,
        });
        self
    }

    pub fn optional(mut self, name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        self.params.push(ParamSpec {
            name,
            kind,
            required: false,
            default: None,
            description,
        });
        self
    }

    pub fn with_default(
        mut self,
        name: &'static str,
        kind: ParamKind,
        default: Value,
        description: &'static str,
    ) -> Self {
        self.params.push(ParamSpec {
            name,
            kind,
            required: false,
            default: Some(default),
            description,
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Structural checks a JSON Schema compiler would not catch.
    pub fn check(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for param in &self.params {
            if param.name.is_empty() {
                return Err("parameter with empty name".into());
            }
            if !seen.insert(param.name) {
                return Err(format!("duplicate parameter '{}'", param.name));
            }
            if let Some(default) = &param.default {
                if param.required {
                    return Err(format!("required parameter '{}' has a default", param.name));
                }
                if !param.kind.accepts(default) {
                    return Err(format!(
                        "default for '{}' does not match kind {:?}",
                        param.name, param.kind
                    ));
                }
            }
        }
        Ok(())
    }

    /// JSON Schema advertised to MCP clients as `inputSchema`.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.params {
            let mut prop = param.kind.json_schema();
            if let Value::Object(obj) = &mut prop {
                if !param.description.is_empty() {
                    obj.insert("description".into(), Value::String(param.description.into()));
                }
                if let Some(default) = &param.default {
                    obj.insert("default".into(), default.clone());
                }
            }
            properties.insert(param.name.to_string(), prop);
            if param.required {
                required.push(Value::String(param.name.to_string()));
            }
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn compile(&self) -> Result<CompiledSchema, String> {
        self.check()?;
        let json_schema = self.to_json_schema();
        let validator =
            jsonschema::validator_for(&json_schema).map_err(|e| format!("invalid JSON schema: {e}"))?;
        Ok(CompiledSchema {
            schema: self.clone(),
            json_schema,
            validator,
        })
    }
}

/// An `ArgSchema` paired with its compiled validator.
pub struct CompiledSchema {
    schema: ArgSchema,
    json_schema: Value,
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    pub fn json_schema(&self) -> &Value {
        &self.json_schema
    }

    /// Normalise raw arguments: `null` means "no arguments", `null` fields
    /// count as absent, defaults fill missing optional fields, and the result
    /// must validate. Unknown fields are kept and later ignored by serde.
    pub fn prepare(&self, raw: Value) -> Result<Value, SandboxError> {
        let mut args = match raw {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(SandboxError::invalid(format!(
                    "arguments must be an object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        args.retain(|_, v| !v.is_null());

        for param in self.schema.params() {
            if args.contains_key(param.name) {
                continue;
            }
            if param.required {
                return Err(SandboxError::invalid(format!(
                    "missing required field '{}'",
                    param.name
                )));
            }
            if let Some(default) = &param.default {
                args.insert(param.name.to_string(), default.clone());
            }
        }

        let value = Value::Object(args);
        if let Err(error) = self.validator.validate(&value) {
            return Err(SandboxError::invalid(error.to_string()));
        }
        Ok(value)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Typed argument shape for a tool; one implementation per schema.
pub trait ToolArgs: DeserializeOwned + Send + 'static {
    fn schema() -> ArgSchema;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn write_schema() -> ArgSchema {
        ArgSchema::new()
            .required("path", ParamKind::String, "target path")
            .optional("content", ParamKind::String, "")
            .with_default("permissions", ParamKind::OctalString, json!("0644"), "")
            .with_default("isDirectory", ParamKind::Boolean, json!(false), "")
    }

    #[test]
    fn test_json_schema_lists_required_fields() {
        let schema = write_schema().to_json_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["path"]));
        assert_eq!(schema["properties"]["permissions"]["default"], "0644");
        assert_eq!(schema["properties"]["path"]["description"], "target path");
    }

    #[test]
    fn test_prepare_applies_defaults() {
        let compiled = write_schema().compile().unwrap();
        let args = compiled.prepare(json!({ "path": "/tmp/x" })).unwrap();
        assert_eq!(args["permissions"], "0644");
        assert_eq!(args["isDirectory"], false);
        assert!(args.get("content").is_none());
    }

    #[test]
    fn test_prepare_rejects_missing_required() {
        let compiled = write_schema().compile().unwrap();
        let err = compiled.prepare(json!({ "content": "x" })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn test_prepare_rejects_wrong_kind() {
        let compiled = write_schema().compile().unwrap();
        let err = compiled.prepare(json!({ "path": 42 })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
    }

    #[test]
    fn test_prepare_keeps_unknown_fields() {
        let compiled = write_schema().compile().unwrap();
        let args = compiled.prepare(json!({ "path": "a", "extra": 1 })).unwrap();
        assert_eq!(args["extra"], 1);
    }

    #[test]
    fn test_null_arguments_and_null_fields() {
        let compiled = ArgSchema::new()
            .optional("workingDir", ParamKind::String, "")
            .compile()
            .unwrap();
        assert_eq!(compiled.prepare(Value::Null).unwrap(), json!({}));
        assert_eq!(compiled.prepare(json!({ "workingDir": null })).unwrap(), json!({}));
        assert!(compiled.prepare(json!([1, 2])).is_err());
    }

    #[test]
    fn test_port_list_bounds() {
        let compiled = ArgSchema::new()
            .optional("waitForPorts", ParamKind::PortList, "")
            .compile()
            .unwrap();
        assert!(compiled.prepare(json!({ "waitForPorts": [80, 4242] })).is_ok());
        assert!(compiled.prepare(json!({ "waitForPorts": [0] })).is_err());
        assert!(compiled.prepare(json!({ "waitForPorts": [70000] })).is_err());
    }

    #[test]
    fn test_malformed_schemas_are_rejected() {
        let dup = ArgSchema::new()
            .required("pid", ParamKind::Integer, "")
            .required("pid", ParamKind::Integer, "");
        assert!(dup.compile().is_err());

        let bad_default = ArgSchema::new().with_default("recursive", ParamKind::Boolean, json!("yes"), "");
        assert!(bad_default.check().unwrap_err().contains("recursive"));

        let empty = ArgSchema::new().required("", ParamKind::String, "");
        assert!(empty.check().is_err());
    }
}
