//! Declared tool parameter schemas and argument validation.

use schemars::JsonSchema;
use schemars::schema::{InstanceType, RootSchema, Schema, SchemaObject, SingleOrVec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    const fn json_name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    const fn from_instance(kind: InstanceType) -> Option<Self> {
        match kind {
            InstanceType::String => Some(Self::String),
            InstanceType::Integer => Some(Self::Integer),
            InstanceType::Number => Some(Self::Number),
            InstanceType::Boolean => Some(Self::Boolean),
            InstanceType::Object => Some(Self::Object),
            InstanceType::Array => Some(Self::Array),
            InstanceType::Null => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.json_name())
    }
}

/// One declared tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Param {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

const fn default_required() -> bool {
    true
}

impl Param {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            description: None,
            required: true,
            default: None,
            allowed: None,
        }
    }

    #[must_use]
    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::String)
    }

    #[must_use]
    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Integer)
    }

    #[must_use]
    pub fn number(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Number)
    }

    #[must_use]
    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamType::Boolean)
    }

    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Mark optional; a missing value is replaced with `default` before invocation.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.required = false;
        self.default = Some(default.into());
        self
    }

    #[must_use]
    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationReason {
    NotAnObject,
    Missing { param: String },
    WrongType { param: String, expected: ParamType },
    NotInEnum { param: String, value: String, allowed: Vec<String> },
    Unexpected { param: String },
}

/// Arguments rejected before a tool was invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid arguments for tool `{tool}`: {reason}")]
pub struct SchemaViolation {
    pub tool: String,
    pub reason: ViolationReason,
}

impl fmt::Display for ViolationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => f.write_str("arguments must be a JSON object"),
            Self::Missing { param } => write!(f, "missing required parameter `{param}`"),
            Self::WrongType { param, expected } => {
                write!(f, "parameter `{param}` must be of type {expected}")
            }
            Self::NotInEnum { param, value, allowed } => write!(
                f,
                "parameter `{param}` got {value}, expected one of: {}",
                allowed.join(", ")
            ),
            Self::Unexpected { param } => write!(f, "unexpected parameter `{param}`"),
        }
    }
}

/// Ordered list of declared parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ParamSchema {
    params: Vec<Param>,
}

impl ParamSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Derive parameters from a `schemars` type.
    ///
    /// Fields become parameters in declaration order; `Option` and
    /// `#[serde(default)]` fields are optional, unit enums become enum
    /// constraints.
    #[must_use]
    pub fn from_type<T: JsonSchema>() -> Self {
        Self::from_root(&schemars::schema_for!(T))
    }

    #[must_use]
    pub fn from_root(root: &RootSchema) -> Self {
        let Some(object) = root.schema.object.as_ref() else {
            return Self::default();
        };
        let params = object
            .properties
            .iter()
            .map(|(name, schema)| {
                let resolved = resolve(schema, root);
                let metadata = resolved.metadata.as_deref();
                Param {
                    name: name.clone(),
                    kind: instance_kind(&resolved).unwrap_or(ParamType::Object),
                    description: metadata.and_then(|m| m.description.clone()),
                    required: object.required.contains(name),
                    default: metadata.and_then(|m| m.default.clone()),
                    allowed: resolved
                        .enum_values
                        .as_ref()
                        .map(|values| values.iter().filter(|v| !v.is_null()).cloned().collect()),
                }
            })
            .collect();
        Self { params }
    }

    /// Render as a JSON Schema object for reasoning providers.
    #[must_use]
    pub fn json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.params {
            let mut prop = Map::new();
            prop.insert("type".to_string(), json!(param.kind.json_name()));
            if let Some(description) = &param.description {
                prop.insert("description".to_string(), json!(description));
            }
            if let Some(allowed) = &param.allowed {
                prop.insert("enum".to_string(), Value::Array(allowed.clone()));
            }
            if let Some(default) = &param.default {
                prop.insert("default".to_string(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(prop));
            if param.required {
                required.push(json!(param.name));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }

    /// Validate raw arguments, filling declared defaults.
    ///
    /// `null` for an optional parameter counts as not supplied.
    ///
    /// # Errors
    /// Returns a [`SchemaViolation`] for non-object arguments, missing required
    /// values, type or enum mismatches and undeclared parameters.
    pub fn validate(&self, tool: &str, args: &Value) -> Result<Map<String, Value>, SchemaViolation> {
        let violation = |reason| SchemaViolation { tool: tool.to_string(), reason };
        let supplied = match args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => return Err(violation(ViolationReason::NotAnObject)),
        };

        if let Some(unexpected) = supplied.keys().find(|key| self.get(key).is_none()) {
            return Err(violation(ViolationReason::Unexpected { param: unexpected.clone() }));
        }

        let mut validated = Map::new();
        for param in &self.params {
            let value = supplied.get(&param.name).filter(|v| !v.is_null() || param.required);
            let Some(value) = value else {
                if let Some(default) = &param.default {
                    validated.insert(param.name.clone(), default.clone());
                } else if param.required {
                    return Err(violation(ViolationReason::Missing { param: param.name.clone() }));
                }
                continue;
            };
            if value.is_null() {
                return Err(violation(ViolationReason::Missing { param: param.name.clone() }));
            }
            if !param.kind.accepts(value) {
                return Err(violation(ViolationReason::WrongType {
                    param: param.name.clone(),
                    expected: param.kind,
                }));
            }
            if let Some(allowed) = &param.allowed {
                if !allowed.contains(value) {
                    return Err(violation(ViolationReason::NotInEnum {
                        param: param.name.clone(),
                        value: value.to_string(),
                        allowed: allowed.iter().map(Value::to_string).collect(),
                    }));
                }
            }
            validated.insert(param.name.clone(), value.clone());
        }
        Ok(validated)
    }
}

fn resolve(schema: &Schema, root: &RootSchema) -> SchemaObject {
    let Schema::Object(object) = schema else {
        return SchemaObject::default();
    };
    if let Some(reference) = &object.reference {
        let name = reference.trim_start_matches("#/definitions/");
        if let Some(target) = root.definitions.get(name) {
            let mut resolved = resolve(target, root);
            if let Some(meta) = &object.metadata {
                let merged = resolved.metadata();
                if meta.description.is_some() {
                    merged.description.clone_from(&meta.description);
                }
                if meta.default.is_some() {
                    merged.default.clone_from(&meta.default);
                }
            }
            return resolved;
        }
    }
    if let Some(sub) = &object.subschemas {
        let members = sub.all_of.as_ref().or(sub.any_of.as_ref());
        if let Some(inner) = members.and_then(|m| m.iter().find(|s| !is_null_schema(s))) {
            let mut resolved = resolve(inner, root);
            if let Some(meta) = &object.metadata {
                let merged = resolved.metadata();
                if meta.description.is_some() {
                    merged.description.clone_from(&meta.description);
                }
                if meta.default.is_some() {
                    merged.default.clone_from(&meta.default);
                }
            }
            return resolved;
        }
    }
    object.clone()
}

fn is_null_schema(schema: &Schema) -> bool {
    matches!(
        schema,
        Schema::Object(SchemaObject { instance_type: Some(SingleOrVec::Single(kind)), .. })
            if **kind == InstanceType::Null
    )
}

fn instance_kind(object: &SchemaObject) -> Option<ParamType> {
    match object.instance_type.as_ref()? {
        SingleOrVec::Single(kind) => ParamType::from_instance(**kind),
        SingleOrVec::Vec(kinds) => kinds.iter().copied().find_map(ParamType::from_instance),
    }
}
