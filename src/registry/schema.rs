//! Declarative input schemas
//!
//! A small subset of JSON Schema: an object with typed properties, some of
//! them required. The same value is published through `tools/list` and
//! interpreted by [`InputSchema::validate`] before a handler runs.

use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Integer => "integer",
            PropertyType::Boolean => "boolean",
            PropertyType::Object => "object",
            PropertyType::Array => "array",
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            PropertyType::String => value.is_string(),
            PropertyType::Number => value.is_number(),
            PropertyType::Integer => value.is_i64() || value.is_u64(),
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Object => value.is_object(),
            PropertyType::Array => value.is_array(),
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertySchema {
    pub name: String,
    pub kind: PropertyType,
    pub description: String,
    pub default: Option<Value>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("arguments must be a JSON object")]
    NotAnObject,

    #[error("missing required property '{0}'")]
    MissingProperty(String),

    #[error("property '{property}' must be of type {expected}, got {actual}")]
    WrongType {
        property: String,
        expected: PropertyType,
        actual: &'static str,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputSchema {
    properties: Vec<PropertySchema>,
    required: Vec<String>,
}

impl InputSchema {
    /// Schema with no properties.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Add an optional property.
    pub fn property(mut self, name: &str, kind: PropertyType, description: &str) -> Self {
        self.properties.push(PropertySchema {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            default: None,
        });
        self
    }

    /// Add an optional property with an advertised default.
    pub fn property_with_default(
        mut self,
        name: &str,
        kind: PropertyType,
        description: &str,
        default: Value,
    ) -> Self {
        self.properties.push(PropertySchema {
            name: name.to_string(),
            kind,
            description: description.to_string(),
            default: Some(default),
        });
        self
    }

    /// Add a required property.
    pub fn required(self, name: &str, kind: PropertyType, description: &str) -> Self {
        let mut schema = self.property(name, kind, description);
        schema.required.push(name.to_string());
        schema
    }

    pub fn properties(&self) -> &[PropertySchema] {
        &self.properties
    }

    pub fn required_names(&self) -> &[String] {
        &self.required
    }

    /// JSON Schema form, as published in `tools/list`.
    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        for prop in &self.properties {
            let mut entry = json!({
                "type": prop.kind.as_str(),
                "description": prop.description,
            });
            if let (Some(default), Some(obj)) = (&prop.default, entry.as_object_mut()) {
                obj.insert("default".to_string(), default.clone());
            }
            properties.insert(prop.name.clone(), entry);
        }

        json!({
            "type": "object",
            "properties": properties,
            "required": self.required,
        })
    }

    /// Check `args` and stop at the first violation: required properties
    /// first, then declared types. `null` counts as absent. Undeclared
    /// properties are ignored.
    pub fn validate(&self, args: &Value) -> Result<(), SchemaViolation> {
        let empty = Map::new();
        let obj = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(SchemaViolation::NotAnObject),
        };

        for name in &self.required {
            if obj.get(name).map_or(true, Value::is_null) {
                return Err(SchemaViolation::MissingProperty(name.clone()));
            }
        }

        for prop in &self.properties {
            match obj.get(&prop.name) {
                None | Some(Value::Null) => {}
                Some(value) if prop.kind.matches(value) => {}
                Some(value) => {
                    return Err(SchemaViolation::WrongType {
                        property: prop.name.clone(),
                        expected: prop.kind,
                        actual: json_type_name(value),
                    })
                }
            }
        }

        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
