//! Schema-driven decoding of operation config maps.
//!
//! Every operation declares its accepted fields up front as a [`ConfigSchema`].
//! Decoding matches incoming keys loosely (`pageSize`, `page-size` and
//! `page_size` all hit the same field), trims strings, splits comma lists
//! and produces a canonical map keyed by field name. Typed operation configs
//! are then plain `serde` structs deserialized from that map.

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use super::IntegrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Boolean,
    StringList,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Case {
    Keep,
    Lower,
    Upper,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub description: &'static str,
    pub case: Case,
}

impl FieldSpec {
    pub fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            case: Case::Keep,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, FieldKind::String)
    }

    pub fn integer(name: &'static str) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn string_list(name: &'static str) -> Self {
        Self::new(name, FieldKind::StringList)
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub fn lowercase(mut self) -> Self {
        self.case = Case::Lower;
        self
    }

    pub fn uppercase(mut self) -> Self {
        self.case = Case::Upper;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    fields: Vec<FieldSpec>,
    open: bool,
}

/// `page_size`, `pageSize` and `PAGE-SIZE` all normalize to `pagesize`.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

impl ConfigSchema {
    /// A schema that rejects unknown keys.
    pub fn closed() -> Self {
        Self::default()
    }

    /// A schema that passes unknown keys through untouched.
    pub fn open() -> Self {
        Self {
            fields: Vec::new(),
            open: true,
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    fn lookup(&self, key: &str) -> Option<&FieldSpec> {
        let wanted = normalize_key(key);
        self.fields.iter().find(|f| normalize_key(f.name) == wanted)
    }

    pub fn decode(&self, raw: &Map<String, Value>) -> Result<Map<String, Value>, IntegrationError> {
        let mut out = Map::new();
        for (key, value) in raw {
            match self.lookup(key) {
                Some(field) => {
                    if let Some(v) = coerce(field, value)? {
                        out.insert(field.name.to_string(), v);
                    }
                }
                None if self.open => {
                    out.insert(key.clone(), value.clone());
                }
                None => {
                    return Err(IntegrationError::ConfigDecode(format!("unknown field {}", key)));
                }
            }
        }
        Ok(out)
    }

    /// Decodes `raw` and deserializes the result into `T`.
    pub fn decode_into<T: DeserializeOwned>(&self, raw: &Map<String, Value>) -> Result<T, IntegrationError> {
        let decoded = self.decode(raw)?;
        typed(&decoded)
    }

    /// JSON-Schema rendering, for listing endpoints.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for field in &self.fields {
            let ty = match field.kind {
                FieldKind::String => json!({ "type": "string" }),
                FieldKind::Integer => json!({ "type": "integer" }),
                FieldKind::Boolean => json!({ "type": "boolean" }),
                FieldKind::StringList => json!({ "type": "array", "items": { "type": "string" } }),
                FieldKind::Any => json!({}),
            };
            let mut prop = ty.as_object().cloned().unwrap_or_default();
            if !field.description.is_empty() {
                prop.insert("description".into(), Value::String(field.description.into()));
            }
            properties.insert(field.name.to_string(), Value::Object(prop));
        }
        json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": self.open,
        })
    }
}

/// Deserializes an already-decoded config map.
pub fn typed<T: DeserializeOwned>(config: &Map<String, Value>) -> Result<T, IntegrationError> {
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| IntegrationError::ConfigDecode(e.to_string()))
}

fn coerce(field: &FieldSpec, value: &Value) -> Result<Option<Value>, IntegrationError> {
    let invalid = |expected: &str| {
        IntegrationError::ConfigDecode(format!("field {} expects {}", field.name, expected))
    };

    if value.is_null() {
        return Ok(None);
    }

    let out = match field.kind {
        FieldKind::Any => value.clone(),
        FieldKind::String => {
            let s = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return Err(invalid("a string")),
            };
            Value::String(apply_case(field.case, s))
        }
        FieldKind::Integer => match value {
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Value::from(i),
                (None, Some(f)) if f.fract() == 0.0 => Value::from(f as i64),
                _ => return Err(invalid("an integer")),
            },
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| invalid("an integer"))?,
            _ => return Err(invalid("an integer")),
        },
        FieldKind::Boolean => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Value::Bool(true),
                "false" | "0" | "no" | "" => Value::Bool(false),
                _ => return Err(invalid("a boolean")),
            },
            _ => return Err(invalid("a boolean")),
        },
        FieldKind::StringList => {
            let items: Vec<String> = match value {
                Value::String(s) => s.split(',').map(|p| p.trim().to_string()).collect(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s.trim().to_string()),
                        _ => Err(invalid("a list of strings")),
                    })
                    .collect::<Result<_, _>>()?,
                _ => return Err(invalid("a list of strings")),
            };
            Value::Array(
                items
                    .into_iter()
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(apply_case(field.case, s)))
                    .collect(),
            )
        }
    };
    Ok(Some(out))
}

fn apply_case(case: Case, s: String) -> String {
    match case {
        Case::Keep => s,
        Case::Lower => s.to_lowercase(),
        Case::Upper => s.to_uppercase(),
    }
}
