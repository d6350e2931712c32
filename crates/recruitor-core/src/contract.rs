use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON shape a contract field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl ValueKind {
    /// Whether `value` has this kind.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::String => value.is_string(),
            ValueKind::Number => value.is_number(),
            ValueKind::Integer => value.is_i64() || value.is_u64(),
            ValueKind::Boolean => value.is_boolean(),
            ValueKind::Object => value.is_object(),
            ValueKind::Array => value.is_array(),
            ValueKind::Any => true,
        }
    }

    fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::Object => "object",
            ValueKind::Array => "array",
            ValueKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// One named field of an object-shaped contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

/// Declared input or output shape of an action.
///
/// An empty contract with kind [`ValueKind::Any`] accepts every value. When
/// fields are declared, the value must be an object; required fields must be
/// present and non-null, and present fields must match their kind. Extra
/// fields are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub kind: ValueKind,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl Contract {
    /// A contract that accepts anything.
    pub fn any() -> Self {
        Self {
            kind: ValueKind::Any,
            fields: Vec::new(),
        }
    }

    /// A contract that only checks the top-level kind.
    pub fn of(kind: ValueKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
        }
    }

    /// An object contract with no declared fields yet.
    pub fn object() -> Self {
        Self::of(ValueKind::Object)
    }

    /// Adds a required field.
    pub fn required(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.kind = ValueKind::Object;
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Adds an optional field.
    pub fn optional(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.kind = ValueKind::Object;
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Checks `value` against the contract, returning a human-readable reason on mismatch.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        if !self.kind.matches(value) {
            return Err(format!(
                "expected {}, got {}",
                self.kind,
                ValueKind::describe(value)
            ));
        }
        if self.fields.is_empty() {
            return Ok(());
        }
        let Some(obj) = value.as_object() else {
            return Err(format!("expected object, got {}", ValueKind::describe(value)));
        };
        for field in &self.fields {
            match obj.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None | Some(Value::Null) => {}
                Some(v) if !field.kind.matches(v) => {
                    return Err(format!(
                        "field '{}' expected {}, got {}",
                        field.name,
                        field.kind,
                        ValueKind::describe(v)
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl Default for Contract {
    fn default() -> Self {
        Self::any()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_any_accepts_everything() {
        let c = Contract::any();
        assert!(c.validate(&json!(null)).is_ok());
        assert!(c.validate(&json!([1, 2])).is_ok());
    }

    #[test]
    fn test_required_fields() {
        let c = Contract::object()
            .required("url", ValueKind::String)
            .optional("depth", ValueKind::Integer);

        assert!(c.validate(&json!({"url": "https://jobs.example"})).is_ok());
        assert!(c.validate(&json!({"url": "x", "depth": 2})).is_ok());

        let err = c.validate(&json!({"depth": 2})).unwrap_err();
        assert_eq!(err, "missing required field 'url'");

        let err = c.validate(&json!({"url": 5})).unwrap_err();
        assert_eq!(err, "field 'url' expected string, got number");

        let err = c.validate(&json!({"url": "x", "depth": 1.5})).unwrap_err();
        assert!(err.contains("depth"));
    }

    #[test]
    fn test_kind_mismatch() {
        let c = Contract::of(ValueKind::Array);
        let err = c.validate(&json!({"a": 1})).unwrap_err();
        assert_eq!(err, "expected array, got object");
    }

    #[test]
    fn test_null_optional_field_is_accepted() {
        let c = Contract::object().optional("note", ValueKind::String);
        assert!(c.validate(&json!({"note": null})).is_ok());
    }
}
