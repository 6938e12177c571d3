//! Schema Validator
//!
//! Checks request bodies against declared field sets before anything is
//! deserialized. Reports the first problem found:
//! unknown field, then missing or ill-typed fields in declaration order.

use crate::error::{Error, Result};
use serde_json::{Map, Value};

// =============================================================================
// Shape Declarations
// =============================================================================

/// Accepted JSON type of a field
#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    String,
    /// String with at least one character
    NonEmptyString,
    /// One of a fixed set of strings
    Enum(&'static [&'static str]),
    Integer,
    Boolean,
    StringList,
    /// Kubernetes quantity: a string, or an integer admission rejects later
    Quantity,
    Object(&'static Shape),
    ObjectList(&'static Shape),
    /// Any JSON object, contents unchecked
    FreeForm,
    /// Anything, including null
    Any,
}

/// A declared field
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

impl Field {
    pub const fn required(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            required: false,
        }
    }
}

/// Declared field set of an object
#[derive(Debug)]
pub struct Shape {
    pub fields: &'static [Field],
}

impl Shape {
    fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Create requires the mandatory set; patch requires a non-empty subset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    Patch,
}

// =============================================================================
// Validation
// =============================================================================

/// Validate `body` against `shape`
pub fn validate(body: &Value, shape: &Shape, mode: Mode) -> Result<()> {
    let object = body
        .as_object()
        .ok_or_else(|| Error::Schema("value must be an object".into()))?;

    validate_object(object, shape, "", mode == Mode::Create)?;

    if mode == Mode::Patch
        && !object
            .iter()
            .any(|(k, v)| !v.is_null() && shape.field(k).is_some())
    {
        return Err(Error::Schema("at least one field must be provided".into()));
    }
    Ok(())
}

fn validate_object(
    object: &Map<String, Value>,
    shape: &Shape,
    path: &str,
    enforce_required: bool,
) -> Result<()> {
    if let Some(unknown) = object.keys().find(|k| shape.field(k).is_none()) {
        return Err(at(path, format!("property \"{}\" is unsupported", unknown)));
    }

    for field in shape.fields {
        match object.get(field.name) {
            None | Some(Value::Null) => {
                if enforce_required && field.required {
                    return Err(at(path, format!("property \"{}\" is missing", field.name)));
                }
            }
            Some(value) => {
                let child = format!("{}/{}", path, field.name);
                validate_value(value, field.ty, &child)?;
            }
        }
    }
    Ok(())
}

fn validate_value(value: &Value, ty: FieldType, path: &str) -> Result<()> {
    match ty {
        FieldType::Any => Ok(()),
        FieldType::String => expect(value.is_string(), path, "value must be a string"),
        FieldType::NonEmptyString => match value.as_str() {
            Some("") => Err(at_pointer(path, "minimum string length is 1")),
            Some(_) => Ok(()),
            None => Err(at_pointer(path, "value must be a string")),
        },
        FieldType::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => Ok(()),
            Some(_) => Err(at_pointer(
                path,
                &format!("value is not one of the allowed values {:?}", allowed),
            )),
            None => Err(at_pointer(path, "value must be a string")),
        },
        FieldType::Integer => expect(
            value.is_i64() || value.is_u64(),
            path,
            "value must be an integer",
        ),
        FieldType::Boolean => expect(value.is_boolean(), path, "value must be a boolean"),
        FieldType::StringList => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_value(item, FieldType::String, &format!("{}/{}", path, i))?;
                }
                Ok(())
            }
            None => Err(at_pointer(path, "value must be an array")),
        },
        FieldType::Quantity => expect(
            value.is_string() || value.is_i64() || value.is_u64(),
            path,
            "value must be a string or an integer",
        ),
        FieldType::Object(shape) => match value.as_object() {
            Some(object) => validate_object(object, shape, path, true),
            None => Err(at_pointer(path, "value must be an object")),
        },
        FieldType::ObjectList(shape) => match value.as_array() {
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    validate_value(item, FieldType::Object(shape), &format!("{}/{}", path, i))?;
                }
                Ok(())
            }
            None => Err(at_pointer(path, "value must be an array")),
        },
        FieldType::FreeForm => expect(value.is_object(), path, "value must be an object"),
    }
}

fn expect(ok: bool, path: &str, reason: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(at_pointer(path, reason))
    }
}

fn at_pointer(path: &str, reason: &str) -> Error {
    Error::Schema(format!("Error at \"{}\": {}", path, reason))
}

/// Top-level problems read without a pointer prefix
fn at(path: &str, reason: String) -> Error {
    if path.is_empty() {
        Error::Schema(reason)
    } else {
        at_pointer(path, &reason)
    }
}

// =============================================================================
// Kubernetes-shaped Bodies
// =============================================================================

/// Check metadata and spec presence with kind-specific messages, returning the name
pub fn check_envelope<'a>(kind: &str, body: &'a Value) -> Result<&'a str> {
    let metadata = match body.get("metadata") {
        Some(Value::Object(m)) if !m.is_empty() => m,
        _ => {
            return Err(Error::Validation(format!(
                "{}'s Metadata should not be empty",
                kind
            )))
        }
    };

    let name = match metadata.get("name") {
        None | Some(Value::Null) => {
            return Err(Error::Validation(format!(
                "{}'s metadata.name should not be empty",
                kind
            )))
        }
        Some(Value::String(s)) if s.is_empty() => {
            return Err(Error::Validation(format!(
                "{}'s metadata.name should not be empty",
                kind
            )))
        }
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            return Err(Error::Validation(format!(
                "{}'s metadata.name should be a string",
                kind
            )))
        }
    };

    match body.get("spec") {
        Some(Value::Object(spec)) if !spec.is_empty() => Ok(name),
        _ => Err(Error::Validation("'Spec' field should not be empty".into())),
    }
}
