//! Text codec between native field values and the store's hash encoding.
//!
//! Every hash written by the project store is described by a static
//! [`Schema`]. Writing and reading go through the same table, so a field is
//! always decoded with the type it was encoded with.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Date,
    Json,
    Integer,
    Float,
    Boolean,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Date(DateTime<Utc>),
    Json(Value),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            Self::String(_) => FieldType::String,
            Self::Date(_) => FieldType::Date,
            Self::Json(_) => FieldType::Json,
            Self::Integer(_) => FieldType::Integer,
            Self::Float(_) => FieldType::Float,
            Self::Boolean(_) => FieldType::Boolean,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub fn encode(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Date(d) => d.to_rfc3339_opts(SecondsFormat::Millis, true),
            Self::Json(v) => v.to_string(),
            Self::Integer(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Boolean(b) => b.to_string(),
        }
    }

    pub fn decode(raw: &str, field_type: FieldType) -> Result<Self> {
        let invalid = |kind: &str| Error::Serialization(format!("invalid {kind} value: {raw}"));
        Ok(match field_type {
            FieldType::String => Self::String(raw.to_string()),
            FieldType::Date => Self::Date(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|_| invalid("date"))?
                    .with_timezone(&Utc),
            ),
            FieldType::Json => Self::Json(serde_json::from_str(raw)?),
            FieldType::Integer => Self::Integer(raw.parse().map_err(|_| invalid("integer"))?),
            FieldType::Float => Self::Float(raw.parse().map_err(|_| invalid("float"))?),
            FieldType::Boolean => Self::Boolean(raw.parse().map_err(|_| invalid("boolean"))?),
        })
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(d: DateTime<Utc>) -> Self {
        Self::Date(d)
    }
}

/// Declared field names and types of one hash.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub name: &'static str,
    fields: &'static [(&'static str, FieldType)],
}

pub const META_SCHEMA: Schema = Schema {
    name: "meta",
    fields: &[
        ("id", FieldType::String),
        ("status", FieldType::String),
        ("createdAt", FieldType::Date),
        ("updatedAt", FieldType::Date),
        ("userParams", FieldType::Json),
        ("pipeline", FieldType::Json),
        ("inputFile", FieldType::Json),
        ("outputFile", FieldType::Json),
    ],
};

pub const PROCESSING_SCHEMA: Schema = Schema {
    name: "processing",
    fields: &[
        ("step", FieldType::String),
        ("validationProgress", FieldType::Json),
        ("geocodingProgress", FieldType::Json),
        ("validationError", FieldType::String),
        ("geocodingError", FieldType::String),
        ("globalError", FieldType::String),
        ("startedAt", FieldType::Date),
        ("finishedAt", FieldType::Date),
        ("heartbeat", FieldType::Date),
    ],
};

impl Schema {
    pub fn field_type(&self, field: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, ty)| *ty)
    }

    /// Encodes values for an `hset`, refusing undeclared or mistyped fields.
    pub fn prepare(&self, values: &[(&str, FieldValue)]) -> Result<Vec<(String, String)>> {
        values
            .iter()
            .map(|(field, value)| {
                let expected = self.field_type(field).ok_or_else(|| {
                    Error::Serialization(format!("field {field} is not part of the {} schema", self.name))
                })?;
                if value.field_type() != expected {
                    return Err(Error::Serialization(format!(
                        "field {field} expects {expected:?}, got {:?}",
                        value.field_type()
                    )));
                }
                Ok((field.to_string(), value.encode()))
            })
            .collect()
    }

    /// Decodes a raw hash. Undeclared fields are ignored.
    pub fn hydrate(&self, raw: HashMap<String, String>) -> Result<Record> {
        let mut values = HashMap::with_capacity(raw.len());
        for (field, text) in raw {
            if let Some(ty) = self.field_type(&field) {
                values.insert(field, FieldValue::decode(&text, ty)?);
            }
        }
        Ok(Record { values })
    }
}

/// A hydrated hash with typed accessors.
#[derive(Debug, Default)]
pub struct Record {
    values: HashMap<String, FieldValue>,
}

impl Record {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn string(&self, field: &str) -> Option<String> {
        match self.values.get(field) {
            Some(FieldValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn date(&self, field: &str) -> Option<DateTime<Utc>> {
        match self.values.get(field) {
            Some(FieldValue::Date(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn json<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>> {
        match self.values.get(field) {
            Some(FieldValue::Json(v)) => Ok(Some(serde_json::from_value(v.clone())?)),
            _ => Ok(None),
        }
    }
}
