//! Typed user fields carried by history records.
//!
//! A run declares its field set up front: the generator's output schema and
//! the simulator's output schema. Every history row holds one value per
//! declared field, initialised to the type's zero value until written.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::SchedulerError;

/// Declared type of a user field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// 64-bit float.
    Float,
    /// 64-bit signed integer.
    Int,
    /// Boolean flag.
    Bool,
    /// UTF-8 string.
    Str,
    /// Fixed-length float vector.
    FloatVec(usize),
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Float value.
    Float(f64),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// String value.
    Str(String),
    /// Float vector value.
    FloatVec(Vec<f64>),
}

impl FieldType {
    /// Zero value used before a field is written.
    #[must_use]
    pub fn zero(&self) -> FieldValue {
        match self {
            Self::Float => FieldValue::Float(0.0),
            Self::Int => FieldValue::Int(0),
            Self::Bool => FieldValue::Bool(false),
            Self::Str => FieldValue::Str(String::new()),
            Self::FloatVec(len) => FieldValue::FloatVec(vec![0.0; *len]),
        }
    }

    /// Whether `value` is an instance of this type.
    #[must_use]
    pub fn admits(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (Self::Float, FieldValue::Float(_))
            | (Self::Int, FieldValue::Int(_))
            | (Self::Bool, FieldValue::Bool(_))
            | (Self::Str, FieldValue::Str(_)) => true,
            (Self::FloatVec(len), FieldValue::FloatVec(v)) => v.len() == *len,
            _ => false,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => write!(f, "float"),
            Self::Int => write!(f, "int"),
            Self::Bool => write!(f, "bool"),
            Self::Str => write!(f, "str"),
            Self::FloatVec(len) => write!(f, "float[{len}]"),
        }
    }
}

impl FieldValue {
    /// Float payload, if this is a float.
    #[must_use]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer payload, if this is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Vector payload, if this is a float vector.
    #[must_use]
    pub fn as_slice(&self) -> Option<&[f64]> {
        match self {
            Self::FloatVec(v) => Some(v),
            _ => None,
        }
    }
}

/// A row of named values as exchanged with callables.
pub type Row = BTreeMap<String, FieldValue>;

/// Ordered list of named, typed fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<(String, FieldType)>,
}

impl Schema {
    /// Empty schema.
    #[must_use]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Add a field (builder style).
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push((name.into(), ty));
        self
    }

    /// Declared fields in order.
    #[must_use]
    pub fn fields(&self) -> &[(String, FieldType)] {
        &self.fields
    }

    /// Type of `name`, if declared.
    #[must_use]
    pub fn type_of(&self, name: &str) -> Option<&FieldType> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Whether the schema has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Merge two schemas into one column set. A name declared twice must
    /// carry the same type.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SchemaMismatch`] on conflicting declarations.
    pub fn union(&self, other: &Self) -> Result<Self, SchedulerError> {
        let mut merged = self.clone();
        for (name, ty) in &other.fields {
            match merged.type_of(name) {
                Some(existing) if existing != ty => {
                    return Err(SchedulerError::SchemaMismatch {
                        context: "run schema".into(),
                        detail: format!("field `{name}` declared as both {existing} and {ty}"),
                    });
                }
                Some(_) => {}
                None => merged.fields.push((name.clone(), ty.clone())),
            }
        }
        Ok(merged)
    }

    /// Check that `row` carries exactly the declared fields with matching types.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::SchemaMismatch`] naming the first offending field.
    pub fn check_row(&self, row: &Row, context: &str) -> Result<(), SchedulerError> {
        for (name, ty) in &self.fields {
            match row.get(name) {
                None => {
                    return Err(mismatch(context, format!("missing field `{name}`")));
                }
                Some(value) if !ty.admits(value) => {
                    return Err(mismatch(
                        context,
                        format!("field `{name}` expected {ty}, got {value:?}"),
                    ));
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = row.keys().find(|k| self.type_of(k).is_none()) {
            return Err(mismatch(context, format!("undeclared field `{extra}`")));
        }
        Ok(())
    }
}

fn mismatch(context: &str, detail: String) -> SchedulerError {
    SchedulerError::SchemaMismatch {
        context: context.to_string(),
        detail,
    }
}
