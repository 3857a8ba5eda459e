//! Slice types: declarative families of telemetry records.
//!
//! A slice pairs a [`GroupingDescriptor`] (where the instances come from and
//! which of them to keep) with a [`RecordSchema`] (how each instance becomes a
//! record). The schema's field table is resolved once when the slice is
//! registered and reused for every population.

mod populate;

pub use populate::{convert, populate, record_label, Record};

use crate::selector::Selector;
use crate::telemetry::SourceKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A scalar taken from the first instance of an object class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subquery {
    pub class: String,
    pub property: String,
}

/// Where a slice's instances come from and which of them it keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupingDescriptor {
    pub source: SourceKind,
    pub category: String,
    pub selector: Selector,
    pub subquery: Option<Subquery>,
}

/// Declared type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int,
    Float,
    Text,
    Bool,
}

impl FieldType {
    pub fn default_value(self) -> Value {
        match self {
            Self::Int => Value::from(0i64),
            Self::Float => Value::from(0.0),
            Self::Text => Value::from(""),
            Self::Bool => Value::from(false),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Bool => "bool",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Float)
    }
}

/// How a field gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRole {
    /// Read from the instance's raw values
    #[default]
    Sampled,
    /// Receives the instance name
    InstanceName,
    /// Never populated; keeps its default
    Excluded,
}

/// One declared field of a record schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Raw value name to read instead of `name`
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub divisor: Option<u64>,
    #[serde(default)]
    pub role: FieldRole,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            source: None,
            divisor: None,
            role: FieldRole::Sampled,
        }
    }

    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn divided_by(mut self, divisor: u64) -> Self {
        self.divisor = Some(divisor);
        self
    }

    pub fn role(mut self, role: FieldRole) -> Self {
        self.role = role;
        self
    }
}

/// Resolved binding for one populate-eligible field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Binding {
    pub field: usize,
    pub source: String,
}

/// Ordered fields plus the binding table derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    fields: Vec<FieldSpec>,
    bindings: Vec<Binding>,
    label_field: Option<usize>,
}

impl RecordSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        let bindings = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.role != FieldRole::Excluded)
            .map(|(i, f)| Binding {
                field: i,
                source: f.source.clone().unwrap_or_else(|| f.name.clone()),
            })
            .collect();
        let label_field = fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case("name"));

        Self {
            fields,
            bindings,
            label_field,
        }
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub(crate) fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Field whose value names a record in its label, if the schema has one.
    pub fn label_field(&self) -> Option<&FieldSpec> {
        self.label_field.map(|i| &self.fields[i])
    }

    /// A record with every field at its type's default.
    pub fn default_record(&self) -> Record {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.ty.default_value()))
            .collect()
    }
}

/// A registered slice type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceType {
    pub name: String,
    pub descriptor: GroupingDescriptor,
    pub schema: RecordSchema,
}
