use super::{FieldRole, FieldSpec, FieldType, RecordSchema, SliceType, Subquery};
use crate::error::ConversionError;
use crate::selector::restrict_to;
use crate::telemetry::{Instance, TelemetrySource};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::warn;

/// One populated record, fields in schema order.
pub type Record = Map<String, Value>;

/// Samples `source`, applies the slice's selector and optional subquery, and
/// builds one record per surviving instance.
///
/// Only enumeration and subquery failures are returned as errors. A field
/// that cannot be fetched or converted is logged and keeps its default.
pub fn populate<R>(slice: &SliceType, source: &mut dyn TelemetrySource, resolve: R) -> Result<Vec<Record>>
where
    R: FnOnce(&Subquery) -> Result<String>,
{
    let instances = source
        .sample()
        .with_context(|| format!("Failed to enumerate '{}'", source.category()))?;
    let mut selected = slice
        .descriptor
        .selector
        .apply(instances, |i| i.name.as_str());

    if let Some(subquery) = &slice.descriptor.subquery {
        let scalar = resolve(subquery).with_context(|| {
            format!("Subquery {}.{} failed", subquery.class, subquery.property)
        })?;
        selected = restrict_to(selected, &scalar, |i| i.name.as_str());
    }

    Ok(selected
        .iter()
        .map(|instance| build_record(slice, instance))
        .collect())
}

fn build_record(slice: &SliceType, instance: &Instance) -> Record {
    let schema = &slice.schema;
    let mut record = schema.default_record();

    for binding in schema.bindings() {
        let spec = &schema.fields()[binding.field];
        let value = match spec.role {
            FieldRole::InstanceName => convert(&spec.name, &Value::from(instance.name.as_str()), spec.ty),
            FieldRole::Sampled | FieldRole::Excluded => match instance.get(&binding.source) {
                Some(raw) => convert(&spec.name, raw, spec.ty).map(|v| apply_divisor(v, spec)),
                None => Err(ConversionError::Missing {
                    field: spec.name.clone(),
                    source_field: binding.source.clone(),
                    instance: instance.name.clone(),
                }),
            },
        };

        match value {
            Ok(value) => {
                record.insert(spec.name.clone(), value);
            }
            Err(e) => warn!(
                slice = %slice.name,
                instance = %instance.name,
                error = %e,
                "Field left at default"
            ),
        }
    }

    record
}

/// Converts a raw telemetry value to `ty`.
pub fn convert(field: &str, raw: &Value, ty: FieldType) -> Result<Value, ConversionError> {
    let incompatible = || ConversionError::Incompatible {
        field: field.to_string(),
        raw: raw.to_string(),
        target: ty.name(),
    };

    match ty {
        FieldType::Int => to_int(raw).map(Value::from).ok_or_else(incompatible),
        FieldType::Float => to_float(raw).map(Value::from).ok_or_else(incompatible),
        FieldType::Text => match raw {
            Value::String(s) => Ok(Value::from(s.as_str())),
            Value::Number(n) => Ok(Value::from(n.to_string())),
            Value::Bool(b) => Ok(Value::from(b.to_string())),
            _ => Err(incompatible()),
        },
        FieldType::Bool => to_bool(raw).map(Value::from).ok_or_else(incompatible),
    }
}

fn float_to_int(f: f64) -> Option<i64> {
    let rounded = f.round();
    (rounded.is_finite() && rounded >= i64::MIN as f64 && rounded <= i64::MAX as f64)
        .then_some(rounded as i64)
}

fn to_int(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64().or_else(|| {
            // u64 beyond i64::MAX is not representable
            if n.is_u64() {
                None
            } else {
                n.as_f64().and_then(float_to_int)
            }
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(float_to_int))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn to_float(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn to_bool(raw: &Value) -> Option<bool> {
    match raw {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "up" => Some(true),
            "false" | "0" | "no" | "down" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Integer fields use integer division, float fields float division.
/// A zero divisor, or one on a non-numeric field, is ignored.
fn apply_divisor(value: Value, spec: &FieldSpec) -> Value {
    let Some(divisor) = spec.divisor.filter(|d| *d > 0) else {
        return value;
    };
    match (spec.ty, &value) {
        (FieldType::Int, Value::Number(n)) => match n.as_i64() {
            Some(i) => Value::from(i64::try_from(divisor).map(|d| i / d).unwrap_or(0)),
            None => value,
        },
        (FieldType::Float, Value::Number(n)) => match n.as_f64() {
            Some(f) => Value::from(f / divisor as f64),
            None => value,
        },
        _ => value,
    }
}

/// Payload label for a record: `Slice[<type>]-[<name or index>]`.
pub fn record_label(slice_name: &str, schema: &RecordSchema, record: &Record, index: usize) -> String {
    let name = schema
        .label_field()
        .and_then(|f| record.get(&f.name))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| index.to_string());
    format!("Slice[{slice_name}]-[{name}]")
}
