//! JSON store. Key order is kept as written.

use serde_json::{Map, Number, Value as JsonValue};

use super::Store;
use crate::error::{Result, SealError};
use crate::keysource::KeyServices;
use crate::metadata::{Metadata, METADATA_KEY};
use crate::tree::{Scalar, TreeBranch, TreeItem, TreeKey, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStore;

fn parse_object(bytes: &[u8]) -> Result<Map<String, JsonValue>> {
    match serde_json::from_slice::<JsonValue>(bytes) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(_) => Err(SealError::Parse("top-level JSON value must be an object".into())),
        Err(e) => Err(SealError::Parse(format!("invalid JSON: {e}"))),
    }
}

fn value_from_json(value: JsonValue) -> Result<Value> {
    Ok(match value {
        JsonValue::Null => Value::Scalar(Scalar::Null),
        JsonValue::Bool(b) => Value::Scalar(Scalar::Bool(b)),
        JsonValue::Number(n) => Value::Scalar(scalar_from_number(&n)?),
        JsonValue::String(s) => Value::Scalar(Scalar::String(s)),
        JsonValue::Array(items) => Value::List(
            items
                .into_iter()
                .map(value_from_json)
                .collect::<Result<_>>()?,
        ),
        JsonValue::Object(map) => Value::Branch(branch_from_json(map)?),
    })
}

fn scalar_from_number(n: &Number) -> Result<Scalar> {
    if let Some(i) = n.as_i64() {
        return Ok(Scalar::Int(i));
    }
    if n.is_u64() {
        return Err(SealError::UnsupportedValue(format!(
            "integer {n} does not fit in 64 signed bits"
        )));
    }
    n.as_f64()
        .map(Scalar::Float)
        .ok_or_else(|| SealError::UnsupportedValue(format!("unsupported number {n}")))
}

fn branch_from_json(map: Map<String, JsonValue>) -> Result<TreeBranch> {
    map.into_iter()
        .map(|(key, value)| Ok(TreeItem::new(key, value_from_json(value)?)))
        .collect::<Result<Vec<_>>>()
        .map(TreeBranch)
}

fn scalar_to_json(scalar: &Scalar) -> Result<JsonValue> {
    Ok(match scalar {
        Scalar::String(s) => JsonValue::String(s.clone()),
        Scalar::Int(i) => JsonValue::Number((*i).into()),
        Scalar::Float(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .ok_or_else(|| SealError::UnsupportedValue(format!("{f} is not representable in JSON")))?,
        Scalar::Bool(b) => JsonValue::Bool(*b),
        Scalar::Null => JsonValue::Null,
    })
}

/// `None` for comments, which JSON cannot hold.
fn value_to_json(value: &Value) -> Result<Option<JsonValue>> {
    Ok(match value {
        Value::Scalar(s) => Some(scalar_to_json(s)?),
        Value::Branch(b) => Some(JsonValue::Object(branch_to_json(b)?)),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = value_to_json(item)? {
                    out.push(v);
                }
            }
            Some(JsonValue::Array(out))
        }
        Value::Comment(_) => None,
    })
}

fn branch_to_json(branch: &TreeBranch) -> Result<Map<String, JsonValue>> {
    let mut out = Map::new();
    for item in branch.items() {
        let TreeKey::Str(key) = &item.key else {
            continue;
        };
        if let Some(value) = value_to_json(&item.value)? {
            out.insert(key.clone(), value);
        }
    }
    Ok(out)
}

fn render(map: Map<String, JsonValue>) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec_pretty(&JsonValue::Object(map))
        .map_err(|e| SealError::Parse(format!("could not serialize JSON: {e}")))?;
    out.push(b'\n');
    Ok(out)
}

impl Store for JsonStore {
    fn unmarshal(&self, bytes: &[u8]) -> Result<TreeBranch> {
        let filtered: Map<String, JsonValue> = parse_object(bytes)?
            .into_iter()
            .filter(|(key, _)| key != METADATA_KEY)
            .collect();
        branch_from_json(filtered)
    }

    fn unmarshal_metadata(&self, bytes: &[u8], services: &KeyServices) -> Result<Metadata> {
        let mut map = parse_object(bytes)?;
        match map.remove(METADATA_KEY) {
            Some(JsonValue::Object(metadata)) => Metadata::from_map(&metadata, services),
            Some(_) => Err(SealError::InvalidMetadata("metadata must be an object".into())),
            None => Err(SealError::MetadataNotFound),
        }
    }

    fn marshal(&self, branch: &TreeBranch) -> Result<Vec<u8>> {
        render(branch_to_json(branch)?)
    }

    fn marshal_with_metadata(&self, branch: &TreeBranch, metadata: &Metadata) -> Result<Vec<u8>> {
        let mut map = branch_to_json(branch)?;
        if map.contains_key(METADATA_KEY) {
            return Err(SealError::Parse(format!(
                "document already has a top-level '{METADATA_KEY}' key"
            )));
        }
        map.insert(METADATA_KEY.to_string(), JsonValue::Object(metadata.to_map()));
        render(map)
    }

    fn marshal_value(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Scalar(Scalar::String(s)) => Ok(s.clone().into_bytes()),
            Value::Comment(c) => Ok(c.clone().into_bytes()),
            other => {
                let json = value_to_json(other)?.unwrap_or(JsonValue::Null);
                serde_json::to_vec_pretty(&json)
                    .map_err(|e| SealError::Parse(format!("could not serialize JSON: {e}")))
            }
        }
    }
}
