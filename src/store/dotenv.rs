//! dotenv store.
//!
//! One `KEY=value` per line, `#` starts a comment line. Newlines inside
//! values are written as the two characters `\n`. Metadata is flattened into
//! `sops_`-prefixed keys, nested maps joined with `__map_` and list indices
//! with `__list_`.

use std::collections::BTreeMap;

use serde_json::{Map, Value as JsonValue};

use super::Store;
use crate::error::{Result, SealError};
use crate::keysource::KeyServices;
use crate::metadata::{Metadata, METADATA_KEY};
use crate::tree::{Scalar, TreeBranch, TreeItem, TreeKey, Value};

const MAP_SEPARATOR: &str = "__map_";
const LIST_SEPARATOR: &str = "__list_";

fn metadata_prefix() -> String {
    format!("{METADATA_KEY}_")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DotenvStore;

fn parse_lines(bytes: &[u8]) -> Result<TreeBranch> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| SealError::Parse(format!("dotenv input is not UTF-8: {e}")))?;
    let mut branch = TreeBranch::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            branch.push(TreeItem::comment(comment));
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| SealError::Parse(format!("invalid dotenv input line: {line}")))?;
        branch.push(TreeItem::new(key, Value::string(value.replace("\\n", "\n"))));
    }
    Ok(branch)
}

fn render_line(item: &TreeItem) -> Result<String> {
    match (&item.key, &item.value) {
        (TreeKey::Comment(text), _) => Ok(format!("#{text}\n")),
        (TreeKey::Str(key), Value::Scalar(scalar)) => {
            let raw = scalar
                .to_bytes()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            Ok(format!("{key}={}\n", raw.replace('\n', "\\n")))
        }
        (TreeKey::Str(key), _) => Err(SealError::UnsupportedValue(format!(
            "cannot use complex value in dotenv file: {key}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Metadata flattening
// ---------------------------------------------------------------------------

fn flatten_into(prefix: &str, value: &JsonValue, out: &mut BTreeMap<String, String>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                flatten_into(&format!("{prefix}{MAP_SEPARATOR}{key}"), child, out);
            }
        }
        JsonValue::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}{LIST_SEPARATOR}{index}"), child, out);
            }
        }
        JsonValue::Null => {}
        JsonValue::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        other => {
            out.insert(prefix.to_string(), other.to_string());
        }
    }
}

/// Flatten a metadata map into sorted `key -> string` pairs.
pub fn flatten(map: &Map<String, JsonValue>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (key, value) in map {
        flatten_into(key, value, &mut out);
    }
    out
}

#[derive(Debug)]
enum Segment {
    Key(String),
    Index(usize),
}

fn split_flat_key(flat: &str) -> Result<Vec<Segment>> {
    let next_separator = |s: &str| {
        [s.find(MAP_SEPARATOR), s.find(LIST_SEPARATOR)]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(s.len())
    };

    let end = next_separator(flat);
    let mut segments = vec![Segment::Key(flat[..end].to_string())];
    let mut rest = &flat[end..];
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix(MAP_SEPARATOR) {
            let end = next_separator(after);
            segments.push(Segment::Key(after[..end].to_string()));
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix(LIST_SEPARATOR) {
            let end = next_separator(after);
            let index = after[..end]
                .parse::<usize>()
                .map_err(|_| SealError::InvalidMetadata(format!("invalid list index in '{flat}'")))?;
            segments.push(Segment::Index(index));
            rest = &after[end..];
        } else {
            return Err(SealError::InvalidMetadata(format!("invalid flattened key '{flat}'")));
        }
    }
    Ok(segments)
}

/// Intermediate tree; list slots are keyed by index so input order is irrelevant.
enum Node {
    Leaf(String),
    Map(Vec<(String, Node)>),
    List(BTreeMap<usize, Node>),
}

impl Node {
    fn insert(&mut self, path: &[Segment], value: String, flat: &str) -> Result<()> {
        let Some((first, rest)) = path.split_first() else {
            *self = Node::Leaf(value);
            return Ok(());
        };
        let fresh = || match rest.first() {
            Some(Segment::Index(_)) => Node::List(BTreeMap::new()),
            _ => Node::Map(Vec::new()),
        };
        match (self, first) {
            (Node::Map(entries), Segment::Key(key)) => {
                let position = match entries.iter().position(|(k, _)| k == key) {
                    Some(position) => position,
                    None => {
                        entries.push((key.clone(), fresh()));
                        entries.len() - 1
                    }
                };
                entries[position].1.insert(rest, value, flat)
            }
            (Node::List(items), Segment::Index(index)) => {
                items.entry(*index).or_insert_with(fresh).insert(rest, value, flat)
            }
            _ => Err(SealError::InvalidMetadata(format!(
                "conflicting flattened key '{flat}'"
            ))),
        }
    }

    fn into_json(self) -> JsonValue {
        match self {
            Node::Leaf(s) => JsonValue::String(s),
            Node::Map(entries) => JsonValue::Object(
                entries.into_iter().map(|(k, v)| (k, v.into_json())).collect(),
            ),
            Node::List(items) => JsonValue::Array(items.into_values().map(Node::into_json).collect()),
        }
    }
}

/// Rebuild a metadata map from flattened pairs.
pub fn unflatten<'a>(pairs: impl IntoIterator<Item = (&'a str, String)>) -> Result<Map<String, JsonValue>> {
    let mut root = Node::Map(Vec::new());
    for (flat, value) in pairs {
        let segments = split_flat_key(flat)?;
        root.insert(&segments, value, flat)?;
    }
    match root.into_json() {
        JsonValue::Object(map) => Ok(map),
        _ => Err(SealError::InvalidMetadata("flattened metadata has no root map".into())),
    }
}

impl Store for DotenvStore {
    fn unmarshal(&self, bytes: &[u8]) -> Result<TreeBranch> {
        let prefix = metadata_prefix();
        let items = parse_lines(bytes)?
            .0
            .into_iter()
            .filter(|item| !matches!(&item.key, TreeKey::Str(k) if k.starts_with(&prefix)))
            .collect();
        Ok(TreeBranch(items))
    }

    fn unmarshal_metadata(&self, bytes: &[u8], services: &KeyServices) -> Result<Metadata> {
        let prefix = metadata_prefix();
        let branch = parse_lines(bytes)?;
        let pairs: Vec<(&str, String)> = branch
            .items()
            .iter()
            .filter_map(|item| {
                let key = item.key.as_str()?.strip_prefix(&prefix)?;
                let value = item.value.as_scalar()?.as_str()?.to_string();
                Some((key, value))
            })
            .collect();
        if pairs.is_empty() {
            return Err(SealError::MetadataNotFound);
        }
        Metadata::from_map(&unflatten(pairs)?, services)
    }

    fn marshal(&self, branch: &TreeBranch) -> Result<Vec<u8>> {
        let mut out = String::new();
        for item in branch.items() {
            out.push_str(&render_line(item)?);
        }
        Ok(out.into_bytes())
    }

    fn marshal_with_metadata(&self, branch: &TreeBranch, metadata: &Metadata) -> Result<Vec<u8>> {
        let prefix = metadata_prefix();
        let mut out = self.marshal(branch)?;
        for (key, value) in flatten(&metadata.to_map()) {
            let item = TreeItem::new(format!("{prefix}{key}"), Value::string(value));
            out.extend_from_slice(render_line(&item)?.as_bytes());
        }
        Ok(out)
    }

    fn marshal_value(&self, value: &Value) -> Result<Vec<u8>> {
        match value {
            Value::Scalar(Scalar::String(s)) => Ok(s.clone().into_bytes()),
            _ => Err(SealError::UnsupportedValue(
                "the dotenv store only supports emitting strings".into(),
            )),
        }
    }
}
