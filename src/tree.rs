//! Ordered document tree.
//!
//! A document is a `TreeBranch`: an ordered list of key/value items. Order is
//! significant. The MAC is computed in traversal order and stores emit items
//! in the order they were loaded, so nothing here ever sorts.

use std::fmt;

use crate::error::{Result, SealError};

/// A leaf value together with the type needed to restore it after decryption.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Scalar {
    /// Canonical byte encoding fed to the cipher and the MAC.
    ///
    /// Returns `None` for `Null`, which is never encrypted and never hashed.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Scalar::String(s) => Some(s.as_bytes().to_vec()),
            Scalar::Int(i) => Some(i.to_string().into_bytes()),
            Scalar::Float(f) => Some(format_float(*f).into_bytes()),
            Scalar::Bool(true) => Some(b"True".to_vec()),
            Scalar::Bool(false) => Some(b"False".to_vec()),
            Scalar::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::String(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::String(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Shortest decimal representation, never in exponent form.
pub(crate) fn format_float(value: f64) -> String {
    format!("{value}")
}

/// The key of a branch item.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeKey {
    Str(String),
    Comment(String),
}

impl TreeKey {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TreeKey::Str(s) => Some(s),
            TreeKey::Comment(_) => None,
        }
    }
}

impl From<&str> for TreeKey {
    fn from(value: &str) -> Self {
        TreeKey::Str(value.to_string())
    }
}

/// Any node in the tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    Branch(TreeBranch),
    List(Vec<Value>),
    Comment(String),
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Value::Scalar(Scalar::String(value.into()))
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Value::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_branch(&self) -> Option<&TreeBranch> {
        match self {
            Value::Branch(b) => Some(b),
            _ => None,
        }
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

impl From<TreeBranch> for Value {
    fn from(value: TreeBranch) -> Self {
        Value::Branch(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::string(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeItem {
    pub key: TreeKey,
    pub value: Value,
}

impl TreeItem {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: TreeKey::Str(key.into()),
            value: value.into(),
        }
    }

    pub fn comment(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            key: TreeKey::Comment(text.clone()),
            value: Value::Comment(text),
        }
    }

    pub fn is_comment(&self) -> bool {
        matches!(self.key, TreeKey::Comment(_))
    }
}

/// An ordered sequence of items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeBranch(pub Vec<TreeItem>);

impl TreeBranch {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, item: TreeItem) {
        self.0.push(item);
    }

    pub fn items(&self) -> &[TreeItem] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up the value of a non-comment key.
    pub fn get_key(&self, key: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|item| item.key.as_str() == Some(key))
            .map(|item| &item.value)
    }

    fn get_key_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0
            .iter_mut()
            .find(|item| item.key.as_str() == Some(key))
            .map(|item| &mut item.value)
    }

    /// Replace the value of `key` in place, or append a new item.
    ///
    /// Existing items keep their position.
    pub fn insert_or_replace(&mut self, key: &str, value: Value) {
        match self.get_key_mut(key) {
            Some(slot) => *slot = value,
            None => self.0.push(TreeItem::new(key, value)),
        }
    }

    /// Visit every scalar leaf depth-first in document order.
    ///
    /// The callback receives the leaf and the key path leading to it. List
    /// indices are not part of the path. Comments are skipped.
    pub fn walk_leaves<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(&mut Scalar, &[String]) -> Result<()>,
    {
        let mut path = Vec::new();
        walk_branch(self, &mut path, &mut visit)
    }

    /// Fetch the value at `path`.
    pub fn get(&self, path: &[PathSegment]) -> Result<&Value> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| SealError::Parse("empty tree path".into()))?;
        let key = first.as_key()?;
        let value = self
            .get_key(key)
            .ok_or_else(|| SealError::Parse(format!("key '{key}' not found")))?;
        get_in(value, rest)
    }

    /// Set the value at `path`, creating intermediate branches as needed.
    pub fn set(&mut self, path: &[PathSegment], value: Value) -> Result<()> {
        let (first, rest) = path
            .split_first()
            .ok_or_else(|| SealError::Parse("empty tree path".into()))?;
        let key = first.as_key()?;
        if rest.is_empty() {
            self.insert_or_replace(key, value);
            return Ok(());
        }
        if self.get_key(key).is_none() {
            self.insert_or_replace(key, empty_container(&rest[0]));
        }
        match self.get_key_mut(key) {
            Some(slot) => set_in(slot, rest, value),
            None => Err(SealError::Parse(format!("key '{key}' not found"))),
        }
    }
}

fn walk_branch<F>(branch: &mut TreeBranch, path: &mut Vec<String>, visit: &mut F) -> Result<()>
where
    F: FnMut(&mut Scalar, &[String]) -> Result<()>,
{
    for item in branch.0.iter_mut() {
        let key = match &item.key {
            TreeKey::Str(key) => key.clone(),
            TreeKey::Comment(_) => continue,
        };
        path.push(key);
        walk_value(&mut item.value, path, visit)?;
        path.pop();
    }
    Ok(())
}

fn walk_value<F>(value: &mut Value, path: &mut Vec<String>, visit: &mut F) -> Result<()>
where
    F: FnMut(&mut Scalar, &[String]) -> Result<()>,
{
    match value {
        Value::Scalar(scalar) => visit(scalar, path),
        Value::Branch(branch) => walk_branch(branch, path, visit),
        Value::List(items) => {
            for element in items.iter_mut() {
                walk_value(element, path, visit)?;
            }
            Ok(())
        }
        Value::Comment(_) => Ok(()),
    }
}

/// One step of a tree path: a branch key or a list index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl PathSegment {
    fn as_key(&self) -> Result<&str> {
        match self {
            PathSegment::Key(key) => Ok(key),
            PathSegment::Index(i) => Err(SealError::Parse(format!(
                "expected a key, found index {i}"
            ))),
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(key) => write!(f, "[{key:?}]"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

/// Parse a path such as `["foo"]["bar"][2]`.
pub fn parse_tree_path(input: &str) -> Result<Vec<PathSegment>> {
    let mut segments = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let inner = rest
            .strip_prefix('[')
            .ok_or_else(|| SealError::Parse(format!("invalid tree path '{input}'")))?;
        if let Some(quoted) = inner.strip_prefix('"') {
            let end = quoted
                .find("\"]")
                .ok_or_else(|| SealError::Parse(format!("unterminated key in '{input}'")))?;
            segments.push(PathSegment::Key(quoted[..end].to_string()));
            rest = &quoted[end + 2..];
        } else {
            let end = inner
                .find(']')
                .ok_or_else(|| SealError::Parse(format!("unterminated index in '{input}'")))?;
            let index = inner[..end]
                .trim()
                .parse::<usize>()
                .map_err(|_| SealError::Parse(format!("invalid index in '{input}'")))?;
            segments.push(PathSegment::Index(index));
            rest = &inner[end + 1..];
        }
    }
    if segments.is_empty() {
        return Err(SealError::Parse("empty tree path".into()));
    }
    Ok(segments)
}

fn get_in<'a>(value: &'a Value, path: &[PathSegment]) -> Result<&'a Value> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(value);
    };
    let next = match (value, first) {
        (Value::Branch(branch), PathSegment::Key(key)) => branch
            .get_key(key)
            .ok_or_else(|| SealError::Parse(format!("key '{key}' not found")))?,
        (Value::List(items), PathSegment::Index(i)) => items
            .get(*i)
            .ok_or_else(|| SealError::Parse(format!("index {i} out of range")))?,
        (_, segment) => {
            return Err(SealError::Parse(format!(
                "cannot descend into {segment}: wrong node type"
            )))
        }
    };
    get_in(next, rest)
}

fn set_in(slot: &mut Value, path: &[PathSegment], value: Value) -> Result<()> {
    let Some((first, rest)) = path.split_first() else {
        *slot = value;
        return Ok(());
    };
    match first {
        PathSegment::Key(key) => {
            let Value::Branch(branch) = slot else {
                return Err(SealError::Parse(format!("cannot descend into {first}: not a branch")));
            };
            if rest.is_empty() {
                branch.insert_or_replace(key, value);
                return Ok(());
            }
            if branch.get_key(key).is_none() {
                branch.insert_or_replace(key, empty_container(&rest[0]));
            }
            match branch.get_key_mut(key) {
                Some(child) => set_in(child, rest, value),
                None => Err(SealError::Parse(format!("key '{key}' not found"))),
            }
        }
        PathSegment::Index(i) => {
            let Value::List(items) = slot else {
                return Err(SealError::Parse(format!("cannot descend into {first}: not a list")));
            };
            if *i > items.len() {
                return Err(SealError::Parse(format!("index {i} out of range")));
            }
            if *i == items.len() {
                items.push(empty_container(rest.first().unwrap_or(&PathSegment::Index(0))));
            }
            set_in(&mut items[*i], rest, value)
        }
    }
}

fn empty_container(next: &PathSegment) -> Value {
    match next {
        PathSegment::Key(_) => Value::Branch(TreeBranch::new()),
        PathSegment::Index(_) => Value::List(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TreeBranch {
        let mut inner = TreeBranch::new();
        inner.push(TreeItem::new("b", Scalar::Int(1)));
        let mut branch = TreeBranch::new();
        branch.push(TreeItem::comment("header"));
        branch.push(TreeItem::new("a", inner));
        branch.push(TreeItem::new(
            "list",
            Value::List(vec![
                Value::string("x"),
                Value::Comment("note".into()),
                Value::string("y"),
            ]),
        ));
        branch
    }

    #[test]
    fn test_walk_order_and_paths() {
        let mut branch = sample();
        let mut seen = Vec::new();
        branch
            .walk_leaves(|scalar, path| {
                seen.push((path.join(":"), scalar.clone()));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                ("a:b".to_string(), Scalar::Int(1)),
                ("list".to_string(), Scalar::from("x")),
                ("list".to_string(), Scalar::from("y")),
            ]
        );
    }

    #[test]
    fn test_float_encoding() {
        assert_eq!(format_float(1.5), "1.5");
        assert_eq!(format_float(2.0), "2");
        assert_eq!(format_float(1e21), "1000000000000000000000");
        assert_eq!(format_float(0.0001), "0.0001");
    }

    #[test]
    fn test_bool_and_null_bytes() {
        assert_eq!(Scalar::Bool(true).to_bytes().unwrap(), b"True");
        assert_eq!(Scalar::Bool(false).to_bytes().unwrap(), b"False");
        assert!(Scalar::Null.to_bytes().is_none());
    }

    #[test]
    fn test_parse_tree_path() {
        let path = parse_tree_path(r#"["a"]["b"][2]"#).unwrap();
        assert_eq!(
            path,
            vec![
                PathSegment::Key("a".into()),
                PathSegment::Key("b".into()),
                PathSegment::Index(2)
            ]
        );
        assert!(parse_tree_path("a.b").is_err());
        assert!(parse_tree_path("").is_err());
    }

    #[test]
    fn test_get_and_set() {
        let mut branch = sample();
        let path = parse_tree_path(r#"["list"][2]"#).unwrap();
        assert_eq!(branch.get(&path).unwrap(), &Value::string("y"));

        branch
            .set(&parse_tree_path(r#"["a"]["b"]"#).unwrap(), Value::string("new"))
            .unwrap();
        assert_eq!(
            branch.get(&parse_tree_path(r#"["a"]["b"]"#).unwrap()).unwrap(),
            &Value::string("new")
        );

        branch
            .set(&parse_tree_path(r#"["c"]["d"]"#).unwrap(), Value::string("deep"))
            .unwrap();
        assert_eq!(branch.items().last().unwrap().key, TreeKey::from("c"));
    }

    #[test]
    fn test_insert_or_replace_keeps_position() {
        let mut branch = TreeBranch::new();
        branch.push(TreeItem::new("x", Scalar::Int(1)));
        branch.push(TreeItem::new("y", Scalar::Int(2)));
        branch.insert_or_replace("x", Value::Scalar(Scalar::Int(9)));
        assert_eq!(branch.items()[0].value, Value::Scalar(Scalar::Int(9)));
        assert_eq!(branch.len(), 2);
    }
}
