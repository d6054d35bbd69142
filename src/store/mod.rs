//! Document formats.
//!
//! A store turns bytes into a [`TreeBranch`] plus [`Metadata`] and back.
//! Every store keeps the metadata out of the value tree: the tree a store
//! returns never contains the reserved metadata key.

use std::path::Path;

use crate::error::{Result, SealError};
use crate::keysource::KeyServices;
use crate::metadata::Metadata;
use crate::tree::{TreeBranch, Value};

pub mod dotenv;
pub mod json;

pub use self::dotenv::DotenvStore;
pub use self::json::JsonStore;

pub trait Store: Send + Sync {
    /// Parse the value tree, without metadata.
    fn unmarshal(&self, bytes: &[u8]) -> Result<TreeBranch>;

    /// Parse only the metadata. Fails with `MetadataNotFound` when absent.
    fn unmarshal_metadata(&self, bytes: &[u8], services: &KeyServices) -> Result<Metadata>;

    /// Serialize a tree without metadata.
    fn marshal(&self, branch: &TreeBranch) -> Result<Vec<u8>>;

    /// Serialize a tree with its metadata record.
    fn marshal_with_metadata(&self, branch: &TreeBranch, metadata: &Metadata) -> Result<Vec<u8>>;

    /// Serialize a single value, as extracted from a tree.
    fn marshal_value(&self, value: &Value) -> Result<Vec<u8>>;
}

/// Formats with a built-in store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Dotenv,
}

impl Format {
    /// Pick a format from a file name.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name == ".env" || name.ends_with(".env") {
            return Ok(Format::Dotenv);
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(Format::Json),
            Some(other) => Err(SealError::Config(format!("no store for '.{other}' files"))),
            None => Err(SealError::Config(format!(
                "cannot infer a format for '{}'",
                path.display()
            ))),
        }
    }

    pub fn store(&self) -> Box<dyn Store> {
        match self {
            Format::Json => Box::new(JsonStore),
            Format::Dotenv => Box::new(DotenvStore),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_path() {
        assert_eq!(Format::from_path("secrets.json").unwrap(), Format::Json);
        assert_eq!(Format::from_path(".env").unwrap(), Format::Dotenv);
        assert_eq!(Format::from_path("config/prod.env").unwrap(), Format::Dotenv);
        assert!(Format::from_path("values.yaml").is_err());
        assert!(Format::from_path("Makefile").is_err());
    }
}
