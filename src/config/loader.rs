// src/config/loader.rs

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::config::model::{PipelineFile, RawPipelineFile};
use crate::errors::{DocdagError, Result};
use crate::fs::{FileSystem, RealFileSystem};
use crate::store::{DocumentId, FieldName};

/// Initial inputs: `{ document: { field: value } }`.
pub type InitialInputs = BTreeMap<DocumentId, BTreeMap<FieldName, Value>>;

/// Parse a pipeline definition without semantic validation.
pub fn parse_str(contents: &str) -> Result<RawPipelineFile> {
    let pipeline: RawPipelineFile = toml::from_str(contents)?;
    Ok(pipeline)
}

/// Load a pipeline file from a given path and return the raw
/// `RawPipelineFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (DAG correctness, etc.). Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawPipelineFile> {
    load_from_fs(&RealFileSystem, path.as_ref())
}

/// Same as [`load_from_path`], through an arbitrary [`FileSystem`].
pub fn load_from_fs(fs: &dyn FileSystem, path: &Path) -> Result<RawPipelineFile> {
    let contents = fs.read_to_string(path)?;
    debug!(path = %path.display(), bytes = contents.len(), "read pipeline definition");
    parse_str(&contents)
}

/// Load a pipeline file from path and run validation.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks for:
///   - unknown dependencies, data sources and rule documents,
///   - DAG cycles,
///   - basic global config sanity.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<PipelineFile> {
    let raw = load_from_path(&path)?;
    PipelineFile::try_from(raw)
}

/// Read initial inputs from a JSON file.
pub fn load_inputs(fs: &dyn FileSystem, path: &Path) -> Result<InitialInputs> {
    let contents = fs.read_to_string(path)?;
    parse_inputs(&contents)
}

/// Parse initial inputs, which must be an object of objects.
pub fn parse_inputs(contents: &str) -> Result<InitialInputs> {
    let value: Value = serde_json::from_str(contents)?;
    let Value::Object(documents) = value else {
        return Err(DocdagError::Config(
            "inputs must be a JSON object of documents".to_string(),
        ));
    };

    let mut inputs = InitialInputs::new();
    for (document, fields) in documents {
        let Value::Object(fields) = fields else {
            return Err(DocdagError::Config(format!(
                "input document '{document}' must be a JSON object of fields"
            )));
        };
        inputs.insert(document, fields.into_iter().collect());
    }
    Ok(inputs)
}

/// Read a resume payload: a JSON object of output fields.
pub fn load_payload(fs: &dyn FileSystem, path: &Path) -> Result<BTreeMap<FieldName, Value>> {
    let contents = fs.read_to_string(path)?;
    match serde_json::from_str::<Value>(&contents)? {
        Value::Object(fields) => Ok(fields.into_iter().collect()),
        _ => Err(DocdagError::Config(format!(
            "payload {} must be a JSON object of fields",
            path.display()
        ))),
    }
}
