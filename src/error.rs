//! Failure points owned by the pipeline itself.
//!
//! I/O, parsing and transport errors are carried through `anyhow` with context;
//! the variants here are the conditions callers may want to match on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage received no features and refuses to produce an empty map.
    #[error("feature collection is empty at stage '{stage}'")]
    EmptyCollection {
        /// Stage that detected the empty input.
        stage: &'static str,
    },

    /// A key occurs more than once where keys must be unique.
    #[error("duplicate key '{key}' in {source_name}")]
    DuplicateKey {
        /// The repeated key.
        key: String,
        /// Which input contained it.
        source_name: String,
    },

    /// A required column is absent from an input.
    #[error("column '{column}' not found in {source_name}")]
    MissingColumn {
        /// Name of the column.
        column: String,
        /// Which input was searched.
        source_name: String,
    },

    /// Input geometry file type is not supported.
    #[error("unsupported geometry format: {0}")]
    UnsupportedFormat(String),

    /// The styled column carries no finite numeric value.
    #[error("column '{0}' has no numeric values to color")]
    NoNumericValues(String),

    /// The external tile packaging tool could not be started.
    #[error("tile packaging tool '{0}' was not found")]
    ToolMissing(String),

    /// The external tile packaging tool exited unsuccessfully.
    #[error("tile packaging tool '{tool}' failed ({status}): {stderr}")]
    ToolFailed {
        /// Tool name.
        tool: String,
        /// Exit status description.
        status: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A credential the stage needs was not supplied.
    #[error("missing credential: {0}")]
    MissingCredential(String),

    /// The hosted tile service rejected the upload.
    #[error("upload to {url} rejected with status {status}: {body}")]
    UploadRejected {
        /// Endpoint (without the access token).
        url: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
}
