use thiserror::Error;

/// Core error types for span-bridge
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid tensor shape: {0}")]
    InvalidShape(String),

    /// Fatal configuration error: the model uses a layout the export format
    /// has no convention for (e.g. a multi-layer recurrent module).
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Fatal configuration error: a required submodule is absent and there is
    /// no viable fallback.
    #[error("Missing required submodule: {0}")]
    MissingSubmodule(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A companion runtime invocation exited non-zero or produced no summary.
    #[error("External runtime failure: {0}")]
    ExternalRuntime(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
