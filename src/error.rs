use crate::gpu::ResourceId;

/// Failure reported by a [`ModelSource`](crate::loader::ModelSource).
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("path escapes the model root: {0}")]
    InvalidPath(String),
    #[error("I/O error reading {path}: {message}")]
    Io { path: String, message: String },
}

/// Failure of a `load` call. Cloneable so every caller sharing one in-flight
/// load receives the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("failed to fetch '{path}': {source}")]
    Fetch {
        path: String,
        #[source]
        source: FetchError,
    },
    #[error("failed to parse '{path}': {message}")]
    Parse { path: String, message: String },
    #[error("session '{session}' was disposed before '{path}' finished loading")]
    SessionDisposed { session: String, path: String },
    #[error("load of '{path}' was cancelled by disposal")]
    Cancelled { path: String },
}

impl LoadError {
    pub fn path(&self) -> &str {
        match self {
            LoadError::Fetch { path, .. }
            | LoadError::Parse { path, .. }
            | LoadError::SessionDisposed { path, .. }
            | LoadError::Cancelled { path } => path,
        }
    }
}

/// Reasons the grouped instancing pass refuses a scene graph.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptimizeError {
    #[error("node '{node}' has a non-finite world transform")]
    NonFiniteTransform { node: String },
    #[error("geometry {geometry} is malformed: {reason}")]
    MalformedGeometry { geometry: ResourceId, reason: String },
}
