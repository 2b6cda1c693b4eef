use crate::FeatureId;
use crate::RowId;

/// every failure mode in the engine is fatal. a corrupted mixture or a
/// mis-ordered row stream cannot be recovered from, so nothing here is
/// caught below the process boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("unknown feature id: {0}")]
    UnknownFeature(FeatureId),

    #[error("duplicate feature id: {0}")]
    DuplicateFeature(FeatureId),

    #[error("invalid sparse observed mask: {0}")]
    InvalidSparsity(String),

    #[error("duplicate row: {0}")]
    DuplicateRow(RowId),

    #[error("row id mismatch: expected {expected}, popped {popped}")]
    RowIdMismatch { expected: RowId, popped: RowId },

    #[error("pop from empty queue")]
    EmptyPop,

    #[error("invalid clustering hyperparameters: alpha = {alpha}, d = {d}")]
    InvalidHyperparameters { alpha: f32, d: f32 },

    #[error("unsupported sparsity in {0}")]
    UnsupportedSparsity(&'static str),

    #[error("empty hyperparameter grid: {0}")]
    EmptyGrid(&'static str),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),
}

impl Error {
    /// attach a path or stream name to an io failure
    pub fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
