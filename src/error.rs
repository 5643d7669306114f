//! Error types for the compound file, the SVD backends, the statistical engine,
//! the rotation cache and the pathway aggregator.

use thiserror::Error;

/// Errors raised by [`crate::compound_file::CompoundFile`] and its entry readers/writers.
#[derive(Error, Debug)]
pub enum CompoundFileError {
    #[error("compound file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no entry named '{name}' in compound file")]
    NotFound { name: String },

    #[error("entry '{name}' already exists; delete it before adding it again")]
    EntryExists { name: String },

    #[error("compound file is opened read-only; cannot modify '{name}'")]
    ReadOnly { name: String },

    #[error("corrupt compound file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("read of {requested} bytes runs past the end of entry '{name}' ({remaining} bytes remaining)")]
    ReadPastEnd {
        name: String,
        requested: u64,
        remaining: u64,
    },

    #[error("entry '{name}' is {len} bytes, larger than the 4-byte length prefix allows")]
    EntryTooLarge { name: String, len: usize },

    #[error("invalid UTF-8 string in entry '{name}'")]
    InvalidUtf8 { name: String },

    #[error("failed to encode object: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode object: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Errors raised by the singular value decomposition backends.
///
/// `Unsupported` is a capability answer (the backend cannot do this overload),
/// `Failed` is a numerical or infrastructure failure while trying.
#[derive(Error, Debug)]
pub enum SvdError {
    #[error("operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("{backend} SVD failed: {reason}")]
    Failed {
        backend: &'static str,
        reason: String,
    },

    #[error("no SVD implementation named '{name}'")]
    NoSuchImplementation { name: String },

    #[error("invalid SVD input: {reason}")]
    InvalidInput { reason: String },
}

/// Errors raised while talking to a statistical engine or its connection pool.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine connection failed: {0}")]
    Connection(String),

    #[error("engine connection pool has been shut down")]
    PoolClosed,

    #[error("unknown workspace variable '{0}'")]
    UnknownVariable(String),

    #[error("evaluation of `{expression}` failed: {reason}")]
    Evaluation { expression: String, reason: String },

    #[error("malformed engine reply: {0}")]
    MalformedReply(String),
}

/// Errors raised by [`crate::pca::RemotePca`] outside the contained engine failures.
#[derive(Error, Debug)]
pub enum PcaError {
    #[error("matrix product dimension mismatch: left operand has {left_features} features, rotation has {right_features}")]
    DimensionMismatch {
        left_features: usize,
        right_features: usize,
    },
}

/// Errors raised by [`crate::rotation_cache::RotationCache`].
#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    CompoundFile(#[from] CompoundFileError),

    #[error("rotation component {component} has {len} values but {row_ids} row identifiers were supplied")]
    RotationLengthMismatch {
        component: usize,
        len: usize,
        row_ids: usize,
    },

    #[error("cache directory {path} is not usable: {source}")]
    CacheDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that stop a pathway aggregation task.
///
/// Per-pathway engine failures are not represented here; those are contained
/// and logged. Everything in this enum indicates output that would otherwise be
/// silently wrong.
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("recovered probeset must match probeid for slice: pathway '{pathway}' position {position} cached '{cached}' but slice has '{current}'")]
    IdentifierMismatch {
        pathway: String,
        position: usize,
        cached: String,
        current: String,
    },

    #[error("inconsistent rotation cache for pathway '{pathway}': {reason}")]
    InconsistentCache { pathway: String, reason: String },

    #[error("dimension mismatch in {context}: expected {expected}, got {got}")]
    DimensionMismatch {
        context: String,
        expected: String,
        got: String,
    },

    #[error("probeset index {index} of pathway '{pathway}' is outside the table ({n_columns} columns)")]
    ProbesetOutOfRange {
        pathway: String,
        index: usize,
        n_columns: usize,
    },

    #[error("cross-split averaging must run on split 0, this aggregator is for split {split}")]
    RequiresCompleteSplit { split: u32 },

    #[error(transparent)]
    Svd(#[from] SvdError),

    #[error(transparent)]
    Pca(#[from] PcaError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
