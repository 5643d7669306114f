// Pathway PCA: multi-backend SVD, engine-backed PCA and a rotation cache

#![doc = include_str!("../README.md")]

pub mod aggregator;
pub mod compound_file;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod jacobi;
pub mod linalg_backends;
pub mod pca;
pub mod prcomp;
pub mod rotation_cache;
pub mod scaling;
pub mod svd;
pub mod svd_factory;

pub use aggregator::{AggregatorConfig, FeatureTable, PathwayInfo, PcaFeatureAggregator};
pub use compound_file::{CompoundFile, EntryReader, EntryWriter};
pub use engine::{EmbeddedConnector, EmbeddedEngine, EnginePool, EnginePoolConfig};
pub use error::{AggregationError, CacheError, CompoundFileError, EngineError, PcaError, SvdError};
pub use pca::RemotePca;
pub use rotation_cache::RotationCache;
pub use scaling::{ScalingMap, ScalingMode};
pub use svd::{SingularValueDecomposition, SvdBackend, SvdOutput};
pub use svd_factory::{SvdBackendKind, SvdFactory};
