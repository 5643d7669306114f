//! Maps a backend name to a freshly constructed [`SvdBackend`].

use crate::engine::EnginePool;
use crate::error::SvdError;
use crate::svd::{EngineSvd, JacobiSvd, LapackSvd, RandomizedSvd, RandomizedSvdConfig, SvdBackend};
use log::debug;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvdBackendKind {
    /// Native LAPACK driver.
    Lapack,
    /// Local dense one-sided Jacobi (accepted as `COLT` or `dense` too).
    Jacobi,
    /// Iterative partial solver (accepted as `iterative` too).
    Randomized,
    /// Statistical engine (accepted as `R` or `engine`).
    Engine,
}

impl SvdBackendKind {
    pub const ALL: [SvdBackendKind; 4] = [
        SvdBackendKind::Lapack,
        SvdBackendKind::Jacobi,
        SvdBackendKind::Randomized,
        SvdBackendKind::Engine,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SvdBackendKind::Lapack => "LAPACK",
            SvdBackendKind::Jacobi => "JACOBI",
            SvdBackendKind::Randomized => "RANDOMIZED",
            SvdBackendKind::Engine => "R",
        }
    }
}

impl fmt::Display for SvdBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SvdBackendKind {
    type Err = SvdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lapack" => Ok(SvdBackendKind::Lapack),
            "jacobi" | "colt" | "dense" => Ok(SvdBackendKind::Jacobi),
            "randomized" | "iterative" => Ok(SvdBackendKind::Randomized),
            "r" | "engine" => Ok(SvdBackendKind::Engine),
            _ => Err(SvdError::NoSuchImplementation { name: s.to_string() }),
        }
    }
}

/// Builds backends that share one native lock and, optionally, one engine pool.
#[derive(Debug, Clone)]
pub struct SvdFactory {
    native_lock: Arc<Mutex<()>>,
    engine_pool: Option<Arc<EnginePool>>,
    randomized: RandomizedSvdConfig,
    jacobi_max_sweeps: usize,
}

impl Default for SvdFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SvdFactory {
    /// Factory without an engine; requesting [`SvdBackendKind::Engine`] fails.
    pub fn new() -> Self {
        Self {
            native_lock: Arc::new(Mutex::new(())),
            engine_pool: None,
            randomized: RandomizedSvdConfig::default(),
            jacobi_max_sweeps: JacobiSvd::DEFAULT_MAX_SWEEPS,
        }
    }

    pub fn with_engine_pool(mut self, pool: Arc<EnginePool>) -> Self {
        self.engine_pool = Some(pool);
        self
    }

    pub fn with_randomized_config(mut self, config: RandomizedSvdConfig) -> Self {
        self.randomized = config;
        self
    }

    pub fn with_jacobi_max_sweeps(mut self, max_sweeps: usize) -> Self {
        self.jacobi_max_sweeps = max_sweeps;
        self
    }

    pub fn create(&self, kind: SvdBackendKind) -> Result<SvdBackend, SvdError> {
        debug!("Creating {} SVD backend", kind);
        let backend = match kind {
            SvdBackendKind::Lapack => SvdBackend::Lapack(LapackSvd::new(Arc::clone(&self.native_lock))),
            SvdBackendKind::Jacobi => SvdBackend::Jacobi(JacobiSvd::new(self.jacobi_max_sweeps)),
            SvdBackendKind::Randomized => SvdBackend::Randomized(RandomizedSvd::new(
                self.randomized.clone(),
                Arc::clone(&self.native_lock),
            )),
            SvdBackendKind::Engine => {
                let pool = self.engine_pool.as_ref().ok_or_else(|| SvdError::NoSuchImplementation {
                    name: format!("{} (no engine pool configured)", kind),
                })?;
                SvdBackend::Engine(EngineSvd::new(Arc::clone(pool)))
            }
        };
        Ok(backend)
    }

    pub fn create_by_name(&self, name: &str) -> Result<SvdBackend, SvdError> {
        self.create(name.parse()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EnginePoolConfig;
    use crate::svd::SingularValueDecomposition;

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("LAPACK".parse::<SvdBackendKind>().unwrap(), SvdBackendKind::Lapack);
        assert_eq!("Colt".parse::<SvdBackendKind>().unwrap(), SvdBackendKind::Jacobi);
        assert_eq!("iterative".parse::<SvdBackendKind>().unwrap(), SvdBackendKind::Randomized);
        assert_eq!("R".parse::<SvdBackendKind>().unwrap(), SvdBackendKind::Engine);
        for kind in SvdBackendKind::ALL {
            assert_eq!(kind.name().parse::<SvdBackendKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_name_is_a_hard_failure() {
        let err = SvdFactory::new().create_by_name("octave").unwrap_err();
        assert!(matches!(err, SvdError::NoSuchImplementation { name } if name == "octave"));
    }

    #[test]
    fn engine_backend_needs_a_pool() {
        let factory = SvdFactory::new();
        assert!(matches!(
            factory.create(SvdBackendKind::Engine),
            Err(SvdError::NoSuchImplementation { .. })
        ));
        let pool = Arc::new(EnginePool::embedded(EnginePoolConfig::default()));
        let backend = factory.with_engine_pool(pool).create(SvdBackendKind::Engine).unwrap();
        assert_eq!(backend.backend_name(), "R");
    }
}
