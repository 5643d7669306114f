//! Rotation matrices and their scaling maps, keyed by (endpoint, pathway, split),
//! stored in one compound file per endpoint and split.
//!
//! Physical file: `Rotation-Cache-<endpoint>-Split-<split>.compound-file` in the
//! cache directory. Entry names inside it:
//!
//! ```text
//! <endpoint>/split-<split>/pca-rotation-<pathway>.bin
//! <endpoint>/split-<split>/pca-rotation-<pathway>-mean-map.bin
//! <endpoint>/split-<split>/pca-rotation-<pathway>-range-map.bin
//! ```
//!
//! Spaces and `/` inside endpoint and pathway identifiers become `_`.

use crate::compound_file::CompoundFile;
use crate::error::{CacheError, CompoundFileError};
use crate::scaling::ScalingMap;
use log::{debug, error, info, trace, warn};
use ndarray::Array2;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

static ROTATION_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<endpoint>[^/]+)/split-(?P<split>\d+)/pca-rotation-(?P<pathway>.+)\.bin$")
        .expect("rotation entry pattern is a valid regex")
});

static COMPOUND_FILENAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^Rotation-Cache-(?P<endpoint>.+)-Split-(?P<split>\d+)\.compound-file$")
        .expect("compound filename pattern is a valid regex")
});

const MAP_SUFFIX: &str = "-map.bin";

/// The two scaling maps stored next to each rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    Mean,
    Range,
}

impl MapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MapKind::Mean => "mean",
            MapKind::Range => "range",
        }
    }
}

fn is_map_entry(name: &str) -> bool {
    [MapKind::Mean, MapKind::Range]
        .iter()
        .any(|kind| name.ends_with(&format!("-{}{}", kind, MAP_SUFFIX)))
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replaces characters that would break the path-like entry names.
pub fn sanitize(id: &str) -> String {
    id.replace([' ', '/'], "_")
}

/// Split id encoded in a compound filename (a bare name or a path), or `None`
/// when the name does not follow the cache's naming pattern.
pub fn split_id_from_compound_filename(name: &str) -> Option<u32> {
    let file_name = Path::new(name).file_name()?.to_str()?;
    COMPOUND_FILENAME
        .captures(file_name)
        .and_then(|caps| caps.name("split"))
        .and_then(|m| m.as_str().parse().ok())
}

/// Rotation cache for one split.
///
/// Compound files are opened lazily, once per endpoint, and shared between
/// threads; writes to one file are serialised by its mutex.
#[derive(Debug)]
pub struct RotationCache {
    cache_dir: PathBuf,
    split_id: u32,
    files: Mutex<HashMap<String, Arc<Mutex<CompoundFile>>>>,
    check_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RotationCache {
    /// Opens the cache in `cache_dir`, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(cache_dir: P, split_id: u32) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir).map_err(|source| CacheError::CacheDir {
            path: cache_dir.display().to_string(),
            source,
        })?;
        info!("Rotation cache for split {} in {}", split_id, cache_dir.display());
        Ok(Self {
            cache_dir,
            split_id,
            files: Mutex::new(HashMap::new()),
            check_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn split_id(&self) -> u32 {
        self.split_id
    }

    /// Physical compound file holding `endpoint`'s rotations for this split.
    pub fn compound_path(&self, endpoint: &str) -> PathBuf {
        self.cache_dir.join(format!(
            "Rotation-Cache-{}-Split-{}.compound-file",
            sanitize(endpoint),
            self.split_id
        ))
    }

    pub fn rotation_entry_name(&self, endpoint: &str, pathway: &str) -> String {
        format!(
            "{}/split-{}/pca-rotation-{}.bin",
            sanitize(endpoint),
            self.split_id,
            sanitize(pathway)
        )
    }

    pub fn map_entry_name(&self, endpoint: &str, pathway: &str, kind: MapKind) -> String {
        format!(
            "{}/split-{}/pca-rotation-{}-{}{}",
            sanitize(endpoint),
            self.split_id,
            sanitize(pathway),
            kind,
            MAP_SUFFIX
        )
    }

    fn container(&self, endpoint: &str) -> Result<Arc<Mutex<CompoundFile>>, CacheError> {
        let key = sanitize(endpoint);
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = files.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let path = self.compound_path(endpoint);
        debug!("Opening rotation compound file {}", path.display());
        let opened = Arc::new(Mutex::new(CompoundFile::open(&path)?));
        files.insert(key, Arc::clone(&opened));
        Ok(opened)
    }

    /// Container for reads; `None` when nothing was ever written for `endpoint`
    /// (the file is not created just to answer a lookup).
    fn existing_container(&self, endpoint: &str) -> Result<Option<Arc<Mutex<CompoundFile>>>, CacheError> {
        let opened = self
            .files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&sanitize(endpoint));
        if !opened && !self.compound_path(endpoint).exists() {
            return Ok(None);
        }
        self.container(endpoint).map(Some)
    }

    fn check_lock(&self, entry: &str) -> Arc<Mutex<()>> {
        let mut locks = self.check_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(entry.to_string()).or_default())
    }

    /// Whether a rotation for (`endpoint`, `pathway`) exists in this split.
    pub fn is_table_cached(&self, endpoint: &str, pathway: &str) -> bool {
        let entry = self.rotation_entry_name(endpoint, pathway);
        let lock = self.check_lock(&entry);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = match self.existing_container(endpoint) {
            Ok(Some(container)) => container
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_entry(&entry),
            Ok(None) => false,
            Err(e) => {
                warn!("Could not check rotation cache for {}: {}", entry, e);
                false
            }
        };
        debug!("Rotation {} cached: {}", entry, cached);
        cached
    }

    /// Stores `rotation` (`(n_components, n_features)`) with its feature ids.
    ///
    /// # Errors
    /// `CacheError::RotationLengthMismatch` when a component's length differs from
    /// `row_ids.len()`; compound-file errors otherwise (including an existing entry).
    pub fn save_rotation_matrix(
        &self,
        endpoint: &str,
        pathway: &str,
        row_ids: &[String],
        rotation: &Array2<f64>,
    ) -> Result<(), CacheError> {
        for (component, values) in rotation.outer_iter().enumerate() {
            if values.len() != row_ids.len() {
                return Err(CacheError::RotationLengthMismatch {
                    component,
                    len: values.len(),
                    row_ids: row_ids.len(),
                });
            }
        }
        let entry = self.rotation_entry_name(endpoint, pathway);
        let container = self.container(endpoint)?;
        let mut compound = container.lock().unwrap_or_else(PoisonError::into_inner);
        let mut writer = compound.add_entry(&entry)?;
        writer.write_i32(rotation.nrows() as i32);
        writer.write_i32(row_ids.len() as i32);
        for id in row_ids {
            writer.write_utf(id)?;
        }
        for values in rotation.outer_iter() {
            writer.write_i32(values.len() as i32);
            writer.write_f64_slice(&values.to_vec());
        }
        writer.close()?;
        debug!(
            "Saved {}x{} rotation as {}",
            rotation.nrows(),
            rotation.ncols(),
            entry
        );
        Ok(())
    }

    /// Loads the rotation for (`endpoint`, `pathway`) and appends its feature ids
    /// to `row_ids`. `None` on a cache miss or a read failure (logged).
    pub fn get_rotation_matrix(&self, endpoint: &str, pathway: &str, row_ids: &mut Vec<String>) -> Option<Array2<f64>> {
        let entry = self.rotation_entry_name(endpoint, pathway);
        let container = match self.existing_container(endpoint) {
            Ok(Some(container)) => container,
            Ok(None) => {
                debug!("No rotation cache file for endpoint {}", endpoint);
                return None;
            }
            Err(e) => {
                error!("Could not open rotation cache for {}: {}", entry, e);
                return None;
            }
        };
        let compound = container.lock().unwrap_or_else(PoisonError::into_inner);
        log_read_failure(&entry, compound.path(), read_rotation(&compound, &entry, row_ids))
    }

    /// Loads a rotation from any compound file (e.g. another split's), appending
    /// its feature ids to `row_ids`. `None` on failure (logged).
    pub fn get_rotation_matrix_from(&self, path: &Path, entry: &str, row_ids: &mut Vec<String>) -> Option<Array2<f64>> {
        if let Some(container) = self.own_container_at(path) {
            let compound = container.lock().unwrap_or_else(PoisonError::into_inner);
            return log_read_failure(entry, path, read_rotation(&compound, entry, row_ids));
        }
        let result = CompoundFile::open_read_only(path).and_then(|compound| read_rotation(&compound, entry, row_ids));
        log_read_failure(entry, path, result)
    }

    fn own_container_at(&self, path: &Path) -> Option<Arc<Mutex<CompoundFile>>> {
        // Keys are already sanitized, and sanitizing is idempotent.
        let files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        files
            .iter()
            .find(|(key, _)| self.compound_path(key) == path)
            .map(|(_, container)| Arc::clone(container))
    }

    pub fn save_map(&self, endpoint: &str, pathway: &str, kind: MapKind, map: &ScalingMap) -> Result<(), CacheError> {
        let entry = self.map_entry_name(endpoint, pathway, kind);
        let container = self.container(endpoint)?;
        let mut compound = container.lock().unwrap_or_else(PoisonError::into_inner);
        let mut writer = compound.add_entry(&entry)?;
        writer.write_object(map)?;
        writer.close()?;
        trace!("Saved {} map with {} features as {}", kind, map.len(), entry);
        Ok(())
    }

    /// `None` when the map is missing or unreadable (logged).
    pub fn load_map(&self, endpoint: &str, pathway: &str, kind: MapKind) -> Option<ScalingMap> {
        let entry = self.map_entry_name(endpoint, pathway, kind);
        let container = match self.existing_container(endpoint) {
            Ok(Some(container)) => container,
            Ok(None) => return None,
            Err(e) => {
                error!("Could not open rotation cache for {}: {}", entry, e);
                return None;
            }
        };
        let compound = container.lock().unwrap_or_else(PoisonError::into_inner);
        let result = compound
            .read_entry(&entry)
            .and_then(|mut reader| reader.read_object::<ScalingMap>());
        match result {
            Ok(map) => Some(map),
            Err(e) => {
                error!("Could not load {} map {}: {}", kind, entry, e);
                None
            }
        }
    }

    /// Removes only the rotation for (`endpoint`, `pathway`), keeping its maps.
    /// Returns whether it was present.
    pub fn delete_rotation_matrix(&self, endpoint: &str, pathway: &str) -> Result<bool, CacheError> {
        let Some(container) = self.existing_container(endpoint)? else {
            return Ok(false);
        };
        let mut compound = container.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = self.rotation_entry_name(endpoint, pathway);
        if !compound.contains_entry(&entry) {
            return Ok(false);
        }
        compound.delete_entry(&entry)?;
        Ok(true)
    }

    /// Removes the rotation for (`endpoint`, `pathway`) and both of its maps.
    /// Returns whether a rotation was present.
    pub fn delete_rotation(&self, endpoint: &str, pathway: &str) -> Result<bool, CacheError> {
        let Some(container) = self.existing_container(endpoint)? else {
            return Ok(false);
        };
        let mut compound = container.lock().unwrap_or_else(PoisonError::into_inner);
        let rotation = self.rotation_entry_name(endpoint, pathway);
        let existed = compound.contains_entry(&rotation);
        let names = [
            rotation,
            self.map_entry_name(endpoint, pathway, MapKind::Mean),
            self.map_entry_name(endpoint, pathway, MapKind::Range),
        ];
        for name in &names {
            if compound.contains_entry(name) {
                compound.delete_entry(name)?;
            }
        }
        debug!("Deleted cached rotation {} (present: {})", names[0], existed);
        Ok(existed)
    }

    /// Every cached rotation of (`endpoint`, `pathway`) across all splits in the
    /// cache directory, as compound-file path to matching entry names. Scaling
    /// maps are excluded. Unreadable files are logged and skipped.
    pub fn get_rotation_files(&self, endpoint: &str, pathway: &str) -> BTreeMap<PathBuf, BTreeSet<String>> {
        let mut found = BTreeMap::new();
        let endpoint_key = sanitize(endpoint);
        let pathway_key = sanitize(pathway);
        let prefix = format!("Rotation-Cache-{}-Split-", endpoint_key);

        let dir_entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Could not scan cache directory {}: {}", self.cache_dir.display(), e);
                return found;
            }
        };
        for dir_entry in dir_entries.flatten() {
            let path = dir_entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !file_name.starts_with(&prefix) {
                continue;
            }
            let Some(split) = split_id_from_compound_filename(file_name) else {
                debug!("Skipping {}: cannot determine split", file_name);
                continue;
            };

            let names = match self.own_container_at(&path) {
                Some(container) => container.lock().unwrap_or_else(PoisonError::into_inner).list_entries(),
                None => match CompoundFile::open_read_only(&path) {
                    Ok(compound) => compound.list_entries(),
                    Err(e) => {
                        warn!("Skipping unreadable rotation cache {}: {}", path.display(), e);
                        continue;
                    }
                },
            };
            let matching: BTreeSet<String> = names
                .into_iter()
                .filter(|name| !is_map_entry(name))
                .filter(|name| {
                    ROTATION_ENTRY.captures(name).map_or(false, |caps| {
                        &caps["endpoint"] == endpoint_key && &caps["pathway"] == pathway_key
                    })
                })
                .collect();
            trace!("{} (split {}): {} matching rotations", file_name, split, matching.len());
            if !matching.is_empty() {
                found.insert(path, matching);
            }
        }
        found
    }

    /// Flushes and closes every open compound file.
    pub fn close(self) -> Result<(), CacheError> {
        let files = self.files.into_inner().unwrap_or_else(PoisonError::into_inner);
        for (_, container) in files {
            match Arc::try_unwrap(container) {
                Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner).close()?,
                Err(shared) => shared.lock().unwrap_or_else(PoisonError::into_inner).flush()?,
            }
        }
        Ok(())
    }
}

fn read_rotation(
    compound: &CompoundFile,
    entry: &str,
    row_ids: &mut Vec<String>,
) -> Result<Array2<f64>, CompoundFileError> {
    let corrupt = |reason: String| CompoundFileError::Corrupt {
        path: compound.path().display().to_string(),
        reason: format!("rotation '{}': {}", entry, reason),
    };
    let mut reader = compound.read_entry(entry)?;
    let n_components = reader.read_i32()?;
    let n_features = reader.read_i32()?;
    if n_components < 0 || n_features < 0 {
        return Err(corrupt(format!("negative dimensions {}x{}", n_components, n_features)));
    }
    // Each id takes at least its 4-byte length; each component 4 + 8·n_features bytes.
    let minimum_len = (n_features as u64)
        .checked_mul(8)
        .and_then(|row| row.checked_add(4))
        .and_then(|row| row.checked_mul(n_components as u64))
        .and_then(|rows| rows.checked_add(n_features as u64 * 4));
    match minimum_len {
        Some(len) if len <= reader.remaining() => {}
        _ => {
            return Err(corrupt(format!(
                "header claims {}x{} but only {} payload bytes follow",
                n_components,
                n_features,
                reader.remaining()
            )))
        }
    }
    let (n_components, n_features) = (n_components as usize, n_features as usize);

    let mut ids = Vec::with_capacity(n_features);
    for _ in 0..n_features {
        ids.push(reader.read_utf()?);
    }
    let mut values = Vec::with_capacity(n_components * n_features);
    for component in 0..n_components {
        let len = reader.read_i32()?;
        if len < 0 || len as usize != n_features {
            return Err(corrupt(format!(
                "component {} has {} values for {} features",
                component, len, n_features
            )));
        }
        values.extend(reader.read_f64_vec(n_features)?);
    }
    let rotation =
        Array2::from_shape_vec((n_components, n_features), values).map_err(|e| corrupt(e.to_string()))?;
    row_ids.extend(ids);
    Ok(rotation)
}

fn log_read_failure(entry: &str, path: &Path, result: Result<Array2<f64>, CompoundFileError>) -> Option<Array2<f64>> {
    match result {
        Ok(rotation) => Some(rotation),
        Err(CompoundFileError::NotFound { .. }) => {
            debug!("Rotation {} not cached in {}", entry, path.display());
            None
        }
        Err(e) => {
            error!("Could not read rotation {} from {}: {}", entry, path.display(), e);
            None
        }
    }
}
