//! A single physical file holding many independently named binary entries.
//!
//! On-disk layout:
//!
//! ```text
//! [ header (24 bytes): magic "PPCF" | version u32 | directory offset u64 | directory length u64 ]
//! [ data region: entries, each a big-endian u32 length followed by its payload,
//!   with reclaimable free extents in between ]
//! [ directory: bincode-encoded name -> slot map plus the free list ]
//! ```
//!
//! The directory always lives at the end of the data region and is rewritten
//! whenever an entry is committed or deleted. Deleted entries go to a free list
//! (adjacent extents are merged, a trailing extent shrinks the data region) and
//! are reused first-fit by later entries.
//!
//! At most one [`EntryWriter`] can be open at a time: it mutably borrows the
//! container until it is closed or dropped. Dropping a writer without calling
//! [`EntryWriter::close`] discards the entry.

use crate::error::CompoundFileError;
use log::{debug, trace};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"PPCF";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 24;
const LENGTH_PREFIX: u64 = 4;
/// Free extents smaller than this are not split off; the slack stays with the entry.
const MIN_SPLIT_REMAINDER: u64 = 16;

type Result<T> = std::result::Result<T, CompoundFileError>;

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    offset: u64,
    capacity: u64,
}

impl Extent {
    fn end(&self) -> u64 {
        self.offset + self.capacity
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
struct Slot {
    extent: Extent,
    /// Payload length, excluding the 4-byte prefix.
    len: u32,
}

#[derive(Serialize, Deserialize, Debug)]
struct Directory {
    entries: BTreeMap<String, Slot>,
    free: Vec<Extent>,
    data_end: u64,
}

impl Default for Directory {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            free: Vec::new(),
            data_end: HEADER_LEN,
        }
    }
}

/// Multiplexes many named binary entries into one physical file.
#[derive(Debug)]
pub struct CompoundFile {
    path: PathBuf,
    file: File,
    directory: Directory,
    read_only: bool,
}

impl CompoundFile {
    /// Opens the container at `path`, creating an empty one if the file does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut compound = Self {
            path,
            file,
            directory: Directory::default(),
            read_only: false,
        };
        if compound.file.metadata()?.len() == 0 {
            debug!("Initialising new compound file {}", compound.path.display());
            compound.persist_directory()?;
        } else {
            compound.directory = compound.load_directory()?;
        }
        Ok(compound)
    }

    /// Opens an existing container for reading only. Mutating calls fail with
    /// [`CompoundFileError::ReadOnly`].
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mut compound = Self {
            path,
            file,
            directory: Directory::default(),
            read_only: true,
        };
        compound.directory = compound.load_directory()?;
        Ok(compound)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begins a new entry. The entry becomes visible once the returned writer is closed.
    pub fn add_entry(&mut self, name: &str) -> Result<EntryWriter<'_>> {
        if self.read_only {
            return Err(CompoundFileError::ReadOnly { name: name.to_string() });
        }
        if self.directory.entries.contains_key(name) {
            return Err(CompoundFileError::EntryExists { name: name.to_string() });
        }
        trace!("Opening writer for entry '{}' in {}", name, self.path.display());
        Ok(EntryWriter {
            container: self,
            name: name.to_string(),
            buffer: Vec::new(),
            closed: false,
        })
    }

    /// Opens a reader positioned at the start of the named entry's payload.
    pub fn read_entry(&self, name: &str) -> Result<EntryReader> {
        let slot = self
            .directory
            .entries
            .get(name)
            .copied()
            .ok_or_else(|| CompoundFileError::NotFound { name: name.to_string() })?;

        // A separate handle per reader keeps readers' cursors independent.
        let mut handle = File::open(&self.path)?;
        handle.seek(SeekFrom::Start(slot.extent.offset))?;
        let mut prefix = [0u8; 4];
        handle.read_exact(&mut prefix)?;
        let stored_len = u32::from_be_bytes(prefix);
        if stored_len != slot.len {
            return Err(CompoundFileError::Corrupt {
                path: self.path.display().to_string(),
                reason: format!(
                    "entry '{}' length prefix is {} but directory records {}",
                    name, stored_len, slot.len
                ),
            });
        }
        Ok(EntryReader {
            name: name.to_string(),
            reader: BufReader::new(handle),
            remaining: u64::from(slot.len),
        })
    }

    /// Removes an entry and makes its storage available to later entries.
    pub fn delete_entry(&mut self, name: &str) -> Result<()> {
        if self.read_only {
            return Err(CompoundFileError::ReadOnly { name: name.to_string() });
        }
        let slot = self
            .directory
            .entries
            .remove(name)
            .ok_or_else(|| CompoundFileError::NotFound { name: name.to_string() })?;
        debug!(
            "Deleted entry '{}' ({} bytes at offset {}) from {}",
            name, slot.len, slot.extent.offset, self.path.display()
        );
        self.release(slot.extent);
        self.persist_directory()
    }

    /// Names of all entries, sorted.
    pub fn list_entries(&self) -> Vec<String> {
        self.directory.entries.keys().cloned().collect()
    }

    pub fn contains_entry(&self, name: &str) -> bool {
        self.directory.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.directory.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directory.entries.is_empty()
    }

    /// Payload length of an entry, if present.
    pub fn entry_len(&self, name: &str) -> Option<u64> {
        self.directory.entries.get(name).map(|slot| u64::from(slot.len))
    }

    /// Bytes currently held in the free list.
    pub fn free_bytes(&self) -> u64 {
        self.directory.free.iter().map(|e| e.capacity).sum()
    }

    /// End of the data region, i.e. where the directory starts.
    pub fn data_end(&self) -> u64 {
        self.directory.data_end
    }

    /// Flushes file contents to the device.
    pub fn flush(&mut self) -> Result<()> {
        if !self.read_only {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Flushes and releases the file handle.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    fn commit(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| CompoundFileError::EntryTooLarge {
            name: name.to_string(),
            len: payload.len(),
        })?;
        let extent = self.allocate(LENGTH_PREFIX + payload.len() as u64);
        self.file.seek(SeekFrom::Start(extent.offset))?;
        self.file.write_all(&len.to_be_bytes())?;
        self.file.write_all(payload)?;
        self.directory
            .entries
            .insert(name.to_string(), Slot { extent, len });
        trace!(
            "Committed entry '{}' ({} bytes at offset {}) to {}",
            name, len, extent.offset, self.path.display()
        );
        self.persist_directory()
    }

    fn allocate(&mut self, needed: u64) -> Extent {
        let reusable = self
            .directory
            .free
            .iter()
            .position(|extent| extent.capacity >= needed);
        if let Some(index) = reusable {
            let free_extent = self.directory.free[index];
            let remainder = free_extent.capacity - needed;
            if remainder >= MIN_SPLIT_REMAINDER {
                self.directory.free[index] = Extent {
                    offset: free_extent.offset + needed,
                    capacity: remainder,
                };
                Extent { offset: free_extent.offset, capacity: needed }
            } else {
                self.directory.free.remove(index);
                free_extent
            }
        } else {
            let extent = Extent { offset: self.directory.data_end, capacity: needed };
            self.directory.data_end += needed;
            extent
        }
    }

    fn release(&mut self, extent: Extent) {
        let free = &mut self.directory.free;
        free.push(extent);
        free.sort_by_key(|e| e.offset);

        let mut merged: Vec<Extent> = Vec::with_capacity(free.len());
        for current in free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end() == current.offset => last.capacity += current.capacity,
                _ => merged.push(current),
            }
        }
        if let Some(last) = merged.last() {
            if last.end() == self.directory.data_end {
                self.directory.data_end = last.offset;
                merged.pop();
            }
        }
        *free = merged;
    }

    fn persist_directory(&mut self) -> Result<()> {
        let encoded = bincode::serde::encode_to_vec(&self.directory, bincode_config())?;
        let directory_offset = self.directory.data_end;

        self.file.seek(SeekFrom::Start(directory_offset))?;
        self.file.write_all(&encoded)?;
        self.file.set_len(directory_offset + encoded.len() as u64)?;

        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        header.extend_from_slice(&directory_offset.to_be_bytes());
        header.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    fn load_directory(&mut self) -> Result<Directory> {
        let corrupt = |reason: String| CompoundFileError::Corrupt {
            path: self.path.display().to_string(),
            reason,
        };

        let file_len = self.file.metadata()?.len();
        if file_len < HEADER_LEN {
            return Err(corrupt(format!("file is {} bytes, shorter than the header", file_len)));
        }
        let mut header = [0u8; HEADER_LEN as usize];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut header)?;
        if &header[0..4] != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }
        let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&header[8..16]);
        let directory_offset = u64::from_be_bytes(word);
        word.copy_from_slice(&header[16..24]);
        let directory_len = u64::from_be_bytes(word);
        if directory_offset < HEADER_LEN || directory_offset + directory_len > file_len {
            return Err(corrupt(format!(
                "directory at {}+{} lies outside the file ({} bytes)",
                directory_offset, directory_len, file_len
            )));
        }

        let mut encoded = vec![0u8; directory_len as usize];
        self.file.seek(SeekFrom::Start(directory_offset))?;
        self.file.read_exact(&mut encoded)?;
        let (directory, _): (Directory, usize) =
            bincode::serde::decode_from_slice(&encoded, bincode_config())?;
        if directory.data_end != directory_offset {
            return Err(corrupt(format!(
                "directory records data end {} but is stored at {}",
                directory.data_end, directory_offset
            )));
        }
        debug!(
            "Loaded compound file {} with {} entries",
            self.path.display(),
            directory.entries.len()
        );
        Ok(directory)
    }
}

/// Buffered writer for one entry. Holds the container's only mutable borrow
/// until closed.
pub struct EntryWriter<'a> {
    container: &'a mut CompoundFile,
    name: String,
    buffer: Vec<u8>,
    closed: bool,
}

impl EntryWriter<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64_slice(&mut self, values: &[f64]) {
        self.buffer.reserve(values.len() * 8);
        for value in values {
            self.write_f64(*value);
        }
    }

    /// Writes a UTF-8 string with a 4-byte length prefix.
    pub fn write_utf(&mut self, value: &str) -> Result<()> {
        let len = u32::try_from(value.len()).map_err(|_| CompoundFileError::EntryTooLarge {
            name: self.name.clone(),
            len: value.len(),
        })?;
        self.buffer.extend_from_slice(&len.to_be_bytes());
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Writes an opaque serialized object: a 4-byte length followed by its bincode encoding.
    pub fn write_object<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let encoded = bincode::serde::encode_to_vec(value, bincode_config())?;
        let len = u32::try_from(encoded.len()).map_err(|_| CompoundFileError::EntryTooLarge {
            name: self.name.clone(),
            len: encoded.len(),
        })?;
        self.buffer.extend_from_slice(&len.to_be_bytes());
        self.buffer.extend_from_slice(&encoded);
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.buffer.len()
    }

    /// Finalises the entry and makes it visible to readers.
    pub fn close(mut self) -> Result<()> {
        let payload = std::mem::take(&mut self.buffer);
        let name = std::mem::take(&mut self.name);
        self.closed = true;
        self.container.commit(&name, &payload)
    }
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Drop for EntryWriter<'_> {
    fn drop(&mut self) {
        if !self.closed {
            debug!(
                "Entry writer for '{}' dropped without close; {} buffered bytes discarded",
                self.name,
                self.buffer.len()
            );
        }
    }
}

/// Sequential reader over one entry's payload, bounded by the entry length.
#[derive(Debug)]
pub struct EntryReader {
    name: String,
    reader: BufReader<File>,
    remaining: u64,
}

impl EntryReader {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload bytes not yet consumed.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    fn ensure(&self, requested: u64) -> Result<()> {
        if requested > self.remaining {
            return Err(CompoundFileError::ReadPastEnd {
                name: self.name.clone(),
                requested,
                remaining: self.remaining,
            });
        }
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.ensure(N as u64)?;
        let mut bytes = [0u8; N];
        self.reader.read_exact(&mut bytes)?;
        self.remaining -= N as u64;
        Ok(bytes)
    }

    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        self.ensure(len as u64)?;
        let mut bytes = vec![0u8; len];
        self.reader.read_exact(&mut bytes)?;
        self.remaining -= len as u64;
        Ok(bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.read_array()?))
    }

    pub fn read_f64_vec(&mut self, count: usize) -> Result<Vec<f64>> {
        self.ensure(count as u64 * 8)?;
        (0..count).map(|_| self.read_f64()).collect()
    }

    pub fn read_utf(&mut self) -> Result<String> {
        let len = u32::from_be_bytes(self.read_array()?) as usize;
        let bytes = self.read_vec(len)?;
        String::from_utf8(bytes).map_err(|_| CompoundFileError::InvalidUtf8 { name: self.name.clone() })
    }

    pub fn read_object<T: DeserializeOwned>(&mut self) -> Result<T> {
        let len = u32::from_be_bytes(self.read_array()?) as usize;
        let encoded = self.read_vec(len)?;
        let (value, _): (T, usize) = bincode::serde::decode_from_slice(&encoded, bincode_config())?;
        Ok(value)
    }

    /// Skips `n` payload bytes without materialising them.
    pub fn skip_bytes(&mut self, n: u64) -> Result<()> {
        self.ensure(n)?;
        let offset = i64::try_from(n).map_err(|_| CompoundFileError::ReadPastEnd {
            name: self.name.clone(),
            requested: n,
            remaining: self.remaining,
        })?;
        self.reader.seek_relative(offset)?;
        self.remaining -= n;
        Ok(())
    }

    /// Reads every remaining payload byte.
    pub fn read_to_vec(&mut self) -> Result<Vec<u8>> {
        self.read_vec(self.remaining as usize)
    }
}
