//! Backing stores for voxel data.
//!
//! Algorithms only see the [`VolumeStore`] contract; whether the voxels live
//! in memory or in a temporary file is decided once, at construction.

use std::borrow::Cow;
use std::fmt;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::error::{check_len, MtvError, Result};

pub trait VolumeStore: Send + Sync + fmt::Debug {
    /// Number of voxels held
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read access to the voxel buffer
    fn read(&self) -> Result<Cow<'_, [f64]>>;

    /// Replace the whole voxel buffer
    fn write(&mut self, data: &[f64]) -> Result<()>;

    /// Mutate the voxel buffer in place
    fn modify(&mut self, f: &mut dyn FnMut(&mut [f64])) -> Result<()>;
}

/// Voxels held resident in a `Vec<f64>`
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    data: Vec<f64>,
}

impl InMemoryStore {
    pub fn new(data: Vec<f64>) -> Self {
        Self { data }
    }
}

impl VolumeStore for InMemoryStore {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn read(&self) -> Result<Cow<'_, [f64]>> {
        Ok(Cow::Borrowed(&self.data))
    }

    fn write(&mut self, data: &[f64]) -> Result<()> {
        check_len(self.data.len(), data.len())?;
        self.data.copy_from_slice(data);
        Ok(())
    }

    fn modify(&mut self, f: &mut dyn FnMut(&mut [f64])) -> Result<()> {
        f(&mut self.data);
        Ok(())
    }
}

/// Voxels paged out to a temporary file as little-endian f64
pub struct PagedStore {
    file: Mutex<NamedTempFile>,
    len: usize,
}

impl fmt::Debug for PagedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagedStore").field("len", &self.len).finish()
    }
}

impl PagedStore {
    /// Create a paged store in `dir` (or the system temp dir) holding `data`
    pub fn new(data: &[f64], dir: Option<&Path>) -> Result<Self> {
        let file = match dir {
            Some(d) => NamedTempFile::new_in(d)?,
            None => NamedTempFile::new()?,
        };
        let mut store = Self { file: Mutex::new(file), len: data.len() };
        store.write(data)?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, NamedTempFile>> {
        self.file
            .lock()
            .map_err(|_| MtvError::Numerical("paged volume lock poisoned".to_string()))
    }

    fn load(&self) -> Result<Vec<f64>> {
        let mut guard = self.lock()?;
        let file = guard.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = vec![0u8; self.len * 8];
        file.read_exact(&mut bytes)?;
        Ok(bytes
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                f64::from_le_bytes(b)
            })
            .collect())
    }
}

impl VolumeStore for PagedStore {
    fn len(&self) -> usize {
        self.len
    }

    fn read(&self) -> Result<Cow<'_, [f64]>> {
        Ok(Cow::Owned(self.load()?))
    }

    fn write(&mut self, data: &[f64]) -> Result<()> {
        check_len(self.len, data.len())?;
        let mut bytes = Vec::with_capacity(data.len() * 8);
        for &v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let mut guard = self.lock()?;
        let file = guard.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&bytes)?;
        file.flush()?;
        Ok(())
    }

    fn modify(&mut self, f: &mut dyn FnMut(&mut [f64])) -> Result<()> {
        let mut data = self.load()?;
        f(&mut data);
        self.write(&data)
    }
}
