//! Volumes: voxel data on a lattice, behind a storage backend
//!
//! - `lattice`: grid geometry and boundary condition
//! - `storage`: resident and file-backed voxel stores

pub mod lattice;
pub mod storage;

pub use lattice::*;
pub use storage::*;

use std::borrow::Cow;
use std::path::PathBuf;

use crate::error::{check_len, Result};

/// Where voxel buffers are kept
#[derive(Debug, Clone, Default)]
pub enum StorageKind {
    #[default]
    InMemory,
    /// File-backed temporaries, optionally in a given directory
    Paged { dir: Option<PathBuf> },
}

/// Voxel data on a lattice
#[derive(Debug)]
pub struct Volume {
    lattice: Lattice,
    store: Box<dyn VolumeStore>,
}

impl Volume {
    pub fn new(lattice: Lattice, data: Vec<f64>, storage: &StorageKind) -> Result<Self> {
        check_len(lattice.n_voxels(), data.len())?;
        let store: Box<dyn VolumeStore> = match storage {
            StorageKind::InMemory => Box::new(InMemoryStore::new(data)),
            StorageKind::Paged { dir } => Box::new(PagedStore::new(&data, dir.as_deref())?),
        };
        Ok(Self { lattice, store })
    }

    pub fn filled(lattice: Lattice, value: f64, storage: &StorageKind) -> Result<Self> {
        let n = lattice.n_voxels();
        Self::new(lattice, vec![value; n], storage)
    }

    pub fn in_memory(lattice: Lattice, data: Vec<f64>) -> Result<Self> {
        Self::new(lattice, data, &StorageKind::InMemory)
    }

    #[inline]
    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn read(&self) -> Result<Cow<'_, [f64]>> {
        self.store.read()
    }

    pub fn to_vec(&self) -> Result<Vec<f64>> {
        Ok(self.store.read()?.into_owned())
    }

    pub fn write(&mut self, data: &[f64]) -> Result<()> {
        self.store.write(data)
    }

    pub fn modify<F: FnMut(&mut [f64])>(&mut self, mut f: F) -> Result<()> {
        self.store.modify(&mut f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_rejects_bad_length() {
        let lat = Lattice::from_voxel_size([2, 2, 2], [1.0; 3], [0.0; 3]);
        assert!(Volume::in_memory(lat.clone(), vec![0.0; 7]).is_err());
        assert!(Volume::in_memory(lat, vec![0.0; 8]).is_ok());
    }

    #[test]
    fn test_storage_backends_agree() {
        let lat = Lattice::from_voxel_size([3, 2, 1], [1.0; 3], [0.0; 3]);
        let data: Vec<f64> = (0..6).map(|i| i as f64 * 0.25).collect();
        let mut mem = Volume::new(lat.clone(), data.clone(), &StorageKind::InMemory).unwrap();
        let mut paged = Volume::new(lat, data, &StorageKind::Paged { dir: None }).unwrap();

        for v in [&mut mem, &mut paged] {
            v.modify(|d| d[0] = 9.0).unwrap();
        }
        assert_eq!(mem.to_vec().unwrap(), paged.to_vec().unwrap());
        assert_eq!(paged.read().unwrap()[0], 9.0);
    }
}
