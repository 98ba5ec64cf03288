//! NIfTI file I/O
//!
//! The boundary between files on disk and in-crate [`Volume`]s. Reading goes
//! through a [`VolumeLoader`] so callers can plug in other formats; writing a
//! finished [`Reconstruction`] uses the `{prefix}_{name}` naming convention.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};

use crate::config::Method;
use crate::driver::{ChannelInput, ObservationInput, Reconstruction};
use crate::error::{MtvError, Result};
use crate::volume::{Lattice, StorageKind, Volume};

/// NIfTI data loaded from bytes
pub struct NiftiData {
    /// Volume data as f64, Fortran order, scaling applied
    pub data: Vec<f64>,
    pub dims: [usize; 3],
    /// Voxel sizes in mm
    pub voxel_size: [f64; 3],
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

impl NiftiData {
    pub fn lattice(&self) -> Lattice {
        Lattice::from_affine(self.dims, &self.affine)
    }
}

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Get header info for diagnostics
fn get_header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("File too small ({} bytes, need at least 348)", bytes.len());
    }

    // NIfTI-1 header size should be at offset 0, stored as i32
    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);

    // Magic bytes at offset 344 for NIfTI-1
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();

    // Data type at offset 70 (dim[0..8] at 40, then datatype at 70)
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);

    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Load a NIfTI volume from bytes
///
/// Supports both .nii and .nii.gz (gzip is auto-detected) and 2D or 3D
/// images; for 4D inputs only the first volume is kept.
pub fn load_nifti(bytes: &[u8]) -> Result<NiftiData> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        let decoder = GzDecoder::new(Cursor::new(bytes));
        InMemNiftiObject::from_reader(decoder).map_err(|e| {
            // Try to get header info from decompressed data
            let mut decompressed = Vec::new();
            let info = if GzDecoder::new(Cursor::new(bytes)).read_to_end(&mut decompressed).is_ok() {
                get_header_info(&decompressed)
            } else {
                "Could not decompress".to_string()
            };
            MtvError::Nifti(format!("Failed to read gzipped NIfTI: {} ({})", e, info))
        })?
    } else {
        let info = get_header_info(bytes);
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| MtvError::Nifti(format!("Failed to read NIfTI: {} ({})", e, info)))?
    };

    let header = obj.header();
    let ndim = header.dim[0] as usize;
    if ndim < 2 {
        return Err(MtvError::Nifti(format!("Expected a 2D or 3D image, got {}D", ndim)));
    }

    // Get voxel sizes
    let pixdim = header.pixdim;
    let voxel_size = [pixdim[1] as f64, pixdim[2] as f64, pixdim[3].max(f32::EPSILON) as f64];
    if voxel_size.iter().any(|&v| !(v > 0.0)) {
        return Err(MtvError::Nifti(format!("Invalid voxel size {:?}", voxel_size)));
    }

    // Get affine matrix
    let affine = get_affine(header);

    // Convert volume to ndarray (applies scl_slope / scl_inter)
    let volume = obj.into_volume();
    let array: Array<f64, _> = volume
        .into_ndarray()
        .map_err(|e| MtvError::Nifti(format!("Failed to convert to ndarray: {}", e)))?;

    // Use the actual array shape for dimensions (nifti-rs may reorder)
    let shape = array.shape().to_vec();
    let dims = match shape.len() {
        2 => [shape[0], shape[1], 1],
        n if n >= 3 => [shape[0], shape[1], shape[2]],
        n => return Err(MtvError::Nifti(format!("Expected at least 2D array, got {}D", n))),
    };

    // Extract data in Fortran order (x varies fastest) to match NIfTI convention
    // index = x + y*nx + z*nx*ny
    let mut data = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
    for k in 0..dims[2] {
        for j in 0..dims[1] {
            for i in 0..dims[0] {
                let v = match shape.len() {
                    2 => array[[i, j]],
                    3 => array[[i, j, k]],
                    _ => {
                        // Higher-dimensional arrays: take the first volume
                        let mut index = vec![0usize; shape.len()];
                        index[0] = i;
                        index[1] = j;
                        index[2] = k;
                        array[index.as_slice()]
                    }
                };
                data.push(v);
            }
        }
    }

    Ok(NiftiData { data, dims, voxel_size, affine })
}

/// Get affine transformation matrix from header
fn get_affine(header: &NiftiHeader) -> [f64; 16] {
    // Prefer sform if available (sform_code > 0)
    if header.sform_code > 0 {
        let s = &header.srow_x;
        let t = &header.srow_y;
        let u = &header.srow_z;
        [
            s[0] as f64, s[1] as f64, s[2] as f64, s[3] as f64,
            t[0] as f64, t[1] as f64, t[2] as f64, t[3] as f64,
            u[0] as f64, u[1] as f64, u[2] as f64, u[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        // Fall back to identity with voxel scaling
        let vsx = header.pixdim[1] as f64;
        let vsy = header.pixdim[2] as f64;
        let vsz = header.pixdim[3].max(f32::EPSILON) as f64;
        [
            vsx, 0.0, 0.0, 0.0,
            0.0, vsy, 0.0, 0.0,
            0.0, 0.0, vsz, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]
    }
}

/// Save data as NIfTI bytes
///
/// Writes an uncompressed .nii file
pub fn save_nifti(
    data: &[f64],
    dims: [usize; 3],
    voxel_size: [f64; 3],
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    use std::io::Write;

    let [nx, ny, nz] = dims;
    let [vsx, vsy, vsz] = voxel_size;
    if dims.iter().any(|&d| d > i16::MAX as usize) {
        return Err(MtvError::Nifti(format!("dimensions {:?} exceed the NIfTI-1 limit", dims)));
    }

    // Create NIfTI-1 header (348 bytes)
    let mut header = [0u8; 348];

    // sizeof_hdr = 348
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    // dim[0..7]
    let ndim = if nz == 1 { 2 } else { 3 };
    let dim: [i16; 8] = [ndim, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, &d) in dim.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // datatype = 16 (FLOAT32)
    header[70..72].copy_from_slice(&16i16.to_le_bytes());

    // bitpix = 32
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    // pixdim[0..7]
    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // vox_offset = 352 (header + 4 bytes extension)
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());

    // scl_slope = 1.0
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());

    // scl_inter = 0.0
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform_code = 1 (scanner anat)
    header[254..256].copy_from_slice(&1i16.to_le_bytes());

    // srow_x, srow_y, srow_z
    for i in 0..4 {
        let offset = 280 + i * 4;
        header[offset..offset + 4].copy_from_slice(&(affine[i] as f32).to_le_bytes());
    }
    for i in 0..4 {
        let offset = 296 + i * 4;
        header[offset..offset + 4].copy_from_slice(&(affine[4 + i] as f32).to_le_bytes());
    }
    for i in 0..4 {
        let offset = 312 + i * 4;
        header[offset..offset + 4].copy_from_slice(&(affine[8 + i] as f32).to_le_bytes());
    }

    // magic = "n+1\0" for NIfTI-1 single file
    header[344..348].copy_from_slice(b"n+1\0");

    // Build output buffer
    let mut buffer = Vec::with_capacity(352 + data.len() * 4);

    buffer.write_all(&header)?;

    // Write extension (4 bytes, all zeros = no extension)
    buffer.write_all(&[0u8; 4])?;

    // Write data as float32
    for &val in data {
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }

    Ok(buffer)
}

/// Save data as gzipped NIfTI bytes (.nii.gz)
pub fn save_nifti_gz(
    data: &[f64],
    dims: [usize; 3],
    voxel_size: [f64; 3],
    affine: &[f64; 16],
) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    // First create uncompressed NIfTI
    let uncompressed = save_nifti(data, dims, voxel_size, affine)?;

    // Compress with gzip
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&uncompressed)?;
    Ok(encoder.finish()?)
}


// ============================================================================
// Loader boundary
// ============================================================================

/// A named volume read from some location
pub struct LoadedVolume {
    pub name: String,
    pub volume: Volume,
}

/// Source of observed volumes, keyed by a location identifier
pub trait VolumeLoader {
    fn load(&self, location: &Path) -> Result<LoadedVolume>;
}

/// Reads `.nii` / `.nii.gz` files into volumes on the chosen storage backend
#[derive(Debug, Clone, Default)]
pub struct NiftiLoader {
    pub storage: StorageKind,
}

impl NiftiLoader {
    pub fn new(storage: StorageKind) -> Self {
        Self { storage }
    }
}

impl VolumeLoader for NiftiLoader {
    fn load(&self, location: &Path) -> Result<LoadedVolume> {
        let bytes = fs::read(location)?;
        let nii = load_nifti(&bytes)?;
        let lattice = nii.lattice();
        log::debug!(
            "loaded {} dims={:?} voxel_size={:?}",
            location.display(), nii.dims, nii.voxel_size
        );
        Ok(LoadedVolume {
            name: volume_name(location),
            volume: Volume::new(lattice, nii.data, &self.storage)?,
        })
    }
}

/// Load the observations of one channel; the channel takes the name of
/// its first file
pub fn load_channel(loader: &dyn VolumeLoader, paths: &[PathBuf]) -> Result<ChannelInput> {
    let mut name = None;
    let mut observations = Vec::with_capacity(paths.len());
    for path in paths {
        let loaded = loader.load(path)?;
        name.get_or_insert(loaded.name);
        let lattice = loaded.volume.lattice().clone();
        observations.push(ObservationInput::new(lattice, loaded.volume.to_vec()?));
    }
    let name = name.ok_or_else(|| MtvError::config("a channel needs at least one input file"))?;
    Ok(ChannelInput::new(name, observations))
}

/// File name without directory and without `.nii` / `.nii.gz`
pub fn volume_name(path: &Path) -> String {
    let file = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    for ext in [".nii.gz", ".nii"] {
        if let Some(stem) = file.strip_suffix(ext) {
            return stem.to_string();
        }
    }
    match file.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file,
    }
}

/// Output naming convention: `sr_<name>` or `den_<name>`
pub fn output_name(method: Method, name: &str) -> String {
    format!("{}_{}", method.prefix(), name)
}

/// Write one lattice-shaped buffer to `path` (gzip when it ends in `.gz`)
pub fn write_volume(path: &Path, lattice: &Lattice, data: &[f64]) -> Result<()> {
    crate::error::check_len(lattice.n_voxels(), data.len())?;
    let affine = lattice.to_affine();
    let gz = path.extension().map_or(false, |e| e == "gz");
    let bytes = if gz {
        save_nifti_gz(data, lattice.dims, lattice.voxel_size(), &affine)?
    } else {
        save_nifti(data, lattice.dims, lattice.voxel_size(), &affine)?
    };
    fs::write(path, bytes)?;
    Ok(())
}

/// Write every reconstructed channel to `output_dir/<output_name>.nii`
///
/// Returns the written paths in channel order.
pub fn write_reconstruction(recon: &Reconstruction, output_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)?;
    let mut paths = Vec::with_capacity(recon.channels.len());
    for channel in &recon.channels {
        let path = output_dir.join(format!("{}.nii", channel.output_name));
        write_volume(&path, &recon.lattice, &channel.data)?;
        log::info!("wrote {}", path.display());
        paths.push(path);
    }
    Ok(paths)
}
