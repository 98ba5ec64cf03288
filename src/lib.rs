//! MTV-Recon: multi-channel total variation reconstruction of volumetric images
//!
//! Joint denoising or super-resolution of several co-registered image
//! channels (MRI contrasts, CT). A coupled total-variation prior makes the
//! channels share edge locations; the objective is optimised by ADMM in the
//! gradient domain, optionally with rigid registration and bias-field
//! estimation.
//!
//! # Modules
//! - `volume`: lattices, volumes and their storage backends
//! - `projection`: forward/adjoint operators (resampling, slice profile, rigid motion)
//! - `channel`: per-channel aggregates of observations and latent volumes
//! - `prox_tv`, `image_update`, `hessian`: the ADMM sub-problems
//! - `registration`, `bias`: nuisance-parameter updates
//! - `schedule`, `hyperparams`: regularisation schedule and noise estimation
//! - `driver`: the outer reconstruction loop
//! - `nifti_io`: NIfTI read/write
//! - `fft`, `solvers`, `utils`: numerical building blocks

// Core modules
pub mod config;
pub mod error;
pub mod fft;
pub mod parallel;
pub mod volume;

// Numerical building blocks
pub mod solvers;
pub mod utils;

// Model
pub mod channel;
pub mod hessian;
pub mod projection;

// Optimisation
pub mod bias;
pub mod driver;
pub mod hyperparams;
pub mod image_update;
pub mod prox_tv;
pub mod registration;
pub mod schedule;

// I/O
pub mod nifti_io;

pub use config::{MeanCorrection, Method, Modality, MtvConfig, SliceProfileKind};
pub use driver::{
    reconstruct, reconstruct_with_progress, validate_problem, ChannelInput, IterationReport, MtvProblem,
    ObservationInput, Progress, Reconstruction, ReconstructedChannel, TraceEntry, UpdateKind,
};
pub use error::{MtvError, Result};
pub use volume::{BoundaryCondition, Lattice, StorageKind, Volume};
