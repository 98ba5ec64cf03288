//! Utility functions shared by the reconstruction modules
//!
//! - Gradient operators (forward/backward differences) with explicit boundary conditions
//! - BLAS-1 style vector kernels
//! - Validity masks and image quality measures

pub mod gradient;
pub mod metrics;
pub mod vec_ops;

pub use gradient::*;
pub use metrics::*;
pub use vec_ops::*;
