//! Iterative solvers
//!
//! - PCG: preconditioned conjugate gradient with in-place operators

pub mod cg;

pub use cg::*;
