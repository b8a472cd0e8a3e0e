//! # amrsurf Algorithms
//!
//! Preprocessing applied to a patch's field before surface extraction:
//! Gaussian smoothing, finite-difference gradients and masking of cells
//! outside a physical region of interest.

pub mod filtering;
pub mod region;

pub use filtering::*;
pub use region::*;
