//! # amrsurf Reconstruction
//!
//! Isosurface extraction over block-structured AMR hierarchies.
//!
//! This crate pads patches with ghost zones, triangulates them with masked
//! marching cubes, accumulates fragments per rank and merges the ranks into
//! one surface per snapshot.

pub mod collective;
pub mod ghost;
pub mod marching_cubes;
pub mod parallel;
pub mod pipeline;

// Re-export commonly used items
pub use collective::*;
pub use ghost::*;
pub use marching_cubes::*;
pub use pipeline::*;
