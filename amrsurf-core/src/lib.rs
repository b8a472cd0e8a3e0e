//! Core data structures for amrsurf
//!
//! This crate provides the types shared by every stage of isosurface
//! extraction over adaptive-mesh-refinement data: index boxes, grid patches
//! and their hierarchy, isovalue schedules and the mesh containers that
//! carry triangles from single patches up to a merged snapshot surface.

pub mod error;
pub mod grid;
pub mod hierarchy;
pub mod isovalue;
pub mod mesh;
pub mod point;

pub use error::*;
pub use grid::*;
pub use hierarchy::*;
pub use isovalue::*;
pub use mesh::*;
pub use point::*;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Point3, Vector3};
