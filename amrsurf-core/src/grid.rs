//! Block-structured grid primitives
//!
//! Index boxes live in the integer index space of one refinement level.
//! Patches are rectangular blocks of cells at a single level, carrying a
//! validity mask that marks cells not overridden by a finer patch.

use crate::{Error, Point3d, Result};
use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Inclusive box of cell indices in one level's index space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexBox {
    pub lo: [i64; 3],
    pub hi: [i64; 3],
}

impl IndexBox {
    /// Create a box from its inclusive corners
    pub fn new(lo: [i64; 3], hi: [i64; 3]) -> Self {
        Self { lo, hi }
    }

    /// Create a box from a start index and a cell count per axis
    pub fn from_start_dims(start: [i64; 3], dims: [usize; 3]) -> Self {
        let hi = [
            start[0] + dims[0] as i64 - 1,
            start[1] + dims[1] as i64 - 1,
            start[2] + dims[2] as i64 - 1,
        ];
        Self { lo: start, hi }
    }

    /// Cell counts along each axis (zero for an empty axis)
    pub fn dims(&self) -> [usize; 3] {
        let mut dims = [0usize; 3];
        for axis in 0..3 {
            dims[axis] = (self.hi[axis] - self.lo[axis] + 1).max(0) as usize;
        }
        dims
    }

    /// Total number of cells
    pub fn num_cells(&self) -> usize {
        self.dims().iter().product()
    }

    /// Whether the box holds no cells
    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.hi[axis] < self.lo[axis])
    }

    /// Whether a cell index lies inside the box
    pub fn contains(&self, idx: [i64; 3]) -> bool {
        (0..3).all(|axis| idx[axis] >= self.lo[axis] && idx[axis] <= self.hi[axis])
    }

    /// Whether `other` lies entirely inside this box
    pub fn contains_box(&self, other: &IndexBox) -> bool {
        self.contains(other.lo) && self.contains(other.hi)
    }

    /// Intersection of two boxes, `None` when they do not overlap
    pub fn intersect(&self, other: &IndexBox) -> Option<IndexBox> {
        let mut lo = [0i64; 3];
        let mut hi = [0i64; 3];
        for axis in 0..3 {
            lo[axis] = self.lo[axis].max(other.lo[axis]);
            hi[axis] = self.hi[axis].min(other.hi[axis]);
            if hi[axis] < lo[axis] {
                return None;
            }
        }
        Some(IndexBox { lo, hi })
    }

    /// The same region expressed in a level `ratio` times finer
    pub fn refine(&self, ratio: usize) -> IndexBox {
        let r = ratio as i64;
        IndexBox {
            lo: [self.lo[0] * r, self.lo[1] * r, self.lo[2] * r],
            hi: [
                (self.hi[0] + 1) * r - 1,
                (self.hi[1] + 1) * r - 1,
                (self.hi[2] + 1) * r - 1,
            ],
        }
    }

    /// The coarse cells touched by this box in a level `ratio` times coarser
    pub fn coarsen(&self, ratio: usize) -> IndexBox {
        let r = ratio as i64;
        IndexBox {
            lo: [
                self.lo[0].div_euclid(r),
                self.lo[1].div_euclid(r),
                self.lo[2].div_euclid(r),
            ],
            hi: [
                self.hi[0].div_euclid(r),
                self.hi[1].div_euclid(r),
                self.hi[2].div_euclid(r),
            ],
        }
    }

    /// Iterate all cell indices in x-fastest order
    pub fn iter(&self) -> impl Iterator<Item = [i64; 3]> + '_ {
        let (lo, hi) = (self.lo, self.hi);
        (lo[2]..=hi[2]).flat_map(move |k| {
            (lo[1]..=hi[1]).flat_map(move |j| (lo[0]..=hi[0]).map(move |i| [i, j, k]))
        })
    }
}

/// Physical extent of the simulation domain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainBounds {
    pub left_edge: [f64; 3],
    pub right_edge: [f64; 3],
}

impl DomainBounds {
    /// Create domain bounds, rejecting inverted or degenerate extents
    pub fn new(left_edge: [f64; 3], right_edge: [f64; 3]) -> Result<Self> {
        for axis in 0..3 {
            if !(left_edge[axis] < right_edge[axis]) {
                return Err(Error::InvalidData(format!(
                    "Domain left edge {:?} must be below right edge {:?}",
                    left_edge, right_edge
                )));
            }
        }
        Ok(Self {
            left_edge,
            right_edge,
        })
    }

    /// Domain width along each axis
    pub fn width(&self) -> [f64; 3] {
        [
            self.right_edge[0] - self.left_edge[0],
            self.right_edge[1] - self.left_edge[1],
            self.right_edge[2] - self.left_edge[2],
        ]
    }

    /// Physical coordinate of the centre of cell `index` along `axis`
    pub fn cell_center(&self, axis: usize, index: i64, spacing: f64) -> f64 {
        self.left_edge[axis] + (index as f64 + 0.5) * spacing
    }
}

/// Per-level metadata of a grid hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelInfo {
    pub level: usize,
    /// Index box covering the whole domain at this level
    pub domain_box: IndexBox,
    /// Cell spacing at this level
    pub spacing: [f64; 3],
    /// Refinement ratio relative to the next coarser level (1 on level 0)
    pub ref_ratio: usize,
}

/// One rectangular block of cells at a single refinement level
#[derive(Debug, Clone, PartialEq)]
pub struct GridPatch {
    pub id: usize,
    pub level: usize,
    /// Global start index in the level's index space
    pub start: [i64; 3],
    /// Active cell counts along each axis
    pub dims: [usize; 3],
    /// Cell spacing at the patch's level
    pub spacing: [f64; 3],
    /// `true` where the cell is not covered by a finer patch
    pub mask: Array3<bool>,
}

impl GridPatch {
    /// Create a patch with every cell marked valid
    pub fn new(id: usize, level: usize, index_box: IndexBox, spacing: [f64; 3]) -> Self {
        let dims = index_box.dims();
        Self {
            id,
            level,
            start: index_box.lo,
            dims,
            spacing,
            mask: Array3::from_elem((dims[0], dims[1], dims[2]), true),
        }
    }

    /// The patch's cells as an index box
    pub fn index_box(&self) -> IndexBox {
        IndexBox::from_start_dims(self.start, self.dims)
    }

    /// Number of active cells
    pub fn num_cells(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of cells not overridden by finer data
    pub fn valid_cells(&self) -> usize {
        self.mask.iter().filter(|&&valid| valid).count()
    }

    /// Physical position of the patch's lower corner
    pub fn left_edge(&self, domain: &DomainBounds) -> [f64; 3] {
        let mut edge = [0.0; 3];
        for axis in 0..3 {
            edge[axis] = domain.left_edge[axis] + self.start[axis] as f64 * self.spacing[axis];
        }
        edge
    }

    /// Physical position of the patch's upper corner
    pub fn right_edge(&self, domain: &DomainBounds) -> [f64; 3] {
        let mut edge = self.left_edge(domain);
        for axis in 0..3 {
            edge[axis] += self.dims[axis] as f64 * self.spacing[axis];
        }
        edge
    }

    /// Physical centre of the cell at patch-local index `idx`
    pub fn cell_center(&self, domain: &DomainBounds, idx: [usize; 3]) -> Point3d {
        Point3d::new(
            domain.cell_center(0, self.start[0] + idx[0] as i64, self.spacing[0]),
            domain.cell_center(1, self.start[1] + idx[1] as i64, self.spacing[1]),
            domain.cell_center(2, self.start[2] + idx[2] as i64, self.spacing[2]),
        )
    }
}
