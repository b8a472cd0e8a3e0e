//! Physical region restriction

use amrsurf_core::{Error, Result};
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

/// Axis-aligned physical box limiting where surfaces are extracted
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalBox {
    pub lo: [f64; 3],
    pub hi: [f64; 3],
}

impl PhysicalBox {
    /// Create a box, rejecting inverted extents
    pub fn new(lo: [f64; 3], hi: [f64; 3]) -> Result<Self> {
        for axis in 0..3 {
            if !(lo[axis] < hi[axis]) {
                return Err(Error::Config(format!(
                    "Region lower corner {:?} must be below upper corner {:?}",
                    lo, hi
                )));
            }
        }
        Ok(Self { lo, hi })
    }

    /// Build from `[x_lo, y_lo, z_lo, x_hi, y_hi, z_hi]`
    pub fn from_values(values: &[f64]) -> Result<Self> {
        let [x0, y0, z0, x1, y1, z1] = values else {
            return Err(Error::Config(format!(
                "Region needs 6 values (x_lo y_lo z_lo x_hi y_hi z_hi), got {}",
                values.len()
            )));
        };
        Self::new([*x0, *y0, *z0], [*x1, *y1, *z1])
    }

    /// Whether a coordinate lies inside the box along `axis`
    pub fn contains_coord(&self, axis: usize, coord: f64) -> bool {
        coord >= self.lo[axis] && coord <= self.hi[axis]
    }
}

/// Clear mask cells whose centre lies outside `region`.
///
/// `origin` is the centre of cell `[0, 0, 0]`; cell centres are
/// `origin + index * spacing`.
pub fn restrict_mask(
    mask: &mut Array3<bool>,
    origin: [f64; 3],
    spacing: [f64; 3],
    region: &PhysicalBox,
) {
    let inside_axis = |axis: usize, n: usize| -> Vec<bool> {
        (0..n)
            .map(|i| region.contains_coord(axis, origin[axis] + i as f64 * spacing[axis]))
            .collect()
    };
    let shape = mask.shape().to_vec();
    let ix = inside_axis(0, shape[0]);
    let iy = inside_axis(1, shape[1]);
    let iz = inside_axis(2, shape[2]);

    Zip::indexed(mask).for_each(|(i, j, k), valid| {
        *valid = *valid && ix[i] && iy[j] && iz[k];
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_values() {
        let b = PhysicalBox::from_values(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(b.lo, [0.0, 1.0, 2.0]);
        assert_eq!(b.hi, [3.0, 4.0, 5.0]);
        assert!(PhysicalBox::from_values(&[0.0, 1.0, 2.0, 3.0]).is_err());
        assert!(PhysicalBox::from_values(&[1.0, 0.0, 0.0, 0.0, 1.0, 1.0]).is_err());
    }

    #[test]
    fn test_restrict_mask_clears_outside_cells() {
        let mut mask = Array3::from_elem((4, 4, 4), true);
        mask[[1, 1, 1]] = false;
        // Cell centres at 0.5, 1.5, 2.5, 3.5 on each axis
        let region = PhysicalBox::new([1.0, 0.0, 0.0], [3.0, 4.0, 2.0]).unwrap();
        restrict_mask(&mut mask, [0.5; 3], [1.0; 3], &region);

        assert!(!mask[[0, 0, 0]]);
        assert!(mask[[1, 0, 0]]);
        assert!(mask[[2, 3, 1]]);
        assert!(!mask[[2, 3, 2]]);
        assert!(!mask[[3, 0, 0]]);
        // Already-invalid cells stay invalid
        assert!(!mask[[1, 1, 1]]);
        assert_eq!(mask.iter().filter(|&&v| v).count(), 2 * 4 * 2 - 1);
    }
}
