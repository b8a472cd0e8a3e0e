//! Ghost-zone reconstruction
//!
//! Pads a patch with neighbouring data so marching cubes can close the seam
//! between adjacent patches. Padding is clipped at the physical domain
//! boundary and ghost cells are never valid cube origins.

use amrsurf_core::{
    CoveringRequest, Error, GridHierarchy, GridPatch, IndexBox, Result, SourceLevels,
};
use ndarray::{s, Array3};

/// Which levels may supply ghost data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Only the patch's level and coarser, coarse data injected
    SingleLevel,
    /// All levels, finer data averaged down
    FinestLevel,
}

/// Ghost-zone settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GhostConfig {
    /// Ghost cells requested on every side
    pub width: usize,
    pub policy: ReadPolicy,
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            width: 1,
            policy: ReadPolicy::FinestLevel,
        }
    }
}

impl GhostConfig {
    /// No padding: the patch's own cells only
    pub fn disabled() -> Self {
        Self {
            width: 0,
            ..Self::default()
        }
    }

    /// Set the ghost width
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width;
        self
    }

    /// Set the read policy
    pub fn with_policy(mut self, policy: ReadPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn source_levels(&self, level: usize) -> SourceLevels {
        match self.policy {
            ReadPolicy::SingleLevel => SourceLevels::UpTo(level),
            ReadPolicy::FinestLevel => SourceLevels::Finest,
        }
    }
}

/// A patch's field and mask enlarged by ghost cells
#[derive(Debug, Clone)]
pub struct PaddedPatch {
    pub field: Array3<f64>,
    pub mask: Array3<bool>,
    /// Global index of the first padded cell
    pub start: [i64; 3],
    pub pad_lo: [usize; 3],
    pub pad_hi: [usize; 3],
    pub spacing: [f64; 3],
    /// Physical centre of the first padded cell
    pub origin: [f64; 3],
}

impl PaddedPatch {
    /// Padded dimensions
    pub fn dims(&self) -> [usize; 3] {
        let (nx, ny, nz) = self.field.dim();
        [nx, ny, nz]
    }
}

/// Ghost cells on each side of `patch`, clipped to `level_box`
pub fn padding(patch: &GridPatch, width: usize, level_box: &IndexBox) -> ([usize; 3], [usize; 3]) {
    let patch_box = patch.index_box();
    let mut lo = [0usize; 3];
    let mut hi = [0usize; 3];
    for axis in 0..3 {
        let room_lo = (patch_box.lo[axis] - level_box.lo[axis]).max(0) as usize;
        let room_hi = (level_box.hi[axis] - patch_box.hi[axis]).max(0) as usize;
        lo[axis] = width.min(room_lo);
        hi[axis] = width.min(room_hi);
    }
    (lo, hi)
}

/// Read `field` over `patch` plus its ghost layer
pub fn reconstruct<H: GridHierarchy + ?Sized>(
    hierarchy: &H,
    patch: &GridPatch,
    field: &str,
    config: &GhostConfig,
) -> Result<PaddedPatch> {
    let level = hierarchy.level(patch.level)?;
    let domain = hierarchy.domain();

    let (pad_lo, pad_hi) = padding(patch, config.width, &level.domain_box);
    let patch_box = patch.index_box();
    let region = IndexBox::new(
        [
            patch_box.lo[0] - pad_lo[0] as i64,
            patch_box.lo[1] - pad_lo[1] as i64,
            patch_box.lo[2] - pad_lo[2] as i64,
        ],
        [
            patch_box.hi[0] + pad_hi[0] as i64,
            patch_box.hi[1] + pad_hi[1] as i64,
            patch_box.hi[2] + pad_hi[2] as i64,
        ],
    );

    let data = if region == patch_box {
        hierarchy.patch_data(patch.id, field)?.into_owned()
    } else {
        hierarchy.covering_grid(&CoveringRequest {
            field,
            level: patch.level,
            region,
            source: config.source_levels(patch.level),
        })?
    };

    let dims = region.dims();
    if data.shape() != &dims[..] {
        return Err(Error::Algorithm(format!(
            "Ghost read for patch {} returned shape {:?}, expected {:?}",
            patch.id,
            data.shape(),
            dims
        )));
    }

    let mut mask = Array3::from_elem((dims[0], dims[1], dims[2]), false);
    mask.slice_mut(s![
        pad_lo[0]..pad_lo[0] + patch.dims[0],
        pad_lo[1]..pad_lo[1] + patch.dims[1],
        pad_lo[2]..pad_lo[2] + patch.dims[2]
    ])
    .assign(&patch.mask);

    let origin = [
        domain.cell_center(0, region.lo[0], patch.spacing[0]),
        domain.cell_center(1, region.lo[1], patch.spacing[1]),
        domain.cell_center(2, region.lo[2], patch.spacing[2]),
    ];

    log::trace!(
        "Patch {} padded by {:?}/{:?} to {:?}",
        patch.id,
        pad_lo,
        pad_hi,
        dims
    );

    Ok(PaddedPatch {
        field: data,
        mask,
        start: region.lo,
        pad_lo,
        pad_hi,
        spacing: patch.spacing,
        origin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use amrsurf_core::{DomainBounds, HierarchyBuilder, InMemoryHierarchy};
    use approx::assert_relative_eq;

    fn hierarchy() -> InMemoryHierarchy {
        let domain = DomainBounds::new([0.0; 3], [1.0; 3]).unwrap();
        let mut h = HierarchyBuilder::new(domain, [8, 8, 8])
            .base_boxes(vec![
                IndexBox::new([0, 0, 0], [3, 7, 7]),
                IndexBox::new([4, 0, 0], [7, 7, 7]),
            ])
            .add_level(2, vec![IndexBox::new([4, 4, 4], [11, 11, 11])])
            .build()
            .unwrap();
        h.fill_field("x", |p| p.x);
        h
    }

    #[test]
    fn test_padding_interior_and_boundary() {
        let h = hierarchy();
        let level1 = &h.levels()[1];
        let fine = &h.patches()[2];
        assert_eq!(padding(fine, 2, &level1.domain_box), ([2; 3], [2; 3]));
        assert_eq!(padding(fine, 5, &level1.domain_box), ([4; 3], [4; 3]));

        let left = &h.patches()[0];
        let level0 = &h.levels()[0];
        assert_eq!(padding(left, 1, &level0.domain_box), ([0, 0, 0], [1, 0, 0]));
    }

    #[test]
    fn test_reconstruct_interior_patch_shape() {
        let h = hierarchy();
        let fine = &h.patches()[2];
        let config = GhostConfig::default().with_width(2);
        let padded = reconstruct(&h, fine, "x", &config).unwrap();

        assert_eq!(padded.dims(), [12, 12, 12]);
        assert_eq!(padded.mask.shape(), &[12, 12, 12]);
        assert_eq!(padded.start, [2, 2, 2]);
        assert_eq!(padded.mask.iter().filter(|&&v| v).count(), 512);
        assert!(!padded.mask[[1, 5, 5]]);
        assert!(padded.mask[[2, 5, 5]]);
        assert!(!padded.mask[[10, 5, 5]]);

        // Ghost values come from the coarse level, injected
        assert_relative_eq!(padded.origin[0], 2.5 * 0.0625);
        assert_relative_eq!(padded.field[[0, 5, 5]], 1.5 * 0.125);
        assert_relative_eq!(padded.field[[2, 5, 5]], 4.5 * 0.0625);
    }

    #[test]
    fn test_reconstruct_one_sided() {
        let h = hierarchy();
        let left = &h.patches()[0];
        let padded = reconstruct(&h, left, "x", &GhostConfig::default()).unwrap();

        assert_eq!(padded.pad_lo, [0, 0, 0]);
        assert_eq!(padded.pad_hi, [1, 0, 0]);
        assert_eq!(padded.dims(), [5, 8, 8]);
        // Ghost column read from the right patch, averaged from level 1 where refined
        assert_relative_eq!(padded.field[[4, 0, 0]], 4.5 * 0.125);
        assert_relative_eq!(padded.field[[4, 4, 4]], 0.5 * (8.5 + 9.5) * 0.0625);
        assert!(padded.mask.slice(s![4, .., ..]).iter().all(|&v| !v));
        // The patch's own invalid cells stay invalid
        assert!(!padded.mask[[2, 2, 2]]);
    }

    #[test]
    fn test_single_level_policy_ignores_finer_data() {
        let h = hierarchy();
        let left = &h.patches()[0];
        let config = GhostConfig::default().with_policy(ReadPolicy::SingleLevel);
        let padded = reconstruct(&h, left, "x", &config).unwrap();
        assert_relative_eq!(padded.field[[4, 4, 4]], 4.5 * 0.125);
    }

    #[test]
    fn test_width_zero_returns_patch_data() {
        let h = hierarchy();
        let fine = &h.patches()[2];
        let padded = reconstruct(&h, fine, "x", &GhostConfig::disabled()).unwrap();
        assert_eq!(padded.dims(), fine.dims);
        assert_eq!(padded.mask, fine.mask);
        assert_eq!(padded.field, h.patch_data(2, "x").unwrap());
    }
}
