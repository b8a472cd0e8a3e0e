//! Grid hierarchy access
//!
//! [`GridHierarchy`] is the read-only view the extraction pipeline needs from
//! one AMR snapshot: the domain, per-level metadata, the patch list with
//! validity masks, per-patch field data and dense covering-grid reads over an
//! arbitrary index region.
//!
//! Patch data comes back as a [`PatchData`], borrowed from a hierarchy that
//! keeps fields in memory or owned when read on demand. Callers drop it once
//! consumed, so a disk-backed hierarchy only ever holds the patches in use.

use crate::grid::{DomainBounds, GridPatch, IndexBox, LevelInfo};
use crate::{Error, Point3d, Result};
use ndarray::{Array3, CowArray, Ix3};
use std::collections::HashMap;

/// Cell data of one patch, borrowed or freshly read
pub type PatchData<'a> = CowArray<'a, f64, Ix3>;

/// Which levels may contribute data to a covering-grid read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLevels {
    /// Only levels up to and including the given one; coarser data is
    /// injected piecewise-constant into the requested level.
    UpTo(usize),
    /// Every level; data finer than the requested level is averaged down.
    Finest,
}

/// A dense read of one field over an index region of one level
#[derive(Debug, Clone)]
pub struct CoveringRequest<'a> {
    pub field: &'a str,
    pub level: usize,
    pub region: IndexBox,
    pub source: SourceLevels,
}

/// Read-only access to one AMR snapshot
pub trait GridHierarchy: Sync {
    /// Physical domain bounds
    fn domain(&self) -> &DomainBounds;

    /// Simulation time of the snapshot
    fn time(&self) -> f64;

    /// Per-level metadata, coarsest first
    fn levels(&self) -> &[LevelInfo];

    /// All patches of all levels, ordered by level then id
    fn patches(&self) -> &[GridPatch];

    /// Names of the fields available for reading
    fn field_names(&self) -> Vec<String>;

    /// Cell data of one patch
    fn patch_data(&self, patch_id: usize, field: &str) -> Result<PatchData<'_>>;

    /// Metadata of one level
    fn level(&self, level: usize) -> Result<&LevelInfo> {
        self.levels()
            .get(level)
            .ok_or_else(|| Error::InvalidData(format!("Level {} does not exist", level)))
    }

    /// Finest level index
    fn max_level(&self) -> usize {
        self.levels().len().saturating_sub(1)
    }

    /// Dense grid of `request.field` over `request.region` at `request.level`
    fn covering_grid(&self, request: &CoveringRequest<'_>) -> Result<Array3<f64>> {
        fill_covering_grid(self, request)
    }
}

/// Product of the refinement ratios between a coarse and a finer level
pub fn ratio_between(levels: &[LevelInfo], coarse: usize, fine: usize) -> usize {
    levels[coarse + 1..=fine]
        .iter()
        .map(|info| info.ref_ratio)
        .product()
}

/// Generic covering-grid fill over any hierarchy.
///
/// Levels are visited coarse to fine so the finest contributing data wins.
pub fn fill_covering_grid<H: GridHierarchy + ?Sized>(
    hierarchy: &H,
    request: &CoveringRequest<'_>,
) -> Result<Array3<f64>> {
    let levels = hierarchy.levels();
    if request.level >= levels.len() {
        return Err(Error::InvalidData(format!(
            "Requested level {} but hierarchy has {} levels",
            request.level,
            levels.len()
        )));
    }
    if request.region.is_empty() {
        return Err(Error::InvalidData("Covering grid region is empty".to_string()));
    }

    let max_source = match request.source {
        SourceLevels::UpTo(level) => level.min(hierarchy.max_level()),
        SourceLevels::Finest => hierarchy.max_level(),
    };

    let region = request.region;
    let dims = region.dims();
    let mut out = Array3::from_elem((dims[0], dims[1], dims[2]), f64::NAN);

    // Only patches overlapping the region are fetched, one at a time.
    for patch in hierarchy.patches().iter().filter(|p| p.level <= max_source) {
        let patch_box = patch.index_box();

        if patch.level <= request.level {
            let ratio = ratio_between(levels, patch.level, request.level);
            let Some(overlap) = patch_box.refine(ratio).intersect(&region) else {
                continue;
            };
            let data = hierarchy.patch_data(patch.id, request.field)?;
            for idx in overlap.iter() {
                let src = local_index(&patch_box, [
                    idx[0].div_euclid(ratio as i64),
                    idx[1].div_euclid(ratio as i64),
                    idx[2].div_euclid(ratio as i64),
                ]);
                out[local_index(&region, idx)] = data[src];
            }
        } else {
            let ratio = ratio_between(levels, request.level, patch.level);
            let Some(overlap) = patch_box.coarsen(ratio).intersect(&region) else {
                continue;
            };
            let data = hierarchy.patch_data(patch.id, request.field)?;
            for idx in overlap.iter() {
                let fine = IndexBox::new(idx, idx).refine(ratio);
                let Some(fine) = fine.intersect(&patch_box) else {
                    continue;
                };
                let (sum, count) = fine
                    .iter()
                    .fold((0.0, 0usize), |(sum, count), f| {
                        (sum + data[local_index(&patch_box, f)], count + 1)
                    });
                out[local_index(&region, idx)] = sum / count as f64;
            }
        }
    }

    if out.iter().any(|v| v.is_nan()) {
        return Err(Error::InvalidData(format!(
            "Covering grid over {:?} at level {} is not fully covered by data",
            region, request.level
        )));
    }

    Ok(out)
}

fn local_index(b: &IndexBox, idx: [i64; 3]) -> [usize; 3] {
    [
        (idx[0] - b.lo[0]) as usize,
        (idx[1] - b.lo[1]) as usize,
        (idx[2] - b.lo[2]) as usize,
    ]
}

/// A fully loaded hierarchy holding every field in memory
#[derive(Debug, Clone)]
pub struct InMemoryHierarchy {
    domain: DomainBounds,
    time: f64,
    levels: Vec<LevelInfo>,
    patches: Vec<GridPatch>,
    fields: HashMap<String, Vec<Array3<f64>>>,
}

impl InMemoryHierarchy {
    /// Attach cell data for a field, one array per patch in patch order
    pub fn insert_field(&mut self, name: &str, data: Vec<Array3<f64>>) -> Result<()> {
        if data.len() != self.patches.len() {
            return Err(Error::InvalidData(format!(
                "Field '{}' has {} patch arrays for {} patches",
                name,
                data.len(),
                self.patches.len()
            )));
        }
        for (patch, array) in self.patches.iter().zip(&data) {
            let shape = array.shape();
            if shape != &patch.dims[..] {
                return Err(Error::InvalidData(format!(
                    "Field '{}' on patch {} has shape {:?}, expected {:?}",
                    name, patch.id, shape, patch.dims
                )));
            }
        }
        self.fields.insert(name.to_string(), data);
        Ok(())
    }

    /// Fill a field by evaluating `f` at every cell centre
    pub fn fill_field<F>(&mut self, name: &str, f: F)
    where
        F: Fn(&Point3d) -> f64,
    {
        let data = self
            .patches
            .iter()
            .map(|patch| {
                let [nx, ny, nz] = patch.dims;
                Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| {
                    f(&patch.cell_center(&self.domain, [i, j, k]))
                })
            })
            .collect();
        self.fields.insert(name.to_string(), data);
    }
}

impl GridHierarchy for InMemoryHierarchy {
    fn domain(&self) -> &DomainBounds {
        &self.domain
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn levels(&self) -> &[LevelInfo] {
        &self.levels
    }

    fn patches(&self) -> &[GridPatch] {
        &self.patches
    }

    fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fields.keys().cloned().collect();
        names.sort();
        names
    }

    fn patch_data(&self, patch_id: usize, field: &str) -> Result<PatchData<'_>> {
        let arrays = self.fields.get(field).ok_or_else(|| {
            Error::InvalidData(format!(
                "Field '{}' not found, available fields: {:?}",
                field,
                self.field_names()
            ))
        })?;
        arrays
            .get(patch_id)
            .map(|a| PatchData::from(a.view()))
            .ok_or_else(|| Error::InvalidData(format!("Patch {} does not exist", patch_id)))
    }
}

/// Builder for [`InMemoryHierarchy`]
#[derive(Debug, Clone)]
pub struct HierarchyBuilder {
    domain: DomainBounds,
    base_dims: [usize; 3],
    time: f64,
    base_boxes: Option<Vec<IndexBox>>,
    refined: Vec<(usize, Vec<IndexBox>)>,
}

impl HierarchyBuilder {
    /// Start a hierarchy whose level 0 has `base_dims` cells across the domain
    pub fn new(domain: DomainBounds, base_dims: [usize; 3]) -> Self {
        Self {
            domain,
            base_dims,
            time: 0.0,
            base_boxes: None,
            refined: Vec::new(),
        }
    }

    /// Set the snapshot time
    pub fn time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    /// Split level 0 into the given boxes (default: one box over the domain)
    pub fn base_boxes(mut self, boxes: Vec<IndexBox>) -> Self {
        self.base_boxes = Some(boxes);
        self
    }

    /// Add a finer level refined by `ref_ratio` with the given patch boxes
    pub fn add_level(mut self, ref_ratio: usize, boxes: Vec<IndexBox>) -> Self {
        self.refined.push((ref_ratio, boxes));
        self
    }

    /// Validate the layout, compute validity masks and build the hierarchy
    pub fn build(self) -> Result<InMemoryHierarchy> {
        if self.base_dims.iter().any(|&n| n == 0) {
            return Err(Error::InvalidData(format!(
                "Base dimensions {:?} must be positive",
                self.base_dims
            )));
        }

        let width = self.domain.width();
        let base_box = IndexBox::from_start_dims([0; 3], self.base_dims);
        let mut levels = vec![LevelInfo {
            level: 0,
            domain_box: base_box,
            spacing: [
                width[0] / self.base_dims[0] as f64,
                width[1] / self.base_dims[1] as f64,
                width[2] / self.base_dims[2] as f64,
            ],
            ref_ratio: 1,
        }];
        for (ratio, _) in &self.refined {
            if *ratio < 2 {
                return Err(Error::InvalidData(format!(
                    "Refinement ratio {} must be at least 2",
                    ratio
                )));
            }
            let coarser = &levels[levels.len() - 1];
            let r = *ratio as f64;
            levels.push(LevelInfo {
                level: coarser.level + 1,
                domain_box: coarser.domain_box.refine(*ratio),
                spacing: [
                    coarser.spacing[0] / r,
                    coarser.spacing[1] / r,
                    coarser.spacing[2] / r,
                ],
                ref_ratio: *ratio,
            });
        }

        let mut level_boxes = vec![self.base_boxes.unwrap_or_else(|| vec![base_box])];
        level_boxes.extend(self.refined.into_iter().map(|(_, boxes)| boxes));

        let mut patches = Vec::new();
        for (info, boxes) in levels.iter().zip(&level_boxes) {
            for b in boxes {
                if b.is_empty() || !info.domain_box.contains_box(b) {
                    return Err(Error::InvalidData(format!(
                        "Patch box {:?} does not lie inside level {} domain {:?}",
                        b, info.level, info.domain_box
                    )));
                }
                patches.push(GridPatch::new(patches.len(), info.level, *b, info.spacing));
            }
        }

        // A cell is invalid when any patch one level finer covers it.
        for level in 1..levels.len() {
            let ratio = levels[level].ref_ratio;
            let covers: Vec<IndexBox> = patches
                .iter()
                .filter(|p| p.level == level)
                .map(|p| p.index_box().coarsen(ratio))
                .collect();
            for patch in patches.iter_mut().filter(|p| p.level == level - 1) {
                let patch_box = patch.index_box();
                for cover in &covers {
                    if let Some(overlap) = patch_box.intersect(cover) {
                        for idx in overlap.iter() {
                            patch.mask[local_index(&patch_box, idx)] = false;
                        }
                    }
                }
            }
        }

        log::debug!(
            "Built hierarchy with {} levels and {} patches",
            levels.len(),
            patches.len()
        );

        Ok(InMemoryHierarchy {
            domain: self.domain,
            time: self.time,
            levels,
            patches,
            fields: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn two_level() -> InMemoryHierarchy {
        let domain = DomainBounds::new([0.0; 3], [1.0; 3]).unwrap();
        HierarchyBuilder::new(domain, [8, 8, 8])
            .base_boxes(vec![
                IndexBox::new([0, 0, 0], [3, 7, 7]),
                IndexBox::new([4, 0, 0], [7, 7, 7]),
            ])
            .add_level(2, vec![IndexBox::new([4, 4, 4], [11, 11, 11])])
            .time(1.5)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_levels_and_masks() {
        let h = two_level();
        assert_eq!(h.levels().len(), 2);
        assert_eq!(h.max_level(), 1);
        assert_eq!(h.levels()[1].domain_box, IndexBox::new([0; 3], [15; 3]));
        assert_relative_eq!(h.levels()[1].spacing[0], 0.0625);
        assert_eq!(h.time(), 1.5);

        // Fine patch covers coarse cells [2..=5]^3, split across both base patches.
        let left = &h.patches()[0];
        let right = &h.patches()[1];
        assert_eq!(left.num_cells() - left.valid_cells(), 2 * 4 * 4);
        assert_eq!(right.num_cells() - right.valid_cells(), 2 * 4 * 4);
        assert!(!left.mask[[2, 2, 2]]);
        assert!(left.mask[[1, 2, 2]]);
        assert_eq!(h.patches()[2].valid_cells(), 512);
    }

    #[test]
    fn test_builder_rejects_patch_outside_domain() {
        let domain = DomainBounds::new([0.0; 3], [1.0; 3]).unwrap();
        let result = HierarchyBuilder::new(domain, [4, 4, 4])
            .add_level(2, vec![IndexBox::new([6, 6, 6], [9, 9, 9])])
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_insert_field_shape_check() {
        let mut h = two_level();
        let bad = vec![Array3::zeros((4, 8, 8)); 2];
        assert!(h.insert_field("rho", bad).is_err());
    }

    #[test]
    fn test_covering_grid_single_level_injects_coarse_data() {
        let mut h = two_level();
        h.fill_field("x", |p| p.x);

        // Level-1 read over a region outside the fine patch: injected from level 0.
        let request = CoveringRequest {
            field: "x",
            level: 1,
            region: IndexBox::new([0, 0, 0], [1, 1, 1]),
            source: SourceLevels::UpTo(1),
        };
        let grid = h.covering_grid(&request).unwrap();
        assert_eq!(grid.shape(), &[2, 2, 2]);
        assert_relative_eq!(grid[[0, 0, 0]], 0.0625);
        assert_relative_eq!(grid[[1, 0, 0]], 0.0625);
    }

    #[test]
    fn test_covering_grid_prefers_finest_data() {
        let mut h = two_level();
        h.fill_field("x", |p| p.x);

        let request = CoveringRequest {
            field: "x",
            level: 1,
            region: IndexBox::new([8, 8, 8], [9, 8, 8]),
            source: SourceLevels::UpTo(1),
        };
        let grid = h.covering_grid(&request).unwrap();
        assert_relative_eq!(grid[[0, 0, 0]], 8.5 * 0.0625);
        assert_relative_eq!(grid[[1, 0, 0]], 9.5 * 0.0625);
    }

    #[test]
    fn test_covering_grid_finest_averages_down() {
        let mut h = two_level();
        h.fill_field("x", |p| p.x);

        // Level-0 cell 2 is covered by fine cells 4 and 5.
        let request = CoveringRequest {
            field: "x",
            level: 0,
            region: IndexBox::new([2, 2, 2], [2, 2, 2]),
            source: SourceLevels::Finest,
        };
        let grid = h.covering_grid(&request).unwrap();
        assert_relative_eq!(grid[[0, 0, 0]], 0.5 * (4.5 + 5.5) * 0.0625);

        let coarse_only = CoveringRequest {
            source: SourceLevels::UpTo(0),
            ..request
        };
        let grid = h.covering_grid(&coarse_only).unwrap();
        assert_relative_eq!(grid[[0, 0, 0]], 2.5 * 0.125);
    }

    #[test]
    fn test_covering_grid_outside_domain_fails() {
        let mut h = two_level();
        h.fill_field("x", |p| p.x);
        let request = CoveringRequest {
            field: "x",
            level: 0,
            region: IndexBox::new([-1, 0, 0], [0, 0, 0]),
            source: SourceLevels::UpTo(0),
        };
        assert!(h.covering_grid(&request).is_err());
    }

    #[test]
    fn test_missing_field_names_available() {
        let mut h = two_level();
        h.fill_field("temp", |_| 300.0);
        let err = h.patch_data(0, "rho").unwrap_err();
        assert!(err.to_string().contains("temp"));
    }
}
