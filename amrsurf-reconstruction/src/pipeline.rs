//! Snapshot extraction pipeline
//!
//! Ties the stages together for one snapshot: each rank reconstructs ghost
//! zones, preprocesses and triangulates its share of patches into a
//! [`RankMesh`]; the root then gathers, merges and hands the result to the
//! writer before releasing the workers.

use crate::collective::{partition, run_local, CollectiveConfig, Communicator};
use crate::ghost::{self, GhostConfig, PaddedPatch};
use crate::marching_cubes::{extract_patch, extract_uniform, EmptyReason, PatchOutcome};
use crate::parallel;
use amrsurf_algorithms::{gaussian_smooth, gradient, restrict_mask, GradientComponent, PhysicalBox};
use amrsurf_core::{
    CoveringRequest, Error, GridHierarchy, GridPatch, IndexBox, IsoMesh, Isovalue, RankMesh,
    Result, SamplePlacement, SourceLevels,
};
use ndarray::{s, Array3};

/// How surfaces are extracted from the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPath {
    /// Patch by patch with validity masks, shared vertices, node samples
    Patchwise,
    /// One covering grid of the whole domain at `level`, triangle soup,
    /// cell samples
    Uniform { level: usize },
}

/// What to extract from a snapshot
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Field the surface is a level set of
    pub field: String,
    pub isovalue: Isovalue,
    /// Field sampled onto the surface (defaults to `field`)
    pub sample_field: Option<String>,
    /// Ghost-zone padding, `None` for the patch's own cells only
    pub ghost: Option<GhostConfig>,
    /// Gaussian smoothing width in cells
    pub smooth_sigma: Option<f64>,
    /// Only cells whose centre lies in this box are triangulated
    pub region: Option<PhysicalBox>,
    /// Extract a level set of this gradient component instead of the field
    pub gradient: Option<GradientComponent>,
    pub path: ExtractionPath,
}

impl ExtractionConfig {
    /// Extract `field` at `isovalue` patch by patch without preprocessing
    pub fn new(field: impl Into<String>, isovalue: Isovalue) -> Self {
        Self {
            field: field.into(),
            isovalue,
            sample_field: None,
            ghost: None,
            smooth_sigma: None,
            region: None,
            gradient: None,
            path: ExtractionPath::Patchwise,
        }
    }

    pub fn with_sample_field(mut self, field: impl Into<String>) -> Self {
        self.sample_field = Some(field.into());
        self
    }

    pub fn with_ghost(mut self, ghost: GhostConfig) -> Self {
        self.ghost = Some(ghost);
        self
    }

    pub fn with_smoothing(mut self, sigma: f64) -> Self {
        self.smooth_sigma = Some(sigma);
        self
    }

    pub fn with_region(mut self, region: PhysicalBox) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_gradient(mut self, component: GradientComponent) -> Self {
        self.gradient = Some(component);
        self
    }

    pub fn with_path(mut self, path: ExtractionPath) -> Self {
        self.path = path;
        self
    }

    /// Name of the field whose values are sampled onto the surface
    pub fn sample_name(&self) -> &str {
        self.sample_field.as_deref().unwrap_or(&self.field)
    }

    /// Label of the extracted quantity, `<field>_grad_<component>` for gradients
    pub fn surface_name(&self) -> String {
        match self.gradient {
            Some(component) => format!("{}_grad_{}", self.field, component.suffix()),
            None => self.field.clone(),
        }
    }

    /// Where samples end up for the configured path
    pub fn placement(&self) -> SamplePlacement {
        match self.path {
            ExtractionPath::Patchwise => SamplePlacement::Node,
            ExtractionPath::Uniform { .. } => SamplePlacement::Cell,
        }
    }
}

/// Extract `rank`'s share of the snapshot into a rank-local mesh
pub fn extract_rank<H: GridHierarchy + ?Sized>(
    hierarchy: &H,
    config: &ExtractionConfig,
    rank: usize,
    size: usize,
) -> Result<RankMesh> {
    let iso = config.isovalue.value_at(hierarchy.time());
    let mut mesh = RankMesh::new(rank, config.placement());

    match config.path {
        ExtractionPath::Patchwise => {
            let patches = hierarchy.patches();
            for index in partition(patches.len(), rank, size) {
                let patch = &patches[index];
                match extract_one_patch(hierarchy, patch, config, iso)? {
                    PatchOutcome::Extracted(fragment) => {
                        log::debug!(
                            "Rank {} patch {} (level {}): {} vertices, {} faces",
                            rank,
                            patch.id,
                            patch.level,
                            fragment.vertex_count(),
                            fragment.face_count()
                        );
                        mesh.append(fragment)?;
                        mesh.stats.extracted += 1;
                    }
                    PatchOutcome::Empty(reason) => {
                        log::debug!("Rank {} patch {} skipped: {:?}", rank, patch.id, reason);
                        match reason {
                            EmptyReason::NoCrossing => mesh.stats.no_crossing += 1,
                            EmptyReason::FullyMasked => mesh.stats.fully_masked += 1,
                        }
                    }
                }
            }
        }
        ExtractionPath::Uniform { level } => {
            extract_uniform_slab(hierarchy, config, iso, level, rank, size, &mut mesh)?;
        }
    }

    log::info!(
        "Rank {}: {} vertices, {} faces from {} patches ({} without crossing, {} fully masked)",
        rank,
        mesh.vertex_count(),
        mesh.face_count(),
        mesh.stats.extracted,
        mesh.stats.no_crossing,
        mesh.stats.fully_masked
    );
    Ok(mesh)
}

/// Preprocess and triangulate a single patch
pub fn extract_one_patch<H: GridHierarchy + ?Sized>(
    hierarchy: &H,
    patch: &GridPatch,
    config: &ExtractionConfig,
    iso: f64,
) -> Result<PatchOutcome> {
    let ghost_config = config.ghost.unwrap_or_else(GhostConfig::disabled);
    let PaddedPatch {
        field: raw,
        mut mask,
        spacing,
        origin,
        ..
    } = ghost::reconstruct(hierarchy, patch, &config.field, &ghost_config)?;

    if !mask.iter().any(|&valid| valid) {
        return Ok(PatchOutcome::Empty(EmptyReason::FullyMasked));
    }
    if let Some(region) = &config.region {
        restrict_mask(&mut mask, origin, spacing, region);
    }

    let field = preprocess(&raw, spacing, config)?;
    let samples = match &config.sample_field {
        Some(name) => ghost::reconstruct(hierarchy, patch, name, &ghost_config)?.field,
        None => raw,
    };

    let outcome = extract_patch(
        field.view(),
        Some(samples.view()),
        mask.view(),
        iso,
        spacing,
        origin,
    )?;
    // Only the fragment outlives the patch
    drop((field, samples, mask));
    Ok(outcome)
}

/// Gradient then smoothing, in the shared thread pool
fn preprocess(raw: &Array3<f64>, spacing: [f64; 3], config: &ExtractionConfig) -> Result<Array3<f64>> {
    if config.gradient.is_none() && config.smooth_sigma.is_none() {
        return Ok(raw.clone());
    }
    parallel::execute_parallel(|| {
        let mut field = match config.gradient {
            Some(component) => gradient(raw, spacing, component)?,
            None => raw.clone(),
        };
        if let Some(sigma) = config.smooth_sigma {
            field = gaussian_smooth(&field, sigma)?;
        }
        Ok(field)
    })
}

/// Region of `level` cells covered by the uniform path
fn uniform_region<H: GridHierarchy + ?Sized>(
    hierarchy: &H,
    level: usize,
    region: Option<&PhysicalBox>,
) -> Result<Option<IndexBox>> {
    let info = hierarchy.level(level)?;
    let Some(region) = region else {
        return Ok(Some(info.domain_box));
    };

    let domain = hierarchy.domain();
    let mut lo = [0i64; 3];
    let mut hi = [0i64; 3];
    for axis in 0..3 {
        let h = info.spacing[axis];
        let left = domain.left_edge[axis];
        // First and last cells whose centre lies inside the box
        lo[axis] = ((region.lo[axis] - left) / h - 0.5).ceil() as i64;
        hi[axis] = ((region.hi[axis] - left) / h - 0.5).floor() as i64;
    }
    Ok(info.domain_box.intersect(&IndexBox::new(lo, hi)))
}

#[allow(clippy::too_many_arguments)]
fn extract_uniform_slab<H: GridHierarchy + ?Sized>(
    hierarchy: &H,
    config: &ExtractionConfig,
    iso: f64,
    level: usize,
    rank: usize,
    size: usize,
    mesh: &mut RankMesh,
) -> Result<()> {
    if level > hierarchy.max_level() {
        return Err(Error::Config(format!(
            "Uniform extraction level {} exceeds finest level {}",
            level,
            hierarchy.max_level()
        )));
    }
    if config.smooth_sigma.is_some() || config.gradient.is_some() {
        log::warn!("Smoothing and gradients apply to patchwise extraction only, ignoring them");
    }

    let Some(region) = uniform_region(hierarchy, level, config.region.as_ref())? else {
        log::debug!("Rank {}: region lies outside the domain", rank);
        return Ok(());
    };

    // Cube layers along z are split into contiguous chunks, one per rank.
    let layers = region.dims()[2].saturating_sub(1);
    let first = layers * rank / size;
    let last = layers * (rank + 1) / size;
    if first == last {
        return Ok(());
    }
    let slab = IndexBox::new(
        [region.lo[0], region.lo[1], region.lo[2] + first as i64],
        [region.hi[0], region.hi[1], region.lo[2] + last as i64],
    );

    let read = |field: &str| {
        hierarchy.covering_grid(&CoveringRequest {
            field,
            level,
            region: slab,
            source: SourceLevels::Finest,
        })
    };
    let field = read(&config.field)?;
    let samples = match &config.sample_field {
        Some(name) => read(name)?,
        None => field.clone(),
    };

    let info = hierarchy.level(level)?;
    let domain = hierarchy.domain();
    let origin = [
        domain.cell_center(0, slab.lo[0], info.spacing[0]),
        domain.cell_center(1, slab.lo[1], info.spacing[1]),
        domain.cell_center(2, slab.lo[2], info.spacing[2]),
    ];

    // Sub-slabs share their boundary layer and are triangulated in parallel.
    let slab_layers = last - first;
    let chunks = parallel::current_num_threads().clamp(1, slab_layers);
    let bounds: Vec<(usize, usize)> = (0..chunks)
        .map(|c| (slab_layers * c / chunks, slab_layers * (c + 1) / chunks))
        .filter(|(a, b)| a < b)
        .collect();

    let outcomes = parallel::parallel_map(&bounds, |&(a, b)| {
        let sub_origin = [
            origin[0],
            origin[1],
            origin[2] + a as f64 * info.spacing[2],
        ];
        extract_uniform(
            field.slice(s![.., .., a..=b]),
            Some(samples.slice(s![.., .., a..=b])),
            iso,
            info.spacing,
            sub_origin,
        )
    });

    for outcome in outcomes {
        match outcome? {
            PatchOutcome::Extracted(fragment) => {
                mesh.append(fragment)?;
                mesh.stats.extracted += 1;
            }
            PatchOutcome::Empty(EmptyReason::NoCrossing) => mesh.stats.no_crossing += 1,
            PatchOutcome::Empty(EmptyReason::FullyMasked) => mesh.stats.fully_masked += 1,
        }
    }
    Ok(())
}

/// Extract one snapshot across the ranks of `comm`.
///
/// Phase one extracts locally; a failing rank aborts the collective. Phase
/// two gathers on the root, which merges in rank order, passes the merged
/// mesh to `on_merged` and releases the workers. The root returns the
/// merged mesh, workers return `None`.
pub fn extract_snapshot<H, C, W>(
    hierarchy: &H,
    config: &ExtractionConfig,
    comm: &C,
    on_merged: W,
) -> Result<Option<IsoMesh>>
where
    H: GridHierarchy + ?Sized,
    C: Communicator + ?Sized,
    W: FnOnce(&IsoMesh) -> Result<()>,
{
    let local = match extract_rank(hierarchy, config, comm.rank(), comm.size()) {
        Ok(mesh) => mesh,
        Err(e) => {
            comm.abort(&e.to_string());
            return Err(e);
        }
    };

    match comm.gather(local)? {
        Some(ranks) => {
            let merged = IsoMesh::merge_ranks(ranks).and_then(|mesh| {
                mesh.validate()?;
                on_merged(&mesh)?;
                Ok(mesh)
            });
            match merged {
                Ok(mesh) => {
                    log::info!(
                        "Merged {} vertices and {} faces from {} ranks",
                        mesh.vertex_count(),
                        mesh.face_count(),
                        comm.size()
                    );
                    comm.release()?;
                    Ok(Some(mesh))
                }
                Err(e) => {
                    comm.abort(&e.to_string());
                    Err(e)
                }
            }
        }
        None => {
            comm.wait_release()?;
            Ok(None)
        }
    }
}

/// Extract a snapshot on `workers` in-process ranks and return the merged mesh
pub fn extract_parallel<H: GridHierarchy + ?Sized>(
    hierarchy: &H,
    config: &ExtractionConfig,
    workers: usize,
    collective: &CollectiveConfig,
) -> Result<IsoMesh> {
    extract_parallel_with(hierarchy, config, workers, collective, |_| Ok(()))
}

/// Like [`extract_parallel`], running `on_merged` on the root before release
pub fn extract_parallel_with<H, W>(
    hierarchy: &H,
    config: &ExtractionConfig,
    workers: usize,
    collective: &CollectiveConfig,
    on_merged: W,
) -> Result<IsoMesh>
where
    H: GridHierarchy + ?Sized,
    W: Fn(&IsoMesh) -> Result<()> + Sync,
{
    let results = run_local(workers, collective, |comm| {
        extract_snapshot(hierarchy, config, comm, |mesh| on_merged(mesh))
    })?;

    let mut root = None;
    let mut failure = None;
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(Some(mesh)) => root = Some(mesh),
            Ok(None) => {}
            Err(e) => {
                log::error!("Rank {} failed: {}", rank, e);
                failure.get_or_insert(e);
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    root.ok_or_else(|| Error::Collective("Root produced no mesh".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ghost::ReadPolicy;
    use amrsurf_core::{
        DomainBounds, HierarchyBuilder, InMemoryHierarchy, LevelInfo, PatchData,
    };
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Hands out owned copies and records which patches were read, in order
    struct RecordingHierarchy<'a> {
        inner: &'a InMemoryHierarchy,
        reads: Mutex<Vec<usize>>,
    }

    impl<'a> RecordingHierarchy<'a> {
        fn new(inner: &'a InMemoryHierarchy) -> Self {
            Self {
                inner,
                reads: Mutex::new(Vec::new()),
            }
        }

        fn reads(&self) -> Vec<usize> {
            self.reads.lock().unwrap().clone()
        }
    }

    impl GridHierarchy for RecordingHierarchy<'_> {
        fn domain(&self) -> &DomainBounds {
            self.inner.domain()
        }

        fn time(&self) -> f64 {
            self.inner.time()
        }

        fn levels(&self) -> &[LevelInfo] {
            self.inner.levels()
        }

        fn patches(&self) -> &[GridPatch] {
            self.inner.patches()
        }

        fn field_names(&self) -> Vec<String> {
            self.inner.field_names()
        }

        fn patch_data(&self, patch_id: usize, field: &str) -> Result<PatchData<'_>> {
            self.reads.lock().unwrap().push(patch_id);
            Ok(PatchData::from(self.inner.patch_data(patch_id, field)?.into_owned()))
        }
    }

    /// Two base patches split at x = 0.5 and the plane x = 0.3 + 0.1 z
    fn plane_hierarchy() -> InMemoryHierarchy {
        let domain = DomainBounds::new([0.0; 3], [1.0; 3]).unwrap();
        let mut h = HierarchyBuilder::new(domain, [8, 8, 8])
            .base_boxes(vec![
                IndexBox::new([0, 0, 0], [3, 7, 7]),
                IndexBox::new([4, 0, 0], [7, 7, 7]),
            ])
            .time(2.0)
            .build()
            .unwrap();
        h.fill_field("phi", |p| p.x - 0.1 * p.z);
        h.fill_field("temp", |p| 100.0 * p.y);
        h
    }

    #[test]
    fn test_config_names() {
        let config = ExtractionConfig::new("temp", Isovalue::Fixed(1.0));
        assert_eq!(config.surface_name(), "temp");
        assert_eq!(config.sample_name(), "temp");
        assert_eq!(config.placement(), SamplePlacement::Node);

        let config = config
            .with_gradient(GradientComponent::Magnitude)
            .with_sample_field("rho")
            .with_path(ExtractionPath::Uniform { level: 0 });
        assert_eq!(config.surface_name(), "temp_grad_magnitude");
        assert_eq!(config.sample_name(), "rho");
        assert_eq!(config.placement(), SamplePlacement::Cell);
    }

    #[test]
    fn test_patches_are_read_as_they_are_reached() {
        let h = plane_hierarchy();
        let recording = RecordingHierarchy::new(&h);
        let config = ExtractionConfig::new("phi", Isovalue::Fixed(0.2)).with_sample_field("temp");
        extract_rank(&recording, &config, 0, 1).unwrap();
        // Field then samples of patch 0, then the same for patch 1
        assert_eq!(recording.reads(), vec![0, 0, 1, 1]);

        let recording = RecordingHierarchy::new(&h);
        extract_rank(&recording, &config, 1, 2).unwrap();
        assert_eq!(recording.reads(), vec![1, 1]);
    }

    #[test]
    fn test_ghost_reads_fetch_neighbours_again() {
        let h = plane_hierarchy();
        let recording = RecordingHierarchy::new(&h);
        let config =
            ExtractionConfig::new("phi", Isovalue::Fixed(0.5)).with_ghost(GhostConfig::default());
        let mesh = extract_rank(&recording, &config, 0, 1).unwrap();
        assert!(mesh.face_count() > 0);
        // Each padded read touches both patches; nothing is cached between patches
        assert_eq!(recording.reads(), vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_empty_patches_are_counted() {
        let h = plane_hierarchy();
        let config = ExtractionConfig::new("phi", Isovalue::Fixed(0.2));
        let mesh = extract_rank(&h, &config, 0, 1).unwrap();

        assert_eq!(mesh.stats.extracted, 1);
        assert_eq!(mesh.stats.no_crossing, 1);
        assert!(mesh.validate().is_ok());
        assert!(mesh.vertices.iter().all(|v| v.x < 0.5));
    }

    #[test]
    fn test_isovalue_ramp_uses_snapshot_time() {
        let h = plane_hierarchy();
        let ramp = Isovalue::from_breakpoints(&[0.0, 0.0, 4.0, 0.4]).unwrap();
        let config = ExtractionConfig::new("phi", ramp);
        let mesh = extract_rank(&h, &config, 0, 1).unwrap();
        for (v, value) in mesh.vertices.iter().zip(&mesh.values) {
            assert_relative_eq!(v.x - 0.1 * v.z, 0.2, epsilon = 1e-12);
            assert_relative_eq!(*value, 0.2, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_ghost_zones_close_the_seam() {
        let h = plane_hierarchy();
        let base = ExtractionConfig::new("phi", Isovalue::Fixed(0.5));
        let without = extract_rank(&h, &base, 0, 1).unwrap();
        let with = extract_rank(&h, &base.clone().with_ghost(GhostConfig::default()), 0, 1).unwrap();

        // The seam cubes between the two patches only exist with ghost cells
        assert!(with.face_count() > without.face_count());
        assert!(with.validate().is_ok());
    }

    #[test]
    fn test_sample_field_and_region() {
        let h = plane_hierarchy();
        let config = ExtractionConfig::new("phi", Isovalue::Fixed(0.3))
            .with_sample_field("temp")
            .with_ghost(GhostConfig::default().with_policy(ReadPolicy::SingleLevel))
            .with_region(PhysicalBox::new([0.0; 3], [1.0, 0.5, 1.0]).unwrap());
        let mesh = extract_rank(&h, &config, 0, 1).unwrap();

        assert!(mesh.face_count() > 0);
        for (v, value) in mesh.vertices.iter().zip(&mesh.values) {
            assert_relative_eq!(*value, 100.0 * v.y, epsilon = 1e-9);
            assert!(v.y <= 0.5 + 0.125);
        }
    }

    #[test]
    fn test_fully_masked_patch() {
        let domain = DomainBounds::new([0.0; 3], [1.0; 3]).unwrap();
        let mut h = HierarchyBuilder::new(domain, [4, 4, 4])
            .add_level(2, vec![IndexBox::new([0, 0, 0], [7, 7, 7])])
            .build()
            .unwrap();
        h.fill_field("phi", |p| p.x);
        let config = ExtractionConfig::new("phi", Isovalue::Fixed(0.5));
        let mesh = extract_rank(&h, &config, 0, 1).unwrap();
        assert_eq!(mesh.stats.fully_masked, 1);
        assert_eq!(mesh.stats.extracted, 1);
    }

    #[test]
    fn test_preprocessing_gradient() {
        let h = plane_hierarchy();
        // |grad phi| is constant, so no crossing of 0.5 anywhere
        let config = ExtractionConfig::new("phi", Isovalue::Fixed(0.5))
            .with_gradient(GradientComponent::Magnitude)
            .with_smoothing(1.0);
        let mesh = extract_rank(&h, &config, 0, 1).unwrap();
        assert_eq!(mesh.face_count(), 0);
        assert_eq!(mesh.stats.no_crossing, 2);
    }

    #[test]
    fn test_uniform_path_splits_across_ranks() {
        let h = plane_hierarchy();
        let config = ExtractionConfig::new("phi", Isovalue::Fixed(0.4))
            .with_path(ExtractionPath::Uniform { level: 0 });

        let serial = extract_parallel(&h, &config, 1, &CollectiveConfig::default()).unwrap();
        let split = extract_parallel(&h, &config, 3, &CollectiveConfig::default()).unwrap();

        assert_eq!(serial.placement, SamplePlacement::Cell);
        assert_eq!(serial.values.len(), serial.face_count());
        assert_eq!(serial.face_count(), split.face_count());
        assert_relative_eq!(serial.surface_area(), split.surface_area(), epsilon = 1e-9);
        // The plane x - 0.1 z = 0.4 across the cell-centre span in y and z
        let span = 0.9375 - 0.0625;
        assert_relative_eq!(serial.surface_area(), span * span * 1.01_f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_on_merged_runs_once_on_root() {
        let h = plane_hierarchy();
        let config = ExtractionConfig::new("phi", Isovalue::Fixed(0.3));
        let calls = AtomicUsize::new(0);
        let mesh = extract_parallel_with(&h, &config, 2, &CollectiveConfig::default(), |m| {
            calls.fetch_add(1, Ordering::SeqCst);
            assert!(m.face_count() > 0);
            Ok(())
        })
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_writer_failure_aborts_all_ranks() {
        let h = plane_hierarchy();
        let config = ExtractionConfig::new("phi", Isovalue::Fixed(0.3));
        let result = extract_parallel_with(&h, &config, 3, &CollectiveConfig::default(), |_| {
            Err(Error::Unsupported("disk full".to_string()))
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_field_aborts() {
        let h = plane_hierarchy();
        let config = ExtractionConfig::new("rho", Isovalue::Fixed(0.3));
        assert!(extract_parallel(&h, &config, 2, &CollectiveConfig::default()).is_err());
    }
}
