//! Per-snapshot driver

use crate::config::Settings;
use amrsurf_core::GridHierarchy;
use amrsurf_io::{
    find_snapshots, open_plotfile, output_base_name, snapshot_name, write_mesh, OutputFormat,
    SurfaceMetadata,
};
use amrsurf_reconstruction::{extract_parallel_with, ExtractionPath};
use anyhow::{ensure, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

/// Outcome of one snapshot
#[derive(Debug, Clone)]
pub struct SnapshotReport {
    pub snapshot: String,
    pub time: f64,
    pub isovalue: f64,
    pub vertices: usize,
    pub faces: usize,
    /// Patch reads served from the plotfile
    pub patch_reads: usize,
    /// Files written by the root
    pub files: Vec<PathBuf>,
}

/// Extract and write every selected snapshot, stopping at the first failure
pub fn run(settings: &Settings) -> Result<Vec<SnapshotReport>> {
    let snapshots = find_snapshots(
        &settings.datapath,
        settings.patterns.as_deref(),
        settings.nskip,
    )?;
    ensure!(
        !snapshots.is_empty(),
        "No snapshots selected in {}",
        settings.datapath.display()
    );

    std::fs::create_dir_all(&settings.outpath).with_context(|| {
        format!(
            "Failed to create output directory {}",
            settings.outpath.display()
        )
    })?;
    if let Some(note) = OutputFormat::alias_note(&settings.format_name) {
        log::warn!("{}", note);
    }
    log::info!(
        "Writing {} surfaces of '{}' to {} with {} ranks",
        settings.format,
        settings.extraction.surface_name(),
        settings.outpath.display(),
        settings.workers
    );

    snapshots
        .iter()
        .map(|path| {
            process_snapshot(settings, path)
                .with_context(|| format!("Failed to process {}", path.display()))
        })
        .collect()
}

/// Open one snapshot, extract its surface on all ranks and write it from
/// the root. Patch data is read from disk as each rank reaches the patch.
pub fn process_snapshot(settings: &Settings, path: &Path) -> Result<SnapshotReport> {
    let start = Instant::now();
    let snapshot = snapshot_name(path);

    let mut config = settings.extraction.clone();
    let hierarchy = open_plotfile(path)?;
    hierarchy.require_fields(&[config.field.as_str(), config.sample_name()])?;
    if settings.uniform {
        let level = settings
            .uniform_level
            .unwrap_or_else(|| hierarchy.max_level());
        config = config.with_path(ExtractionPath::Uniform { level });
    }

    let time = hierarchy.time();
    let isovalue = config.isovalue.value_at(time);
    let base = output_base_name(&config.surface_name(), isovalue, &snapshot);
    let meta = SurfaceMetadata::new(config.surface_name(), isovalue, time)
        .with_sample(config.sample_name());
    log::info!("{}: t = {}, isovalue = {}", snapshot, time, isovalue);

    let written = OnceLock::new();
    let mesh = extract_parallel_with(
        &hierarchy,
        &config,
        settings.workers,
        &settings.collective,
        |mesh| {
            let files = write_mesh(settings.format, &settings.outpath, &base, mesh, &meta)?;
            let _ = written.set(files);
            Ok(())
        },
    )?;

    if mesh.is_empty() {
        log::warn!("{}: no surface at isovalue {}", snapshot, isovalue);
    }
    log::info!(
        "{}: {} vertices, {} faces from {} patch reads in {:.2?}",
        snapshot,
        mesh.vertex_count(),
        mesh.face_count(),
        hierarchy.fetch_count(),
        start.elapsed()
    );

    Ok(SnapshotReport {
        snapshot,
        time,
        isovalue,
        vertices: mesh.vertex_count(),
        faces: mesh.face_count(),
        patch_reads: hierarchy.fetch_count(),
        files: written.into_inner().unwrap_or_default(),
    })
}
