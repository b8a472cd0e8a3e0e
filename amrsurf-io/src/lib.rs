//! I/O for amrsurf
//!
//! This crate opens AMReX plotfiles as lazily read grid hierarchies, discovers
//! snapshot series and writes extracted surfaces as PLY, OBJ or a binary
//! array container with an XDMF descriptor.

pub mod container;
pub mod error;
pub mod obj;
pub mod plotfile;
pub mod ply;
pub mod series;
pub mod xdmf;

pub use container::{read_container, ArrayContainer, ArrayEntry, ContainerFile, DType};
pub use error::*;
pub use obj::{ObjReader, ObjWriter};
pub use plotfile::{
    open_plotfile, read_header, read_plotfile, read_plotfile_fields, write_plotfile,
    PlotfileHeader, PlotfileHierarchy,
};
pub use ply::{PlyReader, PlyWriter};
pub use series::{find_snapshots, snapshot_name};
pub use xdmf::write_isosurface;

use amrsurf_core::{Error, IsoMesh, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Per-snapshot values recorded next to a surface
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceMetadata {
    /// Field the surface is a level set of
    pub field: String,
    /// Name of the sampled field, used for the sample array
    pub sample: String,
    pub isovalue: f64,
    /// Simulation time of the snapshot
    pub time: f64,
}

impl SurfaceMetadata {
    /// Metadata for a surface sampling its own field
    pub fn new(field: impl Into<String>, isovalue: f64, time: f64) -> Self {
        let field = field.into();
        Self {
            sample: field.clone(),
            field,
            isovalue,
            time,
        }
    }

    pub fn with_sample(mut self, sample: impl Into<String>) -> Self {
        self.sample = sample.into();
        self
    }
}

/// Trait for reading meshes from files
pub trait MeshReader {
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<IsoMesh>;
}

/// Trait for writing meshes to files
pub trait MeshWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &IsoMesh, meta: &SurfaceMetadata, path: P) -> Result<()>;
}

/// Surface output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Ply,
    Obj,
    /// Binary container plus XDMF descriptor
    Xdmf,
}

impl OutputFormat {
    /// Names accepted on the command line
    pub const NAMES: [&'static str; 4] = ["ply", "obj", "hdf5", "xdmf"];

    /// What a format name that differs from what it writes actually produces
    pub fn alias_note(name: &str) -> Option<&'static str> {
        match name {
            "hdf5" => Some(
                "format hdf5 writes the binary array container <base>.bin with an \
                 XDMF descriptor <base>.xmf, not an HDF5 file",
            ),
            _ => None,
        }
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ply" => Ok(OutputFormat::Ply),
            "obj" => Ok(OutputFormat::Obj),
            "hdf5" | "xdmf" => Ok(OutputFormat::Xdmf),
            other => Err(Error::UnsupportedFormat(format!(
                "Format {} not in [{}]",
                other,
                Self::NAMES.join(", ")
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OutputFormat::Ply => "ply",
            OutputFormat::Obj => "obj",
            OutputFormat::Xdmf => "xdmf",
        };
        f.write_str(name)
    }
}

/// `isosurface_<field>_<isovalue>_<snapshot>`
pub fn output_base_name(field: &str, isovalue: f64, snapshot: &str) -> String {
    format!("isosurface_{}_{:?}_{}", field, isovalue, snapshot)
}

/// Write `mesh` in `format` under `dir` and return the files written
pub fn write_mesh<P: AsRef<Path>>(
    format: OutputFormat,
    dir: P,
    base: &str,
    mesh: &IsoMesh,
    meta: &SurfaceMetadata,
) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;
    let paths = match format {
        OutputFormat::Ply => {
            let path = dir.join(format!("{}.ply", base));
            PlyWriter::write_mesh(mesh, meta, &path)?;
            vec![path]
        }
        OutputFormat::Obj => {
            let path = dir.join(format!("{}.obj", base));
            ObjWriter::write_mesh(mesh, meta, &path)?;
            vec![path]
        }
        OutputFormat::Xdmf => {
            let (container, descriptor) = write_isosurface(dir, base, mesh, meta)?;
            vec![container, descriptor]
        }
    };
    for path in &paths {
        log::info!("Wrote {}", path.display());
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use amrsurf_core::{Point3d, SamplePlacement};

    #[test]
    fn test_format_parsing() {
        assert_eq!("ply".parse::<OutputFormat>().unwrap(), OutputFormat::Ply);
        assert_eq!("obj".parse::<OutputFormat>().unwrap(), OutputFormat::Obj);
        assert_eq!("hdf5".parse::<OutputFormat>().unwrap(), OutputFormat::Xdmf);
        assert_eq!("xdmf".parse::<OutputFormat>().unwrap(), OutputFormat::Xdmf);

        let err = "vtk".parse::<OutputFormat>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        assert!(err.to_string().contains("Format vtk not in [ply, obj, hdf5, xdmf]"));
    }

    #[test]
    fn test_hdf5_alias_is_flagged() {
        let note = OutputFormat::alias_note("hdf5").unwrap();
        assert!(note.contains(".bin"));
        assert!(note.contains("not an HDF5 file"));
        assert_eq!(OutputFormat::alias_note("xdmf"), None);
        assert_eq!(OutputFormat::alias_note("ply"), None);
    }

    #[test]
    fn test_output_base_name() {
        assert_eq!(
            output_base_name("temp", 1500.0, "plt00100"),
            "isosurface_temp_1500.0_plt00100"
        );
        assert_eq!(
            output_base_name("mag_vort", 0.25, "plt00000"),
            "isosurface_mag_vort_0.25_plt00000"
        );
    }

    #[test]
    fn test_write_mesh_every_format() {
        let dir = tempfile::tempdir().unwrap();
        let mut mesh = IsoMesh::new(SamplePlacement::Node);
        mesh.vertices = vec![
            Point3d::new(0.0, 0.0, 0.0),
            Point3d::new(1.0, 0.0, 0.0),
            Point3d::new(0.0, 1.0, 0.0),
        ];
        mesh.faces = vec![[0, 1, 2]];
        mesh.values = vec![1.0, 2.0, 3.0];
        let meta = SurfaceMetadata::new("temp", 2.0, 0.0);

        let out = dir.path().join("nested").join("out");
        assert_eq!(write_mesh(OutputFormat::Ply, &out, "a", &mesh, &meta).unwrap().len(), 1);
        assert_eq!(write_mesh(OutputFormat::Obj, &out, "a", &mesh, &meta).unwrap().len(), 1);
        let files = write_mesh(OutputFormat::Xdmf, &out, "a", &mesh, &meta).unwrap();
        assert_eq!(files.len(), 2);
        for file in files {
            assert!(file.exists());
        }
        assert!(out.join("a.ply").exists());
        assert!(out.join("a.obj").exists());
    }
}
