//! OBJ format support
//!
//! Plain ASCII `v`/`f` records with 1-based indices. OBJ has no scalar
//! attributes, so the sample values are not stored; the header comment
//! records the field, isovalue and time instead.

use crate::{MeshReader, MeshWriter, SurfaceMetadata};
use amrsurf_core::{Error, IsoMesh, Point3d, Result, SamplePlacement};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub struct ObjReader;
pub struct ObjWriter;

impl MeshWriter for ObjWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &IsoMesh, meta: &SurfaceMetadata, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        writeln!(writer, "# amrsurf isosurface")?;
        writeln!(
            writer,
            "# field {} isovalue {:?} time {:?}",
            meta.field, meta.isovalue, meta.time
        )?;
        writeln!(
            writer,
            "# {} vertices, {} faces",
            mesh.vertex_count(),
            mesh.face_count()
        )?;
        for v in &mesh.vertices {
            writeln!(writer, "v {} {} {}", v.x, v.y, v.z)?;
        }
        for [a, b, c] in &mesh.faces {
            writeln!(writer, "f {} {} {}", a + 1, b + 1, c + 1)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl MeshReader for ObjReader {
    /// Reads geometry only; the returned mesh has no sample values
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<IsoMesh> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let mut mesh = IsoMesh::new(SamplePlacement::Node);

        let bad = |line: usize, what: &str| {
            Error::InvalidData(format!("{}:{}: {}", path.display(), line + 1, what))
        };

        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("v") => {
                    let coords = tokens
                        .take(3)
                        .map(|t| t.parse::<f64>().map_err(|_| bad(n, "invalid coordinate")))
                        .collect::<Result<Vec<f64>>>()?;
                    let [x, y, z] = coords[..] else {
                        return Err(bad(n, "vertex needs three coordinates"));
                    };
                    mesh.vertices.push(Point3d::new(x, y, z));
                }
                Some("f") => {
                    // `f 1/1/1 2/2/2 3/3/3` keeps the position index only
                    let indices = tokens
                        .map(|t| {
                            t.split('/')
                                .next()
                                .and_then(|i| i.parse::<u32>().ok())
                                .filter(|&i| i > 0)
                                .map(|i| i - 1)
                                .ok_or_else(|| bad(n, "invalid face index"))
                        })
                        .collect::<Result<Vec<u32>>>()?;
                    let [a, b, c] = indices[..] else {
                        return Err(bad(n, "only triangles are supported"));
                    };
                    mesh.faces.push([a, b, c]);
                }
                _ => {}
            }
        }

        if let Some(face) = mesh.faces.iter().flatten().find(|&&i| i as usize >= mesh.vertices.len()) {
            return Err(Error::InvalidData(format!(
                "Face index {} out of range for {} vertices",
                face,
                mesh.vertices.len()
            )));
        }
        Ok(mesh)
    }
}
