//! XDMF descriptor for surfaces stored in a binary container
//!
//! The descriptor binds the `Conn`, `Coord` and sample arrays of a
//! `<base>.bin` container to an XDMF 3 triangle grid. Every shape and offset
//! is taken from the container table so the two files cannot disagree.

use crate::container::{ArrayContainer, ArrayEntry};
use crate::SurfaceMetadata;
use amrsurf_core::{Error, IsoMesh, Result, SamplePlacement};
use itertools::Itertools;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const CONN: &str = "Conn";
pub const COORD: &str = "Coord";

/// Extension of the descriptor file
pub const DESCRIPTOR_EXTENSION: &str = "xmf";
/// Extension of the binary container
pub const CONTAINER_EXTENSION: &str = "bin";

fn center(placement: SamplePlacement) -> &'static str {
    match placement {
        SamplePlacement::Node => "Node",
        SamplePlacement::Cell => "Cell",
    }
}

/// Pack a mesh into the three container arrays
pub fn mesh_container(mesh: &IsoMesh, field: &str) -> Result<ArrayContainer> {
    if field == CONN || field == COORD {
        return Err(Error::InvalidData(format!(
            "Field name '{}' collides with a geometry array",
            field
        )));
    }

    let conn = mesh
        .faces
        .iter()
        .flatten()
        .map(|&i| {
            i32::try_from(i)
                .map_err(|_| Error::InvalidData(format!("Vertex index {} exceeds i32", i)))
        })
        .collect::<Result<Vec<i32>>>()?;
    let coord: Vec<f64> = mesh
        .vertices
        .iter()
        .flat_map(|v| [v.x, v.y, v.z])
        .collect();

    let mut container = ArrayContainer::new();
    container
        .push_i32(CONN, &[mesh.face_count() as u64, 3], conn)?
        .push_f64(COORD, &[mesh.vertex_count() as u64, 3], coord)?
        .push_f64(field, &[mesh.values.len() as u64], mesh.values.clone())?;
    Ok(container)
}

fn find<'a>(entries: &'a [ArrayEntry], name: &str) -> Result<&'a ArrayEntry> {
    entries
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| Error::InvalidData(format!("Container table has no '{}' array", name)))
}

fn write_data_item<W: Write>(
    writer: &mut W,
    indent: &str,
    container: &str,
    entry: &ArrayEntry,
) -> Result<()> {
    let (number_type, precision) = entry.dtype.xdmf_type();
    writeln!(
        writer,
        "{indent}<DataItem Name=\"{}\" Format=\"Binary\" Endian=\"Little\" Seek=\"{}\" \
         NumberType=\"{number_type}\" Precision=\"{precision}\" Dimensions=\"{}\">",
        entry.name,
        entry.offset,
        entry.dims.iter().join(" ")
    )?;
    writeln!(writer, "{indent}  {container}")?;
    writeln!(writer, "{indent}</DataItem>")?;
    Ok(())
}

/// Write the descriptor text for a container whose table is `entries`
pub fn write_descriptor<W: Write>(
    writer: &mut W,
    container: &str,
    entries: &[ArrayEntry],
    meta: &SurfaceMetadata,
    placement: SamplePlacement,
) -> Result<()> {
    let conn = find(entries, CONN)?;
    let coord = find(entries, COORD)?;
    let samples = find(entries, &meta.sample)?;

    let faces = conn.dims.first().copied().unwrap_or(0);
    let vertices = coord.dims.first().copied().unwrap_or(0);
    let expected = placement.expected_len(vertices as usize, faces as usize) as u64;
    if samples.len() != expected {
        return Err(Error::InvalidData(format!(
            "{} samples for {:?} placement with {} vertices and {} faces",
            samples.len(),
            placement,
            vertices,
            faces
        )));
    }

    writeln!(writer, "<?xml version=\"1.0\"?>")?;
    writeln!(
        writer,
        "<Xdmf Version=\"3.0\" xmlns:xi=\"http://www.w3.org/2001/XInclude\">"
    )?;
    writeln!(writer, "  <Domain>")?;
    writeln!(writer, "    <Grid Name=\"isoSurface\" GridType=\"Uniform\">")?;
    writeln!(
        writer,
        "      <Information Name=\"Variable\" Value=\"{}\"/>",
        meta.field
    )?;
    writeln!(
        writer,
        "      <Information Name=\"IsoValue\" Value=\"{:?}\"/>",
        meta.isovalue
    )?;
    writeln!(writer, "      <Time Value=\"{:?}\"/>", meta.time)?;

    writeln!(
        writer,
        "      <Topology TopologyType=\"Triangle\" NumberOfElements=\"{}\">",
        faces
    )?;
    write_data_item(writer, "        ", container, conn)?;
    writeln!(writer, "      </Topology>")?;

    writeln!(writer, "      <Geometry GeometryType=\"XYZ\">")?;
    write_data_item(writer, "        ", container, coord)?;
    writeln!(writer, "      </Geometry>")?;

    writeln!(
        writer,
        "      <Attribute Name=\"{}\" AttributeType=\"Scalar\" Center=\"{}\">",
        meta.sample,
        center(placement)
    )?;
    write_data_item(writer, "        ", container, samples)?;
    writeln!(writer, "      </Attribute>")?;

    writeln!(writer, "    </Grid>")?;
    writeln!(writer, "  </Domain>")?;
    writeln!(writer, "</Xdmf>")?;
    Ok(())
}

/// Write `<dir>/<base>.bin` and `<dir>/<base>.xmf` for one surface.
///
/// Returns the container and descriptor paths.
pub fn write_isosurface<P: AsRef<Path>>(
    dir: P,
    base: &str,
    mesh: &IsoMesh,
    meta: &SurfaceMetadata,
) -> Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;

    let container_name = format!("{}.{}", base, CONTAINER_EXTENSION);
    let container_path = dir.join(&container_name);
    let descriptor_path = dir.join(format!("{}.{}", base, DESCRIPTOR_EXTENSION));

    let entries = mesh_container(mesh, &meta.sample)?.write(&container_path)?;

    let file = File::create(&descriptor_path)?;
    let mut writer = BufWriter::new(file);
    write_descriptor(&mut writer, &container_name, &entries, meta, mesh.placement)?;
    writer.flush()?;

    log::info!(
        "Wrote {} ({} faces, {} vertices)",
        descriptor_path.display(),
        mesh.face_count(),
        mesh.vertex_count()
    );
    Ok((container_path, descriptor_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::read_container;
    use amrsurf_core::{MeshFragment, Point3d, RankMesh};
    use regex::Regex;

    fn mesh(placement: SamplePlacement) -> IsoMesh {
        let mut rank = RankMesh::new(0, placement);
        let vertices = vec![
            Point3d::new(0.0, 0.0, 0.0),
            Point3d::new(1.0, 0.0, 0.0),
            Point3d::new(0.0, 1.0, 0.0),
            Point3d::new(1.0, 1.0, 0.0),
        ];
        let faces = vec![[0, 1, 2], [2, 1, 3]];
        let values = match placement {
            SamplePlacement::Node => vec![1.0, 2.0, 3.0, 4.0],
            SamplePlacement::Cell => vec![10.0, 20.0],
        };
        rank.append(MeshFragment {
            vertices,
            faces,
            values,
            placement,
        })
        .unwrap();
        IsoMesh::merge_ranks(vec![rank]).unwrap()
    }

    fn meta() -> SurfaceMetadata {
        SurfaceMetadata::new("temp", 1500.0, 0.25)
    }

    #[test]
    fn test_descriptor_matches_container() {
        let dir = tempfile::tempdir().unwrap();
        let (bin, xmf) = write_isosurface(dir.path(), "surf", &mesh(SamplePlacement::Node), &meta())
            .unwrap();
        assert_eq!(bin.file_name().unwrap(), "surf.bin");

        let text = fs::read_to_string(&xmf).unwrap();
        let container = read_container(&bin).unwrap();

        assert!(text.contains("<Grid Name=\"isoSurface\""));
        assert!(text.contains("<Information Name=\"Variable\" Value=\"temp\"/>"));
        assert!(text.contains("<Information Name=\"IsoValue\" Value=\"1500.0\"/>"));
        assert!(text.contains("<Time Value=\"0.25\"/>"));
        assert!(text.contains("TopologyType=\"Triangle\" NumberOfElements=\"2\""));
        assert!(text.contains("Center=\"Node\""));

        // Every DataItem seeks to the table offset with the table shape
        let item = Regex::new(r#"Name="(\w+)" Format="Binary" Endian="Little" Seek="(\d+)" NumberType="(\w+)" Precision="(\d)" Dimensions="([\d ]+)""#).unwrap();
        let mut seen = 0;
        for caps in item.captures_iter(&text) {
            let entry = container.entry(&caps[1]).unwrap();
            assert_eq!(caps[2].parse::<u64>().unwrap(), entry.offset);
            assert_eq!(&caps[3], entry.dtype.xdmf_type().0);
            assert_eq!(&caps[5], entry.dims.iter().join(" "));
            seen += 1;
        }
        assert_eq!(seen, 3);
        assert!(text.contains("  surf.bin\n"));

        assert_eq!(container.i32_array(CONN).unwrap(), &[0, 1, 2, 2, 1, 3]);
        assert_eq!(container.f64_array("temp").unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_cell_placement() {
        let dir = tempfile::tempdir().unwrap();
        let (_, xmf) = write_isosurface(dir.path(), "soup", &mesh(SamplePlacement::Cell), &meta())
            .unwrap();
        let text = fs::read_to_string(xmf).unwrap();
        assert!(text.contains("Center=\"Cell\""));
        assert!(text.contains("Dimensions=\"2\""));
    }

    #[test]
    fn test_sample_count_checked() {
        let mut container = mesh_container(&mesh(SamplePlacement::Node), "temp").unwrap();
        container.push_f64("extra", &[1], vec![0.0]).unwrap();
        let entries = container.entries();
        let mut out = Vec::new();
        // Node samples described as cell samples
        let result = write_descriptor(&mut out, "x.bin", &entries, &meta(), SamplePlacement::Cell);
        assert!(result.is_err());
    }

    #[test]
    fn test_sample_attribute_named_after_sample_field() {
        let dir = tempfile::tempdir().unwrap();
        let meta = SurfaceMetadata::new("temp", 1500.0, 0.25).with_sample("rho");
        let (bin, xmf) =
            write_isosurface(dir.path(), "s", &mesh(SamplePlacement::Node), &meta).unwrap();
        let text = fs::read_to_string(xmf).unwrap();
        assert!(text.contains("<Information Name=\"Variable\" Value=\"temp\"/>"));
        assert!(text.contains("<Attribute Name=\"rho\""));
        assert!(read_container(bin).unwrap().f64_array("rho").is_ok());
    }

    #[test]
    fn test_reserved_field_name() {
        assert!(mesh_container(&mesh(SamplePlacement::Node), "Coord").is_err());
    }
}
