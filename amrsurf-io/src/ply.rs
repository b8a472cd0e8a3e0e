//! PLY format support
//!
//! Surfaces are written as binary little-endian PLY with double precision
//! coordinates. The sample values become a `double` property named after the
//! field, on `vertex` for node samples or on `face` for cell samples.

use crate::{MeshReader, MeshWriter, SurfaceMetadata};
use amrsurf_core::{Error, IsoMesh, Point3d, Result, SamplePlacement};
use ply_rs::{
    parser::Parser,
    ply::{
        Addable, DefaultElement, ElementDef, Encoding, Ply, Property, PropertyDef, PropertyType,
        ScalarType,
    },
    writer::Writer,
};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const VERTEX: &str = "vertex";
const FACE: &str = "face";
const VERTEX_INDICES: &str = "vertex_indices";

pub struct PlyReader;
pub struct PlyWriter;

fn double_property(name: &str) -> PropertyDef {
    PropertyDef::new(name.to_string(), PropertyType::Scalar(ScalarType::Double))
}

impl MeshWriter for PlyWriter {
    fn write_mesh<P: AsRef<Path>>(mesh: &IsoMesh, meta: &SurfaceMetadata, path: P) -> Result<()> {
        if [VERTEX_INDICES, "x", "y", "z"].contains(&meta.sample.as_str()) {
            return Err(Error::InvalidData(format!(
                "Field name '{}' collides with a PLY geometry property",
                meta.sample
            )));
        }

        let mut ply = Ply::<DefaultElement>::new();
        ply.header.encoding = Encoding::BinaryLittleEndian;
        ply.header.comments.push(format!(
            "isosurface of {} at {:?}, time {:?}",
            meta.field, meta.isovalue, meta.time
        ));

        // Define vertex element
        let mut vertex_element = ElementDef::new(VERTEX.to_string());
        vertex_element.count = mesh.vertex_count();
        for axis in ["x", "y", "z"] {
            vertex_element.properties.add(double_property(axis));
        }
        if mesh.placement == SamplePlacement::Node {
            vertex_element.properties.add(double_property(&meta.sample));
        }
        ply.header.elements.add(vertex_element);

        // Define face element
        let mut face_element = ElementDef::new(FACE.to_string());
        face_element.count = mesh.face_count();
        face_element.properties.add(PropertyDef::new(
            VERTEX_INDICES.to_string(),
            PropertyType::List(ScalarType::UChar, ScalarType::Int),
        ));
        if mesh.placement == SamplePlacement::Cell {
            face_element.properties.add(double_property(&meta.sample));
        }
        ply.header.elements.add(face_element);

        let vertices = mesh
            .vertices
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut element = DefaultElement::new();
                element.insert("x".to_string(), Property::Double(v.x));
                element.insert("y".to_string(), Property::Double(v.y));
                element.insert("z".to_string(), Property::Double(v.z));
                if mesh.placement == SamplePlacement::Node {
                    element.insert(meta.sample.clone(), Property::Double(mesh.values[i]));
                }
                element
            })
            .collect();
        ply.payload.insert(VERTEX.to_string(), vertices);

        let faces = mesh
            .faces
            .iter()
            .enumerate()
            .map(|(i, face)| {
                let mut element = DefaultElement::new();
                let indices = face
                    .iter()
                    .map(|&idx| {
                        i32::try_from(idx).map_err(|_| {
                            Error::InvalidData(format!("Vertex index {} exceeds i32", idx))
                        })
                    })
                    .collect::<Result<Vec<i32>>>()?;
                element.insert(VERTEX_INDICES.to_string(), Property::ListInt(indices));
                if mesh.placement == SamplePlacement::Cell {
                    element.insert(meta.sample.clone(), Property::Double(mesh.values[i]));
                }
                Ok(element)
            })
            .collect::<Result<Vec<_>>>()?;
        ply.payload.insert(FACE.to_string(), faces);

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        Writer::new().write_ply(&mut writer, &mut ply)?;
        writer.flush()?;
        Ok(())
    }
}

impl MeshReader for PlyReader {
    fn read_mesh<P: AsRef<Path>>(path: P) -> Result<IsoMesh> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let ply = Parser::<DefaultElement>::new().read_ply(&mut reader)?;

        // The first non-geometry property carries the samples
        let extra = |element: &str, skip: &[&str]| -> Option<String> {
            ply.header.elements.get(element).and_then(|def| {
                def.properties
                    .keys()
                    .find(|name| !skip.contains(&name.as_str()))
                    .cloned()
            })
        };
        let (placement, sample_name) = match extra(VERTEX, &["x", "y", "z"]) {
            Some(name) => (SamplePlacement::Node, Some(name)),
            None => (SamplePlacement::Cell, extra(FACE, &[VERTEX_INDICES])),
        };
        let sample_name = sample_name
            .ok_or_else(|| Error::InvalidData("PLY file carries no sample property".to_string()))?;

        let mut mesh = IsoMesh::new(placement);
        if let Some(vertices) = ply.payload.get(VERTEX) {
            for vertex in vertices {
                mesh.vertices.push(Point3d::new(
                    extract_property_value(vertex, "x")?,
                    extract_property_value(vertex, "y")?,
                    extract_property_value(vertex, "z")?,
                ));
                if placement == SamplePlacement::Node {
                    mesh.values.push(extract_property_value(vertex, &sample_name)?);
                }
            }
        }
        if let Some(faces) = ply.payload.get(FACE) {
            for face in faces {
                let indices = extract_face_indices(face)?;
                let [a, b, c] = indices[..] else {
                    return Err(Error::InvalidData(format!(
                        "Face with {} vertices, expected a triangle",
                        indices.len()
                    )));
                };
                mesh.faces.push([a, b, c]);
                if placement == SamplePlacement::Cell {
                    mesh.values.push(extract_property_value(face, &sample_name)?);
                }
            }
        }

        mesh.validate()?;
        Ok(mesh)
    }
}

/// Extract a property value as f64 from a PLY element
fn extract_property_value(element: &DefaultElement, name: &str) -> Result<f64> {
    match element.get(name) {
        Some(Property::Double(val)) => Ok(*val),
        Some(Property::Float(val)) => Ok(*val as f64),
        Some(Property::Int(val)) => Ok(*val as f64),
        Some(Property::UInt(val)) => Ok(*val as f64),
        _ => Err(Error::InvalidData(format!(
            "Property '{}' not found or invalid type",
            name
        ))),
    }
}

/// Extract face indices from a PLY face element
fn extract_face_indices(element: &DefaultElement) -> Result<Vec<u32>> {
    match element.get(VERTEX_INDICES) {
        Some(Property::ListInt(indices)) => indices
            .iter()
            .map(|&idx| {
                u32::try_from(idx)
                    .map_err(|_| Error::InvalidData(format!("Negative vertex index {}", idx)))
            })
            .collect(),
        Some(Property::ListUInt(indices)) => Ok(indices.clone()),
        _ => Err(Error::InvalidData("Face indices not found".to_string())),
    }
}
