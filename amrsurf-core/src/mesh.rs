//! Isosurface mesh data structures

use crate::point::*;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Where sample values live on the mesh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplePlacement {
    /// One value per vertex
    #[default]
    Node,
    /// One value per triangle
    Cell,
}

impl SamplePlacement {
    /// Number of sample values expected for a mesh of the given size
    pub fn expected_len(&self, vertices: usize, faces: usize) -> usize {
        match self {
            SamplePlacement::Node => vertices,
            SamplePlacement::Cell => faces,
        }
    }
}

/// Triangles extracted from a single patch, indices local to the fragment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshFragment {
    pub vertices: Vec<Point3d>,
    pub faces: Vec<[u32; 3]>,
    pub values: Vec<f64>,
    pub placement: SamplePlacement,
}

impl MeshFragment {
    /// Create an empty fragment
    pub fn new(placement: SamplePlacement) -> Self {
        Self {
            placement,
            ..Self::default()
        }
    }

    /// Get the number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of faces
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if the fragment holds no triangles
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Check face indices and sample count
    pub fn validate(&self) -> Result<()> {
        validate_faces(&self.faces, self.vertices.len())?;
        validate_values(
            self.placement,
            self.values.len(),
            self.vertices.len(),
            self.faces.len(),
        )
    }

    /// Shift every face index by `base`, failing if an index leaves the
    /// 32-bit range
    pub fn offset_faces(&mut self, base: u32) -> Result<()> {
        for face in &mut self.faces {
            *face = offset_face(face, base)?;
        }
        Ok(())
    }
}

/// Per-rank counters of patch outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionStats {
    pub extracted: usize,
    pub no_crossing: usize,
    pub fully_masked: usize,
}

impl ExtractionStats {
    /// Total patches visited
    pub fn visited(&self) -> usize {
        self.extracted + self.no_crossing + self.fully_masked
    }

    /// Accumulate another rank's counters
    pub fn combine(&mut self, other: &ExtractionStats) {
        self.extracted += other.extracted;
        self.no_crossing += other.no_crossing;
        self.fully_masked += other.fully_masked;
    }
}

/// Append-only accumulator for the fragments one rank extracts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankMesh {
    pub rank: usize,
    pub vertices: Vec<Point3d>,
    pub faces: Vec<[u32; 3]>,
    pub values: Vec<f64>,
    pub placement: SamplePlacement,
    pub stats: ExtractionStats,
}

impl RankMesh {
    /// Create an empty accumulator for `rank`
    pub fn new(rank: usize, placement: SamplePlacement) -> Self {
        Self {
            rank,
            vertices: Vec::new(),
            faces: Vec::new(),
            values: Vec::new(),
            placement,
            stats: ExtractionStats::default(),
        }
    }

    /// Append a fragment, offsetting its faces by the current vertex count
    pub fn append(&mut self, mut fragment: MeshFragment) -> Result<()> {
        if fragment.placement != self.placement {
            return Err(Error::InvalidData(format!(
                "Cannot append {:?} samples to a {:?} mesh",
                fragment.placement, self.placement
            )));
        }
        let base = u32::try_from(self.vertices.len()).map_err(|_| {
            Error::Algorithm(format!(
                "Rank {} exceeds the 32-bit vertex index range",
                self.rank
            ))
        })?;
        fragment.offset_faces(base)?;
        self.vertices.append(&mut fragment.vertices);
        self.faces.append(&mut fragment.faces);
        self.values.append(&mut fragment.values);
        Ok(())
    }

    /// Get the number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of faces
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check face indices and sample count
    pub fn validate(&self) -> Result<()> {
        validate_faces(&self.faces, self.vertices.len())?;
        validate_values(
            self.placement,
            self.values.len(),
            self.vertices.len(),
            self.faces.len(),
        )
    }
}

/// The merged isosurface of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsoMesh {
    pub vertices: Vec<Point3d>,
    pub faces: Vec<[u32; 3]>,
    pub values: Vec<f64>,
    pub placement: SamplePlacement,
    pub stats: ExtractionStats,
}

impl IsoMesh {
    /// Create an empty mesh
    pub fn new(placement: SamplePlacement) -> Self {
        Self {
            vertices: Vec::new(),
            faces: Vec::new(),
            values: Vec::new(),
            placement,
            stats: ExtractionStats::default(),
        }
    }

    /// Concatenate rank meshes in rank order, re-offsetting face indices by
    /// the cumulative vertex count of the preceding ranks
    pub fn merge_ranks(mut ranks: Vec<RankMesh>) -> Result<Self> {
        ranks.sort_by_key(|r| r.rank);
        let placement = ranks
            .first()
            .map(|r| r.placement)
            .unwrap_or(SamplePlacement::Node);

        let mut merged = IsoMesh::new(placement);
        merged.vertices.reserve(ranks.iter().map(|r| r.vertex_count()).sum());
        merged.faces.reserve(ranks.iter().map(|r| r.face_count()).sum());

        for mut rank in ranks {
            if rank.placement != placement {
                return Err(Error::InvalidData(format!(
                    "Rank {} uses {:?} samples but rank 0 uses {:?}",
                    rank.rank, rank.placement, placement
                )));
            }
            let base = u32::try_from(merged.vertices.len()).map_err(|_| {
                Error::Algorithm("Merged mesh exceeds the 32-bit vertex index range".to_string())
            })?;
            for face in &rank.faces {
                merged.faces.push(offset_face(face, base)?);
            }
            merged.vertices.append(&mut rank.vertices);
            merged.values.append(&mut rank.values);
            merged.stats.combine(&rank.stats);
        }

        Ok(merged)
    }

    /// Get the number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of faces
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    /// Check if the mesh is empty
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Check face indices and sample count
    pub fn validate(&self) -> Result<()> {
        validate_faces(&self.faces, self.vertices.len())?;
        validate_values(
            self.placement,
            self.values.len(),
            self.vertices.len(),
            self.faces.len(),
        )
    }

    /// Calculate face normals (unnormalized, length = twice the triangle area)
    pub fn face_normals(&self) -> Vec<Vector3d> {
        self.faces
            .iter()
            .map(|face| {
                let v0 = self.vertices[face[0] as usize];
                let v1 = self.vertices[face[1] as usize];
                let v2 = self.vertices[face[2] as usize];
                (v1 - v0).cross(&(v2 - v0))
            })
            .collect()
    }

    /// Total triangle area
    pub fn surface_area(&self) -> f64 {
        self.face_normals().iter().map(|n| 0.5 * n.norm()).sum()
    }

    /// Axis-aligned bounds of the vertices, `None` when empty
    pub fn bounds(&self) -> Option<(Point3d, Point3d)> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold((first, first), |(lo, hi), v| {
            (lo.inf(v), hi.sup(v))
        }))
    }
}

fn offset_face(face: &[u32; 3], base: u32) -> Result<[u32; 3]> {
    let shift = |index: u32| {
        index.checked_add(base).ok_or_else(|| {
            Error::Algorithm(format!(
                "Face index {} offset by {} exceeds the 32-bit vertex index range",
                index, base
            ))
        })
    };
    Ok([shift(face[0])?, shift(face[1])?, shift(face[2])?])
}

fn validate_faces(faces: &[[u32; 3]], vertex_count: usize) -> Result<()> {
    if let Some((i, face)) = faces
        .iter()
        .enumerate()
        .find(|(_, f)| f.iter().any(|&idx| idx as usize >= vertex_count))
    {
        return Err(Error::InvalidData(format!(
            "Face {} {:?} references a vertex outside 0..{}",
            i, face, vertex_count
        )));
    }
    Ok(())
}

fn validate_values(
    placement: SamplePlacement,
    values: usize,
    vertices: usize,
    faces: usize,
) -> Result<()> {
    let expected = placement.expected_len(vertices, faces);
    if values != expected {
        return Err(Error::InvalidData(format!(
            "Mesh has {} {:?} samples, expected {}",
            values, placement, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn triangle(offset: f64) -> MeshFragment {
        MeshFragment {
            vertices: vec![
                Point3d::new(offset, 0.0, 0.0),
                Point3d::new(offset + 1.0, 0.0, 0.0),
                Point3d::new(offset, 1.0, 0.0),
            ],
            faces: vec![[0, 1, 2]],
            values: vec![1.0, 2.0, 3.0],
            placement: SamplePlacement::Node,
        }
    }

    #[test]
    fn test_fragment_validate() {
        let mut frag = triangle(0.0);
        assert!(frag.validate().is_ok());
        frag.faces.push([0, 1, 3]);
        assert!(frag.validate().is_err());
    }

    #[test]
    fn test_rank_mesh_append_offsets_faces() {
        let mut rank = RankMesh::new(0, SamplePlacement::Node);
        rank.append(triangle(0.0)).unwrap();
        rank.append(triangle(2.0)).unwrap();

        assert_eq!(rank.vertex_count(), 6);
        assert_eq!(rank.faces, vec![[0, 1, 2], [3, 4, 5]]);
        assert!(rank.validate().is_ok());

        let soup = MeshFragment::new(SamplePlacement::Cell);
        assert!(rank.append(soup).is_err());
    }

    #[test]
    fn test_merge_ranks_in_rank_order() {
        let mut r0 = RankMesh::new(0, SamplePlacement::Node);
        r0.append(triangle(0.0)).unwrap();
        r0.stats.extracted = 1;
        let mut r1 = RankMesh::new(1, SamplePlacement::Node);
        r1.append(triangle(5.0)).unwrap();
        r1.append(triangle(7.0)).unwrap();
        r1.stats.extracted = 2;
        r1.stats.no_crossing = 3;
        let r2 = RankMesh::new(2, SamplePlacement::Node);

        let merged = IsoMesh::merge_ranks(vec![r1, r2, r0]).unwrap();
        assert_eq!(merged.vertex_count(), 9);
        assert_eq!(merged.faces, vec![[0, 1, 2], [3, 4, 5], [6, 7, 8]]);
        assert_eq!(merged.vertices[3].x, 5.0);
        assert_eq!(merged.stats.visited(), 6);
        assert!(merged.validate().is_ok());
        assert_relative_eq!(merged.surface_area(), 1.5);
    }

    #[test]
    fn test_offset_overflow_is_an_error() {
        let mut frag = triangle(0.0);
        frag.faces = vec![[0, 1, u32::MAX - 3]];
        assert!(frag.offset_faces(3).is_ok());
        assert_eq!(frag.faces[0], [3, 4, u32::MAX]);
        assert!(matches!(frag.offset_faces(1), Err(Error::Algorithm(_))));

        let mut r0 = RankMesh::new(0, SamplePlacement::Node);
        r0.append(triangle(0.0)).unwrap();
        let mut r1 = RankMesh::new(1, SamplePlacement::Node);
        r1.faces.push([0, 1, u32::MAX - 1]);
        assert!(matches!(
            IsoMesh::merge_ranks(vec![r0, r1]),
            Err(Error::Algorithm(_))
        ));
    }

    #[test]
    fn test_merge_rejects_mixed_placement() {
        let r0 = RankMesh::new(0, SamplePlacement::Node);
        let r1 = RankMesh::new(1, SamplePlacement::Cell);
        assert!(IsoMesh::merge_ranks(vec![r0, r1]).is_err());
    }

    #[test]
    fn test_cell_placement_value_count() {
        let mesh = IsoMesh {
            vertices: triangle(0.0).vertices,
            faces: vec![[0, 1, 2]],
            values: vec![1.0],
            placement: SamplePlacement::Cell,
            stats: ExtractionStats::default(),
        };
        assert!(mesh.validate().is_ok());

        let (lo, hi) = mesh.bounds().unwrap();
        assert_eq!(lo, Point3d::new(0.0, 0.0, 0.0));
        assert_eq!(hi, Point3d::new(1.0, 1.0, 0.0));
    }
}
