//! The mesh sink fed by the iso-surface extractor, and an in-memory
//! implementation of it.

use crate::Real;
use na::Point3;
use std::sync::Mutex;

/// An output vertex: a position, optionally tagged with the local
/// sample-depth estimate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct MeshVertex {
    /// World-space position.
    pub point: Point3<Real>,
    /// Local sample-depth estimate, when density output is enabled.
    pub density_depth: Option<Real>,
}

impl MeshVertex {
    pub fn new(point: Point3<Real>) -> Self {
        Self {
            point,
            density_depth: None,
        }
    }
}

/// Reference to a sink vertex: in-core vertices are indexed contiguously
/// from 0, out-of-core vertices carry the opaque id the sink returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PointIndex {
    /// Index within the stream it belongs to.
    pub index: usize,
    /// Whether the index refers to the in-core stream.
    pub in_core: bool,
}

/// Consumer of the extracted iso-surface. All methods take `&self` and the
/// sink must be shareable across extraction threads, so implementations
/// provide their own interior mutability.
pub trait MeshSink: Sync {
    fn add_in_core_point(&self, vertex: MeshVertex) -> usize;
    fn add_out_of_core_point(&self, vertex: MeshVertex) -> usize;
    fn add_polygon(&self, polygon: &[PointIndex]);
    fn in_core_point(&self, index: usize) -> MeshVertex;
    fn in_core_point_count(&self) -> usize;
    fn out_of_core_point_count(&self) -> usize;
}

/// In-memory sink keeping both vertex streams and the polygon list.
#[derive(Default)]
pub struct CoredMeshData {
    in_core: Mutex<Vec<MeshVertex>>,
    out_of_core: Mutex<Vec<MeshVertex>>,
    polygons: Mutex<Vec<Vec<PointIndex>>>,
}

impl CoredMeshData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the two vertex streams into a single indexed mesh
    /// (out-of-core vertices follow the in-core ones).
    pub fn into_mesh(self) -> ReconstructedMesh {
        let in_core = self.in_core.into_inner().unwrap();
        let out_of_core = self.out_of_core.into_inner().unwrap();
        let polygons = self.polygons.into_inner().unwrap();

        let offset = in_core.len();
        let mut vertices = in_core;
        vertices.extend(out_of_core);
        let polygons = polygons
            .into_iter()
            .map(|poly| {
                poly.into_iter()
                    .map(|p| if p.in_core { p.index } else { p.index + offset })
                    .collect()
            })
            .collect();
        ReconstructedMesh { vertices, polygons }
    }
}

impl MeshSink for CoredMeshData {
    fn add_in_core_point(&self, vertex: MeshVertex) -> usize {
        let mut in_core = self.in_core.lock().unwrap();
        in_core.push(vertex);
        in_core.len() - 1
    }

    fn add_out_of_core_point(&self, vertex: MeshVertex) -> usize {
        let mut out_of_core = self.out_of_core.lock().unwrap();
        out_of_core.push(vertex);
        out_of_core.len() - 1
    }

    fn add_polygon(&self, polygon: &[PointIndex]) {
        self.polygons.lock().unwrap().push(polygon.to_vec());
    }

    fn in_core_point(&self, index: usize) -> MeshVertex {
        self.in_core.lock().unwrap()[index]
    }

    fn in_core_point_count(&self) -> usize {
        self.in_core.lock().unwrap().len()
    }

    fn out_of_core_point_count(&self) -> usize {
        self.out_of_core.lock().unwrap().len()
    }
}

/// The final indexed mesh: positions plus polygon index tuples.
#[derive(Clone, Debug, Default)]
pub struct ReconstructedMesh {
    /// All vertices, in-core first.
    pub vertices: Vec<MeshVertex>,
    /// Polygons as tuples of indices into `vertices`.
    pub polygons: Vec<Vec<usize>>,
}

impl ReconstructedMesh {
    /// Split every polygon into a triangle fan. Polygons are convex enough
    /// for this to be safe only when the extractor already triangulated, so
    /// this is mainly a convenience for viewers and tests.
    pub fn triangles(&self) -> Vec<[usize; 3]> {
        let mut result = vec![];
        for poly in &self.polygons {
            for i in 1..poly.len().saturating_sub(1) {
                result.push([poly[0], poly[i], poly[i + 1]]);
            }
        }
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sink_resolves_indices() {
        let sink = CoredMeshData::new();
        let a = sink.add_in_core_point(MeshVertex::new(Point3::origin()));
        let b = sink.add_out_of_core_point(MeshVertex::new(Point3::new(1.0, 0.0, 0.0)));
        let c = sink.add_in_core_point(MeshVertex::new(Point3::new(0.0, 1.0, 0.0)));
        sink.add_polygon(&[
            PointIndex {
                index: a,
                in_core: true,
            },
            PointIndex {
                index: b,
                in_core: false,
            },
            PointIndex {
                index: c,
                in_core: true,
            },
        ]);
        assert_eq!(sink.in_core_point_count(), 2);
        assert_eq!(sink.out_of_core_point_count(), 1);

        let mesh = sink.into_mesh();
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.polygons, vec![vec![0, 2, 1]]);
    }
}
