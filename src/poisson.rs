use crate::bspline::{BSplineBasis, BoundaryType};
use crate::config::ReconstructionParams;
use crate::error::ReconstructionError;
use crate::mesh::{CoredMeshData, MeshSink, ReconstructedMesh};
use crate::octree::Octree;
use crate::sorted_nodes::SortedTreeNodes;
use crate::splat::PointData;
use crate::stream::{PointStream, SlicePointStream};
use crate::Real;
use log::debug;
use na::{Point3, Vector3};
use parry::bounding_volume::Aabb;

/// An implicit surface reconstructed with the screened Poisson
/// reconstruction algorithm on an adaptive octree.
pub struct PoissonReconstruction {
    pub(crate) tree: Octree,
    pub(crate) basis: BSplineBasis,
    pub(crate) snodes: SortedTreeNodes,
    pub(crate) normals: Vec<Vector3<Real>>,
    pub(crate) points: Vec<PointData>,
    pub(crate) boundary: BoundaryType,
    pub(crate) max_depth: usize,
    pub(crate) min_depth: usize,
    pub(crate) splat_depth: usize,
    pub(crate) samples_per_node: Real,
    pub(crate) constrain_values: bool,
    /// Lower corner of the scaled bounding cube; output positions are
    /// `p * scale + center`.
    pub(crate) center: Point3<Real>,
    pub(crate) scale: Real,
    pub(crate) s_depth: usize,
    pub(crate) iso_value: Real,
    pub(crate) params: ReconstructionParams,
}

fn maybe_pool(threads: usize) -> Option<rayon::ThreadPool> {
    (threads > 0)
        .then(|| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .ok()
        })
        .flatten()
}

impl PoissonReconstruction {
    /// Reconstruct a surface from sample points and their outward normals.
    ///
    /// # Parameters
    /// - `points`: the sample points, in world coordinates.
    /// - `normals`: the normals at the sample points. Must have the same
    ///   length as `points`.
    /// - `params`: the reconstruction configuration; see
    ///   [`ReconstructionParams`].
    pub fn from_points_and_normals(
        points: &[Point3<Real>],
        normals: &[Vector3<Real>],
        params: ReconstructionParams,
    ) -> Result<Self, ReconstructionError> {
        let mut stream = SlicePointStream::new(points, normals);
        Self::from_stream(&mut stream, params)
    }

    /// Reconstruct a surface from a restartable stream of oriented samples.
    pub fn from_stream(
        stream: &mut dyn PointStream,
        params: ReconstructionParams,
    ) -> Result<Self, ReconstructionError> {
        params.validate()?;

        // Bounds pass: find the cube enclosing the transformed samples.
        let x_form = params.x_form;
        stream.reset();
        let mut aabb: Option<Aabb> = None;
        while let Some((p, _)) = stream.next_point() {
            let p = x_form.transform_point(&p);
            match &mut aabb {
                Some(aabb) => {
                    aabb.mins = Point3::from(aabb.mins.coords.inf(&p.coords));
                    aabb.maxs = Point3::from(aabb.maxs.coords.sup(&p.coords));
                }
                None => aabb = Some(Aabb::new(p, p)),
            }
        }
        let aabb = aabb.ok_or(ReconstructionError::EmptyPointSet)?;

        let boundary = params.boundary_type;
        let max_extent = aabb.extents().max();
        let scale = max_extent
            * if boundary == BoundaryType::None {
                2.0 * params.scale_factor
            } else {
                params.scale_factor
            };
        let center = aabb.center() - Vector3::repeat(scale / 2.0);

        let mut max_depth = params.max_depth;
        let mut splat_depth = params.splat_depth;
        let min_depth;
        if boundary == BoundaryType::None {
            max_depth += 1;
            min_depth = (params.min_depth + 1).clamp(2, max_depth);
            if splat_depth > 0 {
                splat_depth += 1;
            }
        } else {
            min_depth = params.min_depth.min(max_depth);
        }

        let mut engine = Self {
            tree: Octree::new(),
            basis: BSplineBasis::new(max_depth, boundary),
            snodes: SortedTreeNodes::empty(),
            normals: vec![],
            points: vec![],
            boundary,
            max_depth,
            min_depth,
            splat_depth,
            samples_per_node: params.samples_per_node,
            constrain_values: params.constraint_weight > 0.0,
            center,
            scale,
            s_depth: 0,
            iso_value: 0.0,
            params: params.clone(),
        };

        let count = engine.set_tree(stream);
        if count == 0 {
            return Err(ReconstructionError::EmptyPointSet);
        }
        debug!(
            "splatted {count} samples into {} octree nodes",
            engine.tree.node_count()
        );
        engine.clip_tree();
        engine.finalize_tree();
        engine.s_depth = engine.refine_boundary(params.subdivide_depth);
        debug!(
            "finalized tree: {} nodes over {} levels (subtree depth {})",
            engine.snodes.node_count[engine.snodes.levels],
            engine.snodes.levels,
            engine.s_depth
        );

        let run = |engine: &mut Self| {
            engine.set_laplacian_constraints();
            let iterations = engine.solve_cascade();
            debug!("cascade finished after {iterations} CG iterations");
            engine.iso_value = engine
                .params
                .iso_value
                .unwrap_or_else(|| engine.compute_iso_value());
            debug!("iso-value {:.6e}", engine.iso_value);
        };
        match maybe_pool(params.threads) {
            Some(pool) => pool.install(|| run(&mut engine)),
            None => run(&mut engine),
        }
        Ok(engine)
    }

    /// The iso-value the surface is extracted at.
    pub fn iso_value(&self) -> Real {
        self.iso_value
    }

    /// The domain where the implicit function is defined, in world
    /// coordinates.
    pub fn aabb(&self) -> Aabb {
        Aabb::new(self.center, self.center + Vector3::repeat(self.scale))
    }

    /// Evaluates the implicit function at the given world-space point. The
    /// reconstructed surface is its zero set; negative values lie inside.
    ///
    /// In order to get a meaningful value, the point must be located inside
    /// of [`Self::aabb`].
    pub fn eval(&self, pt: &Point3<Real>) -> Real {
        let q = (pt - self.center.coords) / self.scale;
        let mut value = if self.boundary == BoundaryType::Dirichlet {
            -0.5
        } else {
            0.0
        };
        let max_depth = self.snodes.levels.saturating_sub(1);
        for d in 0..=max_depth {
            let res = 1i64 << d;
            let cell = [
                (q[0] * res as Real).floor() as i64,
                (q[1] * res as Real).floor() as i64,
                (q[2] * res as Real).floor() as i64,
            ];
            for i in -1..=1 {
                for j in -1..=1 {
                    for k in -1..=1 {
                        let off = [cell[0] + i, cell[1] + j, cell[2] + k];
                        let Some(node) = self.tree.node_at(d, off) else {
                            continue;
                        };
                        let solution = self.tree.data(node).solution;
                        if solution == 0.0 {
                            continue;
                        }
                        value += solution
                            * self.basis.value(d, off[0] as usize, q[0])
                            * self.basis.value(d, off[1] as usize, q[1])
                            * self.basis.value(d, off[2] as usize, q[2]);
                    }
                }
            }
        }
        value - self.iso_value
    }

    /// Evaluates the gradient of the implicit function at the given
    /// world-space point.
    pub fn eval_gradient(&self, pt: &Point3<Real>) -> Vector3<Real> {
        let q = (pt - self.center.coords) / self.scale;
        let mut gradient = Vector3::zeros();
        let max_depth = self.snodes.levels.saturating_sub(1);
        for d in 0..=max_depth {
            let res = 1i64 << d;
            let cell = [
                (q[0] * res as Real).floor() as i64,
                (q[1] * res as Real).floor() as i64,
                (q[2] * res as Real).floor() as i64,
            ];
            for i in -1..=1 {
                for j in -1..=1 {
                    for k in -1..=1 {
                        let off = [cell[0] + i, cell[1] + j, cell[2] + k];
                        let Some(node) = self.tree.node_at(d, off) else {
                            continue;
                        };
                        let solution = self.tree.data(node).solution;
                        if solution == 0.0 {
                            continue;
                        }
                        let v = [
                            self.basis.value(d, off[0] as usize, q[0]),
                            self.basis.value(d, off[1] as usize, q[1]),
                            self.basis.value(d, off[2] as usize, q[2]),
                        ];
                        let dv = [
                            self.basis.deriv(d, off[0] as usize, q[0]),
                            self.basis.deriv(d, off[1] as usize, q[1]),
                            self.basis.deriv(d, off[2] as usize, q[2]),
                        ];
                        gradient += Vector3::new(
                            dv[0] * v[1] * v[2],
                            v[0] * dv[1] * v[2],
                            v[0] * v[1] * dv[2],
                        ) * solution;
                    }
                }
            }
        }
        gradient / self.scale
    }

    /// Extracts the iso-surface into the given mesh sink.
    pub fn reconstruct_into(&mut self, sink: &dyn MeshSink) {
        let iso_value = self.iso_value;
        match maybe_pool(self.params.threads) {
            Some(pool) => pool.install(|| self.extract_iso_surface(iso_value, sink)),
            None => self.extract_iso_surface(iso_value, sink),
        }
    }

    /// Extracts the iso-surface as an indexed mesh.
    pub fn reconstruct_mesh(&mut self) -> ReconstructedMesh {
        let sink = CoredMeshData::new();
        self.reconstruct_into(&sink);
        sink.into_mesh()
    }
}
