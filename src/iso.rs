//! Iso-surface extraction: marching cubes adapted to the adaptive octree,
//! with memoized corner evaluation, Hermite edge roots, cross-depth face
//! delegation, and loop-based polygon emission.
//!
//! Work inside a subtree proceeds finest depth first. Each depth runs as a
//! sequence of barriered phases: corner-slot values in parallel, sign masks
//! and their ancestor propagation, corner gradients in parallel, then the
//! serialized root creation and polygon emission (which are the only phases
//! touching the mesh sink and the cross-subtree boundary maps).

use crate::bspline::BoundaryType;
use crate::cube;
use crate::marching_cubes as mc;
use crate::mesh::{MeshSink, MeshVertex, PointIndex};
use crate::octree::{is_inset, DeterministicState, NodeId};
use crate::operators::{Stencil3, VectorStencil5};
use crate::poisson::PoissonReconstruction;
use crate::polynomial::solve_quadratic;
use crate::sorted_nodes::{CornerTable, EdgeTable};
use crate::triangulation::minimal_area_triangulation;
use crate::{Real, EPSILON};
use log::warn;
use na::{Point3, Vector3};
use rayon::prelude::*;
use std::collections::HashMap;

// Per-corner evaluation stencils; the plural forms add the parent-depth
// contribution and are indexed by the node's child code.
type CornerStencil = [Stencil3; 8];
type CornerStencils = [[Stencil3; 8]; 8];
type CornerNormalStencil = [VectorStencil5; 8];
type CornerNormalStencils = [[VectorStencil5; 8]; 8];

struct EvalStencils {
    value: CornerStencil,
    values: CornerStencils,
    normal: CornerNormalStencil,
    normals: CornerNormalStencils,
}

/// An edge root: the finest cell containing it, the edge within that cell,
/// and the canonical 64-bit key identifying the root across cells.
#[derive(Copy, Clone, Debug)]
struct RootInfo {
    node: NodeId,
    edge: usize,
    key: u64,
}

// Memoized per-subtree extraction state built over the shared tables.
struct RootData {
    corners: CornerTable,
    edges: Option<EdgeTable>,
    corner_values: Vec<Real>,
    corner_values_set: Vec<bool>,
    corner_normals: Vec<Vector3<Real>>,
    corner_normals_set: Vec<bool>,
    interior_roots: Vec<usize>,
    edges_set: Vec<bool>,
}

impl RootData {
    fn new(corners: CornerTable, edges: Option<EdgeTable>) -> Self {
        let c = corners.count();
        let e = edges.as_ref().map_or(0, |e| e.count());
        Self {
            corners,
            edges,
            corner_values: vec![0.0; c],
            corner_values_set: vec![false; c],
            corner_normals: vec![Vector3::zeros(); c],
            corner_normals_set: vec![false; c],
            interior_roots: vec![usize::MAX; e],
            edges_set: vec![false; e],
        }
    }
}

// Cross-subtree sharing: in-core root ids and corner values/gradients keyed
// by canonical corner keys, so parallel subtrees agree on boundary entries.
#[derive(Default)]
struct BoundaryData {
    roots: HashMap<u64, usize, DeterministicState>,
    values: HashMap<u64, (Real, Vector3<Real>), DeterministicState>,
}

// Parameter of the iso-crossing along an edge, from the endpoint values and
// (edge-scaled) endpoint derivatives. The Hermite spline is rescaled into a
// quadratic; degenerate fits fall back to linear interpolation, and the
// result always stays on the edge.
fn hermite_edge_root(
    x0: Real,
    x1: Real,
    dx0: Real,
    dx1: Real,
    iso_value: Real,
    non_linear_fit: bool,
) -> Real {
    let scl = (x1 - x0) / ((dx1 + dx0) / 2.0);
    let mut root = Real::NAN;
    if non_linear_fit && scl.is_finite() {
        let dx0 = dx0 * scl;
        let dx1 = dx1 * scl;
        let coeffs = [x0, dx0, 3.0 * (x1 - x0) - dx1 - 2.0 * dx0];
        let roots = solve_quadratic(coeffs, iso_value, EPSILON);
        let mut count = 0;
        let mut sum = 0.0;
        for r in roots {
            if (0.0..=1.0).contains(&r) {
                sum += r;
                count += 1;
            }
        }
        if count > 0 {
            root = sum / count as Real;
        }
    }
    if !root.is_finite() {
        root = (x0 - iso_value) / (x0 - x1);
    }
    if !root.is_finite() {
        warn!("degenerate edge root ({x0} {x1}); placing it at the midpoint");
        root = 0.5;
    }
    if !(0.0..=1.0).contains(&root) {
        warn!("edge root {root:.4} fell outside the edge ({x0} {x1}); clamping");
        root = root.clamp(0.0, 1.0);
    }
    root
}

impl PoissonReconstruction {
    // ------------------------------------------------------------------
    // Evaluation stencils
    // ------------------------------------------------------------------

    fn corner_eval_stencil(&self, d: usize) -> CornerStencil {
        let mut out = [[[[0.0; 3]; 3]; 3]; 8];
        if d < 2 {
            return out;
        }
        let center = 1u32 << (d - 1);
        let width = 1.0 / (1u64 << d) as Real;
        for (c, stencil) in out.iter_mut().enumerate() {
            let (cx, cy, cz) = cube::factor_corner_index(c);
            let pos = [
                (center + cx as u32) as Real * width,
                (center + cy as u32) as Real * width,
                (center + cz as u32) as Real * width,
            ];
            for (x, plane) in stencil.iter_mut().enumerate() {
                for (y, row) in plane.iter_mut().enumerate() {
                    for (z, v) in row.iter_mut().enumerate() {
                        let off = [
                            (center + x as u32 - 1) as usize,
                            (center + y as u32 - 1) as usize,
                            (center + z as u32 - 1) as usize,
                        ];
                        *v = self.basis.value(d, off[0], pos[0])
                            * self.basis.value(d, off[1], pos[1])
                            * self.basis.value(d, off[2], pos[2]);
                    }
                }
            }
        }
        out
    }

    fn corner_eval_stencils(&self, d: usize) -> CornerStencils {
        let mut out = [[[[[0.0; 3]; 3]; 3]; 8]; 8];
        if d < 3 {
            return out;
        }
        let center = 1u32 << (d - 1);
        let width = 1.0 / (1u64 << d) as Real;
        for (c, per_child) in out.iter_mut().enumerate() {
            let (cx, cy, cz) = cube::factor_corner_index(c);
            for (child, stencil) in per_child.iter_mut().enumerate() {
                let (ix, iy, iz) = cube::factor_corner_index(child);
                let idx = [center + ix as u32, center + iy as u32, center + iz as u32];
                let pos = [
                    (idx[0] + cx as u32) as Real * width,
                    (idx[1] + cy as u32) as Real * width,
                    (idx[2] + cz as u32) as Real * width,
                ];
                for (x, plane) in stencil.iter_mut().enumerate() {
                    for (y, row) in plane.iter_mut().enumerate() {
                        for (z, v) in row.iter_mut().enumerate() {
                            let off = [
                                (center / 2 + x as u32 - 1) as usize,
                                (center / 2 + y as u32 - 1) as usize,
                                (center / 2 + z as u32 - 1) as usize,
                            ];
                            *v = self.basis.value(d - 1, off[0], pos[0])
                                * self.basis.value(d - 1, off[1], pos[1])
                                * self.basis.value(d - 1, off[2], pos[2]);
                        }
                    }
                }
            }
        }
        out
    }

    fn corner_normal_eval_stencil(&self, d: usize) -> CornerNormalStencil {
        let mut out = [[[[Vector3::zeros(); 5]; 5]; 5]; 8];
        if d < 2 {
            return out;
        }
        let center = 1u32 << (d - 1);
        let width = 1.0 / (1u64 << d) as Real;
        for (c, stencil) in out.iter_mut().enumerate() {
            let (cx, cy, cz) = cube::factor_corner_index(c);
            let pos = [
                (center + cx as u32) as Real * width,
                (center + cy as u32) as Real * width,
                (center + cz as u32) as Real * width,
            ];
            for (x, plane) in stencil.iter_mut().enumerate() {
                for (y, row) in plane.iter_mut().enumerate() {
                    for (z, g) in row.iter_mut().enumerate() {
                        let off = [
                            (center + x as u32 - 2) as usize,
                            (center + y as u32 - 2) as usize,
                            (center + z as u32 - 2) as usize,
                        ];
                        let v = [
                            self.basis.value(d, off[0], pos[0]),
                            self.basis.value(d, off[1], pos[1]),
                            self.basis.value(d, off[2], pos[2]),
                        ];
                        let dv = [
                            self.basis.deriv(d, off[0], pos[0]),
                            self.basis.deriv(d, off[1], pos[1]),
                            self.basis.deriv(d, off[2], pos[2]),
                        ];
                        *g = Vector3::new(
                            dv[0] * v[1] * v[2],
                            v[0] * dv[1] * v[2],
                            v[0] * v[1] * dv[2],
                        );
                    }
                }
            }
        }
        out
    }

    fn corner_normal_eval_stencils(&self, d: usize) -> CornerNormalStencils {
        let mut out = [[[[[Vector3::zeros(); 5]; 5]; 5]; 8]; 8];
        if d < 3 {
            return out;
        }
        let center = 1u32 << (d - 1);
        let width = 1.0 / (1u64 << d) as Real;
        for (c, per_child) in out.iter_mut().enumerate() {
            let (cx, cy, cz) = cube::factor_corner_index(c);
            for (child, stencil) in per_child.iter_mut().enumerate() {
                let (ix, iy, iz) = cube::factor_corner_index(child);
                let idx = [center + ix as u32, center + iy as u32, center + iz as u32];
                let pos = [
                    (idx[0] + cx as u32) as Real * width,
                    (idx[1] + cy as u32) as Real * width,
                    (idx[2] + cz as u32) as Real * width,
                ];
                for (x, plane) in stencil.iter_mut().enumerate() {
                    for (y, row) in plane.iter_mut().enumerate() {
                        for (z, g) in row.iter_mut().enumerate() {
                            let off = [
                                (center / 2 + x as u32 - 2) as usize,
                                (center / 2 + y as u32 - 2) as usize,
                                (center / 2 + z as u32 - 2) as usize,
                            ];
                            let v = [
                                self.basis.value(d - 1, off[0], pos[0]),
                                self.basis.value(d - 1, off[1], pos[1]),
                                self.basis.value(d - 1, off[2], pos[2]),
                            ];
                            let dv = [
                                self.basis.deriv(d - 1, off[0], pos[0]),
                                self.basis.deriv(d - 1, off[1], pos[1]),
                                self.basis.deriv(d - 1, off[2], pos[2]),
                            ];
                            *g = Vector3::new(
                                dv[0] * v[1] * v[2],
                                v[0] * dv[1] * v[2],
                                v[0] * v[1] * dv[2],
                            );
                        }
                    }
                }
            }
        }
        out
    }

    fn center_eval_stencil(&self, d: usize) -> Stencil3 {
        let mut out = [[[0.0; 3]; 3]; 3];
        if d < 2 {
            return out;
        }
        let center = 1u32 << (d - 1);
        let width = 1.0 / (1u64 << d) as Real;
        let pos = (center as Real + 0.5) * width;
        for (x, plane) in out.iter_mut().enumerate() {
            for (y, row) in plane.iter_mut().enumerate() {
                for (z, v) in row.iter_mut().enumerate() {
                    let off = [
                        (center + x as u32 - 1) as usize,
                        (center + y as u32 - 1) as usize,
                        (center + z as u32 - 1) as usize,
                    ];
                    *v = self.basis.value(d, off[0], pos)
                        * self.basis.value(d, off[1], pos)
                        * self.basis.value(d, off[2], pos);
                }
            }
        }
        out
    }

    fn center_eval_stencils(&self, d: usize) -> [Stencil3; 8] {
        let mut out = [[[[0.0; 3]; 3]; 3]; 8];
        if d < 3 {
            return out;
        }
        let center = 1u32 << (d - 1);
        let width = 1.0 / (1u64 << d) as Real;
        for (child, stencil) in out.iter_mut().enumerate() {
            let (ix, iy, iz) = cube::factor_corner_index(child);
            let idx = [center + ix as u32, center + iy as u32, center + iz as u32];
            let pos = [
                (idx[0] as Real + 0.5) * width,
                (idx[1] as Real + 0.5) * width,
                (idx[2] as Real + 0.5) * width,
            ];
            for (x, plane) in stencil.iter_mut().enumerate() {
                for (y, row) in plane.iter_mut().enumerate() {
                    for (z, v) in row.iter_mut().enumerate() {
                        let off = [
                            (center / 2 + x as u32 - 1) as usize,
                            (center / 2 + y as u32 - 1) as usize,
                            (center / 2 + z as u32 - 1) as usize,
                        ];
                        *v = self.basis.value(d - 1, off[0], pos[0])
                            * self.basis.value(d - 1, off[1], pos[1])
                            * self.basis.value(d - 1, off[2], pos[2]);
                    }
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Point evaluation at cell centers and corners
    // ------------------------------------------------------------------

    /// The cumulative (all-depths) solution, indexed by sorted node index up
    /// to the second-finest depth; the vector read by every parent-depth
    /// evaluation.
    pub(crate) fn cumulative_solution(&self) -> Vec<Real> {
        let levels = self.snodes.levels;
        let fine_total = self.snodes.node_count[levels - 1];
        let mut met = vec![0.0; fine_total];
        for i in self.snodes.node_count[self.min_depth]..fine_total {
            met[i] = self.tree.data(self.snodes.tree_nodes[i]).solution;
        }
        for d in self.min_depth.max(1)..levels - 1 {
            self.up_sample(d, &mut met);
        }
        met
    }

    fn get_center_value(
        &self,
        node: NodeId,
        met_solution: &[Real],
        stencil: &Stencil3,
        p_stencil: &Stencil3,
        is_interior: bool,
    ) -> Real {
        let d = self.tree.depth(node);
        let (center, _) = self.tree.center_and_width(node);
        let mut value = 0.0;

        let neighbors = self.tree.neighbors3(node);
        for x in 0..3 {
            for y in 0..3 {
                for z in 0..3 {
                    let Some(n) = neighbors[x][y][z] else { continue };
                    value += if is_interior {
                        self.tree.data(n).solution * stencil[x][y][z]
                    } else {
                        let noff = self.tree.offset(n);
                        self.tree.data(n).solution
                            * self.basis.value(d, noff[0] as usize, center[0])
                            * self.basis.value(d, noff[1] as usize, center[1])
                            * self.basis.value(d, noff[2] as usize, center[2])
                    };
                }
            }
        }
        if d > self.min_depth {
            let parent = self.tree.parent(node).expect("deeper than min depth");
            let p_neighbors = self.tree.neighbors3(parent);
            for x in 0..3 {
                for y in 0..3 {
                    for z in 0..3 {
                        let Some(n) = p_neighbors[x][y][z] else { continue };
                        let n_index = self.tree.data(n).node_index;
                        if n_index < 0 {
                            continue;
                        }
                        value += if is_interior {
                            met_solution[n_index as usize] * p_stencil[x][y][z]
                        } else {
                            let noff = self.tree.offset(n);
                            met_solution[n_index as usize]
                                * self.basis.value(d - 1, noff[0] as usize, center[0])
                                * self.basis.value(d - 1, noff[1] as usize, center[1])
                                * self.basis.value(d - 1, noff[2] as usize, center[2])
                        };
                    }
                }
            }
        }
        value
    }

    fn get_corner_value(
        &self,
        node: NodeId,
        corner: usize,
        met_solution: &[Real],
        stencil: &Stencil3,
        stencils: &[Stencil3; 8],
        is_interior: bool,
    ) -> Real {
        let mut value = if self.boundary == BoundaryType::Dirichlet {
            -0.5
        } else {
            0.0
        };
        let d = self.tree.depth(node);
        let pos = self.tree.corner_position(node, corner);
        let (cx, cy, cz) = cube::factor_corner_index(corner);

        let mut start = [0usize; 3];
        let mut end = [3usize; 3];
        for (axis, &c) in [cx, cy, cz].iter().enumerate() {
            if c == 0 {
                end[axis] = 2;
            } else {
                start[axis] = 1;
            }
        }

        let neighbors = self.tree.neighbors3(node);
        for x in start[0]..end[0] {
            for y in start[1]..end[1] {
                for z in start[2]..end[2] {
                    let Some(n) = neighbors[x][y][z] else { continue };
                    value += if is_interior {
                        self.tree.data(n).solution * stencil[x][y][z]
                    } else {
                        let noff = self.tree.offset(n);
                        self.tree.data(n).solution
                            * self.basis.value(d, noff[0] as usize, pos[0])
                            * self.basis.value(d, noff[1] as usize, pos[1])
                            * self.basis.value(d, noff[2] as usize, pos[2])
                    };
                }
            }
        }

        if d > self.min_depth {
            let child_code = self.tree.child_index(node);
            let (px, py, pz) = cube::factor_corner_index(child_code);
            for (axis, (&c, &pc)) in [cx, cy, cz].iter().zip([px, py, pz].iter()).enumerate() {
                if c != pc {
                    start[axis] = 0;
                    end[axis] = 3;
                }
            }
            let parent = self.tree.parent(node).expect("deeper than min depth");
            let p_neighbors = self.tree.neighbors3(parent);
            for x in start[0]..end[0] {
                for y in start[1]..end[1] {
                    for z in start[2]..end[2] {
                        let Some(n) = p_neighbors[x][y][z] else { continue };
                        let n_index = self.tree.data(n).node_index;
                        if n_index < 0 {
                            continue;
                        }
                        value += if is_interior {
                            met_solution[n_index as usize] * stencils[child_code][x][y][z]
                        } else {
                            let noff = self.tree.offset(n);
                            met_solution[n_index as usize]
                                * self.basis.value(d - 1, noff[0] as usize, pos[0])
                                * self.basis.value(d - 1, noff[1] as usize, pos[1])
                                * self.basis.value(d - 1, noff[2] as usize, pos[2])
                        };
                    }
                }
            }
        }
        value
    }

    fn get_corner_normal(
        &self,
        node: NodeId,
        corner: usize,
        met_solution: &[Real],
        stencil: &VectorStencil5,
        stencils: &[VectorStencil5; 8],
        is_interior: bool,
    ) -> Vector3<Real> {
        let mut normal = Vector3::zeros();
        let d = self.tree.depth(node);
        let pos = self.tree.corner_position(node, corner);
        let (cx, cy, cz) = cube::factor_corner_index(corner);

        let mut start = [0usize; 3];
        let mut end = [5usize; 3];
        for (axis, &c) in [cx, cy, cz].iter().enumerate() {
            if c == 0 {
                end[axis] = 4;
            } else {
                start[axis] = 1;
            }
        }

        let eval_gradient = |bd: usize, noff: [u32; 3]| {
            let v = [
                self.basis.value(bd, noff[0] as usize, pos[0]),
                self.basis.value(bd, noff[1] as usize, pos[1]),
                self.basis.value(bd, noff[2] as usize, pos[2]),
            ];
            let dv = [
                self.basis.deriv(bd, noff[0] as usize, pos[0]),
                self.basis.deriv(bd, noff[1] as usize, pos[1]),
                self.basis.deriv(bd, noff[2] as usize, pos[2]),
            ];
            Vector3::new(
                dv[0] * v[1] * v[2],
                v[0] * dv[1] * v[2],
                v[0] * v[1] * dv[2],
            )
        };

        let neighbors = self.tree.neighbors5(node);
        for x in start[0]..end[0] {
            for y in start[1]..end[1] {
                for z in start[2]..end[2] {
                    let Some(n) = neighbors[x][y][z] else { continue };
                    normal += if is_interior {
                        stencil[x][y][z] * self.tree.data(n).solution
                    } else {
                        eval_gradient(d, self.tree.offset(n)) * self.tree.data(n).solution
                    };
                }
            }
        }

        if d > self.min_depth {
            let child_code = self.tree.child_index(node);
            let (px, py, pz) = cube::factor_corner_index(child_code);
            for (axis, (&c, &pc)) in [cx, cy, cz].iter().zip([px, py, pz].iter()).enumerate() {
                if c != pc {
                    start[axis] = 0;
                    end[axis] = 5;
                }
            }
            let parent = self.tree.parent(node).expect("deeper than min depth");
            let p_neighbors = self.tree.neighbors5(parent);
            for x in start[0]..end[0] {
                for y in start[1]..end[1] {
                    for z in start[2]..end[2] {
                        let Some(n) = p_neighbors[x][y][z] else { continue };
                        let n_index = self.tree.data(n).node_index;
                        if n_index < 0 {
                            continue;
                        }
                        normal += if is_interior {
                            stencils[child_code][x][y][z] * met_solution[n_index as usize]
                        } else {
                            eval_gradient(d - 1, self.tree.offset(n))
                                * met_solution[n_index as usize]
                        };
                    }
                }
            }
        }
        normal
    }

    // ------------------------------------------------------------------
    // Iso-value selection
    // ------------------------------------------------------------------

    /// The volume-weighted average of the solution at leaf centers, shifted
    /// by −0.5 under Dirichlet boundaries. Used as the extraction iso-value
    /// unless the caller overrides it.
    pub(crate) fn compute_iso_value(&self) -> Real {
        let levels = self.snodes.levels;
        let max_depth = levels - 1;
        let met = self.cumulative_solution();
        let channel = usize::from(self.params.output_density);

        let mut center_values = vec![0.0; self.snodes.node_count[levels]];
        let mut iso_sum = 0.0;
        let mut weight_sum = 0.0;
        for d in (self.min_depth..=max_depth).rev() {
            let stencil = self.center_eval_stencil(d);
            let p_stencils = self.center_eval_stencils(d);
            let range = self.snodes.depth_range(d);
            let values: Vec<Real> = range
                .clone()
                .into_par_iter()
                .map(|i| {
                    let node = self.snodes.tree_nodes[i];
                    if self.tree.has_children(node) {
                        let mut v = 0.0;
                        for c in 0..cube::CORNERS {
                            let child = self.tree.child(node, c);
                            v += center_values[self.tree.data(child).node_index as usize];
                        }
                        v / cube::CORNERS as Real
                    } else {
                        let child_code = if self.tree.parent(node).is_some() {
                            self.tree.child_index(node)
                        } else {
                            0
                        };
                        let is_interior =
                            self.is_stencil_interior(d, self.tree.offset(node), 2);
                        self.get_center_value(
                            node,
                            &met,
                            &stencil,
                            &p_stencils[child_code],
                            is_interior,
                        )
                    }
                })
                .collect();
            for (i, v) in range.zip(values) {
                center_values[i] = v;
                let node = self.snodes.tree_nodes[i];
                let w = self.tree.data(node).center_weight[channel];
                if w != 0.0 {
                    iso_sum += v * w;
                    weight_sum += w;
                }
            }
        }

        let shift = if self.boundary == BoundaryType::Dirichlet {
            0.5
        } else {
            0.0
        };
        let average = if weight_sum != 0.0 {
            iso_sum / weight_sum
        } else {
            shift
        };
        average - shift
    }

    // ------------------------------------------------------------------
    // Root keys and boundary tests
    // ------------------------------------------------------------------

    fn corner_key(&self, node: NodeId, corner: usize) -> u64 {
        let d = self.tree.depth(node);
        let off = self.tree.offset(node);
        let (x, y, z) = cube::factor_corner_index(corner);
        let shift = self.max_depth + 1 - d;
        let cx = ((off[0] + x as u32) as u64) << shift;
        let cy = ((off[1] + y as u32) as u64) << shift;
        let cz = ((off[2] + z as u32) as u64) << shift;
        cx | (cy << 21) | (cz << 42)
    }

    fn edge_root_key(&self, node: NodeId, edge: usize) -> u64 {
        let d = self.tree.depth(node);
        let off = self.tree.offset(node);
        let (o, i1, i2) = cube::factor_edge_index(edge);
        let (a1, a2) = match o {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        let shift = self.max_depth + 1 - d;
        let e1 = ((off[a1] + i1 as u32) as u64) << shift;
        let e2 = ((off[a2] + i2 as u32) as u64) << shift;
        let center = (((off[o] as u64) << 1) | 1) << (self.max_depth - d);
        (o as u64) | (e1 << 2) | (e2 << 23) | (center << 44)
    }

    fn is_boundary_face(&self, node: NodeId, face: usize, s_depth: usize) -> bool {
        let d = self.tree.depth(node);
        if d <= s_depth {
            return true;
        }
        let (dir, side) = cube::factor_face_index(face);
        let o = self.tree.offset(node);
        let idx = ((o[dir] as usize) << 1) + (side << 1);
        idx % (2 << (d - s_depth)) == 0
    }

    fn is_boundary_edge(&self, node: NodeId, edge: usize, s_depth: usize) -> bool {
        let (o, x, y) = cube::factor_edge_index(edge);
        self.is_boundary_edge_xy(node, o, x, y, s_depth)
    }

    fn is_boundary_edge_xy(
        &self,
        node: NodeId,
        dir: usize,
        x: usize,
        y: usize,
        s_depth: usize,
    ) -> bool {
        let d = self.tree.depth(node);
        if d <= s_depth {
            return true;
        }
        let o = self.tree.offset(node);
        let (idx1, idx2) = match dir {
            0 => (o[1] as usize + x, o[2] as usize + y),
            1 => (o[0] as usize + x, o[2] as usize + y),
            _ => (o[0] as usize + x, o[1] as usize + y),
        };
        let mask = 1 << (d - s_depth);
        idx1 % mask == 0 || idx2 % mask == 0
    }

    // ------------------------------------------------------------------
    // Root location
    // ------------------------------------------------------------------

    // Finds the finest cell that actually carries the root of `edge`,
    // starting from `node`, descending through refined face/edge neighbours.
    fn get_root_info(&self, node: NodeId, edge: usize) -> Option<RootInfo> {
        if !mc::has_edge_roots(self.tree.data(node).mc_index, edge) {
            return None;
        }

        let (f1, f2) = cube::faces_adjacent_to_edge(edge);
        let mut finest = node;
        let mut finest_edge = edge;
        if self.tree.depth(node) < self.max_depth && !self.tree.has_children(node) {
            let neighbors = self.tree.neighbors3(node);
            let face_neighbor = |f: usize| {
                let (dx, dy, dz) = cube::face_direction(f);
                neighbors[(dx + 1) as usize][(dy + 1) as usize][(dz + 1) as usize]
            };
            let usable = |n: Option<NodeId>| {
                n.filter(|&n| self.tree.data(n).node_index >= 0 && self.tree.has_children(n))
            };
            if let Some(n) = usable(face_neighbor(f1)) {
                finest = n;
                finest_edge = cube::face_reflect_edge_index(edge, f1);
            } else if let Some(n) = usable(face_neighbor(f2)) {
                finest = n;
                finest_edge = cube::face_reflect_edge_index(edge, f2);
            } else {
                let (o, i1, i2) = cube::factor_edge_index(edge);
                let diag = match o {
                    0 => neighbors[1][i1 * 2][i2 * 2],
                    1 => neighbors[i1 * 2][1][i2 * 2],
                    _ => neighbors[i1 * 2][i2 * 2][1],
                };
                if let Some(n) = usable(diag) {
                    finest = n;
                    finest_edge = cube::edge_reflect_edge_index(edge);
                }
            }
        }

        let (c1, c2) = cube::edge_corners(finest_edge);
        if self.tree.has_children(finest) {
            if let Some(ri) = self.get_root_info(self.tree.child(finest, c1), finest_edge) {
                return Some(ri);
            }
            if let Some(ri) = self.get_root_info(self.tree.child(finest, c2), finest_edge) {
                return Some(ri);
            }
            warn!(
                "no edge root found in either child (depth {}, edge {})",
                self.tree.depth(finest),
                finest_edge
            );
            None
        } else {
            Some(RootInfo {
                node: finest,
                edge: finest_edge,
                key: self.edge_root_key(finest, finest_edge),
            })
        }
    }

    // The other end of a super-edge shared with an ancestor: used when a
    // directed half-edge list fails to close.
    fn get_root_pair(&self, ri: &RootInfo) -> Option<RootInfo> {
        let (c1, c2) = cube::edge_corners(ri.edge);
        let mut node = ri.node;
        while let Some(parent) = self.tree.parent(node) {
            let c = self.tree.child_index(node);
            if c != c1 && c != c2 {
                return None;
            }
            if !mc::has_edge_roots(self.tree.data(parent).mc_index, ri.edge) {
                let other = if c == c1 { c2 } else { c1 };
                return self.get_root_info(self.tree.child(parent, other), ri.edge);
            }
            node = parent;
        }
        None
    }

    // Maps a root to its sink vertex: in-core through the boundary map,
    // out-of-core through the edge table.
    fn get_root_index(
        &self,
        ri: &RootInfo,
        root_data: &RootData,
        boundary: &BoundaryData,
    ) -> Option<PointIndex> {
        if let Some(&index) = boundary.roots.get(&ri.key) {
            return Some(PointIndex {
                index,
                in_core: true,
            });
        }
        if let Some(edges) = &root_data.edges {
            let slot = edges.index(ri.node, ri.edge);
            if root_data.edges_set[slot] {
                return Some(PointIndex {
                    index: root_data.interior_roots[slot],
                    in_core: false,
                });
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Hermite root construction
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn get_root(
        &self,
        ri: &RootInfo,
        iso_value: Real,
        s_depth: usize,
        root_data: &RootData,
        boundary: &BoundaryData,
        met_solution: &[Real],
        stencils: &[EvalStencils],
    ) -> Option<MeshVertex> {
        let mc_index = self.tree.data(ri.node).mc_index;
        if !mc::has_roots(mc_index) || !mc::has_edge_roots(mc_index, ri.edge) {
            return None;
        }

        let (c1, c2) = cube::edge_corners(ri.edge);
        let (o, i1, i2) = cube::factor_edge_index(ri.edge);
        // A cross-LOD edge can name a cell the current tables do not cover;
        // per the failure semantics that root is dropped, not fatal.
        let (Some(iter1), Some(iter2)) = (
            root_data.corners.get(ri.node, c1),
            root_data.corners.get(ri.node, c2),
        ) else {
            warn!("edge root outside the active corner table (key {})", ri.key);
            return None;
        };
        if !root_data.corner_values_set[iter1] || !root_data.corner_values_set[iter2] {
            warn!("edge root requested before its corner values were set (key {})", ri.key);
            return None;
        }
        let mut x0 = root_data.corner_values[iter1];
        let mut x1 = root_data.corner_values[iter2];

        let is_boundary = self.is_boundary_edge(ri.node, ri.edge, s_depth);
        let d = self.tree.depth(ri.node);
        let is_interior = self.is_stencil_interior(d, self.tree.offset(ri.node), 2);
        let fetch_normal = |c: usize, slot: usize| -> (Option<Real>, Vector3<Real>) {
            if is_boundary {
                if let Some(&(value, normal)) = boundary.values.get(&self.corner_key(ri.node, c)) {
                    return (Some(value), normal);
                }
            } else if root_data.corner_normals_set[slot] {
                return (None, root_data.corner_normals[slot]);
            }
            let normal = self.get_corner_normal(
                ri.node,
                c,
                met_solution,
                &stencils[d].normal[c],
                &stencils[d].normals[c],
                is_interior,
            );
            (None, normal)
        };
        let (v1, mut n1) = fetch_normal(c1, iter1);
        let (v2, mut n2) = fetch_normal(c2, iter2);
        if let Some(v) = v1 {
            x0 = v;
        }
        if let Some(v) = v2 {
            x1 = v;
        }

        let (center, width) = self.tree.center_and_width(ri.node);
        n1 *= width;
        n2 *= width;

        let mut position = Point3::origin();
        let (a1, a2) = match o {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };
        position[a1] = center[a1] - width / 2.0 + width * i1 as Real;
        position[a2] = center[a2] - width / 2.0 + width * i2 as Real;

        let root = hermite_edge_root(
            x0,
            x1,
            n1[o],
            n2[o],
            iso_value,
            self.params.non_linear_fit,
        );
        position[o] = center[o] - width / 2.0 + width * root;

        let density_depth = self.params.output_density.then(|| {
            let mut node = ri.node;
            while self.tree.depth(node) > self.splat_depth {
                match self.tree.parent(node) {
                    Some(p) => node = p,
                    None => break,
                }
            }
            self.sample_depth_and_weight(node, &position).0
        });

        Some(MeshVertex {
            point: position * self.scale + self.center.coords,
            density_depth,
        })
    }

    // ------------------------------------------------------------------
    // Face loops
    // ------------------------------------------------------------------

    // Collects directed root-to-root half-edges lying on `face` from the
    // leaves of a finer neighbouring subtree; pairs arrive reversed because
    // they are seen from the other side.
    fn collect_face_edges(
        &self,
        node: NodeId,
        face: usize,
        edges: &mut Vec<(RootInfo, RootInfo)>,
        vertex_count: &mut HashMap<u64, (RootInfo, i64)>,
    ) {
        if self.tree.has_children(node) {
            for c in cube::face_corners(face) {
                self.collect_face_edges(self.tree.child(node, c), face, edges, vertex_count);
            }
            return;
        }
        let mc_index = self.tree.data(node).mc_index;
        if !mc::has_roots(mc_index) {
            return;
        }
        for tri in mc::triangles(mc_index) {
            for k in 0..3 {
                let e1 = tri[k];
                let e2 = tri[(k + 1) % 3];
                if cube::face_adjacent_to_edges(e1, e2) != Some(face) {
                    continue;
                }
                match (self.get_root_info(node, e1), self.get_root_info(node, e2)) {
                    (Some(ri1), Some(ri2)) => {
                        edges.push((ri2, ri1));
                        vertex_count.entry(ri1.key).or_insert((ri1, 0)).1 -= 1;
                        vertex_count.entry(ri2.key).or_insert((ri2, 0)).1 += 1;
                    }
                    _ => warn!("bad shared-face edge pair (face {face})"),
                }
            }
        }
    }

    // All directed half-edges of a leaf's iso-curve, delegating cross-depth
    // faces to the finer side, then patching non-closing chains through
    // super-edge pairs.
    fn get_mc_iso_edges(&self, node: NodeId, s_depth: usize) -> Vec<(RootInfo, RootInfo)> {
        let mut edges: Vec<(RootInfo, RootInfo)> = vec![];
        let mut vertex_count: HashMap<u64, (RootInfo, i64)> = HashMap::new();

        let neighbors = self.tree.neighbors3(node);
        let triangles = mc::triangles(self.tree.data(node).mc_index);
        for f in 0..cube::FACES {
            let (dx, dy, dz) = cube::face_direction(f);
            let neighbor = neighbors[(dx + 1) as usize][(dy + 1) as usize][(dz + 1) as usize];
            let finer = neighbor.filter(|&n| {
                self.tree.data(n).node_index >= 0
                    && self.tree.has_children(n)
                    && !self.is_boundary_face(node, f, s_depth)
            });
            if let Some(finer) = finer {
                self.collect_face_edges(
                    finer,
                    cube::opposite_face(f),
                    &mut edges,
                    &mut vertex_count,
                );
            } else {
                for tri in &triangles {
                    for k in 0..3 {
                        let e1 = tri[k];
                        let e2 = tri[(k + 1) % 3];
                        if cube::face_adjacent_to_edges(e1, e2) != Some(f) {
                            continue;
                        }
                        match (self.get_root_info(node, e1), self.get_root_info(node, e2)) {
                            (Some(ri1), Some(ri2)) => {
                                edges.push((ri1, ri2));
                                vertex_count.entry(ri1.key).or_insert((ri1, 0)).1 += 1;
                                vertex_count.entry(ri2.key).or_insert((ri2, 0)).1 -= 1;
                            }
                            _ => warn!("bad edge pair on face {f}"),
                        }
                    }
                }
            }
        }

        // Re-balance vertices whose in/out half-edge counts disagree by
        // following the super-edge to the sibling root.
        let mut i = 0;
        while i < edges.len() {
            let (first, second) = edges[i];
            if let Some(&(info, count)) = vertex_count.get(&first.key) {
                if count != 0 {
                    match self.get_root_pair(&info) {
                        Some(pair) if vertex_count.contains_key(&pair.key) => {
                            edges.push((pair, first));
                            vertex_count.get_mut(&pair.key).unwrap().1 += 1;
                            vertex_count.get_mut(&first.key).unwrap().1 -= 1;
                        }
                        _ => warn!("unmatched half-edge start (key {})", first.key),
                    }
                }
            } else {
                warn!("half-edge start vertex missing (key {})", first.key);
            }
            if let Some(&(info, count)) = vertex_count.get(&second.key) {
                if count != 0 {
                    match self.get_root_pair(&info) {
                        Some(pair) if vertex_count.contains_key(&pair.key) => {
                            edges.push((second, pair));
                            vertex_count.get_mut(&pair.key).unwrap().1 -= 1;
                            vertex_count.get_mut(&second.key).unwrap().1 += 1;
                        }
                        _ => warn!("unmatched half-edge end (key {})", second.key),
                    }
                }
            } else {
                warn!("half-edge end vertex missing (key {})", second.key);
            }
            i += 1;
        }
        edges
    }

    // Splices directed half-edges into closed loops.
    fn get_edge_loops(mut edges: Vec<(RootInfo, RootInfo)>) -> Vec<Vec<(RootInfo, RootInfo)>> {
        let mut loops = vec![];
        while let Some(seed) = edges.pop() {
            let mut front: Vec<(RootInfo, RootInfo)> = vec![];
            let mut back: Vec<(RootInfo, RootInfo)> = vec![];
            let mut front_key = seed.1.key;
            let mut back_key = seed.0.key;
            let mut j = 0;
            while j < edges.len() {
                let e = edges[j];
                if e.0.key == front_key || e.1.key == front_key {
                    let e = if e.0.key == front_key { e } else { (e.1, e.0) };
                    front_key = e.1.key;
                    front.push(e);
                    edges.swap_remove(j);
                    j = 0;
                } else if e.0.key == back_key || e.1.key == back_key {
                    let e = if e.1.key == back_key { e } else { (e.1, e.0) };
                    back_key = e.0.key;
                    back.push(e);
                    edges.swap_remove(j);
                    j = 0;
                } else {
                    j += 1;
                }
            }
            let mut result = vec![];
            for e in back.into_iter().rev() {
                result.push(e);
            }
            result.push(seed);
            result.extend(front);
            loops.push(result);
        }
        loops
    }

    // ------------------------------------------------------------------
    // Polygon emission
    // ------------------------------------------------------------------

    // Resolves a sink vertex position during triangulation.
    fn vertex_position(
        &self,
        index: PointIndex,
        sink: &dyn MeshSink,
        interior_vertices: &[MeshVertex],
        off_set: usize,
    ) -> MeshVertex {
        if index.in_core {
            sink.in_core_point(index.index)
        } else {
            interior_vertices[index.index - off_set]
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_polygon_to_sink(
        &self,
        polygon: &[PointIndex],
        sink: &dyn MeshSink,
        interior_vertices: &mut Vec<MeshVertex>,
        off_set: usize,
    ) -> usize {
        if self.params.polygon_mesh {
            sink.add_polygon(polygon);
            return 1;
        }
        if polygon.len() == 3 {
            sink.add_polygon(polygon);
            return 1;
        }
        if polygon.len() < 3 {
            return 0;
        }

        let vertices: Vec<MeshVertex> = polygon
            .iter()
            .map(|&p| self.vertex_position(p, sink, interior_vertices, off_set))
            .collect();

        // A loop that degenerates onto a grid plane gets a barycenter fan
        // instead of the minimal-area triangulation.
        let mut is_degenerate = false;
        if self.params.add_barycenter {
            for i in 0..vertices.len() {
                for j in 0..i {
                    if (i + 1) % vertices.len() == j || (j + 1) % vertices.len() == i {
                        continue;
                    }
                    for k in 0..3 {
                        if vertices[i].point[k] == vertices[j].point[k] {
                            is_degenerate = true;
                        }
                    }
                }
            }
        }

        if is_degenerate {
            let mut center = Vector3::zeros();
            for v in &vertices {
                center += v.point.coords;
            }
            center /= vertices.len() as Real;
            let density = vertices
                .iter()
                .filter_map(|v| v.density_depth)
                .next()
                .filter(|_| self.params.output_density);
            let barycenter = MeshVertex {
                point: Point3::from(center),
                density_depth: density,
            };
            let center_idx = sink.add_out_of_core_point(barycenter);
            interior_vertices.push(barycenter);
            for i in 0..polygon.len() {
                sink.add_polygon(&[
                    polygon[i],
                    polygon[(i + 1) % polygon.len()],
                    PointIndex {
                        index: center_idx,
                        in_core: false,
                    },
                ]);
            }
            polygon.len()
        } else {
            let points: Vec<Point3<Real>> = vertices.iter().map(|v| v.point).collect();
            let triangles = minimal_area_triangulation(&points);
            for t in &triangles {
                sink.add_polygon(&[polygon[t[0]], polygon[t[1]], polygon[t[2]]]);
            }
            triangles.len()
        }
    }

    // ------------------------------------------------------------------
    // The extraction sweep
    // ------------------------------------------------------------------

    // Computes every unset corner-slot value owned by a depth-`d` leaf, in
    // parallel over slots, then derives the leaves' sign masks and
    // propagates set bits to ancestors sharing the corner.
    #[allow(clippy::too_many_arguments)]
    fn set_iso_corners(
        &mut self,
        d: usize,
        leaf_nodes: &[NodeId],
        iso_value: Real,
        root_data: &mut RootData,
        met_solution: &[Real],
        stencils: &[EvalStencils],
    ) {
        let jobs: Vec<(usize, NodeId, usize)> = root_data
            .corners
            .owners()
            .iter()
            .enumerate()
            .filter(|&(slot, &(node, _))| {
                !root_data.corner_values_set[slot]
                    && self.tree.depth(node) == d
                    && self.tree.data(node).node_index >= 0
            })
            .map(|(slot, &(node, corner))| (slot, node, corner))
            .collect();
        let values: Vec<Real> = jobs
            .par_iter()
            .map(|&(_, node, corner)| {
                let is_interior = self.is_stencil_interior(d, self.tree.offset(node), 2);
                self.get_corner_value(
                    node,
                    corner,
                    met_solution,
                    &stencils[d].value[corner],
                    &stencils[d].values[corner],
                    is_interior,
                )
            })
            .collect();
        for (&(slot, _, _), value) in jobs.iter().zip(values) {
            root_data.corner_values[slot] = value;
            root_data.corner_values_set[slot] = true;
        }

        for &leaf in leaf_nodes {
            let mut corner_values = [0.0; 8];
            for (c, v) in corner_values.iter_mut().enumerate() {
                let slot = root_data.corners.index(leaf, c);
                assert!(
                    root_data.corner_values_set[slot],
                    "corner slot unset while masking a leaf"
                );
                *v = root_data.corner_values[slot];
            }
            let mc_index = mc::get_index(&corner_values, iso_value);
            self.tree.data_mut(leaf).mc_index = mc_index;

            if let Some(parent) = self.tree.parent(leaf) {
                let c = self.tree.child_index(leaf);
                let mcid = mc_index & mc::corner_mask_bit(c);
                if mcid != 0 {
                    self.tree.data_mut(parent).mc_index |= mcid;
                    let mut p = parent;
                    loop {
                        match self.tree.parent(p) {
                            Some(gp)
                                if self.tree.depth(gp) >= self.min_depth
                                    && self.tree.child_index(p) == c =>
                            {
                                self.tree.data_mut(gp).mc_index |= mcid;
                                p = gp;
                            }
                            _ => break,
                        }
                    }
                }
            }
        }
    }

    // Pre-computes in parallel the corner gradients the depth's roots will
    // need, storing them in the slot memo or the shared boundary map.
    #[allow(clippy::too_many_arguments)]
    fn set_corner_normals(
        &self,
        leaf_nodes: &[NodeId],
        s_depth: usize,
        root_data: &mut RootData,
        boundary: &mut BoundaryData,
        met_solution: &[Real],
        stencils: &[EvalStencils],
    ) {
        #[derive(Copy, Clone)]
        enum Store {
            Slot(usize),
            Boundary(u64, usize),
        }
        let mut jobs: Vec<(NodeId, usize, Store)> = vec![];
        let mut seen_slots: HashMap<usize, ()> = HashMap::new();
        let mut seen_keys: HashMap<u64, ()> = HashMap::new();

        for &leaf in leaf_nodes {
            if self.boundary == BoundaryType::None
                && !is_inset(self.tree.depth(leaf), self.tree.offset(leaf))
            {
                continue;
            }
            if !mc::has_roots(self.tree.data(leaf).mc_index) {
                continue;
            }
            for e in 0..cube::EDGES {
                let Some(ri) = self.get_root_info(leaf, e) else {
                    continue;
                };
                let is_boundary = self.is_boundary_edge(ri.node, ri.edge, s_depth);
                let (c1, c2) = cube::edge_corners(ri.edge);
                for c in [c1, c2] {
                    if is_boundary {
                        let key = self.corner_key(ri.node, c);
                        if boundary.values.contains_key(&key)
                            || seen_keys.insert(key, ()).is_some()
                        {
                            continue;
                        }
                        let slot = root_data.corners.index(ri.node, c);
                        jobs.push((ri.node, c, Store::Boundary(key, slot)));
                    } else {
                        let slot = root_data.corners.index(ri.node, c);
                        if root_data.corner_normals_set[slot]
                            || seen_slots.insert(slot, ()).is_some()
                        {
                            continue;
                        }
                        jobs.push((ri.node, c, Store::Slot(slot)));
                    }
                }
            }
        }

        let normals: Vec<Vector3<Real>> = jobs
            .par_iter()
            .map(|&(node, corner, _)| {
                let d = self.tree.depth(node);
                let is_interior = self.is_stencil_interior(d, self.tree.offset(node), 2);
                self.get_corner_normal(
                    node,
                    corner,
                    met_solution,
                    &stencils[d].normal[corner],
                    &stencils[d].normals[corner],
                    is_interior,
                )
            })
            .collect();
        for (&(_, _, store), normal) in jobs.iter().zip(normals) {
            match store {
                Store::Slot(slot) => {
                    root_data.corner_normals[slot] = normal;
                    root_data.corner_normals_set[slot] = true;
                }
                Store::Boundary(key, slot) => {
                    let value = root_data.corner_values[slot];
                    boundary.values.insert(key, (value, normal));
                }
            }
        }
    }

    // Creates the root vertices of a leaf's active edges, inserting in-core
    // (boundary) or out-of-core (interior) sink points.
    #[allow(clippy::too_many_arguments)]
    fn set_mc_root_positions(
        &self,
        leaf: NodeId,
        s_depth: usize,
        iso_value: Real,
        root_data: &mut RootData,
        boundary: &mut BoundaryData,
        interior_vertices: &mut Vec<MeshVertex>,
        sink: &dyn MeshSink,
        met_solution: &[Real],
        stencils: &[EvalStencils],
    ) {
        if !mc::has_roots(self.tree.data(leaf).mc_index) {
            return;
        }
        for o in 0..3 {
            for j in 0..2 {
                for k in 0..2 {
                    let e = cube::edge_index(o, j, k);
                    let Some(ri) = self.get_root_info(leaf, e) else {
                        continue;
                    };
                    if root_data.edges.is_none()
                        || self.is_boundary_edge_xy(leaf, o, j, k, s_depth)
                    {
                        if boundary.roots.contains_key(&ri.key) {
                            continue;
                        }
                        let Some(vertex) = self.get_root(
                            &ri,
                            iso_value,
                            s_depth,
                            root_data,
                            boundary,
                            met_solution,
                            stencils,
                        ) else {
                            warn!("missing root on a sign-change edge (key {})", ri.key);
                            continue;
                        };
                        let index = sink.add_in_core_point(vertex);
                        boundary.roots.insert(ri.key, index);
                    } else {
                        let edges = root_data.edges.as_ref().expect("interior path has edges");
                        let slot = edges.index(ri.node, ri.edge);
                        if root_data.edges_set[slot] {
                            continue;
                        }
                        let Some(vertex) = self.get_root(
                            &ri,
                            iso_value,
                            s_depth,
                            root_data,
                            boundary,
                            met_solution,
                            stencils,
                        ) else {
                            warn!("missing root on a sign-change edge (key {})", ri.key);
                            continue;
                        };
                        let id = sink.add_out_of_core_point(vertex);
                        interior_vertices.push(vertex);
                        root_data.interior_roots[slot] = id;
                        root_data.edges_set[slot] = true;
                    }
                }
            }
        }
    }

    // Polygon loops of one leaf, as sink point indices.
    fn leaf_polygons(
        &self,
        leaf: NodeId,
        s_depth: usize,
        root_data: &RootData,
        boundary: &BoundaryData,
    ) -> Vec<Vec<PointIndex>> {
        let edges = self.get_mc_iso_edges(leaf, s_depth);
        let loops = Self::get_edge_loops(edges);
        let mut polygons = vec![];
        for l in loops {
            let mut polygon = vec![];
            for e in l.iter().rev() {
                match self.get_root_index(&e.0, root_data, boundary) {
                    Some(p) => polygon.push(p),
                    None => warn!("polygon vertex has no stored root (key {})", e.0.key),
                }
            }
            polygons.push(polygon);
        }
        polygons
    }

    /// Extracts the iso-surface at `iso_value` into `sink`, subtree by
    /// subtree, finest depth first within each subtree.
    pub(crate) fn extract_iso_surface(&mut self, iso_value: Real, sink: &dyn MeshSink) {
        let levels = self.snodes.levels;
        let max_depth = levels - 1;
        let s_depth = self.s_depth;
        let met_solution = self.cumulative_solution();

        for &node in &self.snodes.tree_nodes {
            self.tree.data_mut(node).mc_index = 0;
        }

        let stencils: Vec<EvalStencils> = (0..=max_depth)
            .map(|d| {
                if d < self.min_depth {
                    EvalStencils {
                        value: [[[[0.0; 3]; 3]; 3]; 8],
                        values: [[[[[0.0; 3]; 3]; 3]; 8]; 8],
                        normal: [[[[Vector3::zeros(); 5]; 5]; 5]; 8],
                        normals: [[[[[Vector3::zeros(); 5]; 5]; 5]; 8]; 8],
                    }
                } else {
                    EvalStencils {
                        value: self.corner_eval_stencil(d),
                        values: self.corner_eval_stencils(d),
                        normal: self.corner_normal_eval_stencil(d),
                        normals: self.corner_normal_eval_stencils(d),
                    }
                }
            })
            .collect();

        let mut boundary = BoundaryData::default();
        let coarse_corners = self.snodes.corner_table(&self.tree, None, s_depth);
        let mut coarse_data = RootData::new(coarse_corners, None);

        let subtree_roots: Vec<NodeId> = self
            .snodes
            .depth_range(s_depth)
            .map(|i| self.snodes.tree_nodes[i])
            .filter(|&n| self.tree.has_children(n))
            .collect();

        for subtree in subtree_roots {
            let corners = self.snodes.corner_table(&self.tree, Some(subtree), max_depth);
            let edges = self.snodes.edge_table(&self.tree, Some(subtree), max_depth);
            let mut root_data = RootData::new(corners, Some(edges));
            let off_set = sink.out_of_core_point_count();
            let mut interior_vertices: Vec<MeshVertex> = vec![];

            for d in ((s_depth + 1)..=max_depth).rev() {
                let leaf_nodes: Vec<NodeId> = self
                    .tree
                    .descendants(subtree)
                    .into_iter()
                    .filter(|&n| {
                        self.tree.depth(n) == d
                            && !self.tree.has_children(n)
                            && self.tree.data(n).node_index >= 0
                    })
                    .collect();
                if leaf_nodes.is_empty() {
                    continue;
                }

                self.set_iso_corners(
                    d,
                    &leaf_nodes,
                    iso_value,
                    &mut root_data,
                    &met_solution,
                    &stencils,
                );

                // Leaves sitting on a corner of the subtree cell seed the
                // coarse pass's memo, so both sides of the subdivision
                // boundary agree on that corner's value.
                for &leaf in &leaf_nodes {
                    let res = 1u32 << (d - s_depth);
                    let off = self.tree.offset(leaf);
                    let local = [off[0] % res, off[1] % res, off[2] % res];
                    let m = res - 1;
                    if !local.iter().all(|&o| o == 0 || o == m) {
                        continue;
                    }
                    let mut coarse = leaf;
                    while self.tree.depth(coarse) != s_depth {
                        coarse = self.tree.parent(coarse).expect("deeper than sDepth");
                    }
                    let c = cube::corner_index(
                        usize::from(local[0] != 0),
                        usize::from(local[1] != 0),
                        usize::from(local[2] != 0),
                    );
                    if let Some(idx) = coarse_data.corners.get(coarse, c) {
                        let slot = root_data.corners.index(leaf, c);
                        coarse_data.corner_values[idx] = root_data.corner_values[slot];
                        coarse_data.corner_values_set[idx] = true;
                    }
                }

                self.set_corner_normals(
                    &leaf_nodes,
                    s_depth,
                    &mut root_data,
                    &mut boundary,
                    &met_solution,
                    &stencils,
                );

                for &leaf in &leaf_nodes {
                    if self.boundary != BoundaryType::None
                        || is_inset(self.tree.depth(leaf), self.tree.offset(leaf))
                    {
                        self.set_mc_root_positions(
                            leaf,
                            s_depth,
                            iso_value,
                            &mut root_data,
                            &mut boundary,
                            &mut interior_vertices,
                            sink,
                            &met_solution,
                            &stencils,
                        );
                    }
                }

                let emitting: Vec<NodeId> = leaf_nodes
                    .iter()
                    .copied()
                    .filter(|&leaf| {
                        self.boundary != BoundaryType::None
                            || is_inset(self.tree.depth(leaf), self.tree.offset(leaf))
                    })
                    .collect();
                let polygons: Vec<Vec<Vec<PointIndex>>> = emitting
                    .par_iter()
                    .map(|&leaf| self.leaf_polygons(leaf, s_depth, &root_data, &boundary))
                    .collect();
                for leaf_polygons in polygons {
                    for polygon in leaf_polygons {
                        self.add_polygon_to_sink(
                            &polygon,
                            sink,
                            &mut interior_vertices,
                            off_set,
                        );
                    }
                }
            }
        }

        // The remaining coarse leaves (at or above the subtree depth) run
        // against the whole-tree corner table, with every edge treated as
        // boundary so roots live in the shared maps.
        let mut interior_vertices: Vec<MeshVertex> = vec![];
        let off_set = sink.out_of_core_point_count();
        for d in (0..=s_depth).rev() {
            let leaf_nodes: Vec<NodeId> = self
                .snodes
                .depth_range(d)
                .map(|i| self.snodes.tree_nodes[i])
                .filter(|&n| !self.tree.has_children(n))
                .collect();
            for &leaf in &leaf_nodes {
                let mut corner_values = [0.0; 8];
                for (c, v) in corner_values.iter_mut().enumerate() {
                    let slot = coarse_data.corners.index(leaf, c);
                    if coarse_data.corner_values_set[slot] {
                        *v = coarse_data.corner_values[slot];
                    } else {
                        let dd = self.tree.depth(leaf);
                        let is_interior =
                            self.is_stencil_interior(dd, self.tree.offset(leaf), 2);
                        let value = self.get_corner_value(
                            leaf,
                            c,
                            &met_solution,
                            &stencils[dd].value[c],
                            &stencils[dd].values[c],
                            is_interior,
                        );
                        coarse_data.corner_values[slot] = value;
                        coarse_data.corner_values_set[slot] = true;
                        *v = value;
                    }
                }
                let mc_index = mc::get_index(&corner_values, iso_value);
                self.tree.data_mut(leaf).mc_index = mc_index;
                if let Some(parent) = self.tree.parent(leaf) {
                    let c = self.tree.child_index(leaf);
                    let mcid = mc_index & mc::corner_mask_bit(c);
                    if mcid != 0 {
                        self.tree.data_mut(parent).mc_index |= mcid;
                        let mut p = parent;
                        loop {
                            match self.tree.parent(p) {
                                Some(gp)
                                    if self.tree.depth(gp) >= self.min_depth
                                        && self.tree.child_index(p) == c =>
                                {
                                    self.tree.data_mut(gp).mc_index |= mcid;
                                    p = gp;
                                }
                                _ => break,
                            }
                        }
                    }
                }
            }
            for &leaf in &leaf_nodes {
                if self.boundary != BoundaryType::None
                    || is_inset(self.tree.depth(leaf), self.tree.offset(leaf))
                {
                    self.set_mc_root_positions(
                        leaf,
                        0,
                        iso_value,
                        &mut coarse_data,
                        &mut boundary,
                        &mut interior_vertices,
                        sink,
                        &met_solution,
                        &stencils,
                    );
                    let polys = self.leaf_polygons(leaf, 0, &coarse_data, &boundary);
                    for polygon in polys {
                        self.add_polygon_to_sink(&polygon, sink, &mut interior_vertices, off_set);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::hermite_edge_root;
    use crate::marching_cubes as mc;
    use crate::{PoissonReconstruction, ReconstructionParams};
    use na::{Point3, Vector3};

    fn sphere_cloud(n: usize, radius: f64) -> (Vec<Point3<f64>>, Vec<Vector3<f64>>) {
        let golden = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
        let mut points = Vec::with_capacity(n);
        let mut normals = Vec::with_capacity(n);
        for i in 0..n {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let r = (1.0 - y * y).sqrt();
            let theta = golden * i as f64;
            let dir = Vector3::new(theta.cos() * r, y, theta.sin() * r);
            points.push(Point3::from(dir * radius));
            normals.push(dir);
        }
        (points, normals)
    }

    #[test]
    fn hermite_root_interpolates_a_clean_crossing() {
        // Symmetric values with consistent slopes cross in the middle.
        let r = hermite_edge_root(1.0, -1.0, -2.0, -2.0, 0.0, true);
        assert!((r - 0.5).abs() < 1.0e-9);
        // The linear fallback hits the exact interpolation parameter.
        let r = hermite_edge_root(3.0, -1.0, 0.0, 0.0, 0.0, false);
        assert!((r - 0.75).abs() < 1.0e-12);
    }

    #[test]
    fn hermite_root_stays_on_the_edge() {
        // Inconsistent or degenerate gradients must still produce a
        // parameter inside [0, 1].
        let cases = [
            (1.0, -0.01, 50.0, -0.003),
            (0.2, -3.0, 0.0, 0.0),
            (1.0e-9, -1.0e-9, 1.0, 1.0),
            (2.0, -0.5, -100.0, 100.0),
            (0.5, 0.5, 0.0, 0.0),
        ];
        for &(x0, x1, dx0, dx1) in &cases {
            for non_linear in [false, true] {
                let r = hermite_edge_root(x0, x1, dx0, dx1, 0.0, non_linear);
                assert!(
                    (0.0..=1.0).contains(&r),
                    "root {r} escaped the edge for ({x0}, {x1}, {dx0}, {dx1})"
                );
            }
        }
    }

    #[test]
    fn mc_bits_propagate_to_matching_ancestors() {
        let (points, normals) = sphere_cloud(2000, 0.4);
        let mut engine = PoissonReconstruction::from_points_and_normals(
            &points,
            &normals,
            ReconstructionParams {
                max_depth: 4,
                splat_depth: 2,
                constraint_weight: 0.0,
                threads: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let _ = engine.reconstruct_mesh();

        // Every leaf corner sign-bit whose corner code matches the leaf's
        // child code must be visible on the ancestors sharing that corner.
        let mut checked = 0;
        for &leaf in &engine.snodes.tree_nodes {
            if engine.tree.has_children(leaf) {
                continue;
            }
            let mc_index = engine.tree.data(leaf).mc_index;
            if mc_index == 0 {
                continue;
            }
            let Some(parent) = engine.tree.parent(leaf) else {
                continue;
            };
            let c = engine.tree.child_index(leaf);
            let mcid = mc_index & mc::corner_mask_bit(c);
            if mcid == 0 {
                continue;
            }
            assert!(
                engine.tree.data(parent).mc_index & mcid != 0,
                "parent lost a propagated corner bit"
            );
            checked += 1;
            let mut node = parent;
            loop {
                match engine.tree.parent(node) {
                    Some(gp)
                        if engine.tree.depth(gp) >= engine.min_depth
                            && engine.tree.child_index(node) == c =>
                    {
                        assert!(
                            engine.tree.data(gp).mc_index & mcid != 0,
                            "ancestor chain lost a propagated corner bit"
                        );
                        node = gp;
                    }
                    _ => break,
                }
            }
        }
        assert!(checked > 0, "no sign-carrying leaf corners found");
    }
}
