//! Finite-element operator assembly: Laplacian matrix rows, divergence
//! constraints, screening contributions, and the up/down-sampling pair that
//! couples depths in the cascade.
//!
//! All integrals factor into per-axis B-spline integrals. For interior nodes
//! the values come from per-depth stencils (5×5×5 cubes, or 2³ of them for
//! child-parent coupling, indexed by the 3-bit child code); near the domain
//! boundary the integrator is called directly.

use crate::bspline::BoundaryType;
use crate::cube;
use crate::octree::{NodeId, NO_INDEX};
use crate::poisson::PoissonReconstruction;
use crate::Real;
use na::Vector3;
use nalgebra_sparse::CooMatrix;
use rayon::prelude::*;

pub type Stencil3 = [[[Real; 3]; 3]; 3];
pub type Stencil5 = [[[Real; 5]; 5]; 5];
pub type VectorStencil5 = [[[Vector3<Real>; 5]; 5]; 5];

/// Loop bounds over a neighbourhood cube.
#[derive(Copy, Clone, Debug)]
pub struct Range3 {
    pub start: [usize; 3],
    pub end: [usize; 3],
}

impl Range3 {
    pub fn full(n: usize) -> Self {
        Self {
            start: [0; 3],
            end: [n; 3],
        }
    }
}

/// Shrinks a 5-wide range to the support of the parent-depth functions that
/// overlap `node`, from its child code.
pub fn coarser_support_range(child_code: usize) -> Range3 {
    let mut range = Range3::full(5);
    let (x, y, z) = cube::factor_corner_index(child_code);
    for (axis, &c) in [x, y, z].iter().enumerate() {
        if c == 0 {
            range.end[axis] = 4;
        } else {
            range.start[axis] = 1;
        }
    }
    range
}

impl PoissonReconstruction {
    /// Is the node far enough from the domain boundary that per-depth
    /// stencils apply? `margin` is 2 for same-depth stencils and 4 for
    /// child-parent stencils.
    pub(crate) fn is_stencil_interior(&self, d: usize, off: [u32; 3], margin: u32) -> bool {
        let mn = if self.boundary == BoundaryType::None {
            if d < 2 {
                return false;
            }
            (1u32 << (d - 2)) + margin
        } else {
            margin
        };
        if (1u32 << d) < 2 * mn {
            return false;
        }
        let mx = (1u32 << d) - mn;
        off.iter().all(|&o| o >= mn && o < mx)
    }

    /// `∫ ∇φ₁ · ∇φ₂` for two (same- or child-parent-depth) separable basis
    /// functions.
    pub(crate) fn laplacian_entry(
        &self,
        d: usize,
        off1: [u32; 3],
        off2: [u32; 3],
        child_parent: bool,
    ) -> Real {
        let dot = |axis: usize, d1: bool, d2: bool| {
            self.basis.dot(
                d,
                off1[axis] as usize,
                off2[axis] as usize,
                d1,
                d2,
                child_parent,
            )
        };
        let vv = [
            dot(0, false, false),
            dot(1, false, false),
            dot(2, false, false),
        ];
        let dd = [dot(0, true, true), dot(1, true, true), dot(2, true, true)];
        dd[0] * vv[1] * vv[2] + vv[0] * dd[1] * vv[2] + vv[0] * vv[1] * dd[2]
    }

    // Scatter-form divergence weight: how the vector field splatted on the
    // first function constrains the second.
    pub(crate) fn divergence_scatter(
        &self,
        d: usize,
        off1: [u32; 3],
        off2: [u32; 3],
        child_parent: bool,
    ) -> Vector3<Real> {
        let dot = |axis: usize, d1: bool, d2: bool| {
            self.basis.dot(
                d,
                off1[axis] as usize,
                off2[axis] as usize,
                d1,
                d2,
                child_parent,
            )
        };
        let vv = [
            dot(0, false, false),
            dot(1, false, false),
            dot(2, false, false),
        ];
        let vd = [dot(0, false, true), dot(1, false, true), dot(2, false, true)];
        Vector3::new(vd[0] * vv[1] * vv[2], vv[0] * vd[1] * vv[2], vv[0] * vv[1] * vd[2])
    }

    // Gather-form divergence weight: the first function's gradient against a
    // field carried by the second.
    pub(crate) fn divergence_gather(
        &self,
        d: usize,
        off1: [u32; 3],
        off2: [u32; 3],
        child_parent: bool,
    ) -> Vector3<Real> {
        let dot = |axis: usize, d1: bool, d2: bool| {
            self.basis.dot(
                d,
                off1[axis] as usize,
                off2[axis] as usize,
                d1,
                d2,
                child_parent,
            )
        };
        let vv = [
            dot(0, false, false),
            dot(1, false, false),
            dot(2, false, false),
        ];
        let dv = [dot(0, true, false), dot(1, true, false), dot(2, true, false)];
        Vector3::new(dv[0] * vv[1] * vv[2], vv[0] * dv[1] * vv[2], vv[0] * vv[1] * dv[2])
    }

    pub(crate) fn laplacian_stencil(&self, depth: usize) -> Stencil5 {
        let mut stencil = [[[0.0; 5]; 5]; 5];
        if depth < 2 {
            return stencil;
        }
        let center = 1u32 << (depth - 1);
        for (x, plane) in stencil.iter_mut().enumerate() {
            for (y, row) in plane.iter_mut().enumerate() {
                for (z, v) in row.iter_mut().enumerate() {
                    let off2 = [
                        x as u32 + center - 2,
                        y as u32 + center - 2,
                        z as u32 + center - 2,
                    ];
                    *v = self.laplacian_entry(depth, [center; 3], off2, false);
                }
            }
        }
        stencil
    }

    pub(crate) fn laplacian_stencils(&self, depth: usize) -> [Stencil5; 8] {
        let mut stencils = [[[[0.0; 5]; 5]; 5]; 8];
        if depth < 2 {
            return stencils;
        }
        let center = 1u32 << (depth - 1);
        for (c, stencil) in stencils.iter_mut().enumerate() {
            let (i, j, k) = cube::factor_corner_index(c);
            let off1 = [center + i as u32, center + j as u32, center + k as u32];
            for (x, plane) in stencil.iter_mut().enumerate() {
                for (y, row) in plane.iter_mut().enumerate() {
                    for (z, v) in row.iter_mut().enumerate() {
                        let off2 = [
                            x as u32 + center / 2 - 2,
                            y as u32 + center / 2 - 2,
                            z as u32 + center / 2 - 2,
                        ];
                        *v = self.laplacian_entry(depth, off1, off2, true);
                    }
                }
            }
        }
        stencils
    }

    pub(crate) fn divergence_stencil(&self, depth: usize, scatter: bool) -> VectorStencil5 {
        let mut stencil = [[[Vector3::zeros(); 5]; 5]; 5];
        if depth < 2 {
            return stencil;
        }
        let center = 1u32 << (depth - 1);
        for (x, plane) in stencil.iter_mut().enumerate() {
            for (y, row) in plane.iter_mut().enumerate() {
                for (z, v) in row.iter_mut().enumerate() {
                    let off2 = [
                        x as u32 + center - 2,
                        y as u32 + center - 2,
                        z as u32 + center - 2,
                    ];
                    *v = if scatter {
                        self.divergence_scatter(depth, [center; 3], off2, false)
                    } else {
                        self.divergence_gather(depth, [center; 3], off2, false)
                    };
                }
            }
        }
        stencil
    }

    pub(crate) fn divergence_stencils(&self, depth: usize, scatter: bool) -> [VectorStencil5; 8] {
        let mut stencils = [[[[Vector3::zeros(); 5]; 5]; 5]; 8];
        if depth < 2 {
            return stencils;
        }
        let center = 1u32 << (depth - 1);
        for (c, stencil) in stencils.iter_mut().enumerate() {
            let (i, j, k) = cube::factor_corner_index(c);
            let off1 = [center + i as u32, center + j as u32, center + k as u32];
            for (x, plane) in stencil.iter_mut().enumerate() {
                for (y, row) in plane.iter_mut().enumerate() {
                    for (z, v) in row.iter_mut().enumerate() {
                        let off2 = [
                            x as u32 + center / 2 - 2,
                            y as u32 + center / 2 - 2,
                            z as u32 + center / 2 - 2,
                        ];
                        *v = if scatter {
                            self.divergence_scatter(depth, off1, off2, true)
                        } else {
                            self.divergence_gather(depth, off1, off2, true)
                        };
                    }
                }
            }
        }
        stencils
    }

    // Screening contributions of the samples around `node` to its matrix
    // row: a 5×5×5 cube of `Σ_p w_p φ_row(p) φ_col(p)` values.
    pub(crate) fn screening_row_values(&self, node: NodeId) -> Stencil5 {
        let mut values = [[[0.0; 5]; 5]; 5];
        let d = self.tree.depth(node);
        let off = self.tree.offset(node);
        let res = 1i64 << d;
        let neighbors = self.tree.neighbors3(node);
        let mut diagonal = 0.0;
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..3 {
                    let Some(pn) = neighbors[i][j][k] else {
                        continue;
                    };
                    let idx = self.tree.data(pn).point_index;
                    if idx < 0 {
                        continue;
                    }
                    let data = &self.points[idx as usize];
                    let p = data.position;
                    // φ values of the three overlapping functions along each
                    // axis, indexed by the offset shift `jdx - s`.
                    let jdx = [i, j, k];
                    let mut sv = [[0.0; 3]; 3];
                    for l in 0..3 {
                        for (s, v) in sv[l].iter_mut().enumerate() {
                            let o = off[l] as i64 + jdx[l] as i64 - s as i64;
                            if o >= 0 && o < res {
                                *v = self.basis.value(d, o as usize, p[l]);
                            }
                        }
                    }
                    let value = sv[0][jdx[0]] * sv[1][jdx[1]] * sv[2][jdx[2]];
                    let weighted = value * data.weight;
                    diagonal += value * weighted;
                    for ii in 0..3 {
                        for jj in 0..3 {
                            for kk in 0..3 {
                                values[i + ii][j + jj][k + kk] +=
                                    sv[0][2 - ii] * sv[1][2 - jj] * sv[2][2 - kk] * weighted;
                            }
                        }
                    }
                }
            }
        }
        values[2][2][2] = diagonal;
        values
    }

    /// One Laplacian matrix row of `node`, as `(column, value)` pairs
    /// restricted to `range`. `col_index` maps a column node to its index in
    /// the system being assembled (returning `None` drops the column).
    pub(crate) fn matrix_row(
        &self,
        node: NodeId,
        stencil: &Stencil5,
        range: Range3,
        col_index: &(dyn Fn(NodeId) -> Option<usize> + Sync),
    ) -> Vec<(usize, Real)> {
        let d = self.tree.depth(node);
        let off = self.tree.offset(node);
        let is_interior = self.is_stencil_interior(d, off, 2);
        let neighbors = self.tree.neighbors5(node);
        let screening = self
            .constrain_values
            .then(|| self.screening_row_values(node));

        let mut row = vec![];
        for x in range.start[0]..range.end[0] {
            for y in range.start[1]..range.end[1] {
                for z in range.start[2]..range.end[2] {
                    let Some(col) = neighbors[x][y][z] else {
                        continue;
                    };
                    if self.tree.data(col).node_index < 0 {
                        continue;
                    }
                    let Some(col_index) = col_index(col) else {
                        continue;
                    };
                    let mut value = if is_interior {
                        stencil[x][y][z]
                    } else {
                        self.laplacian_entry(d, off, self.tree.offset(col), false)
                    };
                    if let Some(screening) = &screening {
                        value += screening[x][y][z];
                    }
                    if value != 0.0 {
                        row.push((col_index, value));
                    }
                }
            }
        }
        row
    }

    /// The amount to subtract from `node`'s constraint for the already-solved
    /// coarser depths: the child-parent Laplacian coupling against the
    /// up-sampled solution, plus the screening term against the coarser
    /// point values.
    pub(crate) fn coarser_constraint_delta(
        &self,
        node: NodeId,
        met_solution: &[Real],
        stencils: &[Stencil5; 8],
    ) -> Real {
        let d = self.tree.depth(node);
        if d <= self.min_depth {
            return 0.0;
        }
        let off = self.tree.offset(node);
        let is_interior = self.is_stencil_interior(d, off, 4);
        let child_code = self.tree.child_index(node);
        let range = coarser_support_range(child_code);
        let stencil = &stencils[child_code];
        let parent = self.tree.parent(node).expect("non-root node");
        let p_neighbors = self.tree.neighbors5(parent);

        let mut delta = 0.0;
        for x in range.start[0]..range.end[0] {
            for y in range.start[1]..range.end[1] {
                for z in range.start[2]..range.end[2] {
                    let Some(q) = p_neighbors[x][y][z] else {
                        continue;
                    };
                    let q_index = self.tree.data(q).node_index;
                    if q_index < 0 {
                        continue;
                    }
                    let coupling = if is_interior {
                        stencil[x][y][z]
                    } else {
                        self.laplacian_entry(d, off, self.tree.offset(q), true)
                    };
                    delta += coupling * met_solution[q_index as usize];
                }
            }
        }

        if self.constrain_values {
            // Screening against the coarser solution evaluated at the
            // neighbourhood's sample points: each point contributes its
            // coarser value weighted by the row node's own basis function.
            let neighbors = self.tree.neighbors3(node);
            for plane in neighbors.iter() {
                for cells in plane.iter() {
                    for &cell in cells.iter() {
                        let Some(pn) = cell else {
                            continue;
                        };
                        let idx = self.tree.data(pn).point_index;
                        if idx < 0 {
                            continue;
                        }
                        let data = &self.points[idx as usize];
                        let p = data.position;
                        delta += data.coarser_value
                            * self.basis.value(d, off[0] as usize, p[0])
                            * self.basis.value(d, off[1] as usize, p[1])
                            * self.basis.value(d, off[2] as usize, p[2]);
                    }
                }
            }
        }
        delta
    }

    /// Assembles the divergence right-hand-side into every node's
    /// `constraint` field: same-depth gather, fine-to-coarse down-sampled
    /// scatter, and coarser-depth coupling through up-sampled normal
    /// coefficients.
    pub(crate) fn set_laplacian_constraints(&mut self) {
        let levels = self.snodes.levels;
        let max_depth = levels - 1;
        let start_depth = if self.boundary == BoundaryType::None {
            2
        } else {
            0
        };

        let node_total = self.snodes.node_count[levels];
        let fine_total = self.snodes.node_count[max_depth];
        let mut constraints = vec![0.0; fine_total];

        for node in self.snodes.tree_nodes.iter().copied() {
            self.tree.data_mut(node).constraint = 0.0;
        }

        // Same-depth gather plus the scatter onto the parent depth,
        // re-expressed as a gather so rows can run in parallel.
        for d in (start_depth..levels).rev() {
            let gather_stencil = self.divergence_stencil(d, false);
            let scatter_stencils = self.divergence_stencils(d, true);

            let range = self.snodes.depth_range(d);
            let own: Vec<Real> = range
                .clone()
                .into_par_iter()
                .map(|i| {
                    let node = self.snodes.tree_nodes[i];
                    let off = self.tree.offset(node);
                    let is_interior = self.is_stencil_interior(d, off, 2);
                    let neighbors = self.tree.neighbors5(node);
                    let mut constraint = 0.0;
                    for x in 0..5 {
                        for y in 0..5 {
                            for z in 0..5 {
                                let Some(nb) = neighbors[x][y][z] else {
                                    continue;
                                };
                                let n_idx = self.tree.data(nb).normal_index;
                                if n_idx < 0 {
                                    continue;
                                }
                                let normal = self.normals[n_idx as usize];
                                constraint += if is_interior {
                                    gather_stencil[x][y][z].dot(&normal)
                                } else {
                                    self.divergence_gather(d, off, self.tree.offset(nb), false)
                                        .dot(&normal)
                                };
                            }
                        }
                    }
                    constraint
                })
                .collect();
            for (i, c) in range.clone().zip(own) {
                let node = self.snodes.tree_nodes[i];
                self.tree.data_mut(node).constraint += c;
            }

            if d == 0 {
                continue;
            }
            // Parent-depth accumulation: each parent-depth node gathers the
            // scatter contributions of the fine normals around it.
            let p_range = self.snodes.depth_range(d - 1);
            let parent_adds: Vec<Real> = p_range
                .clone()
                .into_par_iter()
                .map(|qi| {
                    let q = self.snodes.tree_nodes[qi];
                    let q_off = self.tree.offset(q);
                    let mut acc = 0.0;
                    for x in 0..5usize {
                        for y in 0..5usize {
                            for z in 0..5usize {
                                let p_off = [
                                    q_off[0] as i64 - (x as i64 - 2),
                                    q_off[1] as i64 - (y as i64 - 2),
                                    q_off[2] as i64 - (z as i64 - 2),
                                ];
                                let Some(p) = self.tree.node_at(d - 1, p_off) else {
                                    continue;
                                };
                                if !self.tree.has_children(p) {
                                    continue;
                                }
                                for c in 0..cube::CORNERS {
                                    let n = self.tree.child(p, c);
                                    if self.tree.data(n).node_index < 0 {
                                        continue;
                                    }
                                    let n_idx = self.tree.data(n).normal_index;
                                    if n_idx < 0 {
                                        continue;
                                    }
                                    let normal = self.normals[n_idx as usize];
                                    if normal == Vector3::zeros() {
                                        continue;
                                    }
                                    let range = coarser_support_range(c);
                                    if x < range.start[0]
                                        || x >= range.end[0]
                                        || y < range.start[1]
                                        || y >= range.end[1]
                                        || z < range.start[2]
                                        || z >= range.end[2]
                                    {
                                        continue;
                                    }
                                    let n_off = self.tree.offset(n);
                                    let interior2 =
                                        self.is_stencil_interior(d, n_off, 4);
                                    acc += if interior2 {
                                        scatter_stencils[c][x][y][z].dot(&normal)
                                    } else {
                                        self.divergence_scatter(d, n_off, q_off, true)
                                            .dot(&normal)
                                    };
                                }
                            }
                        }
                    }
                    acc
                })
                .collect();
            for (qi, add) in p_range.zip(parent_adds) {
                if qi < fine_total {
                    constraints[qi] += add;
                }
            }
        }

        // Down-sample the scattered constraints fine → coarse, then fold
        // them into the node payloads.
        for d in (start_depth..max_depth).rev() {
            self.down_sample(d, &mut constraints);
        }
        for i in 0..fine_total {
            let node = self.snodes.tree_nodes[i];
            self.tree.data_mut(node).constraint += constraints[i];
        }
        drop(constraints);

        // Up-sample the per-node normal coefficients coarse → fine and add
        // the coupling from all coarser depths.
        let mut coefficients = vec![Vector3::zeros(); node_total];
        for i in 0..fine_total {
            let node = self.snodes.tree_nodes[i];
            let idx = self.tree.data(node).normal_index;
            if idx >= 0 {
                coefficients[i] += self.normals[idx as usize];
            }
        }
        for d in start_depth..max_depth {
            // Fills depth d from depth d − 1.
            self.up_sample_vectors(d, &mut coefficients);
        }

        for d in 1..levels {
            let stencils = self.divergence_stencils(d, false);
            let range = self.snodes.depth_range(d);
            let adds: Vec<Real> = range
                .clone()
                .into_par_iter()
                .map(|i| {
                    let node = self.snodes.tree_nodes[i];
                    let Some(parent) = self.tree.parent(node) else {
                        return 0.0;
                    };
                    let off = self.tree.offset(node);
                    let child_code = self.tree.child_index(node);
                    let srange = coarser_support_range(child_code);
                    let is_interior = self.is_stencil_interior(d, off, 4);
                    let p_neighbors = self.tree.neighbors5(parent);
                    let mut constraint = 0.0;
                    for x in srange.start[0]..srange.end[0] {
                        for y in srange.start[1]..srange.end[1] {
                            for z in srange.start[2]..srange.end[2] {
                                let Some(q) = p_neighbors[x][y][z] else {
                                    continue;
                                };
                                let q_index = self.tree.data(q).node_index;
                                if q_index < 0 {
                                    continue;
                                }
                                let normal = coefficients[q_index as usize];
                                if normal == Vector3::zeros() {
                                    continue;
                                }
                                constraint += if is_interior {
                                    stencils[child_code][x][y][z].dot(&normal)
                                } else {
                                    self.divergence_gather(d, off, self.tree.offset(q), true)
                                        .dot(&normal)
                                };
                            }
                        }
                    }
                    constraint
                })
                .collect();
            for (i, add) in range.zip(adds) {
                let node = self.snodes.tree_nodes[i];
                self.tree.data_mut(node).constraint += add;
            }
        }

        // Stash the normal magnitude as the iso-value weighting channel.
        for i in 0..node_total {
            let node = self.snodes.tree_nodes[i];
            let idx = self.tree.data(node).normal_index;
            let w = if idx < 0 {
                0.0
            } else {
                self.normals[idx as usize].norm()
            };
            let channel = usize::from(self.params.output_density);
            self.tree.data_mut(node).center_weight[channel] = w;
        }
    }

    // Interpolation pairs between depth `depth` (fine) and `depth − 1`
    // (coarse), as `(fine_index, coarse_index, weight)` with global sorted
    // indices. The same pairs drive the up-sample and its adjoint
    // down-sample.
    fn sample_pairs(&self, depth: usize) -> Vec<(usize, usize, Real)> {
        let corner_value = match self.boundary {
            BoundaryType::Dirichlet => 0.5,
            BoundaryType::Neumann => 1.0,
            BoundaryType::None => 0.75,
        };
        let mut pairs = vec![];
        for i in self.snodes.depth_range(depth) {
            let node = self.snodes.tree_nodes[i];
            let off = self.tree.offset(node);
            let d = depth;
            // Per-axis 2-tap weights over the parental neighbours, chosen by
            // parity, with degenerate taps at the domain edge.
            let taps: Vec<(usize, [Real; 2])> = (0..3)
                .map(|axis| {
                    let o = off[axis];
                    if o == 0 {
                        (1, [corner_value, 0.0])
                    } else if o + 1 == 1u32 << d {
                        (0, [0.0, corner_value])
                    } else if o % 2 == 1 {
                        (1, [0.75, 0.25])
                    } else {
                        (0, [0.25, 0.75])
                    }
                })
                .collect();
            let parent = self.tree.parent(node).expect("depth ≥ 1");
            let p_neighbors = self.tree.neighbors3(parent);
            for ii in 0..2usize {
                for jj in 0..2usize {
                    for kk in 0..2usize {
                        let q = p_neighbors[ii + taps[0].0][jj + taps[1].0][kk + taps[2].0];
                        let Some(q) = q else { continue };
                        let q_index = self.tree.data(q).node_index;
                        if q_index < 0 {
                            continue;
                        }
                        let w = taps[0].1[ii] * taps[1].1[jj] * taps[2].1[kk];
                        if w != 0.0 {
                            pairs.push((i, q_index as usize, w));
                        }
                    }
                }
            }
        }
        pairs
    }

    /// Coarse-to-fine coefficient propagation: adds the interpolated
    /// depth-`depth − 1` values into the depth-`depth` entries.
    pub(crate) fn up_sample(&self, depth: usize, values: &mut [Real]) {
        if (self.boundary != BoundaryType::None && depth == 0)
            || (self.boundary == BoundaryType::None && depth <= 2)
        {
            return;
        }
        for (fine, coarse, w) in self.sample_pairs(depth) {
            values[fine] += values[coarse] * w;
        }
    }

    fn up_sample_vectors(&self, depth: usize, values: &mut [Vector3<Real>]) {
        if (self.boundary != BoundaryType::None && depth == 0)
            || (self.boundary == BoundaryType::None && depth <= 2)
        {
            return;
        }
        for (fine, coarse, w) in self.sample_pairs(depth) {
            let add = values[coarse] * w;
            values[fine] += add;
        }
    }

    /// Fine-to-coarse constraint accumulation, the adjoint of
    /// [`Self::up_sample`].
    pub(crate) fn down_sample(&self, depth: usize, values: &mut [Real]) {
        if depth == 0 {
            return;
        }
        for (fine, coarse, w) in self.sample_pairs(depth) {
            values[coarse] += values[fine] * w;
        }
    }

    /// Value of the accumulated coarser solution at a node's screening
    /// point, weighted by the point weight.
    fn weighted_coarser_value(&self, node: NodeId, met_solution: &[Real]) -> Real {
        let depth = self.tree.depth(node);
        let idx = self.tree.data(node).point_index;
        if idx < 0 {
            return 0.0;
        }
        let data = &self.points[idx as usize];
        if self.boundary == BoundaryType::Dirichlet && depth == 0 {
            return -0.5 * data.weight;
        }
        if (self.boundary != BoundaryType::None && depth == 0)
            || (self.boundary == BoundaryType::None && depth <= 2)
        {
            return 0.0;
        }

        let p = data.position;
        let parent = self.tree.parent(node).expect("depth ≥ 1");
        let p_neighbors = self.tree.neighbors3(parent);
        let p_off = self.tree.offset(parent);
        let pd = depth - 1;
        let res = 1i64 << pd;
        let mut point_value = 0.0;
        for j in 0..3 {
            let ox = p_off[0] as i64 - 1 + j as i64;
            if ox < 0 || ox >= res {
                continue;
            }
            let x_value = self.basis.value(pd, ox as usize, p[0]);
            for k in 0..3 {
                let oy = p_off[1] as i64 - 1 + k as i64;
                if oy < 0 || oy >= res {
                    continue;
                }
                let xy_value = x_value * self.basis.value(pd, oy as usize, p[1]);
                for l in 0..3 {
                    let oz = p_off[2] as i64 - 1 + l as i64;
                    if oz < 0 || oz >= res {
                        continue;
                    }
                    let Some(basis_node) = p_neighbors[j][k][l] else {
                        continue;
                    };
                    let b_index = self.tree.data(basis_node).node_index;
                    if b_index < 0 {
                        continue;
                    }
                    point_value += self.basis.value(pd, oz as usize, p[2])
                        * xy_value
                        * met_solution[b_index as usize];
                }
            }
        }
        if self.boundary == BoundaryType::Dirichlet {
            point_value -= 0.5;
        }
        point_value * data.weight
    }

    /// Refreshes every depth-`depth` screening point's `coarser_value` from
    /// the up-sampled coarser solution.
    pub(crate) fn set_coarser_point_values(&mut self, depth: usize, met_solution: &[Real]) {
        if !self.constrain_values {
            return;
        }
        let range = self.snodes.depth_range(depth);
        let values: Vec<(i32, Real)> = range
            .into_par_iter()
            .map(|i| {
                let node = self.snodes.tree_nodes[i];
                let idx = self.tree.data(node).point_index;
                if idx == NO_INDEX {
                    (NO_INDEX, 0.0)
                } else {
                    (idx, self.weighted_coarser_value(node, met_solution))
                }
            })
            .collect();
        for (idx, value) in values {
            if idx >= 0 {
                self.points[idx as usize].coarser_value = value;
            }
        }
    }

    /// Builds the whole-depth Laplacian over the depth's sorted span, with
    /// depth-local column numbering.
    pub(crate) fn fixed_depth_laplacian(
        &self,
        depth: usize,
        stencil: &Stencil5,
    ) -> CooMatrix<Real> {
        let range = self.snodes.depth_range(depth);
        let offset = range.start;
        let n = range.len();
        let col_index = move |col: NodeId| {
            let i = self.tree.data(col).node_index as usize;
            debug_assert!(
                i >= offset && i < offset + n,
                "matrix column escaped the depth span"
            );
            Some(i - offset)
        };
        let rows: Vec<Vec<(usize, Real)>> = range
            .clone()
            .into_par_iter()
            .map(|i| {
                let node = self.snodes.tree_nodes[i];
                if self.boundary == BoundaryType::None
                    && !crate::octree::is_inset_supported(
                        self.tree.depth(node),
                        self.tree.offset(node),
                    )
                {
                    // Outside the supported inset the function is pinned.
                    return vec![(i - offset, 1.0)];
                }
                self.matrix_row(node, stencil, Range3::full(5), &col_index)
            })
            .collect();
        let mut coo = CooMatrix::new(n, n);
        for (local_row, row) in rows.into_iter().enumerate() {
            for (col, value) in row {
                coo.push(local_row, col, value);
            }
        }
        coo
    }
}

#[cfg(test)]
mod test {
    use crate::{PoissonReconstruction, ReconstructionParams};
    use na::{Point3, Vector3};
    use std::collections::HashMap;

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

    fn small_engine(constraint_weight: f64) -> PoissonReconstruction {
        let (points, normals) = sphere_cloud(600, 0.45);
        PoissonReconstruction::from_points_and_normals(
            &points,
            &normals,
            ReconstructionParams {
                max_depth: 4,
                splat_depth: 2,
                min_iters: 8,
                constraint_weight,
                threads: 1,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn assert_symmetric(engine: &PoissonReconstruction) {
        let depth = engine.snodes.levels - 1;
        let stencil = engine.laplacian_stencil(depth);
        let coo = engine.fixed_depth_laplacian(depth, &stencil);
        let mut entries: HashMap<(usize, usize), f64> = HashMap::new();
        let mut max_abs: f64 = 0.0;
        for (r, c, v) in coo.triplet_iter() {
            *entries.entry((r, c)).or_insert(0.0) += *v;
            max_abs = max_abs.max(v.abs());
        }
        for (&(r, c), &v) in &entries {
            let sym = entries.get(&(c, r)).copied().unwrap_or(0.0);
            assert!(
                (v - sym).abs() <= 1.0e-8 * max_abs.max(1.0),
                "L[{r}][{c}] = {v} but L[{c}][{r}] = {sym}"
            );
        }
    }

    #[test]
    fn assembled_laplacian_is_symmetric() {
        assert_symmetric(&small_engine(0.0));
    }

    #[test]
    fn screened_laplacian_stays_symmetric() {
        assert_symmetric(&small_engine(4.0));
    }

    #[test]
    fn up_and_down_sample_are_adjoint() {
        let engine = small_engine(0.0);
        let levels = engine.snodes.levels;
        let total = engine.snodes.node_count[levels];
        for depth in 1..levels {
            // x lives on the coarse depth, c on the fine depth; check
            // ⟨c, P x⟩ = ⟨Pᵀ c, x⟩.
            let mut y = vec![0.0; total];
            for i in engine.snodes.depth_range(depth - 1) {
                y[i] = ((i.wrapping_mul(2654435761)) % 1000) as f64 / 1000.0 - 0.5;
            }
            let x = y.clone();
            engine.up_sample(depth, &mut y);

            let mut c = vec![0.0; total];
            for i in engine.snodes.depth_range(depth) {
                c[i] = (((i + 7).wrapping_mul(40503)) % 1000) as f64 / 1000.0 - 0.5;
            }
            let mut z = c.clone();
            engine.down_sample(depth, &mut z);

            let lhs: f64 = engine.snodes.depth_range(depth).map(|i| c[i] * y[i]).sum();
            let rhs: f64 = engine
                .snodes
                .depth_range(depth - 1)
                .map(|i| x[i] * z[i])
                .sum();
            assert!(
                (lhs - rhs).abs() <= 1.0e-9 * (1.0 + lhs.abs()),
                "depth {depth}: {lhs} vs {rhs}"
            );
        }
    }
}
