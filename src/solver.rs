//! The cascaded conjugate-gradient solver: depths are solved coarse to fine,
//! each one against a right-hand side corrected by the up-sampled coarser
//! solution. A depth is either solved whole or partitioned into sub-domains
//! rooted `subdivide_depth` levels up, each solved independently.

use crate::bspline::BoundaryType;
use crate::conjugate_gradient::solve_conjugate_gradient;
use crate::octree::{is_inset_supported, NodeId};
use crate::operators::{Range3, Stencil5};
use crate::poisson::PoissonReconstruction;
use crate::Real;
use log::debug;
use na::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rayon::prelude::*;
use std::collections::HashMap;

const ITERATION_POWER: Real = 1.0 / 3.0;

impl PoissonReconstruction {
    // CG budget and tolerance for a system of `rows` unknowns.
    fn cg_controls(&self, rows: usize) -> (usize, Real) {
        match self.params.fixed_iters {
            Some(n) => (n, 1.0e-10),
            None => {
                let budget = ((rows as Real).powf(ITERATION_POWER) as usize)
                    .max(self.params.min_iters);
                (budget, self.params.accuracy / 100_000.0 * rows as Real)
            }
        }
    }

    fn is_row_supported(&self, node: NodeId) -> bool {
        self.boundary != BoundaryType::None
            || is_inset_supported(self.tree.depth(node), self.tree.offset(node))
    }

    /// Runs the full coarse-to-fine cascade, writing per-depth coefficients
    /// into every node's `solution`. Returns the total CG iteration count.
    pub(crate) fn solve_cascade(&mut self) -> usize {
        let levels = self.snodes.levels;
        let mut subdivide_depth = self.params.subdivide_depth;
        let mut max_solve_depth = self.params.max_solve_depth.unwrap_or(self.max_depth);
        if self.boundary == BoundaryType::None {
            if subdivide_depth > 0 {
                subdivide_depth += 1;
            }
            max_solve_depth += 1;
        }
        let start_depth = if self.boundary == BoundaryType::None {
            2
        } else {
            0
        };

        let root = self.snodes.tree_nodes[0];
        self.tree.data_mut(root).solution = 0.0;

        let mut met_solution = vec![0.0; self.snodes.node_count[levels]];
        let mut iterations = 0;
        for d in start_depth..levels {
            debug!(
                "depth {}/{}: {} nodes",
                d,
                levels - 1,
                self.snodes.depth_range(d).len()
            );
            let no_solve = d > max_solve_depth;
            iterations += if subdivide_depth > 0 && d > subdivide_depth + self.min_depth {
                self.solve_depth_subdomains(d, &mut met_solution, subdivide_depth, no_solve)
            } else {
                self.solve_depth(d, &mut met_solution, no_solve)
            };
        }
        iterations
    }

    // Warm start for depths at or below the coarsest solved depth: the
    // up-sampled coarser solution, which is then cleared so coefficients do
    // not get counted twice.
    fn up_sample_coarser_solution(&mut self, depth: usize) -> DVector<Real> {
        let range = self.snodes.depth_range(depth);
        let mut x = DVector::zeros(range.len());
        if (self.boundary != BoundaryType::None && depth == 0)
            || (self.boundary == BoundaryType::None && depth <= 2)
        {
            return x;
        }
        let start = range.start;
        let mut solution = vec![0.0; self.snodes.node_count[depth + 1]];
        for i in self.snodes.depth_range(depth - 1) {
            solution[i] = self.tree.data(self.snodes.tree_nodes[i]).solution;
        }
        self.up_sample(depth, &mut solution);
        for i in range {
            x[i - start] = solution[i];
        }
        for i in self.snodes.depth_range(depth - 1) {
            let node = self.snodes.tree_nodes[i];
            self.tree.data_mut(node).solution = 0.0;
        }
        x
    }

    // Accumulates the cumulative coarser solution at depth − 1 into
    // `met_solution` (up-sample the running sum, then add that depth's own
    // coefficients).
    fn accumulate_met_solution(&mut self, depth: usize, met_solution: &mut [Real]) {
        self.up_sample(depth - 1, met_solution);
        for i in self.snodes.depth_range(depth - 1) {
            met_solution[i] += self.tree.data(self.snodes.tree_nodes[i]).solution;
        }
    }

    /// Whole-depth solve: assemble the depth Laplacian and the corrected
    /// right-hand side, then run CG.
    fn solve_depth(&mut self, depth: usize, met_solution: &mut [Real], no_solve: bool) -> usize {
        let range = self.snodes.depth_range(depth);
        let n = range.len();

        let mut x = if depth <= self.min_depth {
            self.up_sample_coarser_solution(depth)
        } else {
            if depth > 0 {
                self.accumulate_met_solution(depth, met_solution);
            }
            DVector::zeros(n)
        };

        self.set_coarser_point_values(depth, met_solution);

        let stencil = self.laplacian_stencil(depth);
        let stencils = self.laplacian_stencils(depth);

        // Subtract the coupling with the already-solved coarser depths.
        let met: &[Real] = met_solution;
        let deltas: Vec<Real> = range
            .clone()
            .into_par_iter()
            .map(|i| {
                let node = self.snodes.tree_nodes[i];
                if self.is_row_supported(node) {
                    self.coarser_constraint_delta(node, met, &stencils)
                } else {
                    0.0
                }
            })
            .collect();
        for (i, delta) in range.clone().zip(deltas) {
            let node = self.snodes.tree_nodes[i];
            self.tree.data_mut(node).constraint -= delta;
        }

        let coo = self.fixed_depth_laplacian(depth, &stencil);
        let a = CscMatrix::from(&coo);
        let b = DVector::from_iterator(
            n,
            range.clone().map(|i| {
                let node = self.snodes.tree_nodes[i];
                if self.is_row_supported(node) {
                    self.tree.data(node).constraint
                } else {
                    0.0
                }
            }),
        );

        let mut iterations = 0;
        if !no_solve {
            let (budget, eps) = self.cg_controls(n);
            iterations = solve_conjugate_gradient(&a, &b, &mut x, budget, eps);
        }
        if self.params.show_residual {
            let r = &b - &a * &x;
            debug!(
                "depth {depth} residual: {:.3e} -> {:.3e} [{} iters]",
                b.norm(),
                r.norm(),
                iterations
            );
        }

        for i in range {
            let node = self.snodes.tree_nodes[i];
            self.tree.data_mut(node).solution = x[i - self.snodes.node_count[depth]];
        }
        iterations
    }

    // The depth-`depth` nodes belonging to the sub-domain of a coarse node:
    // the nodes inside the coarse cell's span expanded by a 4-cell ring (the
    // 2-ring of the 2-ring every matrix row can reach).
    fn subdomain_entries(&self, depth: usize, coarse: NodeId) -> Vec<usize> {
        let coarse_depth = self.tree.depth(coarse);
        let coarse_off = self.tree.offset(coarse);
        let width = 1i64 << (depth - coarse_depth);
        let lo: Vec<i64> = (0..3)
            .map(|i| coarse_off[i] as i64 * width - 4)
            .collect();
        let hi: Vec<i64> = (0..3)
            .map(|i| (coarse_off[i] as i64 + 1) * width + 3)
            .collect();
        self.snodes
            .depth_range(depth)
            .filter(|&i| {
                let off = self.tree.offset(self.snodes.tree_nodes[i]);
                (0..3).all(|k| {
                    let o = off[k] as i64;
                    o >= lo[k] && o <= hi[k]
                })
            })
            .collect()
    }

    // Column bounds of a sub-domain row outside the coarse cell proper,
    // clipping the reach toward the collected envelope.
    fn restricted_row_range(&self, node: NodeId, coarse: NodeId) -> Range3 {
        let depth = self.tree.depth(node);
        let r_depth = self.tree.depth(coarse);
        let r_off = self.tree.offset(coarse);
        let off = self.tree.offset(node);
        let width = 1i64 << (depth - r_depth);

        let mut range = Range3::full(5);
        for i in 0..3 {
            let rel = off[i] as i64 - ((r_off[i] as i64) << (depth - r_depth));
            if rel < 0 {
                range.start[i] = (-rel) as usize;
            }
            if rel >= width {
                range.end[i] = (4 - (rel - width)) as usize;
            }
        }
        range
    }

    // One row of a restricted sub-domain system, enumerated over the
    // symmetric half so that a pair clipped by either side's range drops
    // from the whole system, never from one side only. Off-diagonal entries
    // are mirrored on the spot.
    fn restricted_triplets(
        &self,
        node: NodeId,
        local_row: usize,
        stencil: &Stencil5,
        range: Range3,
        local: &HashMap<NodeId, usize>,
    ) -> Vec<(usize, usize, Real)> {
        let d = self.tree.depth(node);
        let off = self.tree.offset(node);
        let is_interior = self.is_stencil_interior(d, off, 2);
        let neighbors = self.tree.neighbors5(node);
        let screening = self
            .constrain_values
            .then(|| self.screening_row_values(node));

        let mut out = vec![];
        for x in range.start[0]..3.min(range.end[0]) {
            for y in range.start[1]..range.end[1] {
                if x == 2 && y > 2 {
                    break;
                }
                for z in range.start[2]..range.end[2] {
                    if x == 2 && y == 2 && z > 2 {
                        break;
                    }
                    let Some(col) = neighbors[x][y][z] else {
                        continue;
                    };
                    if self.tree.data(col).node_index < 0 {
                        continue;
                    }
                    let Some(&cj) = local.get(&col) else {
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
                    if value == 0.0 {
                        continue;
                    }
                    out.push((local_row, cj, value));
                    if cj != local_row {
                        out.push((cj, local_row, value));
                    }
                }
            }
        }
        out
    }

    /// Sub-domain solve: partition the depth's system into blocks rooted at
    /// depth `depth − subdivide_depth` and solve each independently, writing
    /// back only into nodes owned by the block.
    fn solve_depth_subdomains(
        &mut self,
        depth: usize,
        met_solution: &mut [Real],
        subdivide_depth: usize,
        no_solve: bool,
    ) -> usize {
        if subdivide_depth >= depth {
            return self.solve_depth(depth, met_solution, no_solve);
        }

        if depth > self.min_depth && depth > 0 {
            self.accumulate_met_solution(depth, met_solution);
        }
        self.set_coarser_point_values(depth, met_solution);

        let range = self.snodes.depth_range(depth);
        let offset = range.start;
        let b_backup: Vec<Real> = range
            .clone()
            .map(|i| {
                let node = self.snodes.tree_nodes[i];
                if self.is_row_supported(node) {
                    self.tree.data(node).constraint
                } else {
                    0.0
                }
            })
            .collect();

        let stencil = self.laplacian_stencil(depth);
        let stencils = self.laplacian_stencils(depth);

        let coarse_depth = depth - subdivide_depth;
        let coarse_range = self.snodes.depth_range(coarse_depth);
        let mut total_iterations = 0;

        for ci in coarse_range {
            let coarse = self.snodes.tree_nodes[ci];
            let entries = self.subdomain_entries(depth, coarse);
            if entries.is_empty() {
                continue;
            }
            // Only blocks that actually contain descendants of the coarse
            // root produce writes; skip the rest outright.
            let coarse_index = self.tree.data(coarse).node_index;
            let owns_rows = entries.iter().any(|&i| {
                let mut n = self.snodes.tree_nodes[i];
                while self.tree.depth(n) > coarse_depth {
                    n = self.tree.parent(n).expect("deeper than the coarse root");
                }
                n == coarse
            });
            if !owns_rows {
                continue;
            }

            let local: HashMap<NodeId, usize> = entries
                .iter()
                .enumerate()
                .map(|(j, &i)| (self.snodes.tree_nodes[i], j))
                .collect();

            let triplets: Vec<Vec<(usize, usize, Real)>> = entries
                .par_iter()
                .enumerate()
                .map(|(j, &i)| {
                    let node = self.snodes.tree_nodes[i];
                    if !self.is_row_supported(node) {
                        return vec![(j, j, 1.0)];
                    }
                    let row_range = self.restricted_row_range(node, coarse);
                    self.restricted_triplets(node, j, &stencil, row_range, &local)
                })
                .collect();
            let met: &[Real] = met_solution;
            let deltas: Vec<Real> = entries
                .par_iter()
                .map(|&i| {
                    let node = self.snodes.tree_nodes[i];
                    if self.is_row_supported(node) {
                        self.coarser_constraint_delta(node, met, &stencils)
                    } else {
                        0.0
                    }
                })
                .collect();

            let n = entries.len();
            let mut coo = CooMatrix::new(n, n);
            for row in triplets {
                for (r, c, value) in row {
                    coo.push(r, c, value);
                }
            }
            let a = CscMatrix::from(&coo);
            let b = DVector::from_iterator(
                n,
                entries
                    .iter()
                    .zip(&deltas)
                    .map(|(&i, delta)| b_backup[i - offset] - delta),
            );
            let mut x = DVector::from_iterator(
                n,
                entries
                    .iter()
                    .map(|&i| self.tree.data(self.snodes.tree_nodes[i]).solution),
            );

            let mut iterations = 0;
            if !no_solve {
                let (budget, eps) = self.cg_controls(n);
                iterations = solve_conjugate_gradient(&a, &b, &mut x, budget, eps);
            }
            if self.params.show_residual {
                let r = &b - &a * &x;
                debug!(
                    "depth {depth} block {ci} residual: {:.3e} -> {:.3e} [{} iters]",
                    b.norm(),
                    r.norm(),
                    iterations
                );
            }
            total_iterations += iterations;

            // Write back only into nodes whose coarse ancestor has a sorted
            // index at or past this block's root, so overlapping blocks never
            // double-assign.
            for (j, &i) in entries.iter().enumerate() {
                let node = self.snodes.tree_nodes[i];
                let mut ancestor = node;
                while self.tree.depth(ancestor) > coarse_depth {
                    ancestor = self
                        .tree
                        .parent(ancestor)
                        .expect("deeper than the coarse root");
                }
                if self.tree.data(ancestor).node_index >= coarse_index {
                    self.tree.data_mut(node).solution = x[j];
                }
            }
        }
        total_iterations
    }
}

#[cfg(test)]
mod test {
    use crate::{PoissonReconstruction, ReconstructionParams};
    use na::{DVector, Point3, Vector3};
    use nalgebra_sparse::CscMatrix;

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

    fn engine(subdivide_depth: usize) -> PoissonReconstruction {
        let (points, normals) = sphere_cloud(800, 0.42);
        PoissonReconstruction::from_points_and_normals(
            &points,
            &normals,
            ReconstructionParams {
                max_depth: 4,
                splat_depth: 2,
                subdivide_depth,
                constraint_weight: 0.0,
                threads: 1,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn cg_budget_honors_overrides() {
        let mut e = engine(0);
        e.params.fixed_iters = Some(7);
        assert_eq!(e.cg_controls(1000).0, 7);

        e.params.fixed_iters = None;
        e.params.min_iters = 24;
        // Small systems fall back to the iteration floor.
        assert_eq!(e.cg_controls(8).0, 24);
        // Large systems scale with the cube root of the row count.
        let (budget, eps) = e.cg_controls(1_000_000);
        assert!(budget >= 99);
        assert!(eps > 0.0);
    }

    #[test]
    fn whole_depth_solve_reduces_the_residual() {
        let e = engine(0);
        let depth = e.snodes.levels - 1;
        let stencil = e.laplacian_stencil(depth);
        let a = CscMatrix::from(&e.fixed_depth_laplacian(depth, &stencil));
        let range = e.snodes.depth_range(depth);
        let b = DVector::from_iterator(
            range.len(),
            range.clone().map(|i| {
                let node = e.snodes.tree_nodes[i];
                if e.is_row_supported(node) {
                    e.tree.data(node).constraint
                } else {
                    0.0
                }
            }),
        );
        let x = DVector::from_iterator(
            range.clone().len(),
            range.map(|i| e.tree.data(e.snodes.tree_nodes[i]).solution),
        );
        let residual = (&b - &a * &x).norm();
        assert!(b.norm() > 0.0, "finest depth has an empty right-hand side");
        assert!(
            residual < b.norm(),
            "solve did not reduce the finest residual: {residual} vs {}",
            b.norm()
        );
    }

    #[test]
    fn subdomain_cascade_produces_a_solution() {
        // Depths past subdivide_depth are solved block-wise; the cascade
        // must still produce a usable field.
        let e = engine(2);
        assert!(e.iso_value.is_finite());
        assert!(e.eval(&Point3::origin()).is_finite());
        let has_solution = e
            .snodes
            .tree_nodes
            .iter()
            .any(|&n| e.tree.data(n).solution != 0.0);
        assert!(has_solution, "cascade left every coefficient at zero");
    }
}
