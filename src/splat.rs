//! Octree construction from the oriented point stream: the density pass, the
//! adaptive normal-splatting pass, screening bookkeeping, and the
//! finalisation passes that guarantee the neighbourhood coverage the
//! operators rely on.

use crate::bspline::BoundaryType;
use crate::octree::{NodeId, Octree};
use crate::poisson::PoissonReconstruction;
use crate::sorted_nodes::SortedTreeNodes;
use crate::stream::PointStream;
use crate::{Real, EPSILON};
use log::{debug, warn};
use na::{Matrix3, Point3, Vector3};

// Splatting happens on a co-dimension one manifold, so uniform surface
// samples do not produce a unit sample weight without this correction.
const SAMPLE_SCALE: Real = 1.0 / (0.125 * 0.125 + 0.75 * 0.75 + 0.125 * 0.125);

/// Screening data accumulated per node: the weighted centroid of the samples
/// that terminated in the node, and their total weight.
#[derive(Clone, Debug)]
pub struct PointData {
    pub position: Point3<Real>,
    pub weight: Real,
    /// Value of the coarser-depth solution at the point, refreshed before
    /// each depth is solved.
    pub coarser_value: Real,
}

// The 3-wide quadratic kernel along each axis, evaluated for a cell of the
// given center and width against a sample position.
fn quadratic_splat_weights(
    center: &Point3<Real>,
    position: &Point3<Real>,
    width: Real,
) -> [[Real; 3]; 3] {
    let mut dx = [[0.0; 3]; 3];
    for i in 0..3 {
        let x = (center[i] - position[i] - width) / width;
        dx[i][0] = 1.125 + 1.5 * x + 0.5 * x * x;
        let x = (center[i] - position[i]) / width;
        dx[i][1] = 0.75 - x * x;
        dx[i][2] = 1.0 - dx[i][1] - dx[i][0];
    }
    dx
}

impl PoissonReconstruction {
    /// Is a normalized sample inside the working domain? Padded mode insets
    /// the usable region by a quarter on each side.
    pub(crate) fn in_bounds(&self, p: &Point3<Real>) -> bool {
        let e = if self.boundary == BoundaryType::None {
            0.25
        } else {
            0.0
        };
        (0..3).all(|i| p[i] >= e && p[i] <= 1.0 - e)
    }

    // Adds a sample's density contribution to the 3×3×3 neighbourhood of a
    // node.
    fn update_weight_contribution(&mut self, node: NodeId, p: &Point3<Real>, weight: Real) {
        let (center, width) = self.tree.center_and_width(node);
        let dx = quadratic_splat_weights(&center, p, width);
        let weight = weight * SAMPLE_SCALE;
        let neighbors = self.tree.neighbors3(node);
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..3 {
                    if let Some(n) = neighbors[i][j][k] {
                        self.tree.data_mut(n).center_weight[0] +=
                            dx[0][i] * dx[1][j] * dx[2][k] * weight;
                    }
                }
            }
        }
    }

    /// The splatted density around `p`, read from the neighbourhood of
    /// `node`.
    pub(crate) fn sample_density(&self, node: NodeId, p: &Point3<Real>) -> Real {
        let (center, width) = self.tree.center_and_width(node);
        let dx = quadratic_splat_weights(&center, p, width);
        let neighbors = self.tree.neighbors3(node);
        let mut density = 0.0;
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..3 {
                    if let Some(n) = neighbors[i][j][k] {
                        density +=
                            dx[0][i] * dx[1][j] * dx[2][k] * self.tree.data(n).center_weight[0];
                    }
                }
            }
        }
        density
    }

    /// Estimates the depth a sample should be splatted at: walk up from
    /// `node` until the accumulated density reaches `samples_per_node`, then
    /// interpolate. Also returns the sample weight `4^{-depth}`.
    pub(crate) fn sample_depth_and_weight(&self, node: NodeId, p: &Point3<Real>) -> (Real, Real) {
        let spn = self.samples_per_node;
        let mut temp = node;
        let mut density = self.sample_density(temp, p);
        let mut depth;
        if density >= spn {
            depth = self.tree.depth(temp) as Real + (density / spn).ln() / (4.0 as Real).ln();
        } else {
            let mut old = density;
            let mut new = density;
            while new < spn {
                match self.tree.parent(temp) {
                    Some(parent) => {
                        temp = parent;
                        old = new;
                        new = self.sample_density(temp, p);
                    }
                    None => break,
                }
            }
            depth = self.tree.depth(temp) as Real + (new / spn).ln() / (new / old).ln();
        }
        if !depth.is_finite() {
            depth = self.tree.depth(temp) as Real;
        }
        let weight = (4.0 as Real).powf(-depth);
        (depth, weight)
    }

    // Splats an oriented normal into the 3×3×3 neighbourhood of `node`,
    // allocating normal-arena slots on demand.
    fn splat_normal_at(&mut self, node: NodeId, p: &Point3<Real>, normal: Vector3<Real>) {
        let (center, width) = self.tree.center_and_width(node);
        let dx = quadratic_splat_weights(&center, p, width);
        let neighbors = self.tree.neighbors3(node);
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..3 {
                    if let Some(n) = neighbors[i][j][k] {
                        let idx = self.tree.data(n).normal_index;
                        let idx = if idx < 0 {
                            let idx = self.normals.len();
                            self.normals.push(Vector3::zeros());
                            self.tree.data_mut(n).normal_index = idx as i32;
                            idx
                        } else {
                            idx as usize
                        };
                        self.normals[idx] += normal * (dx[0][i] * dx[1][j] * dx[2][k]);
                    }
                }
            }
        }
    }

    // Adaptive splat: estimate the sample's depth, then spread the normal
    // over the two adjacent depth levels with a linear-in-depth weight. The
    // magnitude is divided by the node volume so the splatted field carries
    // divergence-compatible units.
    fn splat_oriented_point(&mut self, p: &Point3<Real>, normal: &Vector3<Real>) -> Option<Real> {
        let mut node = self.tree.root();
        while self.tree.depth(node) < self.splat_depth {
            if !self.tree.has_children(node) {
                warn!("sample traversal hit an unprepared node below splat depth; skipping point");
                return None;
            }
            let (center, _) = self.tree.center_and_width(node);
            node = self.tree.child(node, Octree::corner_of_point(&center, p));
        }

        let (depth, weight) = self.sample_depth_and_weight(node, p);
        let depth = depth.clamp(self.min_depth as Real, self.max_depth as Real);
        let top_depth = (depth.ceil() as usize).clamp(self.min_depth, self.max_depth);

        while self.tree.depth(node) > top_depth {
            node = self.tree.parent(node).expect("walked above the root");
        }
        while self.tree.depth(node) < top_depth {
            if !self.tree.has_children(node) {
                self.tree.init_children(node);
            }
            let (center, _) = self.tree.center_and_width(node);
            node = self.tree.child(node, Octree::corner_of_point(&center, p));
        }

        let dx = 1.0 - (top_depth as Real - depth);
        let width = 1.0 / (1u64 << self.tree.depth(node)) as Real;
        self.splat_normal_at(node, p, normal * (weight / width.powi(3) * dx));
        if (1.0 - dx).abs() > EPSILON {
            let dx = 1.0 - dx;
            let node = self.tree.parent(node).expect("top depth above the root");
            let width = 1.0 / (1u64 << self.tree.depth(node)) as Real;
            self.splat_normal_at(node, p, normal * (weight / width.powi(3) * dx));
        }
        Some(weight)
    }

    /// Builds the tree from the stream: the density pass (when a splat depth
    /// is set), then the normal pass with optional screening bookkeeping.
    /// Returns the number of accepted samples.
    pub(crate) fn set_tree(&mut self, stream: &mut dyn PointStream) -> usize {
        let x_form = self.params.x_form;
        let linear: Matrix3<Real> = x_form.fixed_view::<3, 3>(0, 0).into_owned();
        let x_form_n = linear
            .try_inverse()
            .unwrap_or_else(Matrix3::identity)
            .transpose();
        let use_confidence = self.params.use_confidence;

        self.tree.set_full_depth(self.min_depth);

        if self.splat_depth > 0 {
            stream.reset();
            while let Some((p, n)) = stream.next_point() {
                let p = (x_form.transform_point(&p) - self.center.coords) / self.scale;
                let n = x_form_n * n;
                if !self.in_bounds(&p) {
                    continue;
                }
                let weight = if use_confidence { n.norm() } else { 1.0 };
                let mut node = self.tree.root();
                for _ in 0..self.splat_depth {
                    self.update_weight_contribution(node, &p, weight);
                    if !self.tree.has_children(node) {
                        self.tree.init_children(node);
                    }
                    let (center, _) = self.tree.center_and_width(node);
                    node = self.tree.child(node, Octree::corner_of_point(&center, &p));
                }
                self.update_weight_contribution(node, &p, weight);
            }
        }

        let mut point_weight_sum = 0.0;
        let mut count = 0usize;
        let mut skipped = 0usize;
        self.normals.clear();
        stream.reset();
        while let Some((p, n)) = stream.next_point() {
            let p = (x_form.transform_point(&p) - self.center.coords) / self.scale;
            // The solver convention wants inward-pointing field normals.
            let n = x_form_n * (-n);
            if !self.in_bounds(&p) {
                skipped += 1;
                continue;
            }
            let normal_length = n.norm();
            if normal_length <= EPSILON {
                skipped += 1;
                continue;
            }
            let n = if use_confidence { n } else { n / normal_length };

            if self.samples_per_node > 0.0 && self.splat_depth > 0 {
                match self.splat_oriented_point(&p, &n) {
                    Some(weight) => point_weight_sum += weight,
                    None => {
                        skipped += 1;
                        continue;
                    }
                }
            } else {
                let mut node = self.tree.root();
                let mut n = n;
                if self.splat_depth > 0 {
                    for _ in 0..self.splat_depth {
                        let (center, _) = self.tree.center_and_width(node);
                        node = self.tree.child(node, Octree::corner_of_point(&center, &p));
                    }
                    let point_weight = self.sample_density(node, &p).recip();
                    n *= point_weight;
                    point_weight_sum += point_weight;
                }
                while self.tree.depth(node) < self.max_depth {
                    if !self.tree.has_children(node) {
                        self.tree.init_children(node);
                    }
                    let (center, _) = self.tree.center_and_width(node);
                    node = self.tree.child(node, Octree::corner_of_point(&center, &p));
                }
                self.splat_normal_at(node, &p, n);
            }

            if self.constrain_values {
                let screen_weight = if self.params.use_normal_weights {
                    normal_length
                } else {
                    1.0
                };
                let mut node = self.tree.root();
                loop {
                    let idx = self.tree.data(node).point_index;
                    if idx < 0 {
                        self.tree.data_mut(node).point_index = self.points.len() as i32;
                        self.points.push(PointData {
                            position: Point3::from(p.coords * screen_weight),
                            weight: screen_weight,
                            coarser_value: 0.0,
                        });
                    } else {
                        let data = &mut self.points[idx as usize];
                        data.position += p.coords * screen_weight;
                        data.weight += screen_weight;
                    }
                    if !self.tree.has_children(node) {
                        break;
                    }
                    let (center, _) = self.tree.center_and_width(node);
                    node = self.tree.child(node, Octree::corner_of_point(&center, &p));
                }
            }
            count += 1;
        }
        if skipped > 0 {
            debug!("skipped {skipped} samples (out of bounds, degenerate, or unreachable)");
        }

        if self.boundary == BoundaryType::None {
            point_weight_sum *= 4.0;
        }
        let constraint_weight = if count > 0 {
            self.params.constraint_weight * point_weight_sum / count as Real
        } else {
            0.0
        };

        // Normalize the screening centroids and apply the depth-adaptive
        // rescaling 2^e with e = d·k − D_max·(k − 1).
        if self.constrain_values {
            let k = self.params.adaptive_exponent;
            let padded = self.boundary == BoundaryType::None;
            for node in self.tree.descendants(self.tree.root()) {
                let idx = self.tree.data(node).point_index;
                if idx < 0 {
                    continue;
                }
                let nd = if padded {
                    self.tree.depth(node) as i32 - 1
                } else {
                    self.tree.depth(node) as i32
                };
                let md = if padded {
                    self.max_depth as i32 - 1
                } else {
                    self.max_depth as i32
                };
                let e = nd * k - md * (k - 1);
                let mul = if e < 0 {
                    1.0 / (1u64 << (-e)) as Real
                } else {
                    (1u64 << e) as Real
                };
                let data = &mut self.points[idx as usize];
                data.position /= data.weight;
                data.weight *= mul * constraint_weight;
            }
        }

        // Neumann boundaries cannot carry flux: drop the boundary-normal
        // component of normals splatted onto domain-boundary nodes.
        if self.boundary == BoundaryType::Neumann {
            for node in self.tree.descendants(self.tree.root()) {
                let idx = self.tree.data(node).normal_index;
                if idx < 0 {
                    continue;
                }
                let d = self.tree.depth(node);
                let off = self.tree.offset(node);
                let res = 1u32 << d;
                for i in 0..3 {
                    if off[i] == 0 || off[i] == res - 1 {
                        self.normals[idx as usize][i] = 0.0;
                    }
                }
            }
        }

        count
    }

    fn has_normals(&self, node: NodeId) -> bool {
        let idx = self.tree.data(node).normal_index;
        if idx >= 0 && self.normals[idx as usize] != Vector3::zeros() {
            return true;
        }
        self.tree.has_children(node)
            && (0..8).any(|c| self.has_normals(self.tree.child(node, c)))
    }

    /// Prunes subtrees that received no normal mass.
    pub(crate) fn clip_tree(&mut self) {
        self.clip_rec(self.tree.root());
    }

    fn clip_rec(&mut self, node: NodeId) {
        if !self.tree.has_children(node) {
            return;
        }
        if self.tree.depth(node) >= self.min_depth
            && !(0..8).any(|c| self.has_normals(self.tree.child(node, c)))
        {
            self.tree.null_children(node);
            return;
        }
        for c in 0..8 {
            self.clip_rec(self.tree.child(node, c));
        }
    }

    /// Top-down, forces the full 3×3×3 grandparent neighbourhood of every
    /// node to exist and be refined, so depth-`d` nodes always see their
    /// complete 5×5×5 same-depth neighbourhood.
    pub(crate) fn finalize_tree(&mut self) {
        let max_depth = self.tree.max_depth();
        for d in (2..=max_depth).rev() {
            let at_depth: Vec<NodeId> = self
                .tree
                .descendants(self.tree.root())
                .into_iter()
                .filter(|&n| self.tree.depth(n) == d)
                .collect();
            for node in at_depth {
                let parent = self.tree.parent(node).expect("depth ≥ 2 has a parent");
                let grandparent = self.tree.parent(parent).expect("depth ≥ 2 has a grandparent");
                let gd = self.tree.depth(grandparent);
                let goff = self.tree.offset(grandparent);
                for di in -1i64..=1 {
                    for dj in -1i64..=1 {
                        for dk in -1i64..=1 {
                            let off = [
                                goff[0] as i64 + di,
                                goff[1] as i64 + dj,
                                goff[2] as i64 + dk,
                            ];
                            if let Some(nb) = self.tree.ensure_node(gd, off) {
                                self.tree.init_children(nb);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Refines a ring around subtree boundaries so leaves on both sides of a
    /// subdivision boundary have matching depths, then rebuilds the sorted
    /// snapshot. Returns the subtree root depth `sDepth`.
    pub(crate) fn refine_boundary(&mut self, subdivide_depth: usize) -> usize {
        let max_depth = self.tree.max_depth();
        let mut subdivide_depth = subdivide_depth;
        if self.boundary == BoundaryType::None {
            subdivide_depth += 2;
        }
        let subdivide_depth = subdivide_depth.min(max_depth);
        let mut s_depth = max_depth - subdivide_depth;
        if self.boundary == BoundaryType::None {
            s_depth = s_depth.max(2);
        }
        if s_depth == 0 {
            self.snodes = SortedTreeNodes::set(&mut self.tree);
            return 0;
        }

        for leaf in self.tree.leaves(self.tree.root()) {
            let d = self.tree.depth(leaf);
            if d <= s_depth {
                continue;
            }
            let off = self.tree.offset(leaf);
            let res = (1u32 << d) - 1;
            let sub_res = (1u32 << (d - s_depth)) - 1;
            let sub_off = [off[0] & sub_res, off[1] & sub_res, off[2] & sub_res];
            let boundary: Vec<[bool; 2]> = (0..3)
                .map(|i| {
                    [
                        off[i] != 0 && sub_off[i] == 0,
                        off[i] != res && sub_off[i] == sub_res,
                    ]
                })
                .collect();
            if boundary.iter().all(|b| !b[0] && !b[1]) {
                continue;
            }

            let missing = |dx: i64, dy: i64, dz: i64| {
                self.tree
                    .node_at(
                        d,
                        [
                            off[0] as i64 + dx,
                            off[1] as i64 + dy,
                            off[2] as i64 + dz,
                        ],
                    )
                    .is_none()
            };
            let x: i64 = if boundary[0][0] && missing(-1, 0, 0) {
                -1
            } else if boundary[0][1] && missing(1, 0, 0) {
                1
            } else {
                0
            };
            let y: i64 = if boundary[1][0] && missing(0, -1, 0) {
                -1
            } else if boundary[1][1] && missing(0, 1, 0) {
                1
            } else {
                0
            };
            let z: i64 = if boundary[2][0] && missing(0, 0, -1) {
                -1
            } else if boundary[2][1] && missing(0, 0, 1) {
                1
            } else {
                0
            };
            if x == 0 && y == 0 && z == 0 {
                continue;
            }

            let mut targets = vec![];
            if x != 0 && y != 0 && z != 0 {
                targets.push([x, y, z]);
            }
            if x != 0 && y != 0 {
                targets.push([x, y, 0]);
            }
            if x != 0 && z != 0 {
                targets.push([x, 0, z]);
            }
            if y != 0 && z != 0 {
                targets.push([0, y, z]);
            }
            if x != 0 {
                targets.push([x, 0, 0]);
            }
            if y != 0 {
                targets.push([0, y, 0]);
            }
            if z != 0 {
                targets.push([0, 0, z]);
            }
            for t in targets {
                self.tree.ensure_node(
                    d,
                    [
                        off[0] as i64 + t[0],
                        off[1] as i64 + t[1],
                        off[2] as i64 + t[2],
                    ],
                );
            }
        }

        self.snodes = SortedTreeNodes::set(&mut self.tree);
        s_depth
    }
}

#[cfg(test)]
mod test {
    use super::quadratic_splat_weights;
    use crate::bspline::BoundaryType;
    use crate::octree::Octree;
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
    fn splat_kernel_taps() {
        // A sample at the cell center hits the classic 1/8, 3/4, 1/8 taps,
        // and the taps always partition the sample's mass.
        let center = Point3::new(0.5, 0.5, 0.5);
        let dx = quadratic_splat_weights(&center, &center, 0.25);
        for axis in 0..3 {
            assert!((dx[axis][0] - 0.125).abs() < 1.0e-12);
            assert!((dx[axis][1] - 0.75).abs() < 1.0e-12);
            assert!((dx[axis][2] - 0.125).abs() < 1.0e-12);
            let sum: f64 = dx[axis].iter().sum();
            assert!((sum - 1.0).abs() < 1.0e-12);
        }
        // Off-center samples shift mass toward the near neighbour.
        let p = Point3::new(0.4, 0.5, 0.5);
        let dx = quadratic_splat_weights(&center, &p, 0.25);
        assert!(dx[0][0] > dx[0][2]);
        let sum: f64 = dx[0].iter().sum();
        assert!((sum - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn padded_domain_insets_the_usable_region() {
        // A full build under the doubled-cube mode: the working domain is
        // inset by a quarter on each side and the depths are shifted by one.
        let (points, normals) = sphere_cloud(500, 0.3);
        let engine = PoissonReconstruction::from_points_and_normals(
            &points,
            &normals,
            ReconstructionParams {
                max_depth: 3,
                splat_depth: 2,
                boundary_type: BoundaryType::None,
                constraint_weight: 0.0,
                threads: 1,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(engine.max_depth, 4);
        assert!(!engine.in_bounds(&Point3::new(0.1, 0.5, 0.5)));
        assert!(engine.in_bounds(&Point3::new(0.3, 0.5, 0.5)));
        assert!(engine.iso_value.is_finite());
    }

    #[test]
    fn adaptive_sample_depth_matches_its_weight() {
        let (points, normals) = sphere_cloud(1500, 0.4);
        let engine = PoissonReconstruction::from_points_and_normals(
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
        let mut checked = 0;
        for p in points.iter().step_by(100) {
            let q = (*p - engine.center.coords) / engine.scale;
            let mut node = engine.tree.root();
            while engine.tree.depth(node) < engine.splat_depth && engine.tree.has_children(node) {
                let (center, _) = engine.tree.center_and_width(node);
                node = engine.tree.child(node, Octree::corner_of_point(&center, &q));
            }
            let (depth, weight) = engine.sample_depth_and_weight(node, &q);
            assert!(depth.is_finite());
            assert!((weight - 4.0_f64.powf(-depth)).abs() <= 1.0e-9 * weight.abs().max(1.0e-9));
            checked += 1;
        }
        assert!(checked > 0);
    }
}
