//! The adaptive octree: a node arena with contiguous 8-child blocks, parent
//! back-indices, and a per-depth offset index used for all neighbourhood
//! queries.
//!
//! A node is fully described by its depth `d` and integer offset
//! `(ox, oy, oz) ∈ [0, 2^d)³`: its cell has width `1/2^d` and center
//! `(o + ½)/2^d`. The per-depth index maps offsets to arena slots with a
//! deterministic FNV hasher so that iteration-independent lookups behave the
//! same from run to run.

use crate::cube;
use crate::Real;
use fnv::FnvHasher;
use na::Point3;
use std::collections::HashMap;
use std::hash::BuildHasher;

/// A `BuildHasher` with a fixed key, so hash maps behave deterministically.
#[derive(Copy, Clone, Debug, Default)]
pub struct DeterministicState;

impl BuildHasher for DeterministicState {
    type Hasher = FnvHasher;

    fn build_hasher(&self) -> FnvHasher {
        FnvHasher::with_key(1820)
    }
}

pub type NodeId = usize;

/// Sentinel for "not part of the current sorted snapshot".
pub const NO_INDEX: i32 = -1;

/// Per-node payload threaded through the whole pipeline.
#[derive(Clone, Debug)]
pub struct NodeData {
    /// Dense index assigned by the sorted-node snapshot.
    pub node_index: i32,
    /// Index into the splatted-normal arena, or −1.
    pub normal_index: i32,
    /// Index into the screening-point arena, or −1.
    pub point_index: i32,
    /// Right-hand-side entry for the node's basis function.
    pub constraint: Real,
    /// Solved coefficient of the node's basis function.
    pub solution: Real,
    /// Per-corner sign mask (with bits propagated from finer cells).
    pub mc_index: u8,
    /// Density estimate channels: splat weight, then normal mass.
    pub center_weight: [Real; 2],
}

impl Default for NodeData {
    fn default() -> Self {
        Self {
            node_index: NO_INDEX,
            normal_index: NO_INDEX,
            point_index: NO_INDEX,
            constraint: 0.0,
            solution: 0.0,
            mc_index: 0,
            center_weight: [0.0, 0.0],
        }
    }
}

#[derive(Clone, Debug)]
struct Node {
    parent: i32,
    children: i32,
    depth: u8,
    off: [u32; 3],
    data: NodeData,
}

/// The octree arena. Node 0 is the root.
pub struct Octree {
    nodes: Vec<Node>,
    index: Vec<HashMap<[u32; 3], NodeId, DeterministicState>>,
}

impl Octree {
    pub fn new() -> Self {
        let root = Node {
            parent: -1,
            children: -1,
            depth: 0,
            off: [0, 0, 0],
            data: NodeData::default(),
        };
        let mut level = HashMap::with_hasher(DeterministicState);
        level.insert([0, 0, 0], 0);
        Self {
            nodes: vec![root],
            index: vec![level],
        }
    }

    pub fn root(&self) -> NodeId {
        0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self, node: NodeId) -> usize {
        self.nodes[node].depth as usize
    }

    pub fn offset(&self, node: NodeId) -> [u32; 3] {
        self.nodes[node].off
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        let p = self.nodes[node].parent;
        (p >= 0).then_some(p as NodeId)
    }

    pub fn has_children(&self, node: NodeId) -> bool {
        self.nodes[node].children >= 0
    }

    /// The child with corner code `c`, assuming children exist.
    pub fn child(&self, node: NodeId, c: usize) -> NodeId {
        debug_assert!(c < cube::CORNERS);
        let head = self.nodes[node].children;
        debug_assert!(head >= 0, "node has no children");
        head as NodeId + c
    }

    /// The corner code of `node` within its parent.
    pub fn child_index(&self, node: NodeId) -> usize {
        let parent = self.nodes[node].parent;
        debug_assert!(parent >= 0);
        node - self.nodes[parent as usize].children as NodeId
    }

    pub fn data(&self, node: NodeId) -> &NodeData {
        &self.nodes[node].data
    }

    pub fn data_mut(&mut self, node: NodeId) -> &mut NodeData {
        &mut self.nodes[node].data
    }

    /// Cell center and width in the unit-cube frame.
    pub fn center_and_width(&self, node: NodeId) -> (Point3<Real>, Real) {
        let n = &self.nodes[node];
        let width = 1.0 / (1u64 << n.depth) as Real;
        let center = Point3::new(
            (n.off[0] as Real + 0.5) * width,
            (n.off[1] as Real + 0.5) * width,
            (n.off[2] as Real + 0.5) * width,
        );
        (center, width)
    }

    /// Position of corner `c` of the node's cell.
    pub fn corner_position(&self, node: NodeId, c: usize) -> Point3<Real> {
        let n = &self.nodes[node];
        let width = 1.0 / (1u64 << n.depth) as Real;
        let (x, y, z) = cube::factor_corner_index(c);
        Point3::new(
            (n.off[0] + x as u32) as Real * width,
            (n.off[1] + y as u32) as Real * width,
            (n.off[2] + z as u32) as Real * width,
        )
    }

    /// Allocates the 8-child block of `node` if it does not exist yet.
    pub fn init_children(&mut self, node: NodeId) {
        if self.has_children(node) {
            return;
        }
        let depth = self.nodes[node].depth + 1;
        let off = self.nodes[node].off;
        let head = self.nodes.len();
        self.nodes[node].children = head as i32;
        if self.index.len() <= depth as usize {
            self.index
                .push(HashMap::with_hasher(DeterministicState));
        }
        for c in 0..cube::CORNERS {
            let (x, y, z) = cube::factor_corner_index(c);
            let child_off = [
                2 * off[0] + x as u32,
                2 * off[1] + y as u32,
                2 * off[2] + z as u32,
            ];
            self.nodes.push(Node {
                parent: node as i32,
                children: -1,
                depth,
                off: child_off,
                data: NodeData::default(),
            });
            self.index[depth as usize].insert(child_off, head + c);
        }
    }

    /// Drops the subtree below `node` (the nodes stay in the arena but are
    /// unlinked and removed from the offset index).
    pub fn null_children(&mut self, node: NodeId) {
        if !self.has_children(node) {
            return;
        }
        let head = self.nodes[node].children as NodeId;
        for c in 0..cube::CORNERS {
            let child = head + c;
            self.null_children(child);
            let (depth, off) = (self.nodes[child].depth as usize, self.nodes[child].off);
            self.index[depth].remove(&off);
        }
        self.nodes[node].children = -1;
    }

    /// Refines every node so the tree is complete down to `depth`.
    pub fn set_full_depth(&mut self, depth: usize) {
        let mut frontier = vec![self.root()];
        for _ in 0..depth {
            let mut next = vec![];
            for node in frontier {
                self.init_children(node);
                for c in 0..cube::CORNERS {
                    next.push(self.child(node, c));
                }
            }
            frontier = next;
        }
    }

    /// The node at `(depth, off)` if it exists and the offset is in range.
    pub fn node_at(&self, depth: usize, off: [i64; 3]) -> Option<NodeId> {
        if depth >= self.index.len() {
            return None;
        }
        let res = 1i64 << depth;
        if off.iter().any(|&o| o < 0 || o >= res) {
            return None;
        }
        self.index[depth]
            .get(&[off[0] as u32, off[1] as u32, off[2] as u32])
            .copied()
    }

    /// The node at `(depth, off)`, creating it (and any missing ancestors)
    /// if the offset is in range.
    pub fn ensure_node(&mut self, depth: usize, off: [i64; 3]) -> Option<NodeId> {
        let res = 1i64 << depth;
        if off.iter().any(|&o| o < 0 || o >= res) {
            return None;
        }
        if let Some(node) = self.node_at(depth, off) {
            return Some(node);
        }
        let parent = self.ensure_node(depth - 1, [off[0] >> 1, off[1] >> 1, off[2] >> 1])?;
        self.init_children(parent);
        self.node_at(depth, off)
    }

    /// The 3×3×3 same-depth neighbourhood of `node` (the node itself sits at
    /// `[1][1][1]`).
    pub fn neighbors3(&self, node: NodeId) -> [[[Option<NodeId>; 3]; 3]; 3] {
        let n = &self.nodes[node];
        let d = n.depth as usize;
        let mut result = [[[None; 3]; 3]; 3];
        for (i, plane) in result.iter_mut().enumerate() {
            for (j, row) in plane.iter_mut().enumerate() {
                for (k, slot) in row.iter_mut().enumerate() {
                    *slot = self.node_at(
                        d,
                        [
                            n.off[0] as i64 + i as i64 - 1,
                            n.off[1] as i64 + j as i64 - 1,
                            n.off[2] as i64 + k as i64 - 1,
                        ],
                    );
                }
            }
        }
        result
    }

    /// The 5×5×5 same-depth neighbourhood of `node` (the node itself sits at
    /// `[2][2][2]`).
    pub fn neighbors5(&self, node: NodeId) -> [[[Option<NodeId>; 5]; 5]; 5] {
        let n = &self.nodes[node];
        let d = n.depth as usize;
        let mut result = [[[None; 5]; 5]; 5];
        for (i, plane) in result.iter_mut().enumerate() {
            for (j, row) in plane.iter_mut().enumerate() {
                for (k, slot) in row.iter_mut().enumerate() {
                    *slot = self.node_at(
                        d,
                        [
                            n.off[0] as i64 + i as i64 - 2,
                            n.off[1] as i64 + j as i64 - 2,
                            n.off[2] as i64 + k as i64 - 2,
                        ],
                    );
                }
            }
        }
        result
    }

    /// Pre-order traversal of the subtree rooted at `node`.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut result = vec![];
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            result.push(n);
            if self.has_children(n) {
                for c in (0..cube::CORNERS).rev() {
                    stack.push(self.child(n, c));
                }
            }
        }
        result
    }

    /// The leaves of the subtree rooted at `node`, in pre-order.
    pub fn leaves(&self, node: NodeId) -> Vec<NodeId> {
        self.descendants(node)
            .into_iter()
            .filter(|&n| !self.has_children(n))
            .collect()
    }

    /// Deepest level with a live node.
    pub fn max_depth(&self) -> usize {
        self.descendants(self.root())
            .into_iter()
            .map(|n| self.depth(n))
            .max()
            .unwrap_or(0)
    }

    /// The corner code of the octant of `center` containing `p`.
    pub fn corner_of_point(center: &Point3<Real>, p: &Point3<Real>) -> usize {
        let mut c = 0;
        if p.x >= center.x {
            c |= 1;
        }
        if p.y >= center.y {
            c |= 2;
        }
        if p.z >= center.z {
            c |= 4;
        }
        c
    }
}

impl Default for Octree {
    fn default() -> Self {
        Self::new()
    }
}

/// Is the node's cell inside the solved region of a padded ("no boundary")
/// domain? The outer quarter on each side only exists to carry the doubled
/// cube.
pub fn is_inset(depth: usize, off: [u32; 3]) -> bool {
    if depth < 2 {
        return false;
    }
    let res = 1u32 << depth;
    let o = 1u32 << (depth - 2);
    off.iter().all(|&c| c >= o && c < res - o)
}

/// Like [`is_inset`] but including cells whose support touches the inset
/// region.
pub fn is_inset_supported(depth: usize, off: [u32; 3]) -> bool {
    if depth < 2 {
        return false;
    }
    let res = 1u32 << depth;
    let o = 1u32 << (depth - 2);
    off.iter().all(|&c| c >= o && c <= res - o)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn children_are_contiguous() {
        let mut tree = Octree::new();
        tree.init_children(tree.root());
        for c in 0..8 {
            let child = tree.child(tree.root(), c);
            assert_eq!(tree.child_index(child), c);
            assert_eq!(tree.parent(child), Some(tree.root()));
            assert_eq!(tree.depth(child), 1);
        }
    }

    #[test]
    fn center_and_width() {
        let mut tree = Octree::new();
        tree.init_children(tree.root());
        let child = tree.child(tree.root(), 7);
        let (center, width) = tree.center_and_width(child);
        assert_eq!(width, 0.5);
        assert_eq!(center, Point3::new(0.75, 0.75, 0.75));
        assert_eq!(tree.corner_position(child, 0), Point3::new(0.5, 0.5, 0.5));
        assert_eq!(tree.corner_position(child, 7), Point3::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn neighbor_lookup() {
        let mut tree = Octree::new();
        tree.set_full_depth(2);
        let node = tree.node_at(2, [1, 1, 1]).unwrap();
        let neighbors = tree.neighbors3(node);
        assert_eq!(neighbors[1][1][1], Some(node));
        for (i, plane) in neighbors.iter().enumerate() {
            for (j, row) in plane.iter().enumerate() {
                for (k, slot) in row.iter().enumerate() {
                    let expected = tree.node_at(2, [i as i64, j as i64, k as i64]);
                    assert_eq!(*slot, expected);
                }
            }
        }
        // Domain boundary clips the neighbourhood.
        let corner = tree.node_at(2, [0, 0, 0]).unwrap();
        assert!(tree.neighbors3(corner)[0][0][0].is_none());
    }

    #[test]
    fn null_children_unlinks() {
        let mut tree = Octree::new();
        tree.set_full_depth(2);
        assert_eq!(tree.max_depth(), 2);
        tree.null_children(tree.root());
        assert_eq!(tree.max_depth(), 0);
        assert_eq!(tree.node_at(1, [0, 0, 0]), None);
        assert_eq!(tree.leaves(tree.root()), vec![tree.root()]);
    }

    #[test]
    fn corner_of_point() {
        let center = Point3::new(0.5, 0.5, 0.5);
        assert_eq!(Octree::corner_of_point(&center, &Point3::new(0.2, 0.2, 0.2)), 0);
        assert_eq!(Octree::corner_of_point(&center, &Point3::new(0.7, 0.2, 0.9)), 5);
    }
}
