//! Stable per-depth node enumeration and the shared corner/edge tables.
//!
//! [`SortedTreeNodes`] snapshots the tree into a breadth-first array where
//! the nodes of depth `d` occupy `node_count[d]..node_count[d + 1]` and the
//! children of any node form a contiguous 8-block at the next depth; the
//! position of a node in this array is its `node_index`, the dense row/column
//! numbering used by the linear system.
//!
//! The corner and edge tables assign one global slot to every geometric
//! corner (shared by up to 8 cells) and edge (shared by up to 4 cells) of a
//! subtree. A cell owns one of its corners exactly when no other cell
//! touching the corner either precedes it in Morton order at the same depth
//! or is refined below it, restricted to cells whose ancestor chain stays in
//! the subtree. Ownership makes the slot count deterministic and gives every
//! slot a unique writer.

use crate::cube;
use crate::cube::square;
use crate::octree::{DeterministicState, NodeId, Octree, NO_INDEX};
use std::collections::HashMap;

const UNSET: u32 = u32::MAX;

pub struct SortedTreeNodes {
    /// Breadth-first node array; `tree_nodes[i]` has `node_index == i`.
    pub tree_nodes: Vec<NodeId>,
    /// `node_count[d + 1] - node_count[d]` nodes live at depth `d`.
    pub node_count: Vec<usize>,
    /// Number of depth levels (deepest live depth + 1).
    pub levels: usize,
}

impl SortedTreeNodes {
    /// A placeholder snapshot; replaced as soon as the tree is finalized.
    pub fn empty() -> Self {
        Self {
            tree_nodes: vec![],
            node_count: vec![0, 0],
            levels: 1,
        }
    }

    /// Snapshot the current tree, (re)assigning every node's `node_index`.
    pub fn set(tree: &mut Octree) -> Self {
        for node in tree.descendants(tree.root()) {
            tree.data_mut(node).node_index = NO_INDEX;
        }

        let levels = tree.max_depth() + 1;
        let mut node_count = vec![0; levels + 1];
        let mut tree_nodes = vec![tree.root()];
        node_count[1] = 1;
        for d in 1..levels {
            node_count[d + 1] = node_count[d];
            for i in node_count[d - 1]..node_count[d] {
                let node = tree_nodes[i];
                if tree.has_children(node) {
                    for c in 0..cube::CORNERS {
                        tree_nodes.push(tree.child(node, c));
                    }
                    node_count[d + 1] += cube::CORNERS;
                }
            }
        }
        for (i, &node) in tree_nodes.iter().enumerate() {
            tree.data_mut(node).node_index = i as i32;
        }

        Self {
            tree_nodes,
            node_count,
            levels,
        }
    }

    /// Index range of the nodes at depth `d`.
    pub fn depth_range(&self, d: usize) -> std::ops::Range<usize> {
        self.node_count[d]..self.node_count[d + 1]
    }

    // The per-depth spans of subtree nodes, walking the contiguous child
    // blocks from `root` (or from the whole tree when `root` is `None`).
    fn subtree_spans(
        &self,
        tree: &Octree,
        root: Option<NodeId>,
        table_depth: usize,
    ) -> Vec<(usize, usize, usize)> {
        let (min_depth, mut start, mut end) = match root {
            Some(r) => {
                let i = tree.data(r).node_index;
                assert!(i >= 0, "subtree root is not in the sorted snapshot");
                (tree.depth(r), i as usize, i as usize)
            }
            None => (0, 0, 0),
        };

        let mut spans = vec![];
        for d in min_depth..=table_depth {
            spans.push((d, start, end + 1));
            if d < table_depth {
                while start < end && !tree.has_children(self.tree_nodes[start]) {
                    start += 1;
                }
                while end > start && !tree.has_children(self.tree_nodes[end]) {
                    end -= 1;
                }
                if start == end && !tree.has_children(self.tree_nodes[start]) {
                    break;
                }
                start = tree.data(tree.child(self.tree_nodes[start], 0)).node_index as usize;
                end = tree.data(tree.child(self.tree_nodes[end], 7)).node_index as usize;
            }
        }
        spans
    }

    // Does the depth-`min_depth` ancestor of a cell at `(d, off)` lie at the
    // subtree root's offset?
    fn in_subtree(
        tree: &Octree,
        node: NodeId,
        root: Option<NodeId>,
        min_depth: usize,
    ) -> bool {
        match root {
            None => true,
            Some(r) => {
                let d = tree.depth(node);
                let off = tree.offset(node);
                let root_off = tree.offset(r);
                let shift = d - min_depth;
                (0..3).all(|i| off[i] >> shift == root_off[i])
            }
        }
    }

    /// Build the shared-corner table for the subtree under `root` (or the
    /// whole tree), down to `table_depth`.
    pub fn corner_table(
        &self,
        tree: &Octree,
        root: Option<NodeId>,
        table_depth: usize,
    ) -> CornerTable {
        let spans = self.subtree_spans(tree, root, table_depth);
        let min_depth = spans.first().map_or(0, |s| s.0);

        let mut table: HashMap<NodeId, [u32; cube::CORNERS], DeterministicState> =
            HashMap::with_hasher(DeterministicState);
        for &(_, start, end) in &spans {
            for i in start..end {
                table.insert(self.tree_nodes[i], [UNSET; cube::CORNERS]);
            }
        }

        let mut owners = vec![];
        for &(d, start, end) in &spans {
            for i in start..end {
                let node = self.tree_nodes[i];
                if d < table_depth && tree.has_children(node) {
                    continue;
                }
                let neighbors = tree.neighbors3(node);
                for c in 0..cube::CORNERS {
                    let (x, y, z) = cube::factor_corner_index(c);
                    let ac = cube::antipodal_corner_index(c);
                    let mut owner = true;
                    for cc in 0..cube::CORNERS {
                        let (fx, fy, fz) = cube::factor_corner_index(cc);
                        let neighbor = neighbors[x + fx][y + fy][z + fz];
                        if let Some(n) = neighbor {
                            if tree.data(n).node_index == NO_INDEX {
                                continue;
                            }
                            if (cc < ac || (d < table_depth && tree.has_children(n)))
                                && Self::in_subtree(tree, n, root, min_depth)
                            {
                                owner = false;
                                break;
                            }
                        }
                    }
                    if !owner {
                        continue;
                    }
                    let slot = owners.len() as u32;
                    owners.push((node, c));
                    // Share the slot with every cell touching the corner, at
                    // this depth and at every ancestor for which this is also
                    // corner `c`.
                    let mut n = node;
                    loop {
                        let neighbors = tree.neighbors3(n);
                        for cc in 0..cube::CORNERS {
                            let (fx, fy, fz) = cube::factor_corner_index(cc);
                            if let Some(other) = neighbors[x + fx][y + fy][z + fz] {
                                if tree.data(other).node_index != NO_INDEX {
                                    if let Some(entry) = table.get_mut(&other) {
                                        entry[cube::antipodal_corner_index(cc)] = slot;
                                    }
                                }
                            }
                        }
                        match tree.parent(n) {
                            Some(p)
                                if tree.depth(n) > min_depth && tree.child_index(n) == c =>
                            {
                                n = p;
                            }
                            _ => break,
                        }
                    }
                }
            }
        }

        CornerTable { table, owners }
    }

    /// Build the shared-edge table for the subtree under `root` (or the
    /// whole tree), down to `table_depth`.
    pub fn edge_table(
        &self,
        tree: &Octree,
        root: Option<NodeId>,
        table_depth: usize,
    ) -> EdgeTable {
        let spans = self.subtree_spans(tree, root, table_depth);

        let mut table: HashMap<NodeId, [u32; cube::EDGES], DeterministicState> =
            HashMap::with_hasher(DeterministicState);
        for &(_, start, end) in &spans {
            for i in start..end {
                table.insert(self.tree_nodes[i], [UNSET; cube::EDGES]);
            }
        }

        let mut owners = vec![];
        for &(_, start, end) in &spans {
            for i in start..end {
                let node = self.tree_nodes[i];
                let neighbors = tree.neighbors3(node);
                for e in 0..cube::EDGES {
                    let (o, ei, ej) = cube::factor_edge_index(e);
                    let ac = square::antipodal_corner_index(square::corner_index(ei, ej));
                    let mut owner = true;
                    for cc in 0..square::CORNERS {
                        let (fi, fj) = square::factor_corner_index(cc);
                        let (ii, jj) = (ei + fi, ej + fj);
                        let (x, y, z) = match o {
                            0 => (1, ii, jj),
                            1 => (ii, 1, jj),
                            _ => (ii, jj, 1),
                        };
                        if let Some(n) = neighbors[x][y][z] {
                            if tree.data(n).node_index != NO_INDEX && cc < ac {
                                owner = false;
                                break;
                            }
                        }
                    }
                    if !owner {
                        continue;
                    }
                    let slot = owners.len() as u32;
                    owners.push((node, e));
                    for cc in 0..square::CORNERS {
                        let (fi, fj) = square::factor_corner_index(cc);
                        let (afi, afj) =
                            square::factor_corner_index(square::antipodal_corner_index(cc));
                        let (ii, jj) = (ei + fi, ej + fj);
                        let (x, y, z) = match o {
                            0 => (1, ii, jj),
                            1 => (ii, 1, jj),
                            _ => (ii, jj, 1),
                        };
                        if let Some(other) = neighbors[x][y][z] {
                            if tree.data(other).node_index != NO_INDEX {
                                if let Some(entry) = table.get_mut(&other) {
                                    entry[cube::edge_index(o, afi, afj)] = slot;
                                }
                            }
                        }
                    }
                }
            }
        }

        EdgeTable { table, owners }
    }
}

/// Global ids for the shared corners of a subtree.
pub struct CornerTable {
    table: HashMap<NodeId, [u32; cube::CORNERS], DeterministicState>,
    owners: Vec<(NodeId, usize)>,
}

impl CornerTable {
    pub fn count(&self) -> usize {
        self.owners.len()
    }

    /// The owning `(cell, corner)` of each slot.
    pub fn owners(&self) -> &[(NodeId, usize)] {
        &self.owners
    }

    pub fn index(&self, node: NodeId, c: usize) -> usize {
        let slot = self.table[&node][c];
        assert!(slot != UNSET, "corner slot was never assigned");
        slot as usize
    }

    pub fn get(&self, node: NodeId, c: usize) -> Option<usize> {
        let slot = *self.table.get(&node)?.get(c)?;
        (slot != UNSET).then_some(slot as usize)
    }
}

/// Global ids for the shared edges of a subtree.
pub struct EdgeTable {
    table: HashMap<NodeId, [u32; cube::EDGES], DeterministicState>,
    owners: Vec<(NodeId, usize)>,
}

impl EdgeTable {
    pub fn count(&self) -> usize {
        self.owners.len()
    }

    pub fn index(&self, node: NodeId, e: usize) -> usize {
        let slot = self.table[&node][e];
        assert!(slot != UNSET, "edge slot was never assigned");
        slot as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::octree::Octree;

    fn full_tree(depth: usize) -> (Octree, SortedTreeNodes) {
        let mut tree = Octree::new();
        tree.set_full_depth(depth);
        let snodes = SortedTreeNodes::set(&mut tree);
        (tree, snodes)
    }

    #[test]
    fn sorted_index_consistency() {
        let (tree, snodes) = full_tree(3);
        assert_eq!(snodes.levels, 4);
        assert_eq!(snodes.node_count[4], 1 + 8 + 64 + 512);
        for (i, &node) in snodes.tree_nodes.iter().enumerate() {
            assert_eq!(tree.data(node).node_index, i as i32);
        }
        // Children form a contiguous block at the next depth.
        for d in 0..3 {
            for i in snodes.depth_range(d) {
                let node = snodes.tree_nodes[i];
                if tree.has_children(node) {
                    let head = tree.data(tree.child(node, 0)).node_index as usize;
                    for c in 0..8 {
                        assert_eq!(
                            tree.data(tree.child(node, c)).node_index as usize,
                            head + c
                        );
                        assert!(snodes.depth_range(d + 1).contains(&(head + c)));
                    }
                }
            }
        }
    }

    #[test]
    fn corner_slot_count_of_full_tree() {
        // A complete depth-2 grid has (4+1)³ distinct leaf corners.
        let (tree, snodes) = full_tree(2);
        let corners = snodes.corner_table(&tree, None, 2);
        assert_eq!(corners.count(), 125);
    }

    #[test]
    fn corner_dedup_across_cells() {
        let (tree, snodes) = full_tree(2);
        let corners = snodes.corner_table(&tree, None, 2);
        // Every pair of leaf cells sharing a geometric corner position agrees
        // on its slot id.
        let leaves = tree.leaves(tree.root());
        let mut by_position: std::collections::HashMap<[u32; 3], usize> = Default::default();
        for &leaf in &leaves {
            let off = tree.offset(leaf);
            for c in 0..cube::CORNERS {
                let (x, y, z) = cube::factor_corner_index(c);
                let pos = [off[0] + x as u32, off[1] + y as u32, off[2] + z as u32];
                let slot = corners.index(leaf, c);
                let prev = by_position.insert(pos, slot);
                if let Some(prev) = prev {
                    assert_eq!(prev, slot, "corner {pos:?} has two slots");
                }
            }
        }
    }

    #[test]
    fn edge_slot_count_of_full_tree() {
        // A complete depth-1 grid has, per axis, 2 edge positions along the
        // axis × 3×3 transverse lines = 18 unique edges, so 54 in total.
        // The table also spans the root cell, whose 12 coarse edges get
        // their own slots.
        let (tree, snodes) = full_tree(1);
        let edges = snodes.edge_table(&tree, None, 1);
        assert_eq!(edges.count(), 54 + 12);
    }

    #[test]
    fn adaptive_tree_shares_corners_with_coarse_cells() {
        // Refine only one octant: the refined children that touch a corner of
        // the coarse sibling share its slot.
        let mut tree = Octree::new();
        tree.init_children(tree.root());
        let child0 = tree.child(tree.root(), 0);
        tree.init_children(child0);
        let snodes = SortedTreeNodes::set(&mut tree);
        let corners = snodes.corner_table(&tree, None, 2);

        // The deep cell (depth 2, offset (1,1,1)) has its corner 7 at the
        // cube center, which is also corner 0 of the coarse depth-1 cell at
        // offset (1,1,1).
        let deep = tree.node_at(2, [1, 1, 1]).unwrap();
        let coarse = tree.node_at(1, [1, 1, 1]).unwrap();
        assert_eq!(corners.index(deep, 7), corners.index(coarse, 0));
    }
}
