//! Sparse octree index over voxel blocks.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Parents own
//! their children through the `Branch` handles; children keep a plain parent
//! handle. Roots sit at `max_lod` and are kept in a sorted map, so the index
//! covers an unbounded world as a forest of octrees.

use std::collections::BTreeMap;

use glam::IVec3;
use serde::{Deserialize, Serialize};
use voxelcore_common::{BlockKey, VoxelRegion};

use crate::block::VoxelBlock;
use crate::error::{CoarsenDeniedError, EvictionDeniedError};

/// Handle to an arena slot. Slots are recycled after eviction, so a handle
/// is only meaningful while its node is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A node holds either a block or exactly eight children.
#[derive(Debug, Clone)]
pub enum NodeContent {
    Leaf(VoxelBlock),
    Branch([NodeId; 8]),
}

#[derive(Debug, Clone)]
pub struct OctreeNode {
    key: BlockKey,
    parent: Option<NodeId>,
    content: NodeContent,
}

impl OctreeNode {
    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn content(&self) -> &NodeContent {
        &self.content
    }

    pub fn block(&self) -> Option<&VoxelBlock> {
        match &self.content {
            NodeContent::Leaf(b) => Some(b),
            NodeContent::Branch(_) => None,
        }
    }

    pub fn children(&self) -> Option<&[NodeId; 8]> {
        match &self.content {
            NodeContent::Leaf(_) => None,
            NodeContent::Branch(c) => Some(c),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.content, NodeContent::Leaf(_))
    }
}

/// Arena-backed forest of octrees.
#[derive(Debug, Clone)]
pub struct Octree {
    edge: u32,
    max_lod: u8,
    nodes: Vec<Option<OctreeNode>>,
    free: Vec<u32>,
    roots: BTreeMap<BlockKey, NodeId>,
}

impl Octree {
    pub fn new(edge: u32, max_lod: u8) -> Self {
        Self {
            edge,
            max_lod,
            nodes: Vec::new(),
            free: Vec::new(),
            roots: BTreeMap::new(),
        }
    }

    pub fn edge(&self) -> u32 {
        self.edge
    }

    pub fn max_lod(&self) -> u8 {
        self.max_lod
    }

    pub fn node(&self, id: NodeId) -> Option<&OctreeNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut OctreeNode> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn block(&self, id: NodeId) -> Option<&VoxelBlock> {
        self.node(id).and_then(OctreeNode::block)
    }

    pub fn block_mut(&mut self, id: NodeId) -> Option<&mut VoxelBlock> {
        match self.node_mut(id).map(|n| &mut n.content) {
            Some(NodeContent::Leaf(b)) => Some(b),
            _ => None,
        }
    }

    pub fn roots(&self) -> impl Iterator<Item = (BlockKey, NodeId)> + '_ {
        self.roots.iter().map(|(k, id)| (*k, *id))
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Root keys whose region overlaps `region`.
    pub fn root_keys_in(&self, region: &VoxelRegion) -> Vec<BlockKey> {
        if region.is_empty() {
            return Vec::new();
        }
        let lo = BlockKey::containing(region.min, self.max_lod, self.edge).coord();
        let hi = BlockKey::containing(region.max - IVec3::ONE, self.max_lod, self.edge).coord();
        let mut out = Vec::new();
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    out.push(BlockKey::new(self.max_lod, IVec3::new(x, y, z)));
                }
            }
        }
        out
    }

    fn alloc(&mut self, node: OctreeNode) -> NodeId {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i as usize] = Some(node);
                NodeId(i)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        if let Some(slot) = self.nodes.get_mut(id.index()) {
            if slot.take().is_some() {
                self.free.push(id.0);
            }
        }
    }

    fn ensure_root(&mut self, key: BlockKey) -> NodeId {
        if let Some(id) = self.roots.get(&key) {
            return *id;
        }
        let id = self.alloc(OctreeNode {
            key,
            parent: None,
            content: NodeContent::Leaf(VoxelBlock::new(key, self.edge)),
        });
        self.roots.insert(key, id);
        tracing::trace!(%key, "root created");
        id
    }

    /// Node exactly at `key`, if the tree currently has one.
    pub fn find(&self, key: BlockKey) -> Option<NodeId> {
        if key.lod > self.max_lod {
            return None;
        }
        let mut root_key = key;
        while root_key.lod < self.max_lod {
            root_key = root_key.parent();
        }
        let mut id = *self.roots.get(&root_key)?;
        loop {
            let node = self.node(id)?;
            if node.key == key {
                return Some(id);
            }
            let children = node.children()?;
            id = children[child_slot(node.key, key)];
        }
    }

    /// Leaf containing world position `p`. Walks at most `max_lod` levels.
    pub fn leaf_at(&self, p: IVec3) -> Option<NodeId> {
        let root_key = BlockKey::containing(p, self.max_lod, self.edge);
        let mut id = *self.roots.get(&root_key)?;
        loop {
            let node = self.node(id)?;
            match &node.content {
                NodeContent::Leaf(_) => return Some(id),
                NodeContent::Branch(children) => {
                    let child_key = BlockKey::containing(p, node.key.lod - 1, self.edge);
                    id = children[child_slot(node.key, child_key)];
                }
            }
        }
    }

    /// Node at `key`, creating roots and subdividing coarser leaves on the way.
    /// If finer detail already exists, the returned node is a branch.
    pub fn ensure(&mut self, key: BlockKey) -> NodeId {
        let key = if key.lod > self.max_lod {
            BlockKey::containing(key.origin(self.edge), self.max_lod, self.edge)
        } else {
            key
        };
        let mut root_key = key;
        while root_key.lod < self.max_lod {
            root_key = root_key.parent();
        }
        let mut id = self.ensure_root(root_key);
        loop {
            let Some(node) = self.node(id) else {
                return id;
            };
            if node.key == key {
                return id;
            }
            let node_key = node.key;
            let existing = node.children().copied();
            let children = match existing {
                Some(c) => c,
                None => match self.subdivide(id) {
                    Some(c) => c,
                    None => return id,
                },
            };
            id = children[child_slot(node_key, key)];
        }
    }

    /// Leaves covering `region` at `lod` or finer, creating and subdividing
    /// as needed. Existing finer detail is returned as is.
    pub fn resolve(&mut self, region: &VoxelRegion, lod: u8) -> Vec<NodeId> {
        let lod = lod.min(self.max_lod);
        let mut out = Vec::new();
        for root_key in self.root_keys_in(region) {
            let root = self.ensure_root(root_key);
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                let Some(node) = self.node(id) else {
                    continue;
                };
                if !node.key.region(self.edge).intersects(region) {
                    continue;
                }
                let children = match &node.content {
                    NodeContent::Leaf(_) if node.key.lod > lod => self.subdivide(id),
                    NodeContent::Leaf(_) => {
                        out.push(id);
                        None
                    }
                    NodeContent::Branch(children) => Some(*children),
                };
                if let Some(children) = children {
                    stack.extend(children.iter().rev());
                }
            }
        }
        out
    }

    /// Split a leaf into eight ungenerated children. The leaf's own block is
    /// dropped; children are regenerated or reloaded at the finer LOD.
    pub fn subdivide(&mut self, id: NodeId) -> Option<[NodeId; 8]> {
        let node = self.node(id)?;
        if !node.is_leaf() {
            return None;
        }
        let child_keys = node.key.children()?;
        let edge = self.edge;
        let children = child_keys.map(|key| {
            self.alloc(OctreeNode {
                key,
                parent: Some(id),
                content: NodeContent::Leaf(VoxelBlock::new(key, edge)),
            })
        });
        if let Some(node) = self.node_mut(id) {
            node.content = NodeContent::Branch(children);
            tracing::trace!(key = %node.key, "node subdivided");
        }
        Some(children)
    }

    /// Collapse a branch into one coarse leaf.
    ///
    /// Nested branches are collapsed bottom-up. When every child is generated
    /// the new block is their spatial average; otherwise it is left
    /// ungenerated for the generator to fill at the coarse LOD. Denied, with
    /// the tree unchanged, if any descendant holds unpersisted edits.
    pub fn coarsen(&mut self, id: NodeId) -> Result<(), CoarsenDeniedError> {
        let key = self
            .node(id)
            .map(|n| n.key)
            .ok_or(CoarsenDeniedError::NotBranch(BlockKey::default()))?;
        let Some(children) = self.node(id).and_then(|n| n.children()).copied() else {
            return Err(CoarsenDeniedError::NotBranch(key));
        };
        if let Some(pending) = self.first_unpersisted(id) {
            return Err(CoarsenDeniedError::ChildUnpersisted(pending));
        }
        for child in children {
            if self.node(child).is_some_and(|n| !n.is_leaf()) {
                self.coarsen(child)?;
            }
        }

        let blocks: Vec<&VoxelBlock> = children.iter().filter_map(|c| self.block(*c)).collect();
        let block = match <[&VoxelBlock; 8]>::try_from(blocks) {
            Ok(refs) if refs.iter().all(|b| b.is_generated()) => {
                VoxelBlock::coarsened_from(key, self.edge, refs)
            }
            _ => VoxelBlock::new(key, self.edge),
        };
        for child in children {
            self.release(child);
        }
        if let Some(node) = self.node_mut(id) {
            node.content = NodeContent::Leaf(block);
        }
        tracing::trace!(%key, "node coarsened");
        Ok(())
    }

    /// Free the subtree under `id`.
    ///
    /// Roots are removed entirely; inner nodes become ungenerated leaves so
    /// their parent still partitions its region. Returns the number of nodes
    /// released. Denied, with the tree unchanged, if any leaf in the subtree
    /// holds unpersisted edits.
    pub fn evict(&mut self, id: NodeId) -> Result<usize, EvictionDeniedError> {
        let Some(node) = self.node(id) else {
            return Ok(0);
        };
        let key = node.key;
        let parent = node.parent;
        if let Some(pending) = self.first_unpersisted(id) {
            return Err(EvictionDeniedError { node: key, pending });
        }

        let mut released = 0;
        if let Some(children) = self.node(id).and_then(|n| n.children()).copied() {
            for child in children {
                released += self.release_subtree(child);
            }
        }
        match parent {
            None => {
                self.release(id);
                self.roots.remove(&key);
                released += 1;
            }
            Some(_) => {
                let edge = self.edge;
                if let Some(node) = self.node_mut(id) {
                    node.content = NodeContent::Leaf(VoxelBlock::new(key, edge));
                }
            }
        }
        tracing::debug!(%key, released, "subtree evicted");
        Ok(released)
    }

    fn release_subtree(&mut self, id: NodeId) -> usize {
        let mut stack = vec![id];
        let mut released = 0;
        while let Some(id) = stack.pop() {
            if let Some(children) = self.node(id).and_then(|n| n.children()) {
                stack.extend_from_slice(children);
            }
            self.release(id);
            released += 1;
        }
        released
    }

    fn first_unpersisted(&self, id: NodeId) -> Option<BlockKey> {
        self.subtree_leaves(id)
            .into_iter()
            .filter_map(|leaf| self.block(leaf))
            .find(|b| b.has_unpersisted_edits())
            .map(|b| b.key())
    }

    /// Leaves under `id` in octant order.
    pub fn subtree_leaves(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            match self.node(id).map(|n| &n.content) {
                Some(NodeContent::Leaf(_)) => out.push(id),
                Some(NodeContent::Branch(children)) => stack.extend(children.iter().rev()),
                None => {}
            }
        }
        out
    }

    /// Every leaf, roots in key order, each subtree in octant order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.roots
            .values()
            .flat_map(|root| self.subtree_leaves(*root))
            .collect()
    }

    /// Verify structural invariants: every live node is reachable, has
    /// exactly one of {block, children}, and children partition their parent.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut seen = 0usize;
        for (root_key, root) in &self.roots {
            let node = self
                .node(*root)
                .ok_or_else(|| format!("root {root_key} points at a free slot"))?;
            if node.key != *root_key || node.key.lod != self.max_lod || node.parent.is_some() {
                return Err(format!("root {root_key} is malformed"));
            }
            let mut stack = vec![*root];
            while let Some(id) = stack.pop() {
                seen += 1;
                let node = self
                    .node(id)
                    .ok_or_else(|| format!("dangling handle {id:?}"))?;
                match &node.content {
                    NodeContent::Leaf(block) => {
                        if block.key() != node.key {
                            return Err(format!("leaf {} holds block {}", node.key, block.key()));
                        }
                    }
                    NodeContent::Branch(children) => {
                        let expected = node
                            .key
                            .children()
                            .ok_or_else(|| format!("LOD 0 node {} has children", node.key))?;
                        for (slot, child) in children.iter().enumerate() {
                            let c = self
                                .node(*child)
                                .ok_or_else(|| format!("dangling child of {}", node.key))?;
                            if c.key != expected[slot] || c.parent != Some(id) {
                                return Err(format!(
                                    "child {} of {} is misplaced",
                                    c.key, node.key
                                ));
                            }
                            stack.push(*child);
                        }
                    }
                }
            }
        }
        if seen != self.node_count() {
            return Err(format!(
                "{} live nodes but {} reachable",
                self.node_count(),
                seen
            ));
        }
        Ok(())
    }
}

/// Octant of `parent` that contains `descendant`.
fn child_slot(parent: BlockKey, descendant: BlockKey) -> usize {
    let shift = parent.lod - 1 - descendant.lod;
    let c = descendant.coord();
    let local = IVec3::new(c.x >> shift, c.y >> shift, c.z >> shift) - parent.coord() * 2;
    (local.x & 1) as usize | (((local.y & 1) as usize) << 1) | (((local.z & 1) as usize) << 2)
}
