//! Adaptive octree of oriented samples
//!
//! Nodes live in a flat arena and refer to their children by [`NodeId`].  A
//! sample is stored in the first node (walking down from the root) whose
//! half-size is smaller than the sample's scale, so every sample in a node of
//! size `s` has a scale in `(s / 2, s]`.
use super::{sample::Sample, types::Corner, voxel::MAX_LEVEL};
use nalgebra::Vector3;

/// Handle to a node within an [`Octree`]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(usize);

impl NodeId {
    /// Returns the node's position in the arena
    pub fn index(self) -> usize {
        self.0
    }
}

/// A single octree node
#[derive(Clone, Debug, Default)]
pub struct Node {
    children: [Option<NodeId>; 8],
    samples: Vec<Sample>,
}

impl Node {
    /// Returns the child in the given octant, if present
    pub fn child(&self, octant: Corner) -> Option<NodeId> {
        self.children[octant.index()]
    }
    /// Returns every child slot
    pub fn children(&self) -> &[Option<NodeId>; 8] {
        &self.children
    }
    /// Checks whether this node has no children at all
    pub fn is_leaf(&self) -> bool {
        self.children.iter().all(Option::is_none)
    }
    /// Returns samples stored in this node
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

/// Position of a node within the tree
#[derive(Copy, Clone, Debug)]
pub struct NodeInfo {
    /// Node handle
    pub id: NodeId,
    /// Depth below the root (which is level 0)
    pub level: u8,
    /// Octant triplets from the root, most significant first
    pub path: u64,
    /// Node center
    pub center: Vector3<f64>,
    /// Node edge length
    pub size: f64,
}

impl NodeInfo {
    /// Returns the geometry of the child in the given octant
    pub fn child(&self, id: NodeId, octant: Corner) -> NodeInfo {
        let quarter = self.size / 4.0;
        let o = octant.offset();
        let offset = Vector3::new(
            if o[0] == 1 { quarter } else { -quarter },
            if o[1] == 1 { quarter } else { -quarter },
            if o[2] == 1 { quarter } else { -quarter },
        );
        NodeInfo {
            id,
            level: self.level + 1,
            path: (self.path << 3) | octant.index() as u64,
            center: self.center + offset,
            size: self.size / 2.0,
        }
    }
}

/// Octree of oriented samples
#[derive(Clone, Debug, Default)]
pub struct Octree {
    nodes: Vec<Node>,
    root: Option<NodeId>,
    root_center: Vector3<f64>,
    root_size: f64,
    num_samples: usize,
}

/// Picks the octant of `center`'s node that contains `pos`
fn octant_for(pos: &Vector3<f64>, center: &Vector3<f64>) -> Corner {
    let mut i = 0;
    for axis in 0..3 {
        if pos[axis] > center[axis] {
            i |= 1 << axis;
        }
    }
    Corner::new(i)
}

impl Octree {
    /// Builds an empty octree
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes every node and sample
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Number of nodes, including the root
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of inserted samples
    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    /// Number of levels; a lone root has one level
    pub fn num_levels(&self) -> usize {
        self.visit().iter().map(|n| n.level as usize + 1).max().unwrap_or(0)
    }

    /// Returns the root node, if the tree is not empty
    pub fn root(&self) -> Option<NodeInfo> {
        self.root.map(|id| NodeInfo {
            id,
            level: 0,
            path: 0,
            center: self.root_center,
            size: self.root_size,
        })
    }

    /// Borrows a node
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Checks whether a point lies within the root's bounding cube
    pub fn is_inside_octree(&self, pos: &Vector3<f64>) -> bool {
        let half = self.root_size / 2.0;
        self.root.is_some()
            && (pos - self.root_center).iter().all(|d| d.abs() <= half)
    }

    fn push_node(&mut self) -> NodeId {
        self.nodes.push(Node::default());
        NodeId(self.nodes.len() - 1)
    }

    /// Creates a single empty child in the given octant
    ///
    /// Returns the existing child if the slot is already filled.  This can
    /// leave a node with fewer than 8 children; see
    /// [`make_regular_octree`](Self::make_regular_octree).
    pub fn create_child(&mut self, parent: NodeId, octant: Corner) -> NodeId {
        if let Some(c) = self.nodes[parent.0].child(octant) {
            return c;
        }
        let c = self.push_node();
        self.nodes[parent.0].children[octant.index()] = Some(c);
        c
    }

    /// Creates all 8 children of a leaf
    fn subdivide(&mut self, node: NodeId) {
        for octant in Corner::iter() {
            self.create_child(node, octant);
        }
    }

    /// Doubles the root cube towards `pos`, moving the old root into the
    /// opposite octant of a new root
    fn expand_root_for_point(&mut self, pos: &Vector3<f64>) {
        let Some(old) = self.root else {
            return;
        };
        let half = self.root_size / 2.0;
        let mut octant = 0;
        for axis in 0..3 {
            if pos[axis] > self.root_center[axis] {
                self.root_center[axis] += half;
            } else {
                octant |= 1 << axis;
                self.root_center[axis] -= half;
            }
        }
        self.root_size *= 2.0;

        let root = self.push_node();
        self.nodes[root.0].children[octant] = Some(old);
        self.subdivide(root);
        self.root = Some(root);
        self.fold_deep_nodes();
    }

    /// Merges every subtree below [`MAX_LEVEL`] into its ancestor there
    ///
    /// Growing the root pushes existing nodes one level down, so this keeps
    /// the tree addressable by [`VoxelIndex`](super::VoxelIndex).
    fn fold_deep_nodes(&mut self) {
        let deep: Vec<NodeId> = self
            .visit()
            .into_iter()
            .filter(|n| n.level == MAX_LEVEL && !self.nodes[n.id.0].is_leaf())
            .map(|n| n.id)
            .collect();
        if deep.is_empty() {
            return;
        }
        for id in &deep {
            let node = &mut self.nodes[id.0];
            let mut todo: Vec<NodeId> =
                node.children.iter().flatten().copied().collect();
            node.children = [None; 8];
            while let Some(c) = todo.pop() {
                let child = std::mem::take(&mut self.nodes[c.0]);
                todo.extend(child.children.iter().flatten());
                self.nodes[id.0].samples.extend(child.samples);
            }
        }
        log::debug!("folded {} nodes at level {MAX_LEVEL}", deep.len());
        self.compact();
    }

    /// Drops unreachable nodes, renumbering the rest breadth-first
    fn compact(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        let mut old = std::mem::take(&mut self.nodes);
        let mut remap = vec![usize::MAX; old.len()];
        let mut order = vec![root];
        remap[root.0] = 0;
        let mut i = 0;
        while i < order.len() {
            for c in old[order[i].0].children.iter().flatten() {
                remap[c.0] = order.len();
                order.push(*c);
            }
            i += 1;
        }
        self.nodes = order
            .iter()
            .map(|id| {
                let mut n = std::mem::take(&mut old[id.0]);
                for c in n.children.iter_mut().flatten() {
                    *c = NodeId(remap[c.0]);
                }
                n
            })
            .collect();
        self.root = Some(NodeId(0));
    }

    /// Inserts a sample, growing the tree as needed
    ///
    /// The first sample defines the root: centered on the sample, with the
    /// sample's scale as its size.  Samples with a non-positive scale or a
    /// non-finite position are skipped (returning `false`).
    pub fn insert_sample(&mut self, s: Sample) -> bool {
        if !(s.scale.is_finite() && s.scale > 0.0)
            || !s.pos.iter().all(|v| v.is_finite())
        {
            log::warn!("skipping sample with scale {} at {:?}", s.scale, s.pos);
            return false;
        }
        let pos = s.pos.cast::<f64>();
        if self.root.is_none() {
            self.root = Some(self.push_node());
            self.root_center = pos;
            self.root_size = f64::from(s.scale);
        }
        while !self.is_inside_octree(&pos) {
            self.expand_root_for_point(&pos);
        }
        let node = self.find_node_for_sample(&s);
        self.nodes[node.0].samples.push(s);
        self.num_samples += 1;
        true
    }

    /// Inserts a batch of samples
    pub fn insert_samples<I: IntoIterator<Item = Sample>>(&mut self, iter: I) {
        let mut skipped = 0;
        for s in iter {
            skipped += usize::from(!self.insert_sample(s));
        }
        log::debug!(
            "octree has {} samples in {} nodes ({skipped} skipped)",
            self.num_samples,
            self.nodes.len()
        );
    }

    /// Finds (creating as needed) the node that should store `s`
    ///
    /// Descent stops at [`MAX_LEVEL`], so very small samples may share a node
    /// larger than their scale would imply.
    fn find_node_for_sample(&mut self, s: &Sample) -> NodeId {
        let pos = s.pos.cast::<f64>();
        let scale = f64::from(s.scale);
        while scale > self.root_size {
            self.expand_root_for_point(&pos);
        }
        let Some(mut info) = self.root() else {
            unreachable!("root is created before descent");
        };
        while info.level < MAX_LEVEL && scale <= info.size / 2.0 {
            let octant = octant_for(&pos, &info.center);
            if self.nodes[info.id.0].is_leaf() {
                self.subdivide(info.id);
            }
            let child = self.create_child(info.id, octant);
            info = info.child(child, octant);
        }
        info.id
    }

    /// Returns every node in depth-first order
    pub fn visit(&self) -> Vec<NodeInfo> {
        let mut out = vec![];
        let mut todo: Vec<NodeInfo> = self.root().into_iter().collect();
        while let Some(info) = todo.pop() {
            for octant in Corner::iter().rev() {
                if let Some(c) = self.nodes[info.id.0].child(octant) {
                    todo.push(info.child(c, octant));
                }
            }
            out.push(info);
        }
        out
    }

    /// Returns every leaf in depth-first order
    pub fn leaves(&self) -> Vec<NodeInfo> {
        self.visit()
            .into_iter()
            .filter(|n| self.nodes[n.id.0].is_leaf())
            .collect()
    }

    /// Checks that every node has exactly 0 or 8 children
    pub fn is_regular(&self) -> bool {
        self.nodes.iter().all(|n| {
            let count = n.children.iter().filter(|c| c.is_some()).count();
            count == 0 || count == 8
        })
    }

    /// Creates missing siblings so that every node has 0 or 8 children
    pub fn make_regular_octree(&mut self) {
        let mut created = 0;
        for i in 0..self.nodes.len() {
            let node = &self.nodes[i];
            if node.is_leaf() {
                continue;
            }
            for octant in Corner::iter() {
                if self.nodes[i].child(octant).is_none() {
                    self.create_child(NodeId(i), octant);
                    created += 1;
                }
            }
        }
        log::debug!("created {created} nodes while regularizing octree");
    }

    /// Subdivides every leaf into 8 empty children
    ///
    /// Leaves at [`MAX_LEVEL`] are left alone.
    pub fn refine_octree(&mut self) {
        for leaf in self.leaves() {
            if leaf.level < MAX_LEVEL {
                self.subdivide(leaf.id);
            }
        }
    }

    /// Collects every sample whose support (`factor * scale`) contains `pos`
    ///
    /// Since a node of size `s` only stores samples with scale at most `s`,
    /// nodes whose cube (expanded by `factor * s`) misses `pos` are skipped
    /// along with their subtrees.
    pub fn influence_query<'a>(
        &'a self,
        pos: &Vector3<f64>,
        factor: f64,
        out: &mut Vec<&'a Sample>,
    ) {
        out.clear();
        let mut todo: Vec<NodeInfo> = self.root().into_iter().collect();
        while let Some(info) = todo.pop() {
            let reach = info.size / 2.0 + factor * info.size;
            if (pos - info.center).iter().any(|d| d.abs() > reach) {
                continue;
            }
            let node = &self.nodes[info.id.0];
            for s in &node.samples {
                let r = factor * f64::from(s.scale);
                if (pos - s.pos.cast::<f64>()).norm_squared() < r * r {
                    out.push(s);
                }
            }
            for octant in Corner::iter() {
                if let Some(c) = node.child(octant) {
                    todo.push(info.child(c, octant));
                }
            }
        }
    }
}
