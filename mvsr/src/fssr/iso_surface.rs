//! Marching cubes on a non-uniform octree
//!
//! Extraction runs in four steps:
//!
//! 1. Every node gets a corner-sign [`McIndex`]
//! 2. Every leaf edge is split at the voxels of finer neighbors, and each
//!    finest sub-edge with a sign change is given an interned [`IsoVertex`]
//! 3. Each leaf face is split wherever a finer neighbor exposes a face
//!    center, then every finest sub-face is walked counter-clockwise (about
//!    the leaf's outward normal).  A crossing into the inside region is
//!    joined to the next crossing back out; the directed segments from all
//!    six faces chain into closed loops.
//! 4. Loops are triangulated by minimum area and assembled into a [`Mesh`]
//!
//! Leaves whose edges and faces are not split use the precomputed
//! [`MC_POLYGONS`] table, which is generated with the same face-walk rule.
//! Neighboring leaves walk a shared face in opposite directions, so they
//! produce the same segments with opposite orientation and the mesh is
//! closed wherever the voxels are defined.
use super::{
    MC_POLYGONS,
    iso_octree::IsoOctree,
    mesh::Mesh,
    octree::NodeInfo,
    triangulation::min_area_triangulation,
    types::{Corner, Edge, Face, McIndex},
    voxel::{MAX_LEVEL, VoxelData, VoxelIndex},
};
use crate::Error;
use nalgebra::Vector3;
use std::collections::{BTreeMap, HashMap};

/// Integer grid coordinates at the deepest octree level
type Offsets = [u32; 3];

/// Interpolated point where the implicit function crosses zero
#[derive(Copy, Clone, Debug)]
pub struct IsoVertex {
    /// World position
    pub pos: Vector3<f32>,
    /// Voxel data blended between the edge's endpoints
    pub data: VoxelData,
}

/// Surface extractor borrowing an [`IsoOctree`] with computed voxels
pub struct IsoSurface<'a> {
    iso: &'a IsoOctree,
    root_center: Vector3<f64>,
    root_size: f64,
    vertices: Vec<IsoVertex>,
    /// Finest-level edge (as an ordered voxel pair) to vertex index
    edge_map: HashMap<(VoxelIndex, VoxelIndex), usize>,
}

fn midpoint(a: Offsets, b: Offsets) -> Offsets {
    std::array::from_fn(|i| (a[i] + b[i]) / 2)
}

/// Checks whether a segment spans more than one unit of the finest grid
fn can_split(a: Offsets, b: Offsets) -> bool {
    a.iter().zip(&b).any(|(x, y)| x.abs_diff(*y) >= 2)
}

fn edge_key(a: Offsets, b: Offsets) -> (VoxelIndex, VoxelIndex) {
    let (a, b) = (VoxelIndex::from_offsets(a), VoxelIndex::from_offsets(b));
    if a < b { (a, b) } else { (b, a) }
}

fn leaf_corner(leaf: &NodeInfo, c: Corner) -> Offsets {
    VoxelIndex::from_path_and_corner(leaf.level, leaf.path, c).offsets()
}

impl<'a> IsoSurface<'a> {
    /// Prepares extraction
    ///
    /// The octree must be non-empty and regular (every node has 0 or 8
    /// children).
    pub fn new(iso: &'a IsoOctree) -> Result<Self, Error> {
        let root = iso.octree().root().ok_or(Error::EmptyOctree)?;
        if !iso.octree().is_regular() {
            return Err(Error::IrregularOctree);
        }
        let levels = iso.octree().num_levels();
        if levels > usize::from(MAX_LEVEL) + 1 {
            return Err(Error::OctreeTooDeep((levels - 1) as u8));
        }
        Ok(Self {
            iso,
            root_center: root.center,
            root_size: root.size,
            vertices: vec![],
            edge_map: HashMap::new(),
        })
    }

    fn voxel(&self, i: VoxelIndex) -> Result<VoxelData, Error> {
        self.iso.voxel(i).copied().ok_or(Error::MissingVoxel(i))
    }

    fn is_inside(&self, o: Offsets) -> Result<bool, Error> {
        Ok(self.voxel(VoxelIndex::from_offsets(o))?.value < 0.0)
    }

    /// Returns the midpoint of a segment if a finer node put a voxel there
    fn split_point(&self, a: Offsets, b: Offsets) -> Option<Offsets> {
        if !can_split(a, b) {
            return None;
        }
        let m = midpoint(a, b);
        self.iso.has_voxel(VoxelIndex::from_offsets(m)).then_some(m)
    }

    /// Pushes `a` and every split point on the way to `b` (but not `b`)
    fn edge_points(&self, a: Offsets, b: Offsets, out: &mut Vec<Offsets>) {
        match self.split_point(a, b) {
            Some(m) => {
                self.edge_points(a, m, out);
                self.edge_points(m, b, out);
            }
            None => out.push(a),
        }
    }

    /// Computes the corner-sign index of a single node
    pub fn mc_index(&self, node: &NodeInfo) -> Result<McIndex, Error> {
        let mut mask = 0;
        for c in Corner::iter() {
            let i = VoxelIndex::from_path_and_corner(node.level, node.path, c);
            if self.voxel(i)?.value < 0.0 {
                mask |= 1 << c.index();
            }
        }
        Ok(McIndex(mask))
    }

    /// Computes corner-sign indices for every node, indexed by node id
    pub fn mc_indices(&self) -> Result<Vec<McIndex>, Error> {
        let mut out = vec![McIndex::default(); self.iso.octree().num_nodes()];
        for n in self.iso.octree().visit() {
            out[n.id.index()] = self.mc_index(&n)?;
        }
        Ok(out)
    }

    /// Interns the isovertex on a finest sub-edge, if its signs differ
    fn intern(&mut self, a: Offsets, b: Offsets) -> Result<(), Error> {
        let key = edge_key(a, b);
        if self.edge_map.contains_key(&key) {
            return Ok(());
        }
        let va = self.voxel(key.0)?;
        let vb = self.voxel(key.1)?;
        if (va.value < 0.0) == (vb.value < 0.0) {
            return Ok(());
        }
        let t = va.value / (va.value - vb.value);
        let pa = key.0.position(self.root_center, self.root_size);
        let pb = key.1.position(self.root_center, self.root_size);
        let pos = pa + (pb - pa) * f64::from(t);

        self.edge_map.insert(key, self.vertices.len());
        self.vertices.push(IsoVertex {
            pos: pos.cast::<f32>(),
            data: va.interpolate(&vb, t),
        });
        Ok(())
    }

    /// Interns isovertices on every finest sub-edge of a leaf
    fn intern_leaf_edges(&mut self, leaf: &NodeInfo) -> Result<(), Error> {
        let mut pts = vec![];
        for e in Edge::iter() {
            let (a, b) = e.corners();
            let (a, b) = (leaf_corner(leaf, a), leaf_corner(leaf, b));
            pts.clear();
            self.edge_points(a, b, &mut pts);
            pts.push(b);
            for w in pts.windows(2) {
                self.intern(w[0], w[1])?;
            }
        }
        Ok(())
    }

    fn vertex(&self, a: Offsets, b: Offsets) -> Result<usize, Error> {
        let key = edge_key(a, b);
        self.edge_map
            .get(&key)
            .copied()
            .ok_or(Error::MissingIsoVertex(key.0, key.1))
    }

    /// Checks whether a leaf touches only same-sized (or coarser) neighbors
    fn is_simple(&self, leaf: &NodeInfo) -> bool {
        let edges_whole = Edge::iter().all(|e| {
            let (a, b) = e.corners();
            self.split_point(leaf_corner(leaf, a), leaf_corner(leaf, b))
                .is_none()
        });
        edges_whole
            && Face::iter().all(|f| {
                let c = f.corners().map(|c| leaf_corner(leaf, c));
                self.split_point(c[0], c[2]).is_none()
            })
    }

    /// Looks up loops for a simple leaf in the marching cubes table
    fn table_polygons(
        &self,
        leaf: &NodeInfo,
        mask: McIndex,
        out: &mut Vec<Vec<usize>>,
    ) -> Result<(), Error> {
        for poly in MC_POLYGONS[mask.index()] {
            let p = poly
                .iter()
                .map(|e| {
                    let (a, b) = Edge::new(*e).corners();
                    self.vertex(leaf_corner(leaf, a), leaf_corner(leaf, b))
                })
                .collect::<Result<Vec<_>, _>>()?;
            out.push(p);
        }
        Ok(())
    }

    /// Collects directed segments from one (possibly split) face
    fn face_segments(
        &self,
        ring: [Offsets; 4],
        level: u8,
        segments: &mut BTreeMap<usize, usize>,
    ) -> Result<(), Error> {
        if let Some(m) = self.split_point(ring[0], ring[2]) {
            let mids: [Offsets; 4] =
                std::array::from_fn(|i| midpoint(ring[i], ring[(i + 1) % 4]));
            for i in 0..4 {
                let sub = [ring[i], mids[i], m, mids[(i + 3) % 4]];
                self.face_segments(sub, level, segments)?;
            }
            return Ok(());
        }

        let mut pts = vec![];
        for i in 0..4 {
            self.edge_points(ring[i], ring[(i + 1) % 4], &mut pts);
        }
        let mut crossings = vec![];
        for i in 0..pts.len() {
            let (a, b) = (pts[i], pts[(i + 1) % pts.len()]);
            let inside = self.is_inside(b)?;
            if self.is_inside(a)? != inside {
                crossings.push((self.vertex(a, b)?, inside));
            }
        }
        for (i, &(v, entering)) in crossings.iter().enumerate() {
            if entering {
                let (w, _) = crossings[(i + 1) % crossings.len()];
                if segments.insert(v, w).is_some() {
                    return Err(Error::OpenIsoPolygon(level));
                }
            }
        }
        Ok(())
    }

    /// Walks every face of a leaf and chains the segments into loops
    fn walked_polygons(
        &self,
        leaf: &NodeInfo,
        out: &mut Vec<Vec<usize>>,
    ) -> Result<(), Error> {
        let mut segments = BTreeMap::new();
        for f in Face::iter() {
            let ring = f.corners().map(|c| leaf_corner(leaf, c));
            self.face_segments(ring, leaf.level, &mut segments)?;
        }
        while let Some((&start, _)) = segments.iter().next() {
            let mut poly = vec![];
            let mut v = start;
            loop {
                poly.push(v);
                v = segments
                    .remove(&v)
                    .ok_or(Error::OpenIsoPolygon(leaf.level))?;
                if v == start {
                    break;
                }
            }
            // Two-vertex loops are slivers along a shared edge
            if poly.len() >= 3 {
                out.push(poly);
            }
        }
        Ok(())
    }

    /// Runs extraction, returning a mesh
    ///
    /// Triangles touching a vertex with confidence at or below
    /// `min_confidence` are removed.
    pub fn extract_mesh(mut self, min_confidence: f32) -> Result<Mesh, Error> {
        let masks = self.mc_indices()?;
        let leaves = self.iso.octree().leaves();
        for leaf in &leaves {
            self.intern_leaf_edges(leaf)?;
        }

        let mut polygons = vec![];
        let mut walked = 0;
        for leaf in &leaves {
            let mask = masks[leaf.id.index()];
            if self.is_simple(leaf) {
                if !mask.is_uniform() {
                    self.table_polygons(leaf, mask, &mut polygons)?;
                }
            } else {
                walked += 1;
                self.walked_polygons(leaf, &mut polygons)?;
            }
        }
        log::debug!(
            "found {} polygons in {} leaves ({walked} walked)",
            polygons.len(),
            leaves.len()
        );

        let mut mesh = Mesh::new();
        for v in &self.vertices {
            mesh.vertices.push(v.pos);
            mesh.colors.push(v.data.color);
            mesh.values.push(v.data.scale);
            mesh.confidences.push(v.data.conf);
        }
        let mut pts = vec![];
        for poly in &polygons {
            pts.clear();
            pts.extend(poly.iter().map(|v| self.vertices[*v].pos));
            for t in min_area_triangulation(&pts) {
                mesh.triangles
                    .push(Vector3::new(poly[t[0]], poly[t[1]], poly[t[2]]));
            }
        }
        let removed = mesh.delete_low_confidence(min_confidence);
        mesh.compute_normals();
        log::info!(
            "extracted {} vertices and {} triangles ({removed} removed)",
            mesh.vertices.len(),
            mesh.triangles.len()
        );
        Ok(mesh)
    }
}
