//! Level-independent voxel addressing and per-voxel data
use super::types::Corner;
use crate::Error;
use nalgebra::Vector3;

/// Deepest octree level that can be addressed by a [`VoxelIndex`]
pub const MAX_LEVEL: u8 = 20;

/// Bits per axis in a packed [`VoxelIndex`]
const AXIS_BITS: u32 = MAX_LEVEL as u32 + 1;
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;
static_assertions::const_assert!(3 * AXIS_BITS <= u64::BITS);

/// Level-independent identifier for an octree corner
///
/// Corners are addressed on the grid of the deepest possible level, with
/// 21 bits per axis packed as `x | y << 21 | z << 42`.  A corner
/// shared by nodes of different sizes therefore has a single index.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VoxelIndex(pub u64);

impl VoxelIndex {
    /// Packs integer grid coordinates
    ///
    /// Each coordinate must be at most `1 << MAX_LEVEL`.
    pub fn from_offsets(o: [u32; 3]) -> Self {
        debug_assert!(o.iter().all(|v| u64::from(*v) <= AXIS_MASK));
        Self(
            u64::from(o[0])
                | (u64::from(o[1]) << AXIS_BITS)
                | (u64::from(o[2]) << (2 * AXIS_BITS)),
        )
    }

    /// Builds the index of a node's corner from the node's path
    ///
    /// The path holds one octant triplet per level below the root, with the
    /// root's child in the most significant triplet.
    ///
    /// # Panics
    /// If `level > MAX_LEVEL`
    pub fn from_path_and_corner(level: u8, path: u64, corner: Corner) -> Self {
        assert!(level <= MAX_LEVEL, "level {level} is too deep");
        let mut o = [0u32; 3];
        for l in (0..level).rev() {
            let octant = Corner::new(((path >> (3 * l)) & 7) as u8);
            for (v, bit) in o.iter_mut().zip(octant.offset()) {
                *v = (*v << 1) | bit;
            }
        }
        let shift = MAX_LEVEL - level;
        for (v, bit) in o.iter_mut().zip(corner.offset()) {
            *v = (*v + bit) << shift;
        }
        Self::from_offsets(o)
    }

    /// Builds the index of a node's corner, checking the node's level
    ///
    /// Returns [`Error::OctreeTooDeep`] where [`from_path_and_corner`]
    /// would panic.
    ///
    /// [`from_path_and_corner`]: Self::from_path_and_corner
    pub fn try_from_path_and_corner(
        level: u8,
        path: u64,
        corner: Corner,
    ) -> Result<Self, Error> {
        if level > MAX_LEVEL {
            return Err(Error::OctreeTooDeep(level));
        }
        Ok(Self::from_path_and_corner(level, path, corner))
    }

    /// Unpacks integer grid coordinates
    pub fn offsets(self) -> [u32; 3] {
        [
            (self.0 & AXIS_MASK) as u32,
            ((self.0 >> AXIS_BITS) & AXIS_MASK) as u32,
            ((self.0 >> (2 * AXIS_BITS)) & AXIS_MASK) as u32,
        ]
    }

    /// Converts to a world position, given the root node's geometry
    pub fn position(
        self,
        root_center: Vector3<f64>,
        root_size: f64,
    ) -> Vector3<f64> {
        let scale = root_size / f64::from(1u32 << MAX_LEVEL);
        let o = self.offsets();
        let min = root_center - Vector3::repeat(root_size / 2.0);
        min + Vector3::new(f64::from(o[0]), f64::from(o[1]), f64::from(o[2]))
            * scale
    }
}

/// Implicit function data at a voxel
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct VoxelData {
    /// Signed implicit value, negative inside
    pub value: f32,
    /// Accumulated sample weight
    pub conf: f32,
    /// Weighted average sample scale
    pub scale: f32,
    /// Weighted average sample color
    pub color: Vector3<f32>,
}

impl VoxelData {
    /// Blends two voxels; confidence takes the minimum of both ends
    pub fn interpolate(&self, other: &VoxelData, t: f32) -> VoxelData {
        VoxelData {
            value: self.value * (1.0 - t) + other.value * t,
            conf: self.conf.min(other.conf),
            scale: self.scale * (1.0 - t) + other.scale * t,
            color: self.color * (1.0 - t) + other.color * t,
        }
    }
}
