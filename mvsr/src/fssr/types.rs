//! Strongly-typed cube corners, edges, and faces
//!
//! Corner `i` of a node sits at offset `(i & 1, (i >> 1) & 1, (i >> 2) & 1)`
//! from the node's minimum corner, in units of the node size.  The same bit
//! layout is used for octants.

/// A single axis, represented as a `u8` with one bit (between 0 and 3) set
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Axis(u8);

/// The X axis, i.e. `[1, 0, 0]`
pub const X: Axis = Axis(1);
/// The Y axis, i.e. `[0, 1, 0]`
pub const Y: Axis = Axis(2);
/// The Z axis, i.e. `[0, 0, 1]`
pub const Z: Axis = Axis(4);

impl Axis {
    /// Converts from a bitmask to an index in `0..3`
    pub fn index(self) -> usize {
        self.0.trailing_zeros() as usize
    }

    /// Cycles through X-Y-Z axes, returning the next one
    pub const fn next(self) -> Self {
        let u = self.0 << 1;
        if u > Z.0 { X } else { Axis(u) }
    }

    /// Returns the right-handed frame `(self, self.next(), self.next().next())`
    pub const fn frame(self) -> (Axis, Axis, Axis) {
        let u = self.next();
        (self, u, u.next())
    }
}

impl std::ops::Mul<bool> for Axis {
    type Output = Corner;
    fn mul(self, rhs: bool) -> Corner {
        if rhs { Corner(self.0) } else { Corner(0) }
    }
}

/// Strongly-typed node corner (or octant), in the `[0, 8)` range
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Corner(u8);

impl Corner {
    /// Builds a new corner
    ///
    /// # Panics
    /// If `i >= 8`, which is not a valid corner index
    pub const fn new(i: u8) -> Self {
        assert!(i < 8);
        Self(i)
    }
    /// Returns the value of this corner as an index
    pub fn index(self) -> usize {
        self.0 as usize
    }
    /// Iterates over all 8 corners
    pub fn iter() -> impl DoubleEndedIterator<Item = Self> {
        (0..8).map(Corner)
    }
    /// Returns the integer offset of this corner along each axis
    pub fn offset(self) -> [u32; 3] {
        [
            u32::from(self.0 & 1),
            u32::from((self.0 >> 1) & 1),
            u32::from((self.0 >> 2) & 1),
        ]
    }
}

impl std::ops::BitOr<Axis> for Corner {
    type Output = Corner;
    fn bitor(self, rhs: Axis) -> Corner {
        Corner(self.0 | rhs.0)
    }
}

impl std::ops::BitOr<Corner> for Corner {
    type Output = Corner;
    fn bitor(self, rhs: Corner) -> Corner {
        Corner(self.0 | rhs.0)
    }
}

/// An undirected edge within a node
///
/// With `(t, u, v)` as a right-handed coordinate system and `t` being the
/// varying axis of the edge, this is packed as `4 * t + 2 * v + 1 * u`
/// (where `t`, `u`, and `v` are values in the range 0-2 representing an axis)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Edge(u8);

impl Edge {
    /// Builds a new edge
    ///
    /// # Panics
    /// If `i >= 12`, since that's an invalid edge
    pub const fn new(i: u8) -> Self {
        assert!(i < 12);
        Self(i)
    }
    /// Converts from an edge to an index
    pub fn index(self) -> usize {
        self.0 as usize
    }
    /// Iterates over all 12 edges
    pub fn iter() -> impl Iterator<Item = Self> {
        (0..12).map(Edge)
    }

    /// Returns a `(start, end)` tuple for the given edge
    ///
    /// The start always has the `t` bit clear and the end always has it set.
    pub fn corners(self) -> (Corner, Corner) {
        let (t, u, v) = match self.0 / 4 {
            0 => X.frame(),
            1 => Y.frame(),
            2 => Z.frame(),
            _ => unreachable!("invalid edge index"),
        };
        let start = (u * (self.0 % 2 != 0)) | (v * ((self.0 % 4) / 2 != 0));
        (start, start | t)
    }
}

/// A face of a node, packed as `2 * axis + side`
///
/// `side` is 0 for the face at the node's minimum along `axis`, 1 for the
/// face at its maximum; the outward normal points along `-axis` or `+axis`
/// respectively.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Face(u8);

impl Face {
    /// Iterates over all 6 faces
    pub fn iter() -> impl Iterator<Item = Self> {
        (0..6).map(Face)
    }
    /// Returns the axis normal to this face
    pub fn axis(self) -> Axis {
        Axis(1 << (self.0 / 2))
    }
    /// Returns `true` if this face is on the positive side of its axis
    pub fn positive(self) -> bool {
        self.0 % 2 == 1
    }

    /// Returns the face's corners, counter-clockwise about the outward normal
    pub fn corners(self) -> [Corner; 4] {
        let (t, u, v) = self.axis().frame();
        let base = t * self.positive();
        let ring = [base, base | u, base | u | v, base | v];
        if self.positive() {
            ring
        } else {
            [ring[0], ring[3], ring[2], ring[1]]
        }
    }
}

/// Bitmask of which corners of a node are inside the surface
///
/// Bit `i` is set when the implicit function at corner `i` is negative.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct McIndex(pub u8);

impl McIndex {
    /// Returns the mask as a table index
    pub fn index(self) -> usize {
        self.0 as usize
    }
    /// Checks whether every corner is on the same side of the surface
    pub fn is_uniform(self) -> bool {
        self.0 == 0x00 || self.0 == 0xff
    }
}
