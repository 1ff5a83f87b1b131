//! Strongly-typed axes, corners, and edges of a 3D grid cell
//!
//! Corners are numbered with one bit per axis, so corner `0b101` is at the
//! upper end of the X and Z axes and the lower end of the Y axis:
//!
//! ```text
//!         6 ------- 7
//!        /|        /|
//!       4 ------- 5 |
//!       | |       | |      Z
//!       | 2 ------|-3      |  Y
//!       |/        |/       | /
//!       0 ------- 1        |/____ X
//! ```

/// A single axis, represented as a `u8` with one bit (between 0 and 2) set
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Axis(u8);

impl Axis {
    /// Builds a new axis
    ///
    /// # Panics
    /// If the input does not have exactly 1 set bit in the 0-2 range
    pub const fn new(i: u8) -> Self {
        assert!(i.count_ones() == 1);
        assert!(i.trailing_zeros() < 3);
        Self(i)
    }

    /// Converts from a bitmask to an index
    pub fn index(self) -> usize {
        self.0.trailing_zeros() as usize
    }

    /// Cycles through X-Y-Z axes, returning the next one
    pub const fn next(self) -> Self {
        let u = self.0 << 1;
        if u > Z.0 { X } else { Axis(u) }
    }

    /// Iterates over the three axes
    pub fn iter() -> impl Iterator<Item = Self> {
        [X, Y, Z].into_iter()
    }
}

/// The X axis, i.e. `[1, 0, 0]`
pub const X: Axis = Axis(1);
/// The Y axis, i.e. `[0, 1, 0]`
pub const Y: Axis = Axis(2);
/// The Z axis, i.e. `[0, 0, 1]`
pub const Z: Axis = Axis(4);

impl std::ops::BitAnd<Corner> for Axis {
    type Output = bool;
    fn bitand(self, rhs: Corner) -> bool {
        (self.0 & rhs.0) != 0
    }
}

impl std::ops::BitOr<Axis> for Corner {
    type Output = Corner;
    fn bitor(self, rhs: Axis) -> Corner {
        Corner(self.0 | rhs.0)
    }
}

/// Strongly-typed cell corner, in the 0-8 range
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
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
    pub fn iter() -> impl Iterator<Item = Corner> {
        (0..8).map(Corner)
    }

    /// Returns the grid offset of this corner from the cell's lower corner
    pub fn offset(self) -> [usize; 3] {
        [
            (X & self) as usize,
            (Y & self) as usize,
            (Z & self) as usize,
        ]
    }
}

/// A cell edge running along `axis`, starting at the corner `start`
///
/// `start` never has the `axis` bit set; the edge ends at `start | axis`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Edge {
    /// Lower corner of the edge
    pub start: Corner,
    /// Direction of the edge
    pub axis: Axis,
}

impl Edge {
    /// Returns the upper corner of the edge
    pub fn end(self) -> Corner {
        self.start | self.axis
    }

    /// Iterates over the 12 edges of a cell
    pub fn iter() -> impl Iterator<Item = Edge> {
        Axis::iter().flat_map(|axis| {
            Corner::iter()
                .filter(move |c| !(axis & *c))
                .map(move |start| Edge { start, axis })
        })
    }
}
