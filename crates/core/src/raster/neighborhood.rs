//! The 8-neighbour (Moore) grid model used by flow routing
//!
//! Directions are numbered clockwise from North:
//!
//! ```text
//!   7  0  1        NW  N  NE
//!   6  *  2         W  *  E
//!   5  4  3        SW  S  SE
//! ```
//!
//! Row 0 is the northern edge, so North is `row - 1`.

use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_4, SQRT_2};

/// Row/column offsets indexed by direction code.
const OFFSETS: [(isize, isize); 8] = [
    (-1, 0),  // 0: N
    (-1, 1),  // 1: NE
    (0, 1),   // 2: E
    (1, 1),   // 3: SE
    (1, 0),   // 4: S
    (1, -1),  // 5: SW
    (0, -1),  // 6: W
    (-1, -1), // 7: NW
];

/// One of the eight neighbour directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Direction(u8);

impl Direction {
    pub const N: Direction = Direction(0);
    pub const NE: Direction = Direction(1);
    pub const E: Direction = Direction(2);
    pub const SE: Direction = Direction(3);
    pub const S: Direction = Direction(4);
    pub const SW: Direction = Direction(5);
    pub const W: Direction = Direction(6);
    pub const NW: Direction = Direction(7);

    /// All directions in iteration order
    pub const ALL: [Direction; 8] = [
        Direction(0),
        Direction(1),
        Direction(2),
        Direction(3),
        Direction(4),
        Direction(5),
        Direction(6),
        Direction(7),
    ];

    /// Direction for a code in `0..8`, `None` otherwise
    pub fn from_index(code: i64) -> Option<Self> {
        if (0..8).contains(&code) {
            Some(Direction(code as u8))
        } else {
            None
        }
    }

    /// Direction for any integer, taken modulo 8
    pub fn wrapping(code: i64) -> Self {
        Direction(code.rem_euclid(8) as u8)
    }

    /// Direction code in `0..8`
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// (row, col) offset of the neighbour
    pub fn offset(self) -> (isize, isize) {
        OFFSETS[self.index()]
    }

    /// Direction rotated clockwise by `steps` eighths
    pub fn rotate(self, steps: i64) -> Self {
        Self::wrapping(self.0 as i64 + steps)
    }

    pub fn opposite(self) -> Self {
        self.rotate(4)
    }

    pub fn is_diagonal(self) -> bool {
        self.0 % 2 == 1
    }

    /// Neighbour distance in cell units (1 or √2)
    pub fn length_factor(self) -> f64 {
        if self.is_diagonal() {
            SQRT_2
        } else {
            1.0
        }
    }

    /// Azimuth in radians, clockwise from North
    pub fn azimuth(self) -> f64 {
        self.0 as f64 * FRAC_PI_4
    }

    /// Unit-step vector with x pointing east and y pointing north
    pub fn vector(self) -> (f64, f64) {
        let (dr, dc) = self.offset();
        (dc as f64, -dr as f64)
    }
}

impl From<Direction> for usize {
    fn from(d: Direction) -> usize {
        d.index()
    }
}

/// Shape and spacing of a grid: neighbour lookup and distances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridTopology {
    rows: usize,
    cols: usize,
    cell_size: f64,
}

impl GridTopology {
    pub fn new(rows: usize, cols: usize, cell_size: f64) -> Self {
        Self { rows, cols, cell_size }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    pub fn cell_area(&self) -> f64 {
        self.cell_size * self.cell_size
    }

    /// Whether signed coordinates fall inside the grid
    pub fn in_grid(&self, row: isize, col: isize) -> bool {
        row >= 0 && col >= 0 && (row as usize) < self.rows && (col as usize) < self.cols
    }

    /// Whether the cell keeps at least `margin` cells from every edge
    pub fn is_interior(&self, row: usize, col: usize, margin: usize) -> bool {
        row >= margin
            && col >= margin
            && row + margin < self.rows
            && col + margin < self.cols
    }

    /// Coordinates of the neighbour in `dir`, or `None` if it is off-grid
    #[inline]
    pub fn neighbor(&self, row: usize, col: usize, dir: Direction) -> Option<(usize, usize)> {
        debug_assert!(row < self.rows && col < self.cols);
        let (dr, dc) = dir.offset();
        let nr = row as isize + dr;
        let nc = col as isize + dc;
        if self.in_grid(nr, nc) {
            Some((nr as usize, nc as usize))
        } else {
            None
        }
    }

    /// Physical distance to the neighbour in `dir`
    #[inline]
    pub fn distance(&self, dir: Direction) -> f64 {
        self.cell_size * dir.length_factor()
    }

    /// Linear row-major index of a cell
    #[inline]
    pub fn index(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.rows && col < self.cols);
        row * self.cols + col
    }

    /// Cell coordinates of a linear index
    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize) {
        (index / self.cols, index % self.cols)
    }
}
