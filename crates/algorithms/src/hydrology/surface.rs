//! Read access to the elevation surface
//!
//! [`Surface`] is the engine's only view of the DEM: validity checks,
//! neighbour lookup, the local gradient and the steepest-descent
//! neighbour. It never mutates the DEM.
//!
//! Gradients use the Zevenbergen & Thorne (1987) finite differences on the
//! four orthogonal neighbours. A missing neighbour (off-grid or no-data) is
//! mirrored through the centre cell; if both sides are missing the
//! difference is zero.
//!
//! Reference:
//! Zevenbergen, L.W. & Thorne, C.R. (1987). Quantitative analysis of land
//! surface topography. *Earth Surface Processes and Landforms*, 12, 47–56.

use std::f64::consts::{FRAC_PI_2, PI, TAU};
use terraflow_core::raster::{Direction, GridTopology, Raster};

/// Smallest drop treated as a real slope when it is used as a divisor.
pub(crate) const SLOPE_EPSILON: f64 = 1e-10;

/// Local slope and aspect of a cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gradient {
    /// Slope angle in radians
    pub slope: f64,
    /// Downslope aspect in radians, clockwise from North in `[0, 2π)`;
    /// `None` on a flat cell
    pub aspect: Option<f64>,
}

/// Elevation grid plus its topology.
#[derive(Debug, Clone, Copy)]
pub struct Surface<'a> {
    dem: &'a Raster<f64>,
    topology: GridTopology,
}

impl<'a> Surface<'a> {
    pub fn new(dem: &'a Raster<f64>) -> Self {
        let (rows, cols) = dem.shape();
        Self {
            dem,
            topology: GridTopology::new(rows, cols, dem.cell_size()),
        }
    }

    pub fn dem(&self) -> &'a Raster<f64> {
        self.dem
    }

    pub fn topology(&self) -> &GridTopology {
        &self.topology
    }

    pub fn rows(&self) -> usize {
        self.topology.rows()
    }

    pub fn cols(&self) -> usize {
        self.topology.cols()
    }

    pub fn cell_size(&self) -> f64 {
        self.topology.cell_size()
    }

    /// Elevation at a cell, `None` for no-data or off-grid
    #[inline]
    pub fn elevation(&self, row: usize, col: usize) -> Option<f64> {
        self.dem.value(row, col)
    }

    #[inline]
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.dem.is_valid(row, col)
    }

    /// In-grid neighbour coordinates, regardless of validity
    #[inline]
    pub fn neighbor(&self, row: usize, col: usize, dir: Direction) -> Option<(usize, usize)> {
        self.topology.neighbor(row, col, dir)
    }

    /// Neighbour that is in-grid and holds a valid elevation
    #[inline]
    pub fn valid_neighbor(&self, row: usize, col: usize, dir: Direction) -> Option<(usize, usize, f64)> {
        let (nr, nc) = self.topology.neighbor(row, col, dir)?;
        self.elevation(nr, nc).map(|z| (nr, nc, z))
    }

    #[inline]
    pub fn distance(&self, dir: Direction) -> f64 {
        self.topology.distance(dir)
    }

    /// Zevenbergen–Thorne slope and aspect. `None` if the cell is not valid.
    pub fn gradient(&self, row: usize, col: usize) -> Option<Gradient> {
        let z = self.elevation(row, col)?;

        // N, E, S, W
        let mut dz = [0.0_f64; 4];
        for (i, slot) in dz.iter_mut().enumerate() {
            let dir = Direction::wrapping(2 * i as i64);
            *slot = if let Some((_, _, zn)) = self.valid_neighbor(row, col, dir) {
                zn - z
            } else if let Some((_, _, zo)) = self.valid_neighbor(row, col, dir.opposite()) {
                z - zo
            } else {
                0.0
            };
        }

        let cs2 = 2.0 * self.cell_size();
        let g = (dz[0] - dz[2]) / cs2;
        let h = (dz[1] - dz[3]) / cs2;

        let slope = (g * g + h * h).sqrt().atan();
        let aspect = if g != 0.0 {
            let a = PI + h.atan2(g);
            Some(if a >= TAU { a - TAU } else { a })
        } else if h > 0.0 {
            Some(PI + FRAC_PI_2)
        } else if h < 0.0 {
            Some(FRAC_PI_2)
        } else {
            None
        };

        Some(Gradient { slope, aspect })
    }

    /// Steepest downslope neighbour (D8).
    ///
    /// Candidates are compared by drop per distance; the first maximum in
    /// direction order wins. A cell with any off-grid or no-data neighbour
    /// has no direction, so grid edges and no-data borders act as outlets.
    pub fn steepest_descent(&self, row: usize, col: usize) -> Option<Direction> {
        let z = self.elevation(row, col)?;
        let mut best: Option<(Direction, f64)> = None;

        for dir in Direction::ALL {
            let (_, _, zn) = self.valid_neighbor(row, col, dir)?;
            let dz = (z - zn) / self.distance(dir);
            if dz > 0.0 && best.map_or(true, |(_, max)| max < dz) {
                best = Some((dir, dz));
            }
        }

        best.map(|(dir, _)| dir)
    }

    /// Drop towards `dir`, extrapolated across missing neighbours.
    ///
    /// Uses `z - z_n` when the neighbour is valid, otherwise the drop from
    /// the opposite neighbour into this cell, otherwise zero.
    #[inline]
    pub fn extrapolated_drop(&self, row: usize, col: usize, z: f64, dir: Direction) -> f64 {
        if let Some((_, _, zn)) = self.valid_neighbor(row, col, dir) {
            z - zn
        } else if let Some((_, _, zo)) = self.valid_neighbor(row, col, dir.opposite()) {
            zo - z
        } else {
            0.0
        }
    }

    /// Whether no neighbour is lower; any missing neighbour disqualifies.
    pub fn is_sink(&self, row: usize, col: usize) -> bool {
        let Some(z) = self.elevation(row, col) else {
            return false;
        };
        Direction::ALL.iter().all(|&dir| {
            self.valid_neighbor(row, col, dir)
                .map_or(false, |(_, _, zn)| zn >= z)
        })
    }
}
