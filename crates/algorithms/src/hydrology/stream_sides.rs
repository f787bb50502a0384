//! Stream bank of an inflowing flow line (SIDE)
//!
//! Decides whether flow entering a stream cell arrives from the left or
//! the right bank, looking downstream. The z-components of cross products
//! between the flow line vector and the stream direction vectors give the
//! side. A flow line that enters a junction between two tributaries, or
//! that points exactly against the stream, belongs to both banks.
//!
//! Reference:
//! Grabs, T. et al. (2010). Calculating terrain indices along streams: a
//! new method for separating stream sides. *Water Resources Research*, 46,
//! W12536.

use terraflow_core::raster::{Direction, GridTopology, Raster};

/// Banks receiving an inflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sides {
    pub left: bool,
    pub right: bool,
}

impl Sides {
    pub const BOTH: Sides = Sides {
        left: true,
        right: true,
    };

    fn from_right(right: bool) -> Self {
        Self { left: !right, right }
    }

    /// Share of the inflow credited to the (left, right) bank
    pub fn shares(self) -> (f64, f64) {
        match (self.left, self.right) {
            (true, true) => (0.5, 0.5),
            (true, false) => (1.0, 0.0),
            (false, true) => (0.0, 1.0),
            (false, false) => (0.0, 0.0),
        }
    }
}

#[inline]
fn cross(a: (f64, f64), b: (f64, f64)) -> f64 {
    a.0 * b.1 - a.1 * b.0
}

/// Stream code of a cell as a direction, if the cell is on the stream
#[inline]
fn stream_direction(streams: &Raster<i32>, row: usize, col: usize) -> Option<Direction> {
    streams
        .value(row, col)
        .and_then(|code| Direction::from_index(code as i64))
}

/// Banks of the stream cell reached by leaving `(row, col)` towards `dir`.
///
/// `streams` holds stream direction codes `0..=7`, no-data off the
/// network. The receiver is expected to be a stream cell; otherwise, and
/// on channel heads without tributaries, both banks are returned.
pub fn find_sides(
    topology: &GridTopology,
    streams: &Raster<i32>,
    row: usize,
    col: usize,
    dir: Direction,
) -> Sides {
    let Some((sr, sc)) = topology.neighbor(row, col, dir) else {
        return Sides::BOTH;
    };
    let Some(stream_dir) = stream_direction(streams, sr, sc) else {
        return Sides::BOTH;
    };

    let flow_line = dir.vector();
    let downstream = stream_dir.vector();

    let dot = flow_line.0 * downstream.0 + flow_line.1 * downstream.1;
    let norm = flow_line.0.hypot(flow_line.1) * downstream.0.hypot(downstream.1);
    if (dot / norm + 1.0).abs() < 1e-5 {
        return Sides::BOTH;
    }

    let zcp_a = cross(flow_line, downstream);
    let mut sides = Sides::BOTH;
    let mut tributaries = 0;

    for neighbour_dir in Direction::ALL {
        let Some((nr, nc)) = topology.neighbor(sr, sc, neighbour_dir) else {
            continue;
        };
        let Some(upstream_dir) = stream_direction(streams, nr, nc) else {
            continue;
        };
        if topology.neighbor(nr, nc, upstream_dir) != Some((sr, sc)) {
            continue;
        }

        tributaries += 1;
        let upstream = upstream_dir.vector();
        let zcp_b = cross(flow_line, upstream);
        let prev_right = sides.right;

        sides = if zcp_a * zcp_b >= 0.0 && zcp_b != 0.0 {
            Sides::from_right(zcp_b < 0.0)
        } else {
            // Sharp bend: the stream's own turn decides
            Sides::from_right(cross(downstream, upstream) < 0.0)
        };

        if tributaries > 1 && sides.right != prev_right {
            return Sides::BOTH;
        }
    }

    sides
}
