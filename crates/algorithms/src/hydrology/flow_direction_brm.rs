//! Braunschweiger Reliefmodell (BRM) flow routing
//!
//! The cell's aspect is categorized into one of eight octants `Dir`. Flow
//! goes to up to three receivers: `Dir+1` (left), `Dir` (centre) and
//! `Dir-1` (right).
//!
//! The shares come from two boundary flow lines traced across a 9×9
//! lattice spanning the source cell (row `y = 1`) and the target row
//! (`y = 9`). At every lattice point the line moves along a blend of the
//! neighbourhood's slope vectors, rotated so that `Dir` points along `+y`.
//! Where each line leaves the lattice decides how much of the flow tube
//! spills over to either side.
//!
//! The blend weights are looked up in [`BrmTables`], indexed by the
//! neighbourhood layout (orthogonal or diagonal `Dir`), the neighbour and
//! the lattice point. The published model ships these as fixed numeric
//! tables; supply them through [`BrmTables::from_raw`] to reproduce it.
//! [`BrmTables::approximate`] is an interpolating stand-in and does not
//! give the published model's numbers.
//!
//! Reference:
//! Bauer, J., Rohdenburg, H. & Bork, H.-R. (1985). Ein Digitales
//! Reliefmodell als Vorraussetzung fuer ein deterministisches Modell der
//! Wasser- und Stoff-Fluesse. *Landschaftsgenese und Landschaftsoekologie*,
//! 10, 1–15.

use std::sync::{Arc, OnceLock};
use terraflow_core::raster::Direction;

use super::routing::{FlowRouter, FlowSplit};
use super::surface::Surface;

/// Lattice side length
pub const LATTICE: usize = 9;

/// Per-neighbour lattice weights, indexed `[neighbour][x - 1][y - 1]`
pub type LatticeWeights<const N: usize> = [[[f64; LATTICE]; LATTICE]; N];

/// Upper aspect bound (degrees) of each octant.
const KGEXP: [f64; 8] = [26.0, 64.0, 116.0, 154.0, 206.0, 244.0, 296.0, 334.0];

/// Rotation (degrees) bringing octant `Dir` onto the lattice `+y` axis.
const IDREH: [i64; 8] = [180, 135, 90, 45, 0, 315, 270, 225];

/// Upper bound on flow line steps across the lattice
const MAX_STEPS: usize = 100;

/// Cell centres of the diagonal layout: centre, Dir+1, Dir-1, Dir
const DIAMOND: [(f64, f64); 4] = [(5.0, 1.0), (9.0, 5.0), (1.0, 5.0), (5.0, 9.0)];

/// Interpolation weights of the BRM lattice.
///
/// Orthogonal octants blend six neighbours: the three receivers
/// (`Dir+1`, `Dir`, `Dir-1`), then `Dir+2`, the centre and `Dir-2`.
/// Diagonal octants blend four: the centre, `Dir+1`, `Dir-1` and `Dir`.
#[derive(Debug, Clone, PartialEq)]
pub struct BrmTables {
    ortho: LatticeWeights<6>,
    diago: LatticeWeights<4>,
}

impl BrmTables {
    /// Tables from explicit values.
    pub fn from_raw(ortho: LatticeWeights<6>, diago: LatticeWeights<4>) -> Self {
        Self { ortho, diago }
    }

    /// Interpolating stand-in for the published tables.
    ///
    /// The shares it yields are a consistent split of the flow tube but do
    /// not match the published Braunschweig model.
    ///
    /// The orthogonal layout places the six cell centres at lattice
    /// `x ∈ {13, 5, -3}` (Dir+1 side, middle, Dir-1 side) on the source row
    /// `y = 1` and the target row `y = 9`, and blends them bilinearly. The
    /// diagonal layout is a diamond (centre `(5, 1)`, target `(5, 9)`,
    /// Dir+1 at `(9, 5)`, Dir-1 at `(1, 5)`) blended by inverse squared
    /// distance. Weights at every lattice point sum to one.
    pub fn approximate() -> Self {
        let mut ortho = [[[0.0; LATTICE]; LATTICE]; 6];
        let mut diago = [[[0.0; LATTICE]; LATTICE]; 4];

        for ix in 0..LATTICE {
            for iy in 0..LATTICE {
                let x = (ix + 1) as f64;
                let y = (iy + 1) as f64;

                let ty = (y - 1.0) / 8.0;
                let (side, tx) = if x >= 5.0 {
                    (0, (x - 5.0) / 8.0)
                } else {
                    (2, (5.0 - x) / 8.0)
                };
                // Target row: 0 = Dir+1, 1 = Dir, 2 = Dir-1
                ortho[1][ix][iy] = ty * (1.0 - tx);
                ortho[side][ix][iy] = ty * tx;
                // Source row: 3 = Dir+2, 4 = centre, 5 = Dir-2
                ortho[4][ix][iy] = (1.0 - ty) * (1.0 - tx);
                ortho[side + 3][ix][iy] = (1.0 - ty) * tx;

                let mut w = [0.0; 4];
                match DIAMOND.iter().position(|&(cx, cy)| cx == x && cy == y) {
                    Some(k) => w[k] = 1.0,
                    None => {
                        for (k, &(cx, cy)) in DIAMOND.iter().enumerate() {
                            w[k] = 1.0 / ((x - cx).powi(2) + (y - cy).powi(2));
                        }
                        let sum: f64 = w.iter().sum();
                        w.iter_mut().for_each(|v| *v /= sum);
                    }
                }
                for k in 0..4 {
                    diago[k][ix][iy] = w[k];
                }
            }
        }

        Self { ortho, diago }
    }

    /// Process-wide copy of [`BrmTables::approximate`]
    pub fn shared_approximate() -> Arc<Self> {
        static TABLES: OnceLock<Arc<BrmTables>> = OnceLock::new();
        TABLES.get_or_init(|| Arc::new(Self::approximate())).clone()
    }

    #[inline]
    fn weight(&self, diagonal: bool, neighbour: usize, ix: usize, iy: usize) -> f64 {
        if diagonal {
            self.diago[neighbour][ix][iy]
        } else {
            self.ortho[neighbour][ix][iy]
        }
    }
}

/// Shares of the three receivers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrmShares {
    /// Share of `Dir+1`
    pub left: f64,
    /// Share of `Dir`
    pub middle: f64,
    /// Share of `Dir-1`
    pub right: f64,
}

/// Braunschweig router.
#[derive(Debug, Clone)]
pub struct BrmRouter {
    tables: Arc<BrmTables>,
}

impl BrmRouter {
    pub fn new(tables: Arc<BrmTables>) -> Self {
        Self { tables }
    }

    /// Aspect octant (`Dir`) for an aspect in degrees
    pub fn octant(aspect_deg: f64) -> Direction {
        let mut dir = 0;
        while dir < 8 && aspect_deg > KGEXP[dir] {
            dir += 1;
        }
        Direction::wrapping(dir as i64)
    }

    /// Slope (degrees) and truncated aspect (degrees) of a cell.
    /// Flat or invalid cells have no aspect.
    fn slope_aspect(surface: &Surface<'_>, row: usize, col: usize) -> (f64, Option<i64>) {
        match surface.gradient(row, col) {
            Some(g) => (
                g.slope.to_degrees(),
                g.aspect.map(|a| a.to_degrees() as i64),
            ),
            None => (0.0, None),
        }
    }

    /// Trace the two boundary lines and split the flow tube.
    pub fn spread(&self, diagonal: bool, slopes: &[f64], aspects: &[i64]) -> BrmShares {
        let n = slopes.len();
        let total: f64 = slopes.iter().sum();
        let sg = if total > 0.0 { n as f64 / total } else { 0.0 };

        let mut s = [0.0; 6];
        let mut c = [0.0; 6];
        for k in 0..n {
            let a = sg * slopes[k];
            let e = (aspects[k] as f64).to_radians();
            s[k] = a * -e.sin();
            c[k] = a * -e.cos();
        }

        let step = |x: &mut f64, y: &mut f64| {
            let ix = lattice_index(*x);
            let iy = lattice_index(*y);
            for k in 0..n {
                let a = self.tables.weight(diagonal, k, ix, iy);
                *x += s[k] * a;
                *y += c[k] * a;
            }
        };
        let correct = |q: f64| {
            if !diagonal {
                q
            } else if q < 0.5 {
                q * (1.67 - q * 1.078)
            } else {
                q * 0.869 + 0.131
            }
        };

        let (mut x, mut y) = (1.0, 1.0);
        let mut left = 0.0;
        for _ in 0..MAX_STEPS {
            step(&mut x, &mut y);
            if x < 1.0 {
                left = 0.0;
                break;
            }
            if x > 8.99 || y < 1.0 {
                left = 1.0;
                break;
            }
            if y > 8.95 {
                left = if x < 1.02 { 0.0 } else { correct((x - 1.0) / 8.0) };
                break;
            }
        }

        let (mut x, mut y) = (9.0, 1.0);
        let mut right = 0.0;
        for _ in 0..MAX_STEPS {
            step(&mut x, &mut y);
            if x > 9.0 {
                right = 0.0;
                break;
            }
            if x < 1.01 || y < 1.0 {
                right = 1.0;
                break;
            }
            if y > 8.95 {
                right = if x > 8.98 { 0.0 } else { correct(1.0 - (x - 1.0) / 8.0) };
                break;
            }
        }

        let middle = 1.0 - left - right;
        if middle <= 0.01 {
            let sum = left + right;
            BrmShares {
                left: left / sum,
                middle: 0.0,
                right: right / sum,
            }
        } else {
            BrmShares { left, middle, right }
        }
    }
}

/// Lattice cell of a line coordinate (nearest integer, 1-based)
#[inline]
fn lattice_index(v: f64) -> usize {
    let n = if v >= 0.0 { (v + 0.5) as i64 } else { (v - 0.5) as i64 };
    (n - 1).clamp(0, LATTICE as i64 - 1) as usize
}

impl FlowRouter for BrmRouter {
    fn route(&mut self, surface: &Surface<'_>, row: usize, col: usize) -> FlowSplit {
        if !surface.topology().is_interior(row, col, 1) {
            return FlowSplit::none();
        }
        let Some(aspect) = surface.gradient(row, col).and_then(|g| g.aspect) else {
            return FlowSplit::none();
        };

        let dir = Self::octant(aspect.to_degrees());
        let diagonal = dir.is_diagonal();
        let (cells, n, centre): ([Option<Direction>; 6], usize, usize) = if diagonal {
            (
                [None, Some(dir.rotate(1)), Some(dir.rotate(-1)), Some(dir), None, None],
                4,
                0,
            )
        } else {
            (
                [
                    Some(dir.rotate(1)),
                    Some(dir),
                    Some(dir.rotate(-1)),
                    Some(dir.rotate(2)),
                    None,
                    Some(dir.rotate(-2)),
                ],
                6,
                4,
            )
        };

        let mut slopes = [0.0; 6];
        let mut raw = [None; 6];
        for k in 0..n {
            let (r, c) = match cells[k] {
                Some(d) => {
                    let (dr, dc) = d.offset();
                    ((row as isize + dr) as usize, (col as isize + dc) as usize)
                }
                None => (row, col),
            };
            let (s, a) = Self::slope_aspect(surface, r, c);
            slopes[k] = s;
            raw[k] = a;
        }

        let centre_aspect = raw[centre].unwrap_or(0);
        let mut aspects = [0_i64; 6];
        for k in 0..n {
            let mut a = raw[k].unwrap_or(centre_aspect) + IDREH[dir.index()];
            if a > 360 {
                a -= 360;
            }
            aspects[k] = a;
        }

        let shares = self.spread(diagonal, &slopes[..n], &aspects[..n]);

        let mut split = FlowSplit::none();
        split.add(dir.rotate(1), shares.left);
        split.add(dir, shares.middle);
        split.add(dir.rotate(-1), shares.right);
        split
    }
}
