//! Multiple triangular flow direction (MD∞)
//!
//! The 3×3 neighbourhood is cut into eight triangular facets, each spanned
//! by the centre and two adjacent neighbours `i` and `i+1`. For every facet
//! the plane normal gives an aspect `hr` and a slope `hs`:
//!
//! - an aspect outside the facet's 45° sector is clamped to the bounding
//!   edge with the larger drop, and the slope becomes that edge's slope;
//! - a facet whose second neighbour is missing uses its first edge if that
//!   edge drops.
//!
//! Facets that pass the "valley" test (aspect strictly inside the sector,
//! equal to the next facet's aspect, or lying on an edge shared with a
//! missing facet) contribute `hs^p`. Contributions are normalized and split
//! between the facet's two neighbours by angular position.
//!
//! Normals are computed in a frame with x pointing east and y pointing
//! north.
//!
//! Reference:
//! Seibert, J. & McGlynn, B.L. (2007). A new triangular multiple flow
//! direction algorithm for computing upslope areas from gridded digital
//! elevation models. *Water Resources Research*, 43, W04501.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};
use terraflow_core::raster::Direction;

use super::routing::{FlowRouter, FlowSplit};
use super::surface::Surface;

/// Marker for a facet with no aspect or slope
const UNSET: f64 = -999.0;

/// Multiple triangular flow direction router.
#[derive(Debug, Clone, Copy)]
pub struct TriangularMfdRouter {
    convergence: f64,
}

/// Per-facet aspect and slope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Facets {
    /// Facet aspect (radians, clockwise from North), `-999` if unset
    pub aspect: [f64; 8],
    /// Facet slope (tangent), `-999` if unset
    pub slope: [f64; 8],
}

impl TriangularMfdRouter {
    pub fn new(convergence: f64) -> Self {
        Self { convergence }
    }

    /// Aspect and slope of the eight facets around a valid cell.
    pub fn facets(surface: &Surface<'_>, row: usize, col: usize, z: f64) -> Facets {
        let cs = surface.cell_size();
        let mut dz = [0.0; 8];
        let mut in_grid = [false; 8];
        for dir in Direction::ALL {
            if let Some((_, _, zn)) = surface.valid_neighbor(row, col, dir) {
                in_grid[dir.index()] = true;
                dz[dir.index()] = z - zn;
            }
        }

        let mut facets = Facets {
            aspect: [UNSET; 8],
            slope: [UNSET; 8],
        };

        for a in Direction::ALL {
            let i = a.index();
            if !in_grid[i] {
                continue;
            }
            let b = a.rotate(1);
            let j = b.index();
            let lower = i as f64 * FRAC_PI_4;
            let upper = (i + 1) as f64 * FRAC_PI_4;

            let (mut hr, mut hs) = (UNSET, UNSET);
            if in_grid[j] {
                let (xi, yi) = a.vector();
                let (xj, yj) = b.vector();
                let nx = (dz[j] * yi - dz[i] * yj) * cs;
                let ny = (dz[i] * xj - dz[j] * xi) * cs;
                let nz = (xi * yj - xj * yi) * cs * cs;
                let norm = (nx * nx + ny * ny + nz * nz).sqrt();

                hr = if nx == 0.0 {
                    if ny >= 0.0 {
                        0.0
                    } else {
                        PI
                    }
                } else if nx < 0.0 {
                    PI + FRAC_PI_2 - (ny / nx).atan()
                } else {
                    FRAC_PI_2 - (ny / nx).atan()
                };
                hs = -(nz / norm).acos().tan();

                if hr < lower || hr > upper {
                    if dz[i] > dz[j] {
                        hr = lower;
                        hs = dz[i] / surface.distance(a);
                    } else {
                        hr = j as f64 * FRAC_PI_4;
                        hs = dz[j] / surface.distance(b);
                    }
                }
            } else if dz[i] > 0.0 {
                hr = lower;
                hs = dz[i] / surface.distance(a);
            }

            facets.aspect[i] = hr;
            facets.slope[i] = hs;
        }

        facets
    }
}

impl FlowRouter for TriangularMfdRouter {
    fn route(&mut self, surface: &Surface<'_>, row: usize, col: usize) -> FlowSplit {
        let Some(z) = surface.elevation(row, col) else {
            return FlowSplit::none();
        };
        let Facets { mut aspect, slope } = Self::facets(surface, row, col, z);

        let mut valley = [0.0; 8];
        let mut sum = 0.0;
        for i in 0..8 {
            if slope[i] <= 0.0 {
                continue;
            }
            let j = (i + 1) % 8;
            let prev = (i + 7) % 8;
            let lower = i as f64 * FRAC_PI_4;
            let upper = (i + 1) as f64 * FRAC_PI_4;
            let r = aspect[i];

            let accepted = (r > lower && r < upper)
                || r == aspect[j]
                || (slope[j] == UNSET && r == upper)
                || (slope[prev] == UNSET && r == lower);

            if accepted {
                valley[i] = slope[i].powf(self.convergence);
                sum += valley[i];
            }
        }

        let mut split = FlowSplit::none();
        if sum <= 0.0 {
            return split;
        }

        for i in 0..8 {
            if i == 7 && aspect[i] == 0.0 {
                aspect[i] = TAU;
            }
            if valley[i] != 0.0 {
                let v = valley[i] / sum;
                let lower = i as f64 * FRAC_PI_4;
                let upper = (i + 1) as f64 * FRAC_PI_4;
                let a = Direction::wrapping(i as i64);
                split.add(a, v * (upper - aspect[i]) / FRAC_PI_4);
                split.add(a.rotate(1), v * (aspect[i] - lower) / FRAC_PI_4);
            }
        }

        split
    }
}
