//! Single flow direction routers and the direction grid
//!
//! - **D8** sends everything to the steepest downslope neighbour
//!   (O'Callaghan & Mark 1984).
//! - **Rho8** divides diagonal drops by `1 + U(0,1)` before picking the
//!   maximum (Fairfield & Leymarie 1991), which randomizes the fan-out over
//!   many runs and removes the diagonal bias of pure D8.
//!
//! [`flow_direction`] resolves any [`FlowMethod`] to its dominant direction
//! per cell, for tools that only need one receiver.
//!
//! Direction encoding of the output grid:
//! ```text
//!   7  0  1
//!   6  *  2
//!   5  4  3
//! ```
//! `-1` = no outflow or no-data.

use crate::maybe_rayon::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use terraflow_core::raster::{Direction, Raster};
use terraflow_core::{Algorithm, Error, Result};
use tracing::debug;

use super::buffers::into_grid;
use super::routing::{dispatch, FlowRouter, FlowSplit, RouterVisitor, RoutingParams};
use super::surface::Surface;

/// No-data code of the direction grid
pub const NO_DIRECTION: i32 = -1;

/// Deterministic 8 router.
#[derive(Debug, Clone, Copy, Default)]
pub struct D8Router;

impl FlowRouter for D8Router {
    #[inline]
    fn route(&mut self, surface: &Surface<'_>, row: usize, col: usize) -> FlowSplit {
        surface
            .steepest_descent(row, col)
            .map_or_else(FlowSplit::none, FlowSplit::single)
    }
}

/// Random 8 router.
///
/// A cell with any missing neighbour gets no direction. Otherwise the
/// largest (randomized) drop wins even when it is not positive, so a cell
/// in a pit drains into its lowest-looking neighbour.
#[derive(Debug, Clone)]
pub struct Rho8Router {
    rng: ChaCha8Rng,
}

impl Rho8Router {
    /// Seeded generator; `None` draws a fresh seed.
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(rand::random::<u64>);
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl FlowRouter for Rho8Router {
    fn route(&mut self, surface: &Surface<'_>, row: usize, col: usize) -> FlowSplit {
        let Some(z) = surface.elevation(row, col) else {
            return FlowSplit::none();
        };

        let mut best: Option<(Direction, f64)> = None;
        for dir in Direction::ALL {
            let Some((_, _, zn)) = surface.valid_neighbor(row, col, dir) else {
                return FlowSplit::none();
            };
            let mut d = z - zn;
            if dir.is_diagonal() {
                d /= 1.0 + self.rng.random::<f64>();
            }
            if best.map_or(true, |(_, max)| max < d) {
                best = Some((dir, d));
            }
        }

        best.map_or_else(FlowSplit::none, |(dir, _)| FlowSplit::single(dir))
    }

    fn fork(&self, stream: u64) -> Self {
        let mut rng = self.rng.clone();
        rng.set_stream(stream);
        Self { rng }
    }
}

/// Dominant flow direction grid.
#[derive(Debug, Clone, Default)]
pub struct FlowDirection;

impl Algorithm for FlowDirection {
    type Input = Raster<f64>;
    type Output = Raster<i32>;
    type Params = RoutingParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "Flow Direction"
    }

    fn description(&self) -> &'static str {
        "Resolve the dominant outflow direction of every cell"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        flow_direction(&input, &params)
    }
}

/// Dominant outflow direction of every cell for the chosen method.
///
/// Each cell gets the direction carrying its largest fraction (the first
/// one on ties). Divergent methods may pick a direction pointing off the
/// grid on edge cells, meaning the flow leaves the domain there.
///
/// # Returns
/// `Raster<i32>` with codes `0..=7` and [`NO_DIRECTION`] as no-data
pub fn flow_direction(dem: &Raster<f64>, params: &RoutingParams) -> Result<Raster<i32>> {
    let (rows, cols) = dem.shape();
    debug!(rows, cols, method = %params.method, "resolving flow directions");

    let surface = Surface::new(dem);
    let data = dispatch(params, DirectionGrid { surface: &surface })?;

    into_grid(dem, data, NO_DIRECTION)
}

struct DirectionGrid<'s, 'a> {
    surface: &'s Surface<'a>,
}

impl RouterVisitor for DirectionGrid<'_, '_> {
    type Output = Vec<i32>;

    fn visit<R: FlowRouter>(self, router: R) -> Vec<i32> {
        let surface = self.surface;
        let cols = surface.cols();

        (0..surface.rows())
            .into_par_iter()
            .flat_map(|row| {
                let mut router = router.fork(row as u64);
                let mut row_data = vec![NO_DIRECTION; cols];
                for (col, code) in row_data.iter_mut().enumerate() {
                    if surface.is_valid(row, col) {
                        if let Some(dir) = router.route(surface, row, col).dominant() {
                            *code = dir.index() as i32;
                        }
                    }
                }
                row_data
            })
            .collect()
    }
}
