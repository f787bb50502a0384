//! Top-down flow accumulation
//!
//! Cells are visited once, from the highest to the lowest, in the order of
//! an [`ElevationIndex`]. Every cell starts with its own contribution
//! (unit weight or a weight grid) and hands fractions of everything it
//! holds to its receivers. Because a cell is only visited after all of its
//! upslope contributors, each accumulator is final before anything leaves
//! it.
//!
//! Besides flow, a run can carry:
//! - the mean travel distance of the accumulated flow (`flow_length`);
//! - the catchment mean of a `values` grid;
//! - a `material` load, optionally split into the left and right banks of
//!   a stream network (see [`find_sides`]);
//! - a `loss` grid for negative flow clamped to zero.
//!
//! Routing per cell, in order of precedence:
//! 1. a valid code in `channel_directions` forces that direction;
//! 2. at or above `linear_threshold` the cell is routed with D8;
//! 3. otherwise the configured [`FlowMethod`](super::routing::FlowMethod).
//!
//! Sink routes resolve closed depressions after the main pass: a sink cell
//! carrying a route code sends its whole content down the route chain.

use crate::maybe_rayon::*;
use serde::{Deserialize, Serialize};
use terraflow_core::progress::{poll_every, Outcome, Progress};
use terraflow_core::raster::{CellLocks, Direction, GridTopology, Raster};
use terraflow_core::{Algorithm, Error, NoProgress, Result};
use tracing::{debug, info, warn};

use super::buffers::{into_grid, try_filled, OUTPUT_NODATA};
use super::flow_direction::NO_DIRECTION;
use super::ranking::{ElevationIndex, SortOrder};
use super::routing::{dispatch, FlowField, FlowRouter, FlowSplit, RouterVisitor, RoutingParams};
use super::stream_sides::find_sides;
use super::surface::Surface;

/// Unit of the accumulated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowUnit {
    /// Number of (weighted) cells
    #[default]
    Cells,
    /// Cells multiplied by the cell area
    Area,
}

/// Parameters for top-down accumulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccumulationParams {
    /// Direction assignment method and its settings
    #[serde(flatten)]
    pub routing: RoutingParams,
    /// Route cells with D8 once their flow (or `linear_values`) reaches this
    /// value. `None` disables the switch.
    pub linear_threshold: Option<f64>,
    /// Clamp negative flow to zero when a weight grid is given
    pub no_negatives: bool,
    /// Unit of the flow output
    pub flow_unit: FlowUnit,
    /// Also compute the mean flow path length
    pub flow_length: bool,
    /// Record the amount removed by `no_negatives`
    pub loss: bool,
}

impl Default for AccumulationParams {
    fn default() -> Self {
        Self {
            routing: RoutingParams::default(),
            linear_threshold: Some(500.0),
            no_negatives: true,
            flow_unit: FlowUnit::Cells,
            flow_length: false,
            loss: false,
        }
    }
}

impl AccumulationParams {
    pub fn new(routing: RoutingParams) -> Self {
        Self {
            routing,
            ..Self::default()
        }
    }

    pub fn without_linear_threshold(mut self) -> Self {
        self.linear_threshold = None;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.routing.validate()?;
        if let Some(t) = self.linear_threshold {
            if !t.is_finite() || t < 0.0 {
                return Err(Error::InvalidParameter {
                    name: "linear_threshold",
                    value: t.to_string(),
                    reason: "must be a finite number >= 0".into(),
                });
            }
        }
        Ok(())
    }
}

/// Optional input grids. All must share the elevation grid system.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccumulationInputs<'a> {
    /// Per-cell contribution; no-data counts as 0
    pub weights: Option<&'a Raster<f64>>,
    /// Values averaged over each catchment
    pub values: Option<&'a Raster<f64>>,
    /// Material load per cell; default 1
    pub material: Option<&'a Raster<f64>>,
    /// Stream direction codes, no-data off the network
    pub stream_target: Option<&'a Raster<i32>>,
    /// Forced flow directions
    pub channel_directions: Option<&'a Raster<i32>>,
    /// Values compared against `linear_threshold` instead of flow
    pub linear_values: Option<&'a Raster<f64>>,
    /// Route codes for closed depressions
    pub sink_routes: Option<&'a Raster<i32>>,
}

impl AccumulationInputs<'_> {
    pub fn validate(&self, dem: &Raster<f64>) -> Result<()> {
        if let Some(g) = self.weights {
            dem.ensure_same_grid(g, "weights")?;
        }
        if let Some(g) = self.values {
            dem.ensure_same_grid(g, "values")?;
        }
        if let Some(g) = self.material {
            dem.ensure_same_grid(g, "material")?;
        }
        if let Some(g) = self.stream_target {
            dem.ensure_same_grid(g, "stream_target")?;
        }
        if let Some(g) = self.channel_directions {
            dem.ensure_same_grid(g, "channel_directions")?;
        }
        if let Some(g) = self.linear_values {
            dem.ensure_same_grid(g, "linear_values")?;
        }
        if let Some(g) = self.sink_routes {
            dem.ensure_same_grid(g, "sink_routes")?;
        }
        Ok(())
    }

    #[inline]
    fn weight(&self, row: usize, col: usize) -> f64 {
        self.weights.map_or(1.0, |w| w.value(row, col).unwrap_or(0.0))
    }

    #[inline]
    fn material_load(&self, row: usize, col: usize) -> f64 {
        self.material.map_or(1.0, |m| m.value(row, col).unwrap_or(0.0))
    }
}

/// Material accumulated along the flow paths.
#[derive(Debug, Clone)]
pub struct MaterialOutput {
    pub total: Raster<f64>,
    /// Left bank load, stream cells only
    pub left: Option<Raster<f64>>,
    /// Right bank load, stream cells only
    pub right: Option<Raster<f64>>,
}

/// Result grids of a top-down run.
#[derive(Debug, Clone)]
pub struct AccumulationOutput {
    pub flow: Raster<f64>,
    /// Dominant outflow direction per cell, [`NO_DIRECTION`] as no-data
    pub directions: Raster<i32>,
    pub flow_length: Option<Raster<f64>>,
    pub mean: Option<Raster<f64>>,
    pub material: Option<MaterialOutput>,
    pub loss: Option<Raster<f64>>,
}

impl FlowField for AccumulationOutput {
    fn accumulated_value(&self, row: usize, col: usize) -> Option<f64> {
        self.flow.value(row, col)
    }

    fn direction(&self, row: usize, col: usize) -> Option<Direction> {
        self.directions
            .value(row, col)
            .and_then(|code| Direction::from_index(code as i64))
    }

    fn is_valid(&self, row: usize, col: usize) -> bool {
        self.flow.is_valid(row, col)
    }
}

/// Top-down flow accumulation.
#[derive(Debug, Clone, Default)]
pub struct FlowAccumulation;

impl Algorithm for FlowAccumulation {
    type Input = Raster<f64>;
    type Output = AccumulationOutput;
    type Params = AccumulationParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "Flow Accumulation (Top-Down)"
    }

    fn description(&self) -> &'static str {
        "Accumulate flow from the highest to the lowest cell with a selectable routing method"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        let outcome = flow_accumulation(&input, &AccumulationInputs::default(), &params, &mut NoProgress)?;
        Ok(outcome.into_inner())
    }
}

/// Accumulate flow over `dem`.
///
/// Configuration and grid systems are checked before anything is
/// allocated. A cancelled run returns the raw accumulators, unfinalized.
pub fn flow_accumulation<P: Progress + ?Sized>(
    dem: &Raster<f64>,
    inputs: &AccumulationInputs<'_>,
    params: &AccumulationParams,
    progress: &mut P,
) -> Result<Outcome<AccumulationOutput>> {
    if let Err(e) = params.validate().and_then(|_| inputs.validate(dem)) {
        warn!(error = %e, "rejected accumulation configuration");
        return Err(e);
    }

    let (rows, cols) = dem.shape();
    debug!(
        rows,
        cols,
        method = %params.routing.method,
        linear_threshold = ?params.linear_threshold,
        "top-down accumulation"
    );

    let index = ElevationIndex::build(dem, SortOrder::Descending)?;
    let mut state = TopDown::new(dem, *inputs, params)?;
    state.init(&index);

    let finished = dispatch(
        &params.routing,
        MainPass {
            state: &mut state,
            index: &index,
            progress: &mut *progress,
        },
    )?;
    if !finished {
        warn!(cells = index.len(), "flow accumulation cancelled");
        return Ok(Outcome::Cancelled(state.into_output()?));
    }

    if let Some(routes) = inputs.sink_routes {
        debug!("resolving sink routes");
        if !state.route_sinks(&index, routes, progress)? {
            warn!(cells = index.len(), "flow accumulation cancelled during sink routing");
            return Ok(Outcome::Cancelled(state.into_output()?));
        }
    }

    state.finalize();
    let output = state.into_output()?;
    info!(cells = index.len(), "flow accumulation complete");
    Ok(Outcome::Complete(output))
}

struct Banks {
    left: Vec<f64>,
    right: Vec<f64>,
}

struct Material {
    total: Vec<f64>,
    banks: Option<Banks>,
}

/// Accumulators owned by one run.
struct TopDown<'a> {
    surface: Surface<'a>,
    topology: GridTopology,
    inputs: AccumulationInputs<'a>,
    no_negatives: bool,
    linear_threshold: Option<f64>,
    flow_unit: FlowUnit,
    flow: Vec<f64>,
    directions: Vec<i32>,
    length: Option<Vec<f64>>,
    mean: Option<Vec<f64>>,
    material: Option<Material>,
    loss: Option<Vec<f64>>,
}

impl<'a> TopDown<'a> {
    fn new(dem: &'a Raster<f64>, inputs: AccumulationInputs<'a>, params: &AccumulationParams) -> Result<Self> {
        let surface = Surface::new(dem);
        let topology = *surface.topology();
        let n = topology.len();
        let buffer = |on: bool, what| -> Result<Option<Vec<f64>>> {
            on.then(|| try_filled(n, 0.0, what)).transpose()
        };

        let material = if inputs.material.is_some() || inputs.stream_target.is_some() {
            let banks = if inputs.stream_target.is_some() {
                Some(Banks {
                    left: try_filled(n, 0.0, "left bank accumulator")?,
                    right: try_filled(n, 0.0, "right bank accumulator")?,
                })
            } else {
                None
            };
            Some(Material {
                total: try_filled(n, 0.0, "material accumulator")?,
                banks,
            })
        } else {
            None
        };

        let no_negatives = params.no_negatives && inputs.weights.is_some();
        Ok(Self {
            surface,
            topology,
            inputs,
            no_negatives,
            linear_threshold: params.linear_threshold.filter(|&t| t > 0.0),
            flow_unit: params.flow_unit,
            flow: try_filled(n, 0.0, "flow accumulator")?,
            directions: try_filled(n, NO_DIRECTION, "direction grid")?,
            length: buffer(params.flow_length, "flow length accumulator")?,
            mean: buffer(inputs.values.is_some(), "mean accumulator")?,
            material,
            loss: if no_negatives && params.loss {
                Some(try_filled(n, OUTPUT_NODATA, "loss grid")?)
            } else {
                None
            },
        })
    }

    fn init(&mut self, index: &ElevationIndex) {
        for &idx in index.as_slice() {
            let (row, col) = self.topology.coords(idx);
            let weight = self.inputs.weight(row, col);
            self.flow[idx] += weight;

            if let (Some(mean), Some(values)) = (self.mean.as_mut(), self.inputs.values) {
                if let Some(v) = values.value(row, col) {
                    mean[idx] += weight * v;
                }
            }

            if let Some(material) = self.material.as_mut() {
                let load = weight * self.inputs.material_load(row, col);
                material.total[idx] = load;
                if let Some(banks) = material.banks.as_mut() {
                    banks.left[idx] = load;
                    banks.right[idx] = load;
                }
            }
        }
    }

    #[inline]
    fn forced_direction(&self, grid: Option<&Raster<i32>>, row: usize, col: usize) -> Option<Direction> {
        grid?
            .value(row, col)
            .and_then(|code| Direction::from_index(code as i64))
    }

    /// Whether the cell has reached the D8 switch-over value.
    #[inline]
    fn is_linear(&self, idx: usize, row: usize, col: usize) -> bool {
        let Some(threshold) = self.linear_threshold else {
            return false;
        };
        let value = self
            .inputs
            .linear_values
            .and_then(|g| g.value(row, col))
            .unwrap_or(self.flow[idx]);
        threshold <= value
    }

    /// Clamp negative flow, recording what was removed.
    #[inline]
    fn clamp_negative(&mut self, idx: usize) {
        if self.no_negatives && self.flow[idx] < 0.0 {
            if let Some(loss) = self.loss.as_mut() {
                loss[idx] = self.flow[idx].abs();
            }
            self.flow[idx] = 0.0;
        }
    }

    /// Outflow split of one ranked cell.
    fn split<R: FlowRouter>(&self, router: &mut R, idx: usize, row: usize, col: usize) -> FlowSplit {
        if let Some(dir) = self.forced_direction(self.inputs.channel_directions, row, col) {
            FlowSplit::single(dir)
        } else if self.is_linear(idx, row, col) {
            self.surface
                .steepest_descent(row, col)
                .map_or_else(FlowSplit::none, FlowSplit::single)
        } else {
            router.route(&self.surface, row, col)
        }
    }

    /// Hand `fraction` of cell `src`'s accumulators to its neighbour in
    /// direction `dir`, one step further along the flow path.
    fn transfer(&mut self, src: usize, from: (usize, usize), dir: Direction, fraction: f64) {
        let step = self.topology.distance(dir);
        self.transfer_with_step(src, from, dir, fraction, step);
    }

    /// [`Self::transfer`] with an explicit path step.
    ///
    /// `src` and `from` coincide except along sink routes, where every
    /// cell of the chain receives the sink's content, path length
    /// included, with a step of zero.
    fn transfer_with_step(&mut self, src: usize, from: (usize, usize), dir: Direction, fraction: f64, step: f64) {
        let Some((tr, tc)) = self.topology.neighbor(from.0, from.1, dir) else {
            return;
        };
        if !self.surface.is_valid(tr, tc) {
            return;
        }
        let dst = self.topology.index(tr, tc);
        let flow = self.flow[src];

        self.flow[dst] += fraction * flow;
        if let Some(length) = self.length.as_mut() {
            length[dst] += fraction * (length[src] + flow * step);
        }
        if let Some(mean) = self.mean.as_mut() {
            mean[dst] += fraction * mean[src];
        }

        let Some(material) = self.material.as_mut() else {
            return;
        };
        let streams = self.inputs.stream_target;
        let on_stream = |row, col| streams.is_some_and(|s| s.is_valid(row, col));

        match (on_stream(from.0, from.1), on_stream(tr, tc)) {
            (false, false) => {
                material.total[dst] += fraction * material.total[src];
                if let Some(banks) = material.banks.as_mut() {
                    banks.left[dst] += fraction * banks.left[src];
                    banks.right[dst] += fraction * banks.right[src];
                }
            }
            (false, true) => {
                material.total[dst] += fraction * material.total[src];
                if let (Some(banks), Some(streams)) = (material.banks.as_mut(), streams) {
                    let (l, r) = find_sides(&self.topology, streams, from.0, from.1, dir).shares();
                    banks.left[dst] += l * fraction * banks.left[src];
                    banks.right[dst] += r * fraction * banks.right[src];
                }
            }
            // Material already in the stream is not carried further
            (true, _) => {}
        }
    }

    /// Walk the route chains of closed depressions, lowest first.
    fn route_sinks<P: Progress + ?Sized>(
        &mut self,
        index: &ElevationIndex,
        routes: &Raster<i32>,
        progress: &mut P,
    ) -> Result<bool> {
        let mut locks = CellLocks::try_new(self.topology.len())?;
        let mut chain = Vec::new();
        let total = index.len();
        let mut routed = 0usize;

        for (k, &sink) in index.as_slice().iter().rev().enumerate() {
            if !poll_every(progress, k, total) {
                return Ok(false);
            }
            let (row, col) = self.topology.coords(sink);
            let Some(first) = self.forced_direction(Some(routes), row, col) else {
                continue;
            };
            if !self.surface.is_sink(row, col) {
                continue;
            }

            self.directions[sink] = first.index() as i32;
            locks.lock(sink);
            chain.push(sink);

            let (mut r, mut c, mut dir) = (row, col, first);
            while let Some((nr, nc)) = self.topology.neighbor(r, c, dir) {
                if !self.surface.is_valid(nr, nc) {
                    break;
                }
                let next = self.topology.index(nr, nc);
                if !locks.lock(next) {
                    break;
                }
                chain.push(next);
                self.transfer_with_step(sink, (r, c), dir, 1.0, 0.0);

                let Some(d) = self
                    .forced_direction(Some(routes), nr, nc)
                    .or_else(|| self.surface.steepest_descent(nr, nc))
                else {
                    break;
                };
                (r, c, dir) = (nr, nc, d);
            }

            for idx in chain.drain(..) {
                locks.unlock(idx);
            }
            routed += 1;
        }

        debug!(routed, "sink routes resolved");
        Ok(true)
    }

    fn finalize(&mut self) {
        let cols = self.topology.cols();
        if cols == 0 {
            return;
        }
        let surface = self.surface;
        let flow = &self.flow;

        for buffer in [self.length.as_mut(), self.mean.as_mut()].into_iter().flatten() {
            buffer
                .par_chunks_mut(cols)
                .zip(flow.par_chunks(cols))
                .enumerate()
                .for_each(|(row, (out, flow_row))| {
                    for (col, (v, &f)) in out.iter_mut().zip(flow_row).enumerate() {
                        *v = if !surface.is_valid(row, col) {
                            OUTPUT_NODATA
                        } else if f > 0.0 {
                            *v / f
                        } else {
                            0.0
                        };
                    }
                });
        }

        if let Some(material) = self.material.as_mut() {
            mask_invalid(&mut material.total, cols, &surface);
            if let Some(banks) = material.banks.as_mut() {
                let inputs = self.inputs;
                for side in [&mut banks.left, &mut banks.right] {
                    side.par_chunks_mut(cols).enumerate().for_each(|(row, out)| {
                        for (col, v) in out.iter_mut().enumerate() {
                            let on_stream = inputs.stream_target.is_some_and(|s| s.is_valid(row, col));
                            *v = if surface.is_valid(row, col) && on_stream {
                                *v - 0.5 * inputs.weight(row, col) * inputs.material_load(row, col)
                            } else {
                                OUTPUT_NODATA
                            };
                        }
                    });
                }
            }
        }

        let scale = match self.flow_unit {
            FlowUnit::Cells => 1.0,
            FlowUnit::Area => self.topology.cell_area(),
        };
        self.flow.par_chunks_mut(cols).enumerate().for_each(|(row, out)| {
            for (col, v) in out.iter_mut().enumerate() {
                *v = if surface.is_valid(row, col) {
                    *v * scale
                } else {
                    OUTPUT_NODATA
                };
            }
        });
    }

    fn into_output(self) -> Result<AccumulationOutput> {
        let dem = self.surface.dem();
        let grid = |data: Vec<f64>| into_grid(dem, data, OUTPUT_NODATA);

        let material = match self.material {
            Some(Material { total, banks }) => {
                let (left, right) = match banks {
                    Some(Banks { left, right }) => (Some(grid(left)?), Some(grid(right)?)),
                    None => (None, None),
                };
                Some(MaterialOutput {
                    total: grid(total)?,
                    left,
                    right,
                })
            }
            None => None,
        };

        Ok(AccumulationOutput {
            flow: grid(self.flow)?,
            directions: into_grid(dem, self.directions, NO_DIRECTION)?,
            flow_length: self.length.map(grid).transpose()?,
            mean: self.mean.map(grid).transpose()?,
            material,
            loss: self.loss.map(grid).transpose()?,
        })
    }
}

fn mask_invalid(buffer: &mut [f64], cols: usize, surface: &Surface<'_>) {
    buffer.par_chunks_mut(cols).enumerate().for_each(|(row, out)| {
        for (col, v) in out.iter_mut().enumerate() {
            if !surface.is_valid(row, col) {
                *v = OUTPUT_NODATA;
            }
        }
    });
}

/// Main descending pass with a concrete router.
struct MainPass<'s, 'a, P: ?Sized> {
    state: &'s mut TopDown<'a>,
    index: &'s ElevationIndex,
    progress: &'s mut P,
}

impl<P: Progress + ?Sized> RouterVisitor for MainPass<'_, '_, P> {
    /// `false` when cancelled
    type Output = bool;

    fn visit<R: FlowRouter>(self, mut router: R) -> bool {
        let MainPass { state, index, progress } = self;
        let total = index.len();

        for (k, &idx) in index.as_slice().iter().enumerate() {
            if !poll_every(progress, k, total) {
                return false;
            }
            let (row, col) = state.topology.coords(idx);
            state.clamp_negative(idx);

            let split = state.split(&mut router, idx, row, col);
            if let Some(dir) = split.dominant() {
                state.directions[idx] = dir.index() as i32;
            }
            for (dir, fraction) in split.iter() {
                state.transfer(idx, (row, col), dir, fraction);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrology::routing::FlowMethod;
    use approx::assert_relative_eq;
    use terraflow_core::GeoTransform;

    fn grid(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Raster<f64> {
        let mut dem = Raster::new(rows, cols);
        for row in 0..rows {
            for col in 0..cols {
                dem.set(row, col, f(row, col)).unwrap();
            }
        }
        dem
    }

    /// Code grid on `dem`'s grid system, no-data except at `cells`
    fn codes(dem: &Raster<f64>, cells: &[((usize, usize), Direction)]) -> Raster<i32> {
        let mut grid = dem.with_same_meta::<i32>();
        grid.data_mut().fill(-1);
        grid.set_nodata(Some(-1));
        for &((row, col), dir) in cells {
            grid.set(row, col, dir.index() as i32).unwrap();
        }
        grid
    }

    fn params(method: FlowMethod) -> AccumulationParams {
        AccumulationParams::new(RoutingParams::new(method)).without_linear_threshold()
    }

    fn run(dem: &Raster<f64>, inputs: &AccumulationInputs<'_>, params: &AccumulationParams) -> AccumulationOutput {
        flow_accumulation(dem, inputs, params, &mut NoProgress)
            .unwrap()
            .complete()
            .expect("run should complete")
    }

    fn flow(out: &AccumulationOutput, row: usize, col: usize) -> f64 {
        out.flow.value(row, col).unwrap()
    }

    #[test]
    fn test_d8_pit_scenario() {
        let values = [9.0, 9.0, 9.0, 9.0, 5.0, 9.0, 9.0, 9.0, 1.0];
        let dem = grid(3, 3, |r, c| values[r * 3 + c]);
        let out = run(&dem, &AccumulationInputs::default(), &params(FlowMethod::D8));

        // Only the centre has a full neighbourhood; it drains SE
        assert_eq!(out.direction(1, 1), Some(Direction::SE));
        assert_relative_eq!(flow(&out, 2, 2), 2.0);
        assert_relative_eq!(flow(&out, 1, 1), 1.0);
        for (r, c) in [(0, 0), (0, 1), (0, 2), (1, 0), (1, 2), (2, 0), (2, 1)] {
            assert_relative_eq!(flow(&out, r, c), 1.0);
        }
    }

    #[test]
    fn test_d8_flow_grows_downhill() {
        let dem = grid(6, 6, |r, c| 100.0 - (3 * r + c) as f64);
        let out = run(&dem, &AccumulationInputs::default(), &params(FlowMethod::D8));

        // Interior cells drain south, so flow increases down each column
        for r in 1..4 {
            assert_eq!(out.direction(r, 2), Some(Direction::S));
            assert!(flow(&out, r + 1, 2) > flow(&out, r, 2));
        }
    }

    fn funnel() -> Raster<f64> {
        grid(7, 7, |r, c| {
            let (dr, dc) = (r as f64 - 3.0, c as f64 - 3.0);
            (dr * dr + dc * dc).sqrt()
        })
    }

    #[test]
    fn test_mfd_conserves_mass_in_a_funnel() {
        let out = run(&funnel(), &AccumulationInputs::default(), &params(FlowMethod::Mfd));
        assert_relative_eq!(flow(&out, 3, 3), 49.0, epsilon = 1e-9);
    }

    #[test]
    fn test_outlets_hold_all_contributions() {
        let dem = funnel();
        for method in [FlowMethod::D8, FlowMethod::DInfinity] {
            let out = run(&dem, &AccumulationInputs::default(), &params(method));
            let mut at_outlets = 0.0;
            for r in 0..7 {
                for c in 0..7 {
                    if out.direction(r, c).is_none() {
                        at_outlets += flow(&out, r, c);
                    }
                }
            }
            assert_relative_eq!(at_outlets, 49.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_flat_grid_keeps_own_contribution() {
        let dem = grid(4, 4, |_, _| 2.0);
        for method in [FlowMethod::D8, FlowMethod::Mfd] {
            let out = run(&dem, &AccumulationInputs::default(), &params(method));
            for r in 0..4 {
                for c in 0..4 {
                    assert_relative_eq!(flow(&out, r, c), 1.0);
                }
            }
        }
    }

    #[test]
    fn test_nodata_and_single_cell() {
        let mut dem: Raster<f64> = Raster::filled(3, 3, -9999.0);
        dem.set_nodata(Some(-9999.0));
        let out = run(&dem, &AccumulationInputs::default(), &params(FlowMethod::Mfd));
        assert_eq!(out.flow.valid_count(), 0);

        let one = grid(1, 1, |_, _| 5.0);
        let out = run(&one, &AccumulationInputs::default(), &params(FlowMethod::Mfd));
        assert_eq!(out.flow.value(0, 0), Some(1.0));
        assert_eq!(out.direction(0, 0), None);
    }

    #[test]
    fn test_area_unit_and_weights() {
        let mut dem = grid(1, 3, |_, c| 3.0 - c as f64);
        dem.set_transform(GeoTransform::new(0.0, 10.0, 10.0, -10.0));
        let mut weights = dem.like(2.0);
        weights.set(0, 0, 0.5).unwrap();

        let mut p = params(FlowMethod::Mfd);
        p.flow_unit = FlowUnit::Area;
        let inputs = AccumulationInputs {
            weights: Some(&weights),
            ..Default::default()
        };
        let out = run(&dem, &inputs, &p);
        // 1×3 strip: extrapolated drops carry everything east
        assert_relative_eq!(flow(&out, 0, 0), 0.5 * 100.0, epsilon = 1e-9);
        assert_relative_eq!(flow(&out, 0, 1), 2.5 * 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_negative_weights_are_clamped_and_recorded() {
        let dem = grid(1, 3, |_, c| 3.0 - c as f64);
        let mut weights = dem.like(1.0);
        weights.set(0, 0, -4.0).unwrap();
        let mut p = params(FlowMethod::Mfd);
        p.loss = true;
        let inputs = AccumulationInputs {
            weights: Some(&weights),
            ..Default::default()
        };
        let out = run(&dem, &inputs, &p);

        let loss = out.loss.as_ref().unwrap();
        assert_relative_eq!(loss.value(0, 0).unwrap(), 4.0);
        assert_eq!(loss.value(0, 2), None);
        assert_relative_eq!(flow(&out, 0, 0), 0.0);
        assert_relative_eq!(flow(&out, 0, 1), 1.0);
        assert_relative_eq!(flow(&out, 0, 2), 2.0);
    }

    #[test]
    fn test_flow_length_and_mean() {
        let dem = grid(1, 4, |_, c| 4.0 - c as f64);
        let values = Raster::from_vec(vec![1.0, 2.0, 3.0, 6.0], 1, 4).unwrap();
        let mut p = params(FlowMethod::Mfd);
        p.flow_length = true;
        let inputs = AccumulationInputs {
            values: Some(&values),
            ..Default::default()
        };
        let out = run(&dem, &inputs, &p);

        let length = out.flow_length.as_ref().unwrap();
        // Cell 2 holds flow 3: one unit from 2 cells away, one from 1 cell away
        assert_relative_eq!(length.value(0, 0).unwrap(), 0.0);
        assert_relative_eq!(length.value(0, 2).unwrap(), 1.0, epsilon = 1e-12);
        let mean = out.mean.as_ref().unwrap();
        assert_relative_eq!(mean.value(0, 2).unwrap(), 2.0, epsilon = 1e-12);
        assert_relative_eq!(mean.value(0, 3).unwrap(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_linear_threshold_switches_to_d8() {
        let dem = grid(9, 9, |r, c| 100.0 - (2 * r + c) as f64);
        let mut p = params(FlowMethod::Mfd);
        p.linear_threshold = Some(0.5);
        let linear = run(&dem, &AccumulationInputs::default(), &p);
        let d8 = run(&dem, &AccumulationInputs::default(), &params(FlowMethod::D8));

        for r in 1..8 {
            for c in 1..8 {
                assert_relative_eq!(flow(&linear, r, c), flow(&d8, r, c), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_channel_directions_override() {
        let dem = grid(3, 3, |r, _| 10.0 - r as f64);
        let channels = codes(&dem, &[((1, 1), Direction::SE)]);
        let inputs = AccumulationInputs {
            channel_directions: Some(&channels),
            ..Default::default()
        };
        let out = run(&dem, &inputs, &params(FlowMethod::D8));
        assert_eq!(out.direction(1, 1), Some(Direction::SE));
        assert_relative_eq!(flow(&out, 2, 2), 2.0);
        assert_relative_eq!(flow(&out, 2, 1), 1.0);
    }

    #[test]
    fn test_sink_route_drains_depression() {
        // Closed pit at (2, 2) inside a plane tilted east
        let dem = grid(5, 5, |r, c| {
            if (r, c) == (2, 2) {
                0.0
            } else {
                20.0 - c as f64
            }
        });
        let routes = codes(&dem, &[((2, 2), Direction::E)]);

        let without = run(&dem, &AccumulationInputs::default(), &params(FlowMethod::D8));
        let inputs = AccumulationInputs {
            sink_routes: Some(&routes),
            ..Default::default()
        };
        let with = run(&dem, &inputs, &params(FlowMethod::D8));

        let pit = flow(&without, 2, 2);
        assert!(pit > 1.0);
        assert_relative_eq!(flow(&with, 2, 2), pit);
        // The route hands the pit's content to (2, 3), which drains back into the pit
        assert_relative_eq!(flow(&with, 2, 3), flow(&without, 2, 3) + pit);
        assert_eq!(with.direction(2, 2), Some(Direction::E));
    }

    #[test]
    fn test_sink_route_copies_path_length() {
        // Interior pit, edge cells have no D8 direction
        let dem = grid(3, 3, |r, c| if (r, c) == (1, 1) { 0.0 } else { 10.0 });
        let routes = codes(&dem, &[((1, 1), Direction::E)]);
        let inputs = AccumulationInputs {
            sink_routes: Some(&routes),
            ..Default::default()
        };
        let mut p = params(FlowMethod::D8);
        p.flow_length = true;
        let out = run(&dem, &inputs, &p);

        assert_relative_eq!(flow(&out, 1, 2), 2.0);
        let length = out.flow_length.as_ref().unwrap();
        assert_relative_eq!(length.value(1, 1).unwrap(), 0.0);
        assert_relative_eq!(length.value(1, 2).unwrap(), 0.0);
    }

    #[test]
    fn test_material_banks() {
        // Hillslope draining south into a stream along row 3 that flows east
        let dem = grid(4, 5, |r, c| 10.0 - 2.0 * r as f64 - 0.1 * c as f64);
        let stream_cells: Vec<_> = (0..5).map(|c| ((3, c), Direction::E)).collect();
        let streams = codes(&dem, &stream_cells);
        let inputs = AccumulationInputs {
            stream_target: Some(&streams),
            ..Default::default()
        };
        let out = run(&dem, &inputs, &params(FlowMethod::D8));
        let material = out.material.as_ref().unwrap();
        let left = material.left.as_ref().unwrap();
        let right = material.right.as_ref().unwrap();

        // Off-stream cells have no bank values
        assert_eq!(left.value(1, 2), None);
        // Everything arrives from the north, i.e. the left bank
        assert!(left.value(3, 2).unwrap() > 0.0);
        assert_relative_eq!(right.value(3, 2).unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_cancellation_returns_raw_state() {
        let dem = grid(80, 80, |r, c| (r + c) as f64);
        let mut stop = |_f: f64| false;
        let outcome = flow_accumulation(&dem, &AccumulationInputs::default(), &params(FlowMethod::D8), &mut stop)
            .unwrap();
        assert!(outcome.is_cancelled());
    }

    #[test]
    fn test_configuration_errors() {
        let dem = grid(3, 3, |_, _| 1.0);
        let weights: Raster<f64> = Raster::new(2, 3);
        let inputs = AccumulationInputs {
            weights: Some(&weights),
            ..Default::default()
        };
        let err = flow_accumulation(&dem, &inputs, &params(FlowMethod::D8), &mut NoProgress);
        assert!(matches!(err, Err(Error::GridMismatch { name: "weights", .. })));

        let mut p = params(FlowMethod::Mfd);
        p.linear_threshold = Some(-1.0);
        let err = flow_accumulation(&dem, &AccumulationInputs::default(), &p, &mut NoProgress);
        assert!(matches!(err, Err(Error::InvalidParameter { name: "linear_threshold", .. })));

        let p = AccumulationParams::new(RoutingParams::new(FlowMethod::Mfd).with_convergence(0.0));
        let err = flow_accumulation(&dem, &AccumulationInputs::default(), &p, &mut NoProgress);
        assert!(err.is_err());
    }
}
