//! Downslope flow tracing
//!
//! Follows the flow of single cells downhill until it leaves the grid or
//! ends in a sink. Used for "where does the water from here go" queries
//! ([`trace_downslope`]) and, seeding every `step`-th cell, as an
//! alternative accumulation ([`flow_tracing`]).
//!
//! Two families of tracers:
//!
//! - **Line tracing** follows a flow line cell by cell, driven by the local
//!   aspect:
//!   - *Rho8* steps to the aspect octant, or randomly to the next octant
//!     with a probability equal to the aspect's position inside it
//!     (Fairfield & Leymarie 1991);
//!   - *Kinematic* (KRA, Lea 1992) tracks where a single line crosses the
//!     cell edges;
//!   - *DEMON* (Costa-Cabral & Burges 1994) tracks a flow tube bounded by
//!     two lines, split in two whenever it straddles a cell corner. Tubes
//!     carrying no more than `min_tube_volume` are not split further.
//! - **Split tracing** hands the fractions of any [`FlowMethod`] router
//!   downhill, highest cell first.
//!
//! A flow line only enters a cell that is valid, strictly lower and not
//! already on the current path. Anything else is parked in a deferred
//! buffer, drained at the end in descending elevation along D8.
//!
//! Traversal uses explicit work-lists; nothing recurses on the native
//! stack.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use crate::maybe_rayon::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use terraflow_core::progress::{poll_every, Outcome, Progress};
use terraflow_core::raster::{CellLocks, Direction, GridTopology, Raster};
use terraflow_core::{Algorithm, Error, NoProgress, Result};
use tracing::{debug, info, warn};

use super::buffers::{into_grid, try_filled, OUTPUT_NODATA};
use super::flow_accumulation::FlowUnit;
use super::flow_direction::NO_DIRECTION;
use super::ranking::{ElevationIndex, SortOrder};
use super::routing::{dispatch, FlowField, FlowMethod, FlowRouter, RouterVisitor, RoutingParams};
use super::surface::Surface;

/// Outlet on the far edge after a diagonal crossing, entering from below
#[inline]
fn diag1(from: f64, angle: f64) -> f64 {
    1.0 - (1.0 - from) * (FRAC_PI_2 - angle).tan()
}

/// Outlet on the opposite edge, entering from below
#[inline]
fn cross1(from: f64, angle: f64) -> f64 {
    from + angle.tan()
}

/// Outlet on the top edge, entering from the left
#[inline]
fn diag2(from: f64, angle: f64) -> f64 {
    from * angle.tan()
}

/// Outlet on the opposite edge, entering from the left
#[inline]
fn cross2(from: f64, angle: f64) -> f64 {
    from - (FRAC_PI_2 - angle).tan()
}

/// Line tracing method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineMethod {
    Rho8,
    /// Kinematic routing algorithm (KRA)
    Kinematic,
    /// Digital elevation model networks (DEMON)
    Demon,
}

/// How flow is traced downhill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMethod {
    LineTracing(LineMethod),
    Split(FlowMethod),
}

impl Default for TraceMethod {
    fn default() -> Self {
        TraceMethod::LineTracing(LineMethod::Kinematic)
    }
}

/// Parameters for downslope tracing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceParams {
    pub method: TraceMethod,
    /// Convergence exponent for split tracing with the MFD family
    pub convergence: f64,
    /// Contour weighting for split tracing with the MFD family
    pub contour_weighting: bool,
    /// Weight KRA/DEMON contributions by the flow line's path length
    /// through the cell
    pub flow_correction: bool,
    /// DEMON: tubes carrying at most this much flow are not split (0..=1)
    pub min_tube_volume: f64,
    /// Seed every `step`-th row and column
    pub step: usize,
    /// Seed for the random parts of Rho8; `None` draws a fresh one
    pub seed: Option<u64>,
    /// Unit of the flow output of whole-grid tracing
    pub flow_unit: FlowUnit,
}

impl Default for TraceParams {
    fn default() -> Self {
        Self {
            method: TraceMethod::default(),
            convergence: 1.1,
            contour_weighting: false,
            flow_correction: true,
            min_tube_volume: 0.0,
            step: 1,
            seed: None,
            flow_unit: FlowUnit::Cells,
        }
    }
}

impl TraceParams {
    pub fn new(method: TraceMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Router settings for [`TraceMethod::Split`]
    pub fn routing(&self, method: FlowMethod) -> RoutingParams {
        RoutingParams {
            method,
            convergence: self.convergence,
            contour_weighting: self.contour_weighting,
            seed: self.seed,
            brm_tables: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_tube_volume) {
            return Err(Error::InvalidParameter {
                name: "min_tube_volume",
                value: self.min_tube_volume.to_string(),
                reason: "must be within [0, 1]".into(),
            });
        }
        if self.step == 0 {
            return Err(Error::InvalidParameter {
                name: "step",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if let TraceMethod::Split(method) = self.method {
            self.routing(method).validate()?;
        }
        Ok(())
    }
}

/// Optional input grids for tracing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceInputs<'a> {
    /// Per-seed contribution; cells with no positive weight are not traced
    pub weights: Option<&'a Raster<f64>>,
    /// Values averaged over the traced flow
    pub values: Option<&'a Raster<f64>>,
}

impl TraceInputs<'_> {
    pub fn validate(&self, dem: &Raster<f64>) -> Result<()> {
        if let Some(g) = self.weights {
            dem.ensure_same_grid(g, "weights")?;
        }
        if let Some(g) = self.values {
            dem.ensure_same_grid(g, "values")?;
        }
        Ok(())
    }
}

/// Result grids of a tracing run.
#[derive(Debug, Clone)]
pub struct TraceOutput {
    pub flow: Raster<f64>,
    /// Direction of the largest single hand-over out of each cell
    pub directions: Raster<i32>,
    pub mean: Option<Raster<f64>>,
}

impl FlowField for TraceOutput {
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

/// Flow tracing from every `step`-th cell.
#[derive(Debug, Clone, Default)]
pub struct FlowTracing;

impl Algorithm for FlowTracing {
    type Input = Raster<f64>;
    type Output = TraceOutput;
    type Params = TraceParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "Flow Accumulation (Flow Tracing)"
    }

    fn description(&self) -> &'static str {
        "Trace the flow of each cell downhill until it leaves the grid or ends in a sink"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        let outcome = flow_tracing(&input, &TraceInputs::default(), &params, &mut NoProgress)?;
        Ok(outcome.into_inner())
    }
}

/// Trace the flow of one cell.
///
/// The flow grid holds, for every cell, the share of the seed's flow that
/// passed through it, in percent.
pub fn trace_downslope<P: Progress + ?Sized>(
    dem: &Raster<f64>,
    seed: (usize, usize),
    inputs: &TraceInputs<'_>,
    params: &TraceParams,
    progress: &mut P,
) -> Result<Outcome<TraceOutput>> {
    check(dem, inputs, params)?;
    let (rows, cols) = dem.shape();
    if seed.0 >= rows || seed.1 >= cols {
        return Err(Error::IndexOutOfBounds {
            row: seed.0,
            col: seed.1,
            rows,
            cols,
        });
    }
    debug!(row = seed.0, col = seed.1, method = ?params.method, "tracing downslope");

    let mut tracer = Tracer::new(dem, *inputs, params)?;
    let seeds = [seed];
    let finished = tracer.run(&seeds, params, progress)?;
    if !finished {
        warn!("downslope trace cancelled");
        return Ok(Outcome::Cancelled(tracer.into_output()?));
    }

    let seed_flow = tracer.flow[tracer.topology.index(seed.0, seed.1)];
    if !tracer.drain_linear(progress)? {
        warn!("downslope trace cancelled");
        return Ok(Outcome::Cancelled(tracer.into_output()?));
    }
    let scale = if seed_flow > 0.0 { 100.0 / seed_flow } else { 0.0 };
    tracer.finalize(scale);

    info!(row = seed.0, col = seed.1, "downslope trace complete");
    Ok(Outcome::Complete(tracer.into_output()?))
}

/// Trace every `step`-th cell of the grid.
pub fn flow_tracing<P: Progress + ?Sized>(
    dem: &Raster<f64>,
    inputs: &TraceInputs<'_>,
    params: &TraceParams,
    progress: &mut P,
) -> Result<Outcome<TraceOutput>> {
    check(dem, inputs, params)?;
    let (rows, cols) = dem.shape();
    debug!(rows, cols, step = params.step, method = ?params.method, "flow tracing");

    let seeds: Vec<(usize, usize)> = (0..rows)
        .step_by(params.step)
        .flat_map(|row| (0..cols).step_by(params.step).map(move |col| (row, col)))
        .collect();

    let mut tracer = Tracer::new(dem, *inputs, params)?;
    if !tracer.run(&seeds, params, progress)? || !tracer.drain_linear(progress)? {
        warn!(seeds = seeds.len(), "flow tracing cancelled");
        return Ok(Outcome::Cancelled(tracer.into_output()?));
    }

    let scale = match params.flow_unit {
        FlowUnit::Cells => 1.0,
        FlowUnit::Area => tracer.topology.cell_area(),
    };
    tracer.finalize(scale);

    info!(seeds = seeds.len(), "flow tracing complete");
    Ok(Outcome::Complete(tracer.into_output()?))
}

fn check(dem: &Raster<f64>, inputs: &TraceInputs<'_>, params: &TraceParams) -> Result<()> {
    let checked = params.validate().and_then(|_| inputs.validate(dem));
    if let Err(e) = &checked {
        warn!(error = %e, "rejected tracing configuration");
    }
    checked
}

/// Pending unit of work of the line tracers.
#[derive(Debug, Clone, Copy)]
enum Task {
    /// Flow tube leaving `cell` towards `dir`, bounded by `a` and `b` on
    /// the entry edge (`a == b` for a single line)
    Tube {
        cell: (usize, usize),
        dir: Direction,
        flow: f64,
        a: f64,
        b: f64,
    },
    /// Leave a cell once its subtree is resolved
    Unlock(usize),
}

/// Cell ordered by elevation for the split tracer's max-heap
#[derive(Debug, Clone, Copy, PartialEq)]
struct Ranked {
    z: f64,
    idx: usize,
}

impl Eq for Ranked {}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.z
            .total_cmp(&other.z)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// State of one tracing run.
struct Tracer<'a> {
    surface: Surface<'a>,
    topology: GridTopology,
    inputs: TraceInputs<'a>,
    flow_correction: bool,
    min_tube_volume: f64,
    rng: ChaCha8Rng,
    /// Downslope aspect per cell, NaN on flats and no-data
    aspect: Vec<f64>,
    flow: Vec<f64>,
    mean: Option<Vec<f64>>,
    linear: Vec<f64>,
    linear_mean: Option<Vec<f64>>,
    strongest: Vec<f64>,
    directions: Vec<i32>,
    locks: CellLocks,
    stack: Vec<Task>,
    /// Value carried by the current seed for the catchment mean
    value: f64,
}

impl<'a> Tracer<'a> {
    fn new(dem: &'a Raster<f64>, inputs: TraceInputs<'a>, params: &TraceParams) -> Result<Self> {
        let surface = Surface::new(dem);
        let topology = *surface.topology();
        let n = topology.len();
        let with_mean = inputs.values.is_some();

        let cols = topology.cols();
        let aspect: Vec<f64> = (0..topology.rows())
            .into_par_iter()
            .flat_map(|row| {
                (0..cols)
                    .map(|col| {
                        surface
                            .gradient(row, col)
                            .and_then(|g| g.aspect)
                            .unwrap_or(f64::NAN)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let seed = params.seed.unwrap_or_else(rand::random::<u64>);
        Ok(Self {
            surface,
            topology,
            inputs,
            flow_correction: params.flow_correction,
            min_tube_volume: params.min_tube_volume,
            rng: ChaCha8Rng::seed_from_u64(seed),
            aspect,
            flow: try_filled(n, 0.0, "flow accumulator")?,
            mean: with_mean.then(|| try_filled(n, 0.0, "mean accumulator")).transpose()?,
            linear: try_filled(n, 0.0, "deferred flow buffer")?,
            linear_mean: with_mean.then(|| try_filled(n, 0.0, "deferred mean buffer")).transpose()?,
            strongest: try_filled(n, 0.0, "direction weights")?,
            directions: try_filled(n, NO_DIRECTION, "direction grid")?,
            locks: CellLocks::try_new(n)?,
            stack: Vec::new(),
            value: 0.0,
        })
    }

    #[inline]
    fn add_flow(&mut self, idx: usize, flow: f64) {
        self.flow[idx] += flow;
        if let Some(mean) = self.mean.as_mut() {
            mean[idx] += flow * self.value;
        }
    }

    #[inline]
    fn add_linear(&mut self, idx: usize, flow: f64) {
        self.linear[idx] += flow;
        if let Some(mean) = self.linear_mean.as_mut() {
            mean[idx] += flow * self.value;
        }
    }

    #[inline]
    fn record(&mut self, src: usize, dir: Direction, flow: f64) {
        if flow > self.strongest[src] {
            self.strongest[src] = flow;
            self.directions[src] = dir.index() as i32;
        }
    }

    #[inline]
    fn aspect_at(&self, idx: usize) -> Option<f64> {
        let a = self.aspect[idx];
        (!a.is_nan()).then_some(a)
    }

    /// Quadrant direction (N, E, S or W) and the aspect's offset inside it
    #[inline]
    fn quadrant(aspect: f64) -> (Direction, f64) {
        let q = (aspect / FRAC_PI_2) as i64 % 4;
        (Direction::wrapping(2 * q), aspect % FRAC_PI_2)
    }

    /// Valid, in-grid target of a step, with its elevation
    #[inline]
    fn target(&self, cell: (usize, usize), dir: Direction) -> Option<(usize, usize, f64)> {
        self.surface.valid_neighbor(cell.0, cell.1, dir)
    }

    /// Whether the target can be entered from `from`
    #[inline]
    fn can_enter(&self, from: (usize, usize), target: usize, zt: f64) -> bool {
        let zs = self.surface.elevation(from.0, from.1).unwrap_or(f64::NEG_INFINITY);
        !self.locks.is_locked(target) && zt < zs
    }

    /// Trace every seed. Returns `false` when cancelled.
    fn run<P: Progress + ?Sized>(&mut self, seeds: &[(usize, usize)], params: &TraceParams, progress: &mut P) -> Result<bool> {
        match params.method {
            TraceMethod::LineTracing(method) => Ok(self.run_lines(method, seeds, progress)),
            TraceMethod::Split(method) => dispatch(
                &params.routing(method),
                SplitRun {
                    tracer: self,
                    seeds,
                    progress,
                },
            ),
        }
    }

    /// Add the seed's own contribution and lock it. `None` if there is
    /// nothing to trace.
    fn start(&mut self, row: usize, col: usize) -> Option<(usize, f64)> {
        if !self.surface.is_valid(row, col) {
            return None;
        }
        let flow = self
            .inputs
            .weights
            .map_or(1.0, |w| w.value(row, col).unwrap_or(0.0));
        if flow <= 0.0 {
            return None;
        }
        let idx = self.topology.index(row, col);
        self.value = self
            .inputs
            .values
            .and_then(|v| v.value(row, col))
            .unwrap_or(0.0);
        self.add_flow(idx, flow);
        self.locks.lock(idx);
        Some((idx, flow))
    }

    fn run_lines<P: Progress + ?Sized>(&mut self, method: LineMethod, seeds: &[(usize, usize)], progress: &mut P) -> bool {
        let rows = self.topology.rows();
        let mut last_row = None;

        for &(row, col) in seeds {
            if last_row != Some(row) {
                last_row = Some(row);
                if !progress.report(row as f64 / rows as f64) {
                    return false;
                }
            }
            let Some((idx, flow)) = self.start(row, col) else {
                continue;
            };
            match method {
                LineMethod::Rho8 => self.rho8(row, col, flow),
                LineMethod::Kinematic => self.kinematic(row, col, flow),
                LineMethod::Demon => self.demon(row, col, flow),
            }
            self.locks.unlock(idx);
        }
        true
    }

    fn rho8(&mut self, row: usize, col: usize, flow: f64) {
        let mut path = Vec::new();
        let mut cell = (row, col);

        loop {
            let idx = self.topology.index(cell.0, cell.1);
            let Some(aspect) = self.aspect_at(idx) else {
                break;
            };
            let mut dir = Direction::wrapping((aspect / FRAC_PI_4) as i64);
            if (aspect % FRAC_PI_4) / FRAC_PI_4 > self.rng.random::<f64>() {
                dir = dir.rotate(1);
            }
            let Some((tr, tc, zt)) = self.target(cell, dir) else {
                break;
            };
            let next = self.topology.index(tr, tc);
            self.record(idx, dir, flow);
            if !self.can_enter(cell, next, zt) {
                self.add_linear(next, flow);
                break;
            }
            self.add_flow(next, flow);
            self.locks.lock(next);
            path.push(next);
            cell = (tr, tc);
        }

        for idx in path {
            self.locks.unlock(idx);
        }
    }

    fn kinematic(&mut self, row: usize, col: usize, flow: f64) {
        let idx = self.topology.index(row, col);
        let Some(aspect) = self.aspect_at(idx) else {
            return;
        };
        let (q, dif) = Self::quadrant(aspect);
        let (dir, from) = if dif <= FRAC_PI_4 {
            (q, 0.5 + dif.tan() / 2.0)
        } else {
            (q.rotate(2), 0.5 - (FRAC_PI_2 - dif).tan() / 2.0)
        };

        let mut path = Vec::new();
        let (mut cell, mut dir, mut from) = ((row, col), dir, from);
        loop {
            let Some((tr, tc, zt)) = self.target(cell, dir) else {
                break;
            };
            let src = self.topology.index(cell.0, cell.1);
            let next = self.topology.index(tr, tc);
            self.record(src, dir, flow);
            if !self.can_enter(cell, next, zt) {
                self.add_linear(next, flow);
                break;
            }
            self.locks.lock(next);
            path.push(next);

            let step = self.aspect_at(next).and_then(|a| {
                let (q, dif) = Self::quadrant(a);
                if dir == q {
                    // Entering from below
                    Some(if from > 1.0 - dif.tan() {
                        let to = diag1(from, dif);
                        (q.rotate(2), to, (1.0 - from).hypot(1.0 - to))
                    } else {
                        let to = cross1(from, dif);
                        (q, to, 1.0_f64.hypot(to - from))
                    })
                } else if dir == q.rotate(2) {
                    // Entering from the left
                    Some(if from < (FRAC_PI_2 - dif).tan() {
                        let to = diag2(from, dif);
                        (q, to, from.hypot(to))
                    } else {
                        let to = cross2(from, dif);
                        (q.rotate(2), to, 1.0_f64.hypot(from - to))
                    })
                } else {
                    None
                }
            });

            let Some((next_dir, to, weight)) = step else {
                self.add_linear(next, flow);
                break;
            };
            let weight = if self.flow_correction { weight } else { 1.0 };
            self.add_flow(next, weight * flow);
            (cell, dir, from) = ((tr, tc), next_dir, to);
        }

        for idx in path {
            self.locks.unlock(idx);
        }
    }

    fn demon(&mut self, row: usize, col: usize, flow: f64) {
        let idx = self.topology.index(row, col);
        let Some(aspect) = self.aspect_at(idx) else {
            return;
        };
        let (q, dif) = Self::quadrant(aspect);
        let (share_top, share_right) = if dif < FRAC_PI_4 {
            let b = dif.tan() / 2.0;
            (1.0 - b, b)
        } else {
            let a = (FRAC_PI_2 - dif).tan() / 2.0;
            (a, 1.0 - a)
        };

        let cell = (row, col);
        let (top, right) = (share_top * flow, share_right * flow);
        let tube = |dir, flow| Task::Tube {
            cell,
            dir,
            flow,
            a: 0.0,
            b: 1.0,
        };
        if top <= self.min_tube_volume {
            self.stack.push(tube(q.rotate(2), flow));
        } else if right <= self.min_tube_volume {
            self.stack.push(tube(q, flow));
        } else {
            self.stack.push(tube(q.rotate(2), right));
            self.stack.push(tube(q, top));
        }

        while let Some(task) = self.stack.pop() {
            match task {
                Task::Unlock(idx) => self.locks.unlock(idx),
                Task::Tube { cell, dir, flow, a, b } => self.demon_step(cell, dir, flow, a, b),
            }
        }
    }

    /// Push the two halves of a tube straddling a corner
    fn split_tube(&mut self, cell: (usize, usize), q: Direction, flow: (f64, f64), to: (f64, f64)) {
        let (flow_top, flow_right) = flow;
        let total = flow_top + flow_right;
        let tube = |dir, flow, a, b| Task::Tube { cell, dir, flow, a, b };
        if flow_top <= self.min_tube_volume {
            self.stack.push(tube(q.rotate(2), total, 0.0, to.1));
        } else if flow_right <= self.min_tube_volume {
            self.stack.push(tube(q, total, to.0, 1.0));
        } else {
            self.stack.push(tube(q.rotate(2), flow_right, 0.0, to.1));
            self.stack.push(tube(q, flow_top, to.0, 1.0));
        }
    }

    fn demon_step(&mut self, cell: (usize, usize), dir: Direction, flow: f64, a: f64, b: f64) {
        let Some((tr, tc, zt)) = self.target(cell, dir) else {
            return;
        };
        let src = self.topology.index(cell.0, cell.1);
        let next = self.topology.index(tr, tc);
        self.record(src, dir, flow);
        if !self.can_enter(cell, next, zt) {
            self.add_linear(next, flow);
            return;
        }
        self.locks.lock(next);
        self.stack.push(Task::Unlock(next));

        let Some((q, dif)) = self.aspect_at(next).map(Self::quadrant) else {
            self.add_linear(next, flow);
            return;
        };
        let here = (tr, tc);
        let tube = |dir, a, b| Task::Tube {
            cell: here,
            dir,
            flow,
            a,
            b,
        };

        let weight = if dir == q {
            // Entering from below
            let corner = 1.0 - dif.tan();
            if a >= corner {
                let (ta, tb) = (diag1(a, dif), diag1(b, dif));
                self.stack.push(tube(q.rotate(2), ta, tb));
                (1.0 - (a + b) / 2.0).hypot(1.0 - (ta + tb) / 2.0)
            } else if b < corner {
                let (ta, tb) = (cross1(a, dif), cross1(b, dif));
                self.stack.push(tube(q, ta, tb));
                1.0_f64.hypot(ta - a)
            } else {
                let (ta, tb) = (cross1(a, dif), diag1(b, dif));
                let (fa, fb) = (corner - a, b - corner);
                let top = flow * fa / (fa + fb);
                self.split_tube(here, q, (top, flow - top), (ta, tb));
                let mid = (a + b) / 2.0;
                if mid < corner {
                    1.0_f64.hypot(ta - a)
                } else {
                    (1.0 - mid) / (1.0 - corner) * 1.0_f64.hypot(ta - a)
                }
            }
        } else if dir == q.rotate(2) {
            // Entering from the left
            let corner = (FRAC_PI_2 - dif).tan();
            if b <= corner {
                let (ta, tb) = (diag2(a, dif), diag2(b, dif));
                self.stack.push(tube(q, ta, tb));
                ((a + b) / 2.0).hypot((ta + tb) / 2.0)
            } else if a > corner {
                let (ta, tb) = (cross2(a, dif), cross2(b, dif));
                self.stack.push(tube(q.rotate(2), ta, tb));
                1.0_f64.hypot(a - ta)
            } else {
                let (ta, tb) = (diag2(a, dif), cross2(b, dif));
                let (fa, fb) = (corner - a, b - corner);
                let top = flow * fa / (fa + fb);
                self.split_tube(here, q, (top, flow - top), (ta, tb));
                let mid = (a + b) / 2.0;
                if mid > corner {
                    1.0_f64.hypot(b - tb)
                } else {
                    mid / corner * 1.0_f64.hypot(b - tb)
                }
            }
        } else {
            self.add_linear(next, flow);
            return;
        };

        let weight = if self.flow_correction { weight } else { 1.0 };
        self.add_flow(next, weight * flow);
    }

    /// Hand the deferred flow down along D8, highest cell first.
    fn drain_linear<P: Progress + ?Sized>(&mut self, progress: &mut P) -> Result<bool> {
        if self.linear.iter().all(|&v| v <= 0.0) {
            return Ok(true);
        }
        let index = ElevationIndex::build(self.surface.dem(), SortOrder::Descending)?;
        let total = index.len();
        debug!(cells = total, "draining deferred flow");

        for (k, &idx) in index.as_slice().iter().enumerate() {
            if !poll_every(progress, k, total) {
                return Ok(false);
            }
            let flow = self.linear[idx];
            if flow <= 0.0 {
                continue;
            }
            let carried = self.linear_mean.as_ref().map_or(0.0, |m| m[idx]);
            self.flow[idx] += flow;
            if let Some(mean) = self.mean.as_mut() {
                mean[idx] += carried;
            }

            let (row, col) = self.topology.coords(idx);
            if let Some(dir) = self.surface.steepest_descent(row, col) {
                if let Some((nr, nc)) = self.topology.neighbor(row, col, dir) {
                    let next = self.topology.index(nr, nc);
                    self.linear[next] += flow;
                    if let Some(mean) = self.linear_mean.as_mut() {
                        mean[next] += carried;
                    }
                }
            }
        }
        Ok(true)
    }

    /// Mask no-data, turn mean sums into means and scale the flow.
    fn finalize(&mut self, scale: f64) {
        let cols = self.topology.cols();
        if cols == 0 {
            return;
        }
        let surface = self.surface;

        if let Some(mean) = self.mean.as_mut() {
            mean.par_chunks_mut(cols)
                .zip(self.flow.par_chunks(cols))
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

    fn into_output(self) -> Result<TraceOutput> {
        let dem = self.surface.dem();
        Ok(TraceOutput {
            flow: into_grid(dem, self.flow, OUTPUT_NODATA)?,
            directions: into_grid(dem, self.directions, NO_DIRECTION)?,
            mean: self
                .mean
                .map(|m| into_grid(dem, m, OUTPUT_NODATA))
                .transpose()?,
        })
    }
}

/// Split tracing with a concrete router.
struct SplitRun<'t, 'a, 's, P: ?Sized> {
    tracer: &'t mut Tracer<'a>,
    seeds: &'s [(usize, usize)],
    progress: &'t mut P,
}

impl<P: Progress + ?Sized> RouterVisitor for SplitRun<'_, '_, '_, P> {
    /// `false` when cancelled
    type Output = bool;

    fn visit<R: FlowRouter>(self, mut router: R) -> bool {
        let SplitRun { tracer, seeds, progress } = self;
        let rows = tracer.topology.rows();
        let mut inflow = vec![0.0; tracer.topology.len()];
        let mut queue = BinaryHeap::new();
        let mut last_row = None;

        for &(row, col) in seeds {
            if last_row != Some(row) {
                last_row = Some(row);
                if !progress.report(row as f64 / rows as f64) {
                    return false;
                }
            }
            let Some((seed, flow)) = tracer.start(row, col) else {
                continue;
            };
            inflow[seed] = flow;
            queue.push(Ranked {
                z: tracer.surface.elevation(row, col).unwrap_or(0.0),
                idx: seed,
            });

            // Locks mark queued cells until they are resolved
            while let Some(Ranked { z, idx }) = queue.pop() {
                let q = std::mem::take(&mut inflow[idx]);
                if idx != seed {
                    tracer.add_flow(idx, q);
                }
                let (r, c) = tracer.topology.coords(idx);
                let split = router.route(&tracer.surface, r, c);

                for (dir, fraction) in split.iter() {
                    let Some((tr, tc, zt)) = tracer.target((r, c), dir) else {
                        continue;
                    };
                    let next = tracer.topology.index(tr, tc);
                    let share = fraction * q;
                    tracer.record(idx, dir, share);
                    if zt >= z {
                        tracer.add_linear(next, share);
                    } else {
                        inflow[next] += share;
                        if tracer.locks.lock(next) {
                            queue.push(Ranked { z: zt, idx: next });
                        }
                    }
                }
                tracer.locks.unlock(idx);
            }
        }
        true
    }
}
