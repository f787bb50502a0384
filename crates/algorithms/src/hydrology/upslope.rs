//! Upslope contributions of target cells
//!
//! Two on-demand queries, both driven by a set of target cells:
//!
//! - [`upslope_area`]: for every cell, the percentage of its outflow that
//!   eventually reaches a target. Targets hold 100; other cells are filled
//!   from the lowest upwards with the fraction-weighted value of their
//!   receivers.
//! - [`upslope_accumulation`]: pulls the accumulated contributions of
//!   everything upslope into each target. Router fractions are cached once
//!   per run; the pull walks an explicit post-order work-list, so deep
//!   catchments cannot overflow the stack. A cell is never entered while it
//!   is still being resolved further up the same walk.

use crate::maybe_rayon::*;
use serde::{Deserialize, Serialize};
use terraflow_core::progress::{poll_every, Outcome, Progress};
use terraflow_core::raster::{CellLocks, Direction, GridTopology, Raster, RasterElement};
use terraflow_core::{Error, Result};
use tracing::{debug, info, warn};

use super::buffers::{into_grid, try_filled, OUTPUT_NODATA};
use super::flow_accumulation::FlowUnit;
use super::ranking::{ElevationIndex, SortOrder};
use super::routing::{dispatch, FlowRouter, RouterVisitor, RoutingParams};
use super::surface::Surface;

/// Value of a target cell in [`upslope_area`]
const TARGET_SHARE: f64 = 100.0;

/// Target cells of an upslope query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpslopeTargets {
    cells: Vec<(usize, usize)>,
}

impl UpslopeTargets {
    /// Targets from `(row, col)` positions. Every position must lie on the grid.
    pub fn from_cells(dem: &Raster<f64>, cells: &[(usize, usize)]) -> Result<Self> {
        let (rows, cols) = dem.shape();
        if let Some(&(row, col)) = cells.iter().find(|&&(r, c)| r >= rows || c >= cols) {
            return Err(Error::IndexOutOfBounds { row, col, rows, cols });
        }
        Ok(Self {
            cells: cells.to_vec(),
        })
    }

    /// Targets from world coordinates.
    pub fn from_points(dem: &Raster<f64>, points: &[(f64, f64)]) -> Result<Self> {
        let cells = points
            .iter()
            .map(|&(x, y)| {
                dem.geo_to_cell(x, y).ok_or_else(|| Error::InvalidParameter {
                    name: "target",
                    value: format!("({}, {})", x, y),
                    reason: "point lies outside the grid".into(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { cells })
    }

    /// Every valid cell of `mask` is a target.
    pub fn from_mask<T: RasterElement>(dem: &Raster<f64>, mask: &Raster<T>) -> Result<Self> {
        dem.ensure_same_grid(mask, "target mask")?;
        let cells = mask
            .data()
            .indexed_iter()
            .filter(|(_, &v)| !mask.is_nodata(v))
            .map(|(pos, _)| pos)
            .collect();
        Ok(Self { cells })
    }

    pub fn cells(&self) -> &[(usize, usize)] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Parameters for upslope queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpslopeParams {
    #[serde(flatten)]
    pub routing: RoutingParams,
    /// Unit of pulled contributions
    pub flow_unit: FlowUnit,
    /// Clamp negative accumulations to zero
    pub no_negatives: bool,
    /// Record the amount removed by `no_negatives`
    pub loss: bool,
}

impl Default for UpslopeParams {
    fn default() -> Self {
        Self {
            routing: RoutingParams::default(),
            flow_unit: FlowUnit::Cells,
            no_negatives: true,
            loss: false,
        }
    }
}

impl UpslopeParams {
    pub fn new(routing: RoutingParams) -> Self {
        Self {
            routing,
            ..Self::default()
        }
    }
}

/// Optional input grids for upslope queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpslopeInputs<'a> {
    /// Per-cell contribution for [`upslope_accumulation`]; no-data counts as 0
    pub weights: Option<&'a Raster<f64>>,
    /// Route codes overriding the router, typically out of closed
    /// depressions
    pub sink_routes: Option<&'a Raster<i32>>,
}

impl UpslopeInputs<'_> {
    pub fn validate(&self, dem: &Raster<f64>) -> Result<()> {
        if let Some(g) = self.weights {
            dem.ensure_same_grid(g, "weights")?;
        }
        if let Some(g) = self.sink_routes {
            dem.ensure_same_grid(g, "sink_routes")?;
        }
        Ok(())
    }

    #[inline]
    fn route(&self, row: usize, col: usize) -> Option<Direction> {
        self.sink_routes
            .and_then(|r| r.value(row, col))
            .and_then(|code| code.to_code())
            .and_then(Direction::from_index)
    }
}

/// Result of [`upslope_accumulation`].
#[derive(Debug, Clone)]
pub struct UpslopeOutput {
    /// Resolved value of each target, in target order. NaN for targets on
    /// no-data.
    pub targets: Vec<f64>,
    /// Resolved value of every visited cell, no-data elsewhere
    pub resolved: Raster<f64>,
    /// Amount clamped away by `no_negatives`, if requested
    pub loss: Option<Raster<f64>>,
}

fn check(dem: &Raster<f64>, inputs: &UpslopeInputs<'_>, params: &UpslopeParams) -> Result<()> {
    let checked = params.routing.validate().and_then(|_| inputs.validate(dem));
    if let Err(e) = &checked {
        warn!(error = %e, "rejected upslope configuration");
    }
    checked
}

/// Share (in percent) of every cell's outflow that reaches `targets`.
///
/// Targets on no-data cells are ignored. Edge cells split their outflow the
/// way top-down accumulation does, so divergent methods may send part of
/// it off the grid.
pub fn upslope_area<P: Progress + ?Sized>(
    dem: &Raster<f64>,
    targets: &UpslopeTargets,
    inputs: &UpslopeInputs<'_>,
    params: &UpslopeParams,
    progress: &mut P,
) -> Result<Outcome<Raster<f64>>> {
    check(dem, inputs, params)?;
    debug!(targets = targets.len(), method = %params.routing.method, "upslope area");

    let surface = Surface::new(dem);
    let topology = *surface.topology();
    let mut share = try_filled(topology.len(), 0.0, "upslope area")?;
    for &(row, col) in targets.cells() {
        if surface.is_valid(row, col) {
            share[topology.index(row, col)] = TARGET_SHARE;
        }
    }

    let index = ElevationIndex::build(dem, SortOrder::Ascending)?;
    let finished = dispatch(
        &params.routing,
        AreaPass {
            surface: &surface,
            inputs,
            index: &index,
            share: &mut share,
            progress,
        },
    )?;

    for (idx, v) in share.iter_mut().enumerate() {
        let (row, col) = topology.coords(idx);
        if !surface.is_valid(row, col) {
            *v = OUTPUT_NODATA;
        }
    }
    let grid = into_grid(dem, share, OUTPUT_NODATA)?;
    if !finished {
        warn!(cells = index.len(), "upslope area cancelled");
        return Ok(Outcome::Cancelled(grid));
    }
    info!(targets = targets.len(), "upslope area complete");
    Ok(Outcome::Complete(grid))
}

struct AreaPass<'r, 'a, P: ?Sized> {
    surface: &'r Surface<'a>,
    inputs: &'r UpslopeInputs<'a>,
    index: &'r ElevationIndex,
    share: &'r mut [f64],
    progress: &'r mut P,
}

impl<P: Progress + ?Sized> RouterVisitor for AreaPass<'_, '_, P> {
    type Output = bool;

    fn visit<R: FlowRouter>(self, mut router: R) -> bool {
        let AreaPass {
            surface,
            inputs,
            index,
            share,
            progress,
        } = self;
        let topology = surface.topology();
        let total = index.len();

        for (k, &idx) in index.as_slice().iter().enumerate() {
            if !poll_every(progress, k, total) {
                return false;
            }
            if share[idx] > 0.0 {
                continue;
            }
            let (row, col) = topology.coords(idx);

            if let Some(dir) = inputs.route(row, col) {
                if let Some((nr, nc)) = topology.neighbor(row, col, dir) {
                    let v = share[topology.index(nr, nc)];
                    if v > 0.0 {
                        share[idx] = v;
                    }
                }
                continue;
            }

            let reached: f64 = router
                .route(surface, row, col)
                .iter()
                .filter_map(|(dir, fraction)| {
                    let (nr, nc, _) = surface.valid_neighbor(row, col, dir)?;
                    Some(fraction * share[topology.index(nr, nc)])
                })
                .sum();
            if reached > 0.0 {
                share[idx] = reached;
            }
        }
        true
    }
}

/// Pull everything upslope of `targets` into them.
///
/// Each cell contributes its weight (1 without a weight grid, times the
/// cell area for [`FlowUnit::Area`]). Cells flowing into a target
/// contribute their own resolved value times the fraction they send.
pub fn upslope_accumulation<P: Progress + ?Sized>(
    dem: &Raster<f64>,
    targets: &UpslopeTargets,
    inputs: &UpslopeInputs<'_>,
    params: &UpslopeParams,
    progress: &mut P,
) -> Result<Outcome<UpslopeOutput>> {
    check(dem, inputs, params)?;
    debug!(
        targets = targets.len(),
        method = %params.routing.method,
        "upslope accumulation"
    );

    let surface = Surface::new(dem);
    let fractions = dispatch(
        &params.routing,
        FractionCache {
            surface: &surface,
            inputs,
        },
    )??;

    let mut pull = Pull::new(&surface, *inputs, params, fractions)?;
    let valid = dem.valid_count();
    let mut values = Vec::with_capacity(targets.len());
    for &(row, col) in targets.cells() {
        if !surface.is_valid(row, col) {
            values.push(f64::NAN);
            continue;
        }
        let idx = pull.topology.index(row, col);
        if !pull.resolve(idx, valid, progress) {
            warn!(visited = pull.visited, "upslope accumulation cancelled");
            return Ok(Outcome::Cancelled(pull.into_output(values)?));
        }
        values.push(pull.resolved[idx]);
    }

    info!(targets = targets.len(), visited = pull.visited, "upslope accumulation complete");
    Ok(Outcome::Complete(pull.into_output(values)?))
}

/// Outflow fractions of every cell, computed in parallel rows.
struct FractionCache<'r, 'a> {
    surface: &'r Surface<'a>,
    inputs: &'r UpslopeInputs<'a>,
}

impl RouterVisitor for FractionCache<'_, '_> {
    type Output = Result<Vec<[f64; 8]>>;

    fn visit<R: FlowRouter>(self, router: R) -> Self::Output {
        let surface = self.surface;
        let inputs = self.inputs;
        let topology = surface.topology();
        let cols = topology.cols();

        let mut cache = try_filled(topology.len(), [0.0; 8], "fraction cache")?;
        if cols == 0 {
            return Ok(cache);
        }
        cache
            .par_chunks_mut(cols)
            .enumerate()
            .for_each(|(row, out)| {
                let mut router = router.fork(row as u64);
                for (col, slot) in out.iter_mut().enumerate() {
                    if !surface.is_valid(row, col) {
                        continue;
                    }
                    if let Some(dir) = inputs.route(row, col) {
                        slot[dir.index()] = 1.0;
                    } else {
                        *slot = *router.route(surface, row, col).as_array();
                    }
                }
            });
        Ok(cache)
    }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Enter(usize),
    Resolve(usize),
}

/// State of one upslope accumulation run.
struct Pull<'s, 'a> {
    surface: &'s Surface<'a>,
    topology: GridTopology,
    inputs: UpslopeInputs<'a>,
    fractions: Vec<[f64; 8]>,
    no_negatives: bool,
    unit: f64,
    /// NaN until a cell is resolved
    resolved: Vec<f64>,
    loss: Option<Vec<f64>>,
    locks: CellLocks,
    stack: Vec<Step>,
    visited: usize,
}

impl<'s, 'a> Pull<'s, 'a> {
    fn new(
        surface: &'s Surface<'a>,
        inputs: UpslopeInputs<'a>,
        params: &UpslopeParams,
        fractions: Vec<[f64; 8]>,
    ) -> Result<Self> {
        let topology = *surface.topology();
        let n = topology.len();
        Ok(Self {
            surface,
            topology,
            inputs,
            fractions,
            no_negatives: params.no_negatives,
            unit: match params.flow_unit {
                FlowUnit::Cells => 1.0,
                FlowUnit::Area => topology.cell_area(),
            },
            resolved: try_filled(n, f64::NAN, "resolved values")?,
            loss: params
                .loss
                .then(|| try_filled(n, OUTPUT_NODATA, "loss grid"))
                .transpose()?,
            locks: CellLocks::try_new(n)?,
            stack: Vec::new(),
            visited: 0,
        })
    }

    #[inline]
    fn is_resolved(&self, idx: usize) -> bool {
        !self.resolved[idx].is_nan()
    }

    /// Upslope neighbours of `idx` and the fraction each sends into it
    fn contributors(&self, idx: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let (row, col) = self.topology.coords(idx);
        Direction::ALL.into_iter().filter_map(move |dir| {
            let (nr, nc) = self.topology.neighbor(row, col, dir)?;
            let n = self.topology.index(nr, nc);
            let fraction = self.fractions[n][dir.opposite().index()];
            (fraction > 0.0).then_some((n, fraction))
        })
    }

    /// Resolve `target` and everything upslope of it. `false` when cancelled.
    fn resolve<P: Progress + ?Sized>(&mut self, target: usize, total: usize, progress: &mut P) -> bool {
        self.stack.push(Step::Enter(target));

        while let Some(step) = self.stack.pop() {
            match step {
                Step::Enter(idx) => {
                    if self.is_resolved(idx) || !self.locks.lock(idx) {
                        continue;
                    }
                    self.stack.push(Step::Resolve(idx));
                    let pending: Vec<usize> = self
                        .contributors(idx)
                        .filter(|&(n, _)| !self.is_resolved(n) && !self.locks.is_locked(n))
                        .map(|(n, _)| n)
                        .collect();
                    self.stack.extend(pending.into_iter().map(Step::Enter));
                }
                Step::Resolve(idx) => {
                    if !poll_every(progress, self.visited, total) {
                        self.stack.clear();
                        self.locks.unlock(idx);
                        return false;
                    }
                    let (row, col) = self.topology.coords(idx);
                    let base = self
                        .inputs
                        .weights
                        .map_or(1.0, |w| w.value(row, col).unwrap_or(0.0))
                        * self.unit;
                    let upslope: f64 = self
                        .contributors(idx)
                        .filter(|&(n, _)| self.is_resolved(n))
                        .map(|(n, fraction)| fraction * self.resolved[n])
                        .sum();

                    let mut value = base + upslope;
                    if self.no_negatives && value < 0.0 {
                        if let Some(loss) = self.loss.as_mut() {
                            loss[idx] = -value;
                        }
                        value = 0.0;
                    }
                    self.resolved[idx] = value;
                    self.visited += 1;
                    self.locks.unlock(idx);
                }
            }
        }
        true
    }

    fn into_output(self, targets: Vec<f64>) -> Result<UpslopeOutput> {
        let dem = self.surface.dem();
        Ok(UpslopeOutput {
            targets,
            resolved: into_grid(dem, self.resolved, OUTPUT_NODATA)?,
            loss: self.loss.map(|l| into_grid(dem, l, OUTPUT_NODATA)).transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrology::flow_accumulation::{flow_accumulation, AccumulationInputs, AccumulationParams};
    use crate::hydrology::routing::FlowMethod;
    use approx::assert_relative_eq;
    use terraflow_core::NoProgress;

    fn grid(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Raster<f64> {
        let mut dem = Raster::new(rows, cols);
        for row in 0..rows {
            for col in 0..cols {
                dem.set(row, col, f(row, col)).unwrap();
            }
        }
        dem
    }

    fn south_plane() -> Raster<f64> {
        grid(5, 5, |r, _| 10.0 - r as f64)
    }

    fn params(method: FlowMethod) -> UpslopeParams {
        UpslopeParams::new(RoutingParams::new(method))
    }

    fn area(dem: &Raster<f64>, targets: &UpslopeTargets, inputs: &UpslopeInputs<'_>, method: FlowMethod) -> Raster<f64> {
        upslope_area(dem, targets, inputs, &params(method), &mut NoProgress)
            .unwrap()
            .complete()
            .expect("run should complete")
    }

    #[test]
    fn test_area_d8_column() {
        let dem = south_plane();
        let targets = UpslopeTargets::from_cells(&dem, &[(3, 2)]).unwrap();
        let out = area(&dem, &targets, &UpslopeInputs::default(), FlowMethod::D8);
        assert_eq!(out.value(3, 2), Some(100.0));
        assert_eq!(out.value(2, 2), Some(100.0));
        assert_eq!(out.value(1, 2), Some(100.0));
        // Edge cells have no D8 receiver
        assert_eq!(out.value(0, 2), Some(0.0));
        assert_eq!(out.value(2, 1), Some(0.0));
        assert_eq!(out.value(4, 2), Some(0.0));
    }

    #[test]
    fn test_area_mfd_row_mask() {
        let dem = south_plane();
        let mut mask: Raster<f64> = dem.like(f64::NAN);
        for c in 0..5 {
            mask.set(3, c, 1.0).unwrap();
        }
        let targets = UpslopeTargets::from_mask(&dem, &mask).unwrap();
        assert_eq!(targets.len(), 5);

        let out = area(&dem, &targets, &UpslopeInputs::default(), FlowMethod::Mfd);
        assert_relative_eq!(out.value(2, 2).unwrap(), 100.0, epsilon = 1e-9);
        assert_relative_eq!(out.value(1, 2).unwrap(), 100.0, epsilon = 1e-9);
        assert_eq!(out.value(4, 2), Some(0.0));
    }

    #[test]
    fn test_area_edge_cell_loses_off_grid_share() {
        // Falls south and west; (1, 0) extrapolates drops across the west edge
        let dem = grid(3, 3, |r, c| 100.0 - r as f64 + c as f64);
        let targets = UpslopeTargets::from_cells(&dem, &[(2, 0), (2, 1), (2, 2)]).unwrap();
        let out = area(&dem, &targets, &UpslopeInputs::default(), FlowMethod::Mfd);

        // S (tan 1) stays in the grid, W (tan 1) and SW (tan √2) leave it
        let expected = 100.0 / (2.0 + 2.0_f64.powf(0.55));
        assert_relative_eq!(out.value(1, 0).unwrap(), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_area_follows_route_codes() {
        let dem = south_plane();
        let targets = UpslopeTargets::from_cells(&dem, &[(3, 2)]).unwrap();
        let mut routes: Raster<i32> = dem.with_same_meta();
        routes.data_mut().fill(-1);
        routes.set_nodata(Some(-1));
        routes.set(0, 3, Direction::SW.index() as i32).unwrap();
        let inputs = UpslopeInputs {
            sink_routes: Some(&routes),
            ..Default::default()
        };
        let out = area(&dem, &targets, &inputs, FlowMethod::D8);
        assert_eq!(out.value(0, 3), Some(100.0));
    }

    #[test]
    fn test_accumulation_d8_column() {
        let dem = south_plane();
        let targets = UpslopeTargets::from_cells(&dem, &[(3, 2), (3, 2)]).unwrap();
        let weights = dem.like(2.0);
        let inputs = UpslopeInputs {
            weights: Some(&weights),
            ..Default::default()
        };
        let out = upslope_accumulation(&dem, &targets, &inputs, &params(FlowMethod::D8), &mut NoProgress)
            .unwrap()
            .into_inner();
        assert_eq!(out.targets, vec![6.0, 6.0]);
        assert_eq!(out.resolved.value(2, 2), Some(4.0));
        assert_eq!(out.resolved.value(0, 2), None);
        assert_eq!(out.resolved.value(4, 2), None);
    }

    #[test]
    fn test_accumulation_matches_top_down() {
        let dem = grid(7, 7, |r, c| {
            let (dr, dc) = (r as f64 - 3.0, c as f64 - 3.0);
            (dr * dr + dc * dc).sqrt()
        });
        let targets = UpslopeTargets::from_cells(&dem, &[(3, 3), (1, 2)]).unwrap();
        let pulled = upslope_accumulation(
            &dem,
            &targets,
            &UpslopeInputs::default(),
            &params(FlowMethod::Mfd),
            &mut NoProgress,
        )
        .unwrap()
        .into_inner();

        let top_down = flow_accumulation(
            &dem,
            &AccumulationInputs::default(),
            &AccumulationParams::new(RoutingParams::new(FlowMethod::Mfd)).without_linear_threshold(),
            &mut NoProgress,
        )
        .unwrap()
        .into_inner();

        assert_relative_eq!(pulled.targets[0], top_down.flow.value(3, 3).unwrap(), epsilon = 1e-9);
        assert_relative_eq!(pulled.targets[1], top_down.flow.value(1, 2).unwrap(), epsilon = 1e-9);
    }

    #[test]
    fn test_negative_contributions_are_clamped() {
        let dem = south_plane();
        let mut weights = dem.like(1.0);
        weights.set(1, 2, -5.0).unwrap();
        let inputs = UpslopeInputs {
            weights: Some(&weights),
            ..Default::default()
        };
        let mut p = params(FlowMethod::D8);
        p.loss = true;
        let targets = UpslopeTargets::from_cells(&dem, &[(3, 2)]).unwrap();
        let out = upslope_accumulation(&dem, &targets, &inputs, &p, &mut NoProgress)
            .unwrap()
            .into_inner();
        assert_eq!(out.targets, vec![2.0]);
        let loss = out.loss.unwrap();
        assert_eq!(loss.value(1, 2), Some(5.0));
        assert_eq!(loss.value(2, 2), None);
    }

    #[test]
    fn test_targets_from_points() {
        let dem = south_plane();
        // Default transform: origin (0, 0), y decreasing southwards
        let targets = UpslopeTargets::from_points(&dem, &[(2.5, -1.5)]).unwrap();
        assert_eq!(targets.cells(), &[(1, 2)]);

        assert!(UpslopeTargets::from_points(&dem, &[(-3.0, 0.5)]).is_err());
        assert!(UpslopeTargets::from_cells(&dem, &[(5, 0)]).is_err());
    }

    #[test]
    fn test_cancelled_pull() {
        let dem = south_plane();
        let targets = UpslopeTargets::from_cells(&dem, &[(4, 4)]).unwrap();
        let mut stop = |_f: f64| false;
        let outcome = upslope_accumulation(&dem, &targets, &UpslopeInputs::default(), &params(FlowMethod::Mfd), &mut stop)
            .unwrap();
        assert!(outcome.is_cancelled());
    }
}
