//! Flow routing strategies
//!
//! A [`FlowRouter`] answers one question for a cell: which neighbours does
//! its content flow to, and in what proportions. The answer is a
//! [`FlowSplit`] holding one fraction per direction.
//!
//! Routers are selected by [`FlowMethod`] and resolved once per run through
//! [`dispatch`], which hands a concrete router type to a [`RouterVisitor`].
//! The per-cell loop is therefore monomorphized and never goes through a
//! vtable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use terraflow_core::raster::Direction;
use terraflow_core::{Error, Result};
use tracing::warn;

use super::flow_direction::{D8Router, Rho8Router};
use super::flow_direction_brm::{BrmRouter, BrmTables};
use super::flow_direction_dinf::DInfRouter;
use super::flow_direction_mfd::MfdRouter;
use super::flow_direction_mfd_adaptive::MaxGradientMfdRouter;
use super::flow_direction_triangular::TriangularMfdRouter;
use super::surface::Surface;

/// Direction assignment method for the fractional routers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMethod {
    /// Deterministic 8 (O'Callaghan & Mark 1984)
    D8,
    /// Random 8 (Fairfield & Leymarie 1991)
    Rho8,
    /// Braunschweiger Reliefmodell (Bauer et al. 1985).
    ///
    /// Reproduces the published model only with its lattice tables set in
    /// [`RoutingParams::brm_tables`]. Without them the run falls back to
    /// [`BrmTables::approximate`] and logs a warning.
    Braunschweig,
    /// D-Infinity (Tarboton 1997)
    DInfinity,
    /// Multiple flow direction (Freeman 1991, Quinn et al. 1991)
    #[default]
    Mfd,
    /// Multiple triangular flow direction (Seibert & McGlynn 2007)
    TriangularMfd,
    /// Multiple maximum downslope gradient based flow direction (Qin et al. 2007)
    MaxGradientMfd,
}

impl FlowMethod {
    pub const ALL: [FlowMethod; 7] = [
        FlowMethod::D8,
        FlowMethod::Rho8,
        FlowMethod::Braunschweig,
        FlowMethod::DInfinity,
        FlowMethod::Mfd,
        FlowMethod::TriangularMfd,
        FlowMethod::MaxGradientMfd,
    ];

    /// Method for a numeric id in `0..=6`
    pub fn from_id(id: i64) -> Result<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or_else(|| Error::InvalidParameter {
                name: "method",
                value: id.to_string(),
                reason: "expected a method id between 0 and 6".into(),
            })
    }

    /// Numeric id of the method
    pub fn id(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            FlowMethod::D8 => "d8",
            FlowMethod::Rho8 => "rho8",
            FlowMethod::Braunschweig => "braunschweig",
            FlowMethod::DInfinity => "dinf",
            FlowMethod::Mfd => "mfd",
            FlowMethod::TriangularMfd => "mtfd",
            FlowMethod::MaxGradientMfd => "mmdgfd",
        }
    }

    /// Whether the method spreads flow over several receivers
    pub fn is_divergent(self) -> bool {
        !matches!(self, FlowMethod::D8 | FlowMethod::Rho8)
    }
}

impl fmt::Display for FlowMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FlowMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        match key.as_str() {
            "d8" => Ok(FlowMethod::D8),
            "rho8" => Ok(FlowMethod::Rho8),
            "braunschweig" | "brm" => Ok(FlowMethod::Braunschweig),
            "dinf" | "dinfinity" => Ok(FlowMethod::DInfinity),
            "mfd" => Ok(FlowMethod::Mfd),
            "mtfd" | "triangularmfd" => Ok(FlowMethod::TriangularMfd),
            "mmdgfd" | "maxgradientmfd" => Ok(FlowMethod::MaxGradientMfd),
            _ => match key.parse::<i64>() {
                Ok(id) => Self::from_id(id),
                Err(_) => Err(Error::InvalidParameter {
                    name: "method",
                    value: s.to_string(),
                    reason: "unknown flow routing method".into(),
                }),
            },
        }
    }
}

/// Router configuration shared by every engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingParams {
    /// Direction assignment method
    pub method: FlowMethod,
    /// Convergence exponent of the MFD family (default 1.1). Must be > 0.
    pub convergence: f64,
    /// Scale diagonal MFD weights by the diagonal contour length (√2/2).
    /// Used by Mfd and MaxGradientMfd only.
    pub contour_weighting: bool,
    /// Seed for Rho8; `None` draws a fresh one per run
    pub seed: Option<u64>,
    /// Lattice tables for Braunschweig routing; `None` falls back to
    /// [`BrmTables::approximate`]
    #[serde(skip)]
    pub brm_tables: Option<Arc<BrmTables>>,
}

impl Default for RoutingParams {
    fn default() -> Self {
        Self {
            method: FlowMethod::default(),
            convergence: 1.1,
            contour_weighting: false,
            seed: None,
            brm_tables: None,
        }
    }
}

impl RoutingParams {
    pub fn new(method: FlowMethod) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn with_convergence(mut self, convergence: f64) -> Self {
        self.convergence = convergence;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_brm_tables(mut self, tables: Arc<BrmTables>) -> Self {
        self.brm_tables = Some(tables);
        self
    }

    /// Braunschweig routing without explicit lattice tables
    pub fn uses_approximate_brm(&self) -> bool {
        self.method == FlowMethod::Braunschweig && self.brm_tables.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.convergence.is_finite() && self.convergence > 0.0) {
            return Err(Error::InvalidParameter {
                name: "convergence",
                value: self.convergence.to_string(),
                reason: "must be a finite number greater than 0".into(),
            });
        }
        Ok(())
    }
}

/// Outflow fractions of one cell, indexed by direction code.
///
/// Fractions are non-negative. A split with no positive fraction means the
/// cell keeps its content (pit, flat or edge cell).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FlowSplit {
    fractions: [f64; 8],
}

impl FlowSplit {
    pub fn none() -> Self {
        Self::default()
    }

    /// All flow to one neighbour
    pub fn single(dir: Direction) -> Self {
        let mut split = Self::none();
        split.fractions[dir.index()] = 1.0;
        split
    }

    pub fn from_fractions(fractions: [f64; 8]) -> Self {
        Self { fractions }
    }

    #[inline]
    pub fn add(&mut self, dir: Direction, fraction: f64) {
        self.fractions[dir.index()] += fraction;
    }

    #[inline]
    pub fn fraction(&self, dir: Direction) -> f64 {
        self.fractions[dir.index()]
    }

    pub fn as_array(&self) -> &[f64; 8] {
        &self.fractions
    }

    /// Directions with a positive fraction, in direction order
    pub fn iter(&self) -> impl Iterator<Item = (Direction, f64)> + '_ {
        Direction::ALL
            .into_iter()
            .zip(self.fractions.iter().copied())
            .filter(|&(_, f)| f > 0.0)
    }

    pub fn total(&self) -> f64 {
        self.fractions.iter().filter(|f| **f > 0.0).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.fractions.iter().all(|&f| f <= 0.0)
    }

    /// Direction carrying the largest fraction; the first one on ties
    pub fn dominant(&self) -> Option<Direction> {
        let mut best: Option<(Direction, f64)> = None;
        for (dir, f) in self.iter() {
            if best.map_or(true, |(_, max)| max < f) {
                best = Some((dir, f));
            }
        }
        best.map(|(dir, _)| dir)
    }

    /// Scale fractions so they sum to one. Empty splits stay empty.
    pub fn normalize(&mut self) {
        let total = self.total();
        if total > 0.0 {
            for f in self.fractions.iter_mut() {
                *f = if *f > 0.0 { *f / total } else { 0.0 };
            }
        }
    }
}

/// A direction assignment strategy.
///
/// `route` takes `&mut self` so stochastic routers can advance their
/// generator. Routers are cheap to clone; parallel passes give every
/// worker its own copy through [`FlowRouter::fork`].
pub trait FlowRouter: Clone + Send + Sync {
    /// Outflow fractions of a valid cell
    fn route(&mut self, surface: &Surface<'_>, row: usize, col: usize) -> FlowSplit;

    /// Independent copy for a parallel worker. `stream` distinguishes
    /// workers so stochastic routers do not repeat each other.
    fn fork(&self, _stream: u64) -> Self {
        self.clone()
    }
}

/// Receives the concrete router selected by [`dispatch`].
pub trait RouterVisitor {
    type Output;

    fn visit<R: FlowRouter>(self, router: R) -> Self::Output;
}

/// Build the router for `params.method` and hand it to `visitor`.
///
/// Parameters are validated first.
pub fn dispatch<V: RouterVisitor>(params: &RoutingParams, visitor: V) -> Result<V::Output> {
    params.validate()?;
    let p = params.convergence;
    Ok(match params.method {
        FlowMethod::D8 => visitor.visit(D8Router),
        FlowMethod::Rho8 => visitor.visit(Rho8Router::new(params.seed)),
        FlowMethod::Braunschweig => {
            if params.uses_approximate_brm() {
                warn!("no BRM lattice tables given, using the approximate set");
            }
            let tables = params
                .brm_tables
                .clone()
                .unwrap_or_else(BrmTables::shared_approximate);
            visitor.visit(BrmRouter::new(tables))
        }
        FlowMethod::DInfinity => visitor.visit(DInfRouter),
        FlowMethod::Mfd => {
            visitor.visit(MfdRouter::new(p).with_contour_weighting(params.contour_weighting))
        }
        FlowMethod::TriangularMfd => visitor.visit(TriangularMfdRouter::new(p)),
        FlowMethod::MaxGradientMfd => visitor.visit(
            MaxGradientMfdRouter::new().with_contour_weighting(params.contour_weighting),
        ),
    })
}

/// Read-only view of a routed and accumulated grid for downstream tools.
pub trait FlowField {
    /// Accumulated value, `None` outside the valid area
    fn accumulated_value(&self, row: usize, col: usize) -> Option<f64>;

    /// Dominant outflow direction, `None` for pits and invalid cells
    fn direction(&self, row: usize, col: usize) -> Option<Direction>;

    fn is_valid(&self, row: usize, col: usize) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_method_ids_and_names() {
        for (i, m) in FlowMethod::ALL.iter().enumerate() {
            assert_eq!(m.id(), i as i64);
            assert_eq!(FlowMethod::from_id(i as i64).unwrap(), *m);
            assert_eq!(m.name().parse::<FlowMethod>().unwrap(), *m);
        }
        assert_eq!("D-Infinity".parse::<FlowMethod>().unwrap(), FlowMethod::DInfinity);
        assert_eq!("4".parse::<FlowMethod>().unwrap(), FlowMethod::Mfd);
        assert!(FlowMethod::from_id(7).is_err());
        assert!(FlowMethod::from_id(-1).is_err());
        assert!("kinematic".parse::<FlowMethod>().is_err());
        assert_eq!(FlowMethod::default(), FlowMethod::Mfd);
    }

    #[test]
    fn test_params_validation() {
        assert!(RoutingParams::default().validate().is_ok());
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let params = RoutingParams::default().with_convergence(bad);
            assert!(
                matches!(params.validate(), Err(Error::InvalidParameter { name: "convergence", .. })),
                "convergence {} must be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_brm_table_fallback_is_flagged() {
        assert!(RoutingParams::new(FlowMethod::Braunschweig).uses_approximate_brm());
        assert!(!RoutingParams::new(FlowMethod::Mfd).uses_approximate_brm());

        let explicit = RoutingParams::new(FlowMethod::Braunschweig)
            .with_brm_tables(BrmTables::shared_approximate());
        assert!(!explicit.uses_approximate_brm());
        assert!(explicit.validate().is_ok());
    }

    #[test]
    fn test_split_helpers() {
        let mut split = FlowSplit::none();
        assert!(split.is_empty());
        assert_eq!(split.dominant(), None);

        split.add(Direction::E, 0.25);
        split.add(Direction::SE, 0.5);
        split.add(Direction::S, 0.25);
        assert_relative_eq!(split.total(), 1.0);
        assert_eq!(split.dominant(), Some(Direction::SE));
        assert_eq!(split.iter().count(), 3);

        let mut tie = FlowSplit::none();
        tie.add(Direction::W, 2.0);
        tie.add(Direction::NE, 2.0);
        tie.normalize();
        assert_eq!(tie.dominant(), Some(Direction::NE));
        assert_relative_eq!(tie.fraction(Direction::W), 0.5);
    }
}
