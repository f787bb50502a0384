//! Flow routing and accumulation
//!
//! Everything here reads a DEM through [`Surface`] and never modifies it:
//! - Flow direction: seven routing strategies behind the [`FlowRouter`]
//!   trait (D8, Rho8, Braunschweig, D-Infinity, MFD, triangular MFD,
//!   maximum-gradient MFD)
//! - Flow accumulation: top-down propagation in elevation order, with flow
//!   path length, catchment means, material and stream-bank loads
//! - Flow tracing: downslope traces from single cells (Rho8, KRA, DEMON or
//!   any router)
//! - Upslope queries: upslope area and recursive accumulation for target
//!   cells

mod buffers;
pub(crate) mod flow_accumulation;
pub(crate) mod flow_direction;
mod flow_direction_brm;
mod flow_direction_dinf;
mod flow_direction_mfd;
mod flow_direction_mfd_adaptive;
mod flow_direction_triangular;
mod flow_tracing;
mod ranking;
pub(crate) mod routing;
mod stream_sides;
mod surface;
mod upslope;

pub use buffers::OUTPUT_NODATA;
pub use flow_accumulation::{
    flow_accumulation, AccumulationInputs, AccumulationOutput, AccumulationParams, FlowAccumulation,
    FlowUnit, MaterialOutput,
};
pub use flow_direction::{flow_direction, D8Router, FlowDirection, Rho8Router, NO_DIRECTION};
pub use flow_direction_brm::{BrmRouter, BrmShares, BrmTables, LatticeWeights, LATTICE};
pub use flow_direction_dinf::DInfRouter;
pub use flow_direction_mfd::MfdRouter;
pub use flow_direction_mfd_adaptive::{adaptive_exponent, MaxGradientMfdRouter};
pub use flow_direction_triangular::{Facets, TriangularMfdRouter};
pub use flow_tracing::{
    flow_tracing, trace_downslope, FlowTracing, LineMethod, TraceInputs, TraceMethod, TraceOutput,
    TraceParams,
};
pub use ranking::{ElevationIndex, SortOrder};
pub use routing::{dispatch, FlowField, FlowMethod, FlowRouter, FlowSplit, RouterVisitor, RoutingParams};
pub use stream_sides::{find_sides, Sides};
pub use surface::{Gradient, Surface};
pub use upslope::{
    upslope_accumulation, upslope_area, UpslopeInputs, UpslopeOutput, UpslopeParams, UpslopeTargets,
};
