//! # Terraflow Algorithms
//!
//! Flow routing and accumulation over raster DEMs.
//!
//! ## Modules
//!
//! - **hydrology**: flow direction strategies, top-down accumulation,
//!   downslope tracing and upslope queries

pub mod hydrology;
pub(crate) mod maybe_rayon;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::hydrology::{
        flow_accumulation, flow_direction, flow_tracing, trace_downslope, upslope_accumulation,
        upslope_area, AccumulationInputs, AccumulationOutput, AccumulationParams, FlowAccumulation,
        FlowDirection, FlowField, FlowMethod, FlowTracing, FlowUnit, LineMethod, RoutingParams,
        TraceInputs, TraceMethod, TraceOutput, TraceParams, UpslopeInputs, UpslopeOutput,
        UpslopeParams, UpslopeTargets,
    };
    pub use terraflow_core::prelude::*;
}
