//! # Terraflow Core
//!
//! Core types and traits for the terraflow flow-routing library.
//!
//! This crate provides:
//! - `Raster<T>`: Generic raster grid type
//! - `GeoTransform`: Affine transformation for georeferencing
//! - `Direction` and `GridTopology`: the 8-neighbour grid model
//! - `CellLocks`: per-run visited markers for recursive traversals
//! - Progress reporting and cancellation (`Progress`, `Outcome`)
//! - Algorithm traits for consistent API

pub mod error;
pub mod progress;
pub mod raster;

pub use error::{Error, Result};
pub use progress::{NoProgress, Outcome, Progress};
pub use raster::{CellLocks, Direction, GeoTransform, GridTopology, Raster, RasterElement};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::progress::{NoProgress, Outcome, Progress};
    pub use crate::raster::{CellLocks, Direction, GeoTransform, GridTopology, Raster, RasterElement};
    pub use crate::Algorithm;
}

/// Core trait for all algorithms in terraflow.
///
/// Algorithms are pure functions that transform input data according to parameters.
pub trait Algorithm {
    /// Input type for the algorithm
    type Input;
    /// Output type for the algorithm
    type Output;
    /// Parameters controlling algorithm behavior
    type Params: Default;
    /// Error type for algorithm execution
    type Error: std::error::Error;

    /// Returns the algorithm name
    fn name(&self) -> &'static str;

    /// Returns a description of what the algorithm does
    fn description(&self) -> &'static str;

    /// Execute the algorithm
    fn execute(&self, input: Self::Input, params: Self::Params) -> std::result::Result<Self::Output, Self::Error>;

    /// Execute with default parameters
    fn execute_default(&self, input: Self::Input) -> std::result::Result<Self::Output, Self::Error> {
        self.execute(input, Self::Params::default())
    }
}
