//! Error types for terraflow

use thiserror::Error;

/// Main error type for terraflow operations.
///
/// Only structural and configuration problems are reported here. Pits,
/// flats and degenerate gradients are terrain features, handled by the
/// routing strategies without raising an error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("Index out of bounds: ({row}, {col}) in raster of size ({rows}, {cols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Grid system mismatch for '{name}': {reason}")]
    GridMismatch { name: &'static str, reason: String },

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Cannot allocate {what} for {cells} cells")]
    Allocation { what: &'static str, cells: usize },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for terraflow operations
pub type Result<T> = std::result::Result<T, Error>;
