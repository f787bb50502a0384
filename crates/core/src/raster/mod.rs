//! Raster data structures and the 8-neighbour grid model

mod element;
mod geotransform;
mod grid;
mod locks;
mod neighborhood;

pub use element::RasterElement;
pub use geotransform::GeoTransform;
pub use grid::Raster;
pub use locks::CellLocks;
pub use neighborhood::{Direction, GridTopology};
