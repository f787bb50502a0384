//! Flat per-run cell buffers and their conversion to rasters

use ndarray::Array2;
use terraflow_core::raster::{Raster, RasterElement};
use terraflow_core::{Error, Result};

/// No-data value of every `f64` output grid
pub const OUTPUT_NODATA: f64 = f64::NAN;

/// Allocate a buffer of `len` copies of `value`, reporting failure.
pub(crate) fn try_filled<T: Clone>(len: usize, value: T, what: &'static str) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| Error::Allocation { what, cells: len })?;
    buffer.resize(len, value);
    Ok(buffer)
}

/// Wrap a row-major buffer in a raster sharing `like`'s grid system.
pub(crate) fn into_grid<T: RasterElement>(like: &Raster<f64>, data: Vec<T>, nodata: T) -> Result<Raster<T>> {
    let mut grid = like.with_same_meta::<T>();
    grid.set_nodata(Some(nodata));
    *grid.data_mut() =
        Array2::from_shape_vec(like.shape(), data).map_err(|e| Error::Other(e.to_string()))?;
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_grid_keeps_meta() {
        let mut dem: Raster<f64> = Raster::new(2, 3);
        dem.set_transform(terraflow_core::GeoTransform::new(10.0, 20.0, 5.0, -5.0));
        let grid = into_grid(&dem, vec![1.0, 2.0, 3.0, 4.0, OUTPUT_NODATA, 6.0], OUTPUT_NODATA).unwrap();
        assert_eq!(grid.shape(), (2, 3));
        assert_eq!(grid.cell_size(), 5.0);
        assert_eq!(grid.value(0, 2), Some(3.0));
        assert_eq!(grid.value(1, 1), None);
    }

    #[test]
    fn test_into_grid_rejects_wrong_length() {
        let dem: Raster<f64> = Raster::new(2, 2);
        assert!(into_grid(&dem, vec![0_i32; 3], -1).is_err());
    }
}
