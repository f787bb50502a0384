//! Main Raster type

use crate::error::{Error, Result};
use crate::raster::{GeoTransform, RasterElement};
use ndarray::Array2;

/// A georeferenced 2D raster grid.
///
/// `Raster<T>` stores values of type `T` in a 2D grid with associated
/// geographic metadata and an optional no-data value. All grids used
/// together in one flow-routing run must share the same grid system
/// (shape, cell size and origin), see [`Raster::ensure_same_grid`].
///
/// # Example
///
/// ```ignore
/// use terraflow_core::Raster;
///
/// let mut dem: Raster<f64> = Raster::new(100, 100);
/// dem.set(10, 20, 42.0)?;
/// let z = dem.value(10, 20);
/// ```
#[derive(Debug, Clone)]
pub struct Raster<T: RasterElement> {
    /// Raster data stored in row-major order (row, col)
    data: Array2<T>,
    /// Affine transformation
    transform: GeoTransform,
    /// No-data value
    nodata: Option<T>,
}

impl<T: RasterElement> Raster<T> {
    /// Create a new raster filled with zeros
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: Array2::zeros((rows, cols)),
            transform: GeoTransform::default(),
            nodata: None,
        }
    }

    /// Create a new raster filled with a specific value
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self {
            data: Array2::from_elem((rows, cols), value),
            transform: GeoTransform::default(),
            nodata: None,
        }
    }

    /// Create a raster from row-major data
    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidDimensions {
                width: cols,
                height: rows,
            });
        }

        let array = Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| Error::Other(e.to_string()))?;

        Ok(Self::from_array(array))
    }

    /// Create a raster from an ndarray
    pub fn from_array(data: Array2<T>) -> Self {
        Self {
            data,
            transform: GeoTransform::default(),
            nodata: None,
        }
    }

    /// Create a zero-filled raster with the same grid system but a different data type
    pub fn with_same_meta<U: RasterElement>(&self) -> Raster<U> {
        Raster {
            data: Array2::zeros(self.data.dim()),
            transform: self.transform,
            nodata: None,
        }
    }

    /// Create a raster with the same grid system, filled with a value
    pub fn like(&self, fill_value: T) -> Self {
        Self {
            data: Array2::from_elem(self.data.dim(), fill_value),
            transform: self.transform,
            nodata: self.nodata,
        }
    }

    // Dimensions

    /// Number of rows
    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Dimensions as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the raster is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // Data access

    /// Get value at (row, col)
    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        self.data
            .get((row, col))
            .copied()
            .ok_or(Error::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            })
    }

    /// Valid value at (row, col); `None` when off-grid or no-data
    pub fn value(&self, row: usize, col: usize) -> Option<T> {
        let v = self.data.get((row, col)).copied()?;
        if v.is_nodata(self.nodata) {
            None
        } else {
            Some(v)
        }
    }

    /// Whether (row, col) is in-grid and holds a valid value
    pub fn is_valid(&self, row: usize, col: usize) -> bool {
        self.value(row, col).is_some()
    }

    /// Set value at (row, col)
    pub fn set(&mut self, row: usize, col: usize, value: T) -> Result<()> {
        if row >= self.rows() || col >= self.cols() {
            return Err(Error::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            });
        }
        self.data[(row, col)] = value;
        Ok(())
    }

    /// Get a reference to the underlying array
    pub fn data(&self) -> &Array2<T> {
        &self.data
    }

    /// Get a mutable reference to the underlying array
    pub fn data_mut(&mut self) -> &mut Array2<T> {
        &mut self.data
    }

    // Metadata

    /// Get the geotransform
    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    /// Set the geotransform
    pub fn set_transform(&mut self, transform: GeoTransform) {
        self.transform = transform;
    }

    /// Get the no-data value
    pub fn nodata(&self) -> Option<T> {
        self.nodata
    }

    /// Set the no-data value
    pub fn set_nodata(&mut self, nodata: Option<T>) {
        self.nodata = nodata;
    }

    /// Cell size (assumes square cells)
    pub fn cell_size(&self) -> f64 {
        self.transform.cell_size()
    }

    /// Area of one cell
    pub fn cell_area(&self) -> f64 {
        self.transform.cell_area()
    }

    /// Check if a value is no-data
    pub fn is_nodata(&self, value: T) -> bool {
        value.is_nodata(self.nodata)
    }

    /// Convert geographic coordinates to the (row, col) of the containing cell
    pub fn geo_to_cell(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let (col, row) = self.transform.geo_to_pixel(x, y);
        if !col.is_finite() || !row.is_finite() || col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row.floor() as usize, col.floor() as usize);
        if row < self.rows() && col < self.cols() {
            Some((row, col))
        } else {
            None
        }
    }

    /// Check that `other` shares this raster's grid system.
    ///
    /// `name` identifies the offending input in the error.
    pub fn ensure_same_grid<U: RasterElement>(&self, other: &Raster<U>, name: &'static str) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::GridMismatch {
                name,
                reason: format!(
                    "shape ({}, {}) differs from elevation ({}, {})",
                    other.rows(),
                    other.cols(),
                    self.rows(),
                    self.cols()
                ),
            });
        }
        if !self.transform.approx_eq(other.transform()) {
            return Err(Error::GridMismatch {
                name,
                reason: format!(
                    "cell size {} / origin ({}, {}) differs from elevation {} / ({}, {})",
                    other.cell_size(),
                    other.transform().origin_x,
                    other.transform().origin_y,
                    self.cell_size(),
                    self.transform.origin_x,
                    self.transform.origin_y
                ),
            });
        }
        Ok(())
    }

    /// Count of cells holding a valid value
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nodata(self.nodata)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raster_creation() {
        let raster: Raster<f32> = Raster::new(100, 200);
        assert_eq!(raster.rows(), 100);
        assert_eq!(raster.cols(), 200);
        assert_eq!(raster.shape(), (100, 200));
    }

    #[test]
    fn test_raster_access() {
        let mut raster: Raster<f64> = Raster::new(10, 10);
        raster.set(5, 5, 42.0).unwrap();
        assert_eq!(raster.get(5, 5).unwrap(), 42.0);
        assert!(raster.set(10, 0, 1.0).is_err());
    }

    #[test]
    fn test_value_and_validity() {
        let mut raster: Raster<f64> = Raster::filled(3, 3, 1.0);
        raster.set_nodata(Some(-9999.0));
        raster.set(1, 1, -9999.0).unwrap();
        raster.set(0, 0, f64::NAN).unwrap();

        assert_eq!(raster.value(2, 2), Some(1.0));
        assert_eq!(raster.value(1, 1), None);
        assert_eq!(raster.value(0, 0), None);
        assert_eq!(raster.value(3, 0), None);
        assert!(!raster.is_valid(1, 1));
        assert_eq!(raster.valid_count(), 7);
    }

    #[test]
    fn test_ensure_same_grid() {
        let mut dem: Raster<f64> = Raster::new(4, 5);
        dem.set_transform(GeoTransform::new(0.0, 4.0, 1.0, -1.0));

        let mut weights: Raster<f64> = dem.like(1.0);
        assert!(dem.ensure_same_grid(&weights, "weights").is_ok());

        weights.set_transform(GeoTransform::new(0.0, 4.0, 2.0, -2.0));
        assert!(matches!(
            dem.ensure_same_grid(&weights, "weights"),
            Err(Error::GridMismatch { name: "weights", .. })
        ));

        let other: Raster<i32> = Raster::new(5, 4);
        assert!(dem.ensure_same_grid(&other, "routes").is_err());
    }

    #[test]
    fn test_geo_to_cell() {
        let mut dem: Raster<f64> = Raster::new(10, 10);
        dem.set_transform(GeoTransform::new(100.0, 200.0, 10.0, -10.0));
        assert_eq!(dem.geo_to_cell(105.0, 195.0), Some((0, 0)));
        assert_eq!(dem.geo_to_cell(155.0, 125.0), Some((7, 5)));
        assert_eq!(dem.geo_to_cell(95.0, 195.0), None);
    }
}
