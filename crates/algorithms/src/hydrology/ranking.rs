//! Elevation ranking index
//!
//! A permutation of all valid cells sorted by elevation. Top-down passes
//! walk it from the highest cell to the lowest, so every cell is final
//! before anything leaves it; upslope passes walk it the other way.
//!
//! Ties are broken by row-major position (ascending in both orders), so
//! rebuilding the index on an unchanged grid yields the same permutation.

use crate::maybe_rayon::*;
use std::cmp::Ordering;
use terraflow_core::raster::{GridTopology, Raster};
use terraflow_core::{Error, Result};

/// Grids smaller than this are sorted without spawning parallel work.
const PARALLEL_SORT_MIN: usize = 1 << 16;

/// Processing order of an [`ElevationIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Highest cell first
    Descending,
    /// Lowest cell first
    Ascending,
}

/// Sorted list of valid cells.
#[derive(Debug, Clone)]
pub struct ElevationIndex {
    cells: Vec<usize>,
    topology: GridTopology,
    order: SortOrder,
}

impl ElevationIndex {
    /// Rank every valid cell of `dem`.
    ///
    /// An all-no-data grid gives an empty index, not an error.
    pub fn build(dem: &Raster<f64>, order: SortOrder) -> Result<Self> {
        let (rows, cols) = dem.shape();
        let topology = GridTopology::new(rows, cols, dem.cell_size());

        let mut keys: Vec<(f64, usize)> = Vec::new();
        keys.try_reserve_exact(topology.len())
            .map_err(|_| Error::Allocation {
                what: "elevation index",
                cells: topology.len(),
            })?;

        for ((row, col), &z) in dem.data().indexed_iter() {
            if !dem.is_nodata(z) {
                keys.push((z, topology.index(row, col)));
            }
        }

        let compare = move |a: &(f64, usize), b: &(f64, usize)| -> Ordering {
            let by_z = match order {
                SortOrder::Descending => b.0.total_cmp(&a.0),
                SortOrder::Ascending => a.0.total_cmp(&b.0),
            };
            by_z.then(a.1.cmp(&b.1))
        };

        if keys.len() >= PARALLEL_SORT_MIN {
            keys.par_sort_unstable_by(compare);
        } else {
            keys.sort_unstable_by(compare);
        }

        Ok(Self {
            cells: keys.into_iter().map(|(_, i)| i).collect(),
            topology,
            order,
        })
    }

    /// Number of ranked (valid) cells
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn order(&self) -> SortOrder {
        self.order
    }

    /// Coordinates of the `k`-th ranked cell
    pub fn nth(&self, k: usize) -> Option<(usize, usize)> {
        self.cells.get(k).map(|&i| self.topology.coords(i))
    }

    /// Cells in rank order
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.cells.iter().map(move |&i| self.topology.coords(i))
    }

    /// Linear cell ids in rank order
    pub fn as_slice(&self) -> &[usize] {
        &self.cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dem_from(values: &[f64], rows: usize, cols: usize) -> Raster<f64> {
        let mut dem = Raster::from_vec(values.to_vec(), rows, cols).unwrap();
        dem.set_nodata(Some(-9999.0));
        dem
    }

    #[test]
    fn test_descending_order_with_ties() {
        let dem = dem_from(&[3.0, 5.0, 5.0, 1.0, -9999.0, 5.0], 2, 3);
        let index = ElevationIndex::build(&dem, SortOrder::Descending).unwrap();

        assert_eq!(index.len(), 5, "No-data cells must be excluded");
        let order: Vec<_> = index.iter().collect();
        assert_eq!(order, vec![(0, 1), (0, 2), (1, 2), (0, 0), (1, 0)]);
    }

    #[test]
    fn test_ascending_order_with_ties() {
        let dem = dem_from(&[3.0, 5.0, 5.0, 1.0, -9999.0, 5.0], 2, 3);
        let index = ElevationIndex::build(&dem, SortOrder::Ascending).unwrap();
        let order: Vec<_> = index.iter().collect();
        assert_eq!(order, vec![(1, 0), (0, 0), (0, 1), (0, 2), (1, 2)]);
        assert_eq!(index.nth(0), Some((1, 0)));
        assert_eq!(index.nth(5), None);
    }

    #[test]
    fn test_all_nodata_is_empty() {
        let dem = dem_from(&[-9999.0; 4], 2, 2);
        let index = ElevationIndex::build(&dem, SortOrder::Descending).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_rebuild_is_identical() {
        let values: Vec<f64> = (0..400).map(|i| ((i * 37) % 11) as f64).collect();
        let dem = dem_from(&values, 20, 20);
        let a = ElevationIndex::build(&dem, SortOrder::Descending).unwrap();
        let b = ElevationIndex::build(&dem, SortOrder::Descending).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
    }
}
