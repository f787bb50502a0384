//! D-infinity (D∞) flow routing
//!
//! The cell's aspect is a continuous angle. It falls inside one of the
//! eight 45° facets bounded by two neighbours; the flow is split between
//! those neighbours by the angular position inside the facet.
//!
//! The split is only used when both bounding neighbours are valid and
//! lower than the cell. Otherwise the router falls back to D8, and a flat
//! cell (no aspect) is routed with D8 too.
//!
//! Reference:
//! Tarboton, D.G. (1997). A new method for the determination of flow
//! directions and upslope areas in grid digital elevation models.
//! *Water Resources Research*, 33(2), 309–319.

use std::f64::consts::FRAC_PI_4;
use terraflow_core::raster::Direction;

use super::routing::{FlowRouter, FlowSplit};
use super::surface::Surface;

/// D-infinity router.
#[derive(Debug, Clone, Copy, Default)]
pub struct DInfRouter;

impl DInfRouter {
    /// Facet index and position within the facet (`0..1`) for an aspect.
    pub fn facet(aspect: f64) -> (Direction, f64) {
        let i = (aspect / FRAC_PI_4).floor() as i64;
        let f = (aspect % FRAC_PI_4) / FRAC_PI_4;
        (Direction::wrapping(i), f)
    }
}

impl FlowRouter for DInfRouter {
    fn route(&mut self, surface: &Surface<'_>, row: usize, col: usize) -> FlowSplit {
        let Some(z) = surface.elevation(row, col) else {
            return FlowSplit::none();
        };

        let aspect = surface.gradient(row, col).and_then(|g| g.aspect);
        if let Some(aspect) = aspect {
            let (a, f) = Self::facet(aspect);
            let b = a.rotate(1);
            let lower = |dir| {
                surface
                    .valid_neighbor(row, col, dir)
                    .is_some_and(|(_, _, zn)| zn < z)
            };
            if lower(a) && lower(b) {
                let mut split = FlowSplit::none();
                split.add(a, 1.0 - f);
                split.add(b, f);
                return split;
            }
        }

        surface
            .steepest_descent(row, col)
            .map_or_else(FlowSplit::none, FlowSplit::single)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use terraflow_core::raster::Raster;

    fn grid(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Raster<f64> {
        let mut dem = Raster::new(rows, cols);
        for row in 0..rows {
            for col in 0..cols {
                dem.set(row, col, f(row, col)).unwrap();
            }
        }
        dem
    }

    #[test]
    fn test_facet_lookup() {
        let (dir, f) = DInfRouter::facet(FRAC_PI_4 * 2.5);
        assert_eq!(dir, Direction::E);
        assert_relative_eq!(f, 0.5, epsilon = 1e-12);

        let (dir, f) = DInfRouter::facet(0.0);
        assert_eq!(dir, Direction::N);
        assert_eq!(f, 0.0);
    }

    #[test]
    fn test_split_between_bounding_neighbours() {
        // Plane dipping towards azimuth ~112.5°: between E and SE
        let angle = 112.5_f64.to_radians();
        let (sx, sy) = (angle.sin(), angle.cos());
        // Elevation falls along (x east, y north) = (sx, sy)
        let dem = grid(5, 5, |row, col| {
            100.0 - (col as f64 * sx + -(row as f64) * sy)
        });

        let mut router = DInfRouter;
        let split = router.route(&Surface::new(&dem), 2, 2);
        assert_relative_eq!(split.total(), 1.0, epsilon = 1e-12);
        assert!(split.fraction(Direction::E) > 0.0);
        assert!(split.fraction(Direction::SE) > 0.0);
        assert_relative_eq!(
            split.fraction(Direction::E),
            split.fraction(Direction::SE),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_cardinal_aspect_sends_all_to_one_neighbour() {
        let dem = grid(5, 5, |_, col| 10.0 - col as f64);
        let split = DInfRouter.route(&Surface::new(&dem), 2, 2);
        assert_relative_eq!(split.fraction(Direction::E), 1.0, epsilon = 1e-12);
        assert_eq!(split.iter().count(), 1);
    }

    #[test]
    fn test_falls_back_to_d8() {
        // Centre of a 3x3 with only the SE corner lower
        let dem = grid(3, 3, |row, col| match (row, col) {
            (1, 1) => 5.0,
            (2, 2) => 1.0,
            _ => 9.0,
        });
        let split = DInfRouter.route(&Surface::new(&dem), 1, 1);
        assert_eq!(split, FlowSplit::single(Direction::SE));
    }

    #[test]
    fn test_flat_has_no_flow() {
        let dem = grid(3, 3, |_, _| 4.0);
        assert!(DInfRouter.route(&Surface::new(&dem), 1, 1).is_empty());
    }
}
