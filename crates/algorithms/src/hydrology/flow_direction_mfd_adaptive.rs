//! Multiple maximum downslope gradient based flow direction (MMDGFD)
//!
//! Same slopes as [`MfdRouter`](super::flow_direction_mfd::MfdRouter), but
//! the convergence exponent is a function of the steepest local slope `g`:
//!
//!   p = 8.9·g + 1.1   for g < 1
//!   p = 10            otherwise
//!
//! Steep terrain concentrates flow (D8-like), gentle terrain disperses it.
//!
//! Reference:
//! Qin, C. et al. (2007). An adaptive approach to selecting a
//! flow-partition exponent for a multiple-flow-direction algorithm.
//! *International Journal of Geographical Information Science*, 21(4),
//! 443–458.

use super::flow_direction_mfd::{downslope_gradients, power_split};
use super::routing::{FlowRouter, FlowSplit};
use super::surface::Surface;

/// Exponent for a steepest slope `g` (drop over length).
pub fn adaptive_exponent(g: f64) -> f64 {
    if g < 1.0 {
        8.9 * g + 1.1
    } else {
        10.0
    }
}

/// MMDGFD router.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxGradientMfdRouter {
    contour_weighting: bool,
}

impl MaxGradientMfdRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scale diagonal weights by the diagonal contour length (√2/2).
    pub fn with_contour_weighting(mut self, enabled: bool) -> Self {
        self.contour_weighting = enabled;
        self
    }
}

impl FlowRouter for MaxGradientMfdRouter {
    fn route(&mut self, surface: &Surface<'_>, row: usize, col: usize) -> FlowSplit {
        let Some(z) = surface.elevation(row, col) else {
            return FlowSplit::none();
        };

        let tan = downslope_gradients(surface, row, col, z);
        let g = tan.iter().copied().fold(0.0_f64, f64::max);
        if g <= 0.0 {
            return FlowSplit::none();
        }

        power_split(&tan, adaptive_exponent(g), self.contour_weighting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydrology::flow_direction_mfd::MfdRouter;
    use approx::assert_relative_eq;
    use terraflow_core::raster::{Direction, Raster};

    fn grid(f: impl Fn(usize, usize) -> f64) -> Raster<f64> {
        let mut dem = Raster::new(5, 5);
        for row in 0..5 {
            for col in 0..5 {
                dem.set(row, col, f(row, col)).unwrap();
            }
        }
        dem
    }

    #[test]
    fn test_exponent_curve() {
        assert_relative_eq!(adaptive_exponent(0.0), 1.1);
        assert_relative_eq!(adaptive_exponent(0.5), 5.55, epsilon = 1e-12);
        assert_relative_eq!(adaptive_exponent(1.0), 10.0);
        assert_relative_eq!(adaptive_exponent(3.0), 10.0);
    }

    #[test]
    fn test_gentle_slope_matches_mfd_exponent() {
        // Steepest slope 0.01 gives p = 1.189
        let dem = grid(|row, _| 1.0 - 0.01 * row as f64);
        let surface = Surface::new(&dem);
        let adaptive = MaxGradientMfdRouter::new().route(&surface, 2, 2);
        let mfd = MfdRouter::new(adaptive_exponent(0.01)).route(&surface, 2, 2);
        for dir in Direction::ALL {
            assert_relative_eq!(adaptive.fraction(dir), mfd.fraction(dir), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_steep_terrain_concentrates_flow() {
        let gentle = grid(|row, col| 1.0 - 0.01 * (2 * row + col) as f64);
        let steep = grid(|row, col| 100.0 - 10.0 * (2 * row + col) as f64);
        let a = MaxGradientMfdRouter::new().route(&Surface::new(&gentle), 2, 2);
        let b = MaxGradientMfdRouter::new().route(&Surface::new(&steep), 2, 2);
        let main_a = a.fraction(a.dominant().unwrap());
        let main_b = b.fraction(b.dominant().unwrap());
        assert!(main_b > main_a, "{} should exceed {}", main_b, main_a);
        assert_relative_eq!(b.total(), 1.0, epsilon = 1e-12);
    }
}
