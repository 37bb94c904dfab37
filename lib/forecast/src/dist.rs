//! Normal distribution used to turn a 95% band into arbitrary quantiles
//!
//! Quantiles come from a rational first guess refined by Newton steps on the
//! CDF, and the CDF itself from a Chebyshev expansion of `erfc`.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

use crate::error::{ForecastError, ForecastResult};

/// Chebyshev coefficients of `erfc(z)·exp(z²)` in `t = 2 / (2 + z)`.
const ERFC_CHEBYSHEV: [f64; 28] = [
    -1.302_653_719_781_709_4,
    0.641_969_792_356_490_3,
    0.019_476_473_204_185_836,
    -0.009_561_514_786_808_63,
    -9.465_953_444_820_36e-4,
    3.668_394_978_527_61e-4,
    4.252_332_480_690_7e-5,
    -2.027_857_811_253_4e-5,
    -1.624_290_004_647e-6,
    1.303_655_835_580e-6,
    1.562_644_172_2e-8,
    -8.523_809_591_5e-8,
    6.529_054_439e-9,
    5.059_343_495e-9,
    -9.913_641_56e-10,
    -2.273_651_22e-10,
    9.646_791_1e-11,
    2.394_038e-12,
    -6.886_027e-12,
    8.944_87e-13,
    3.130_92e-13,
    -1.127_08e-13,
    3.81e-16,
    7.106e-15,
    -1.523e-15,
    -9.4e-17,
    1.21e-16,
    -2.8e-17,
];
const NEWTON_STEPS: usize = 8;
const NEWTON_TOLERANCE: f64 = 1e-14;

/// Complementary error function.
pub fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 2.0 / (2.0 + z);
    let ty = 4.0 * t - 2.0;
    // Clenshaw recurrence, highest order first
    let (d, dd) = ERFC_CHEBYSHEV[1..]
        .iter()
        .rev()
        .fold((0.0, 0.0), |(d, dd), c| (ty * d - dd + c, d));
    let tail = t * (-z * z + 0.5 * (ERFC_CHEBYSHEV[0] + ty * d) - dd).exp();
    if x >= 0.0 { tail } else { 2.0 - tail }
}

fn standard_cdf(z: f64) -> f64 {
    0.5 * erfc(-z * FRAC_1_SQRT_2)
}

fn standard_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * PI).sqrt()
}

/// Standard normal quantile of `p` in (0, 1).
fn standard_quantile(p: f64) -> f64 {
    let tail = p.min(1.0 - p);
    let t = (-2.0 * tail.ln()).sqrt();
    let guess = t - (2.30753 + 0.27061 * t) / (1.0 + t * (0.99229 + 0.04481 * t));
    let mut z = if p < 0.5 { -guess } else { guess };
    for _ in 0..NEWTON_STEPS {
        let density = standard_pdf(z);
        if density <= 0.0 {
            break;
        }
        let step = (standard_cdf(z) - p) / density;
        z -= step;
        if step.abs() < NEWTON_TOLERANCE {
            break;
        }
    }
    z
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalDist {
    mu: f64,
    sigma: f64,
}

impl Default for NormalDist {
    fn default() -> Self {
        NormalDist { mu: 0.0, sigma: 1.0 }
    }
}

impl NormalDist {
    pub fn new(mu: f64, sigma: f64) -> ForecastResult<Self> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(ForecastError::invalid(
                "sigma",
                format!("{sigma} must be positive"),
            ));
        }
        Ok(NormalDist { mu, sigma })
    }

    pub fn cdf(&self, x: f64) -> f64 {
        standard_cdf((x - self.mu) / self.sigma)
    }

    pub fn inv_cdf(&self, p: f64) -> ForecastResult<f64> {
        if !(p > 0.0 && p < 1.0) {
            return Err(ForecastError::invalid(
                "p",
                format!("probability must be in (0, 1), got {p}"),
            ));
        }
        Ok(self.mu + self.sigma * standard_quantile(p))
    }
}
