//! Per-segment robust regression used to discard anomalous points
//!
//! Each segment between consecutive breakpoints gets its own Huber
//! M-estimator fit, so a point is only an outlier relative to its own
//! segment. A segment that cannot be fitted contributes no outliers.

use tracing::debug;

use crate::error::{ForecastError, ForecastResult};

/// Residuals beyond `HUBER_EPSILON` scale units are down-weighted and,
/// at convergence, reported as outliers.
pub const HUBER_EPSILON: f64 = 1.35;
/// Consistency constant turning a median absolute residual into a sigma.
const MAD_TO_SIGMA: f64 = 0.6745;
const SCALE_FLOOR: f64 = 1e-8;
const MAX_ITER: usize = 100;
const TOLERANCE: f64 = 1e-10;
const MIN_SEGMENT_POINTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
}

impl LinearFit {
    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HuberFit {
    pub line: LinearFit,
    pub scale: f64,
    pub outliers: Vec<bool>,
    pub iterations: usize,
}

/// Huber regressor fitted by iteratively reweighted least squares.
#[derive(Debug, Clone, Copy)]
pub struct HuberRegressor {
    epsilon: f64,
    max_iter: usize,
    tolerance: f64,
}

impl Default for HuberRegressor {
    fn default() -> Self {
        HuberRegressor {
            epsilon: HUBER_EPSILON,
            max_iter: MAX_ITER,
            tolerance: TOLERANCE,
        }
    }
}

impl HuberRegressor {
    pub fn new(epsilon: f64) -> ForecastResult<Self> {
        if !epsilon.is_finite() || epsilon < 1.0 {
            return Err(ForecastError::invalid(
                "epsilon",
                format!("{epsilon} must be at least 1.0"),
            ));
        }
        Ok(HuberRegressor {
            epsilon,
            ..Default::default()
        })
    }

    pub fn fit(&self, x: &[f64], y: &[f64]) -> ForecastResult<HuberFit> {
        if x.len() != y.len() {
            return Err(ForecastError::InvalidSeries(format!(
                "{} regressors but {} targets",
                x.len(),
                y.len()
            )));
        }
        if x.len() < MIN_SEGMENT_POINTS {
            return Err(ForecastError::insufficient(
                "robust regression",
                format!("{} points, need {MIN_SEGMENT_POINTS}", x.len()),
            ));
        }
        if x.iter().chain(y).any(|v| !v.is_finite()) {
            return Err(ForecastError::Numerical("non-finite input".to_string()));
        }

        let mut weights = vec![1.0; x.len()];
        let mut line = weighted_line(x, y, &weights)?;
        let mut iterations = 0;
        while iterations < self.max_iter {
            iterations += 1;
            let residuals = residuals(&line, x, y);
            let cutoff = self.epsilon * robust_scale(&residuals);
            for (w, r) in weights.iter_mut().zip(&residuals) {
                *w = if r.abs() <= cutoff { 1.0 } else { cutoff / r.abs() };
            }
            let next = weighted_line(x, y, &weights)?;
            let change = (next.slope - line.slope)
                .abs()
                .max((next.intercept - line.intercept).abs());
            line = next;
            if change < self.tolerance {
                break;
            }
        }

        let residuals = residuals(&line, x, y);
        let scale = robust_scale(&residuals);
        let cutoff = self.epsilon * scale;
        let outliers = residuals.iter().map(|r| r.abs() > cutoff).collect();
        if !line.slope.is_finite() || !line.intercept.is_finite() {
            return Err(ForecastError::Numerical(
                "robust regression diverged".to_string(),
            ));
        }
        Ok(HuberFit {
            line,
            scale,
            outliers,
            iterations,
        })
    }
}

/// Flags outliers segment by segment. `points` must be sorted by day-index;
/// segments are `[b_k, b_{k+1})`, the last one closed.
pub fn outlier_mask(points: &[(i64, f64)], breaks: &[i64]) -> Vec<bool> {
    let regressor = HuberRegressor::default();
    let mut mask = vec![false; points.len()];
    let segments = breaks.len().saturating_sub(1);
    for k in 0..segments {
        let (lo, hi) = (breaks[k], breaks[k + 1]);
        let is_last = k + 1 == segments;
        let start = points.partition_point(|(x, _)| *x < lo);
        let end = if is_last {
            points.partition_point(|(x, _)| *x <= hi)
        } else {
            points.partition_point(|(x, _)| *x < hi)
        };
        if start >= end {
            continue;
        }
        let (x, y): (Vec<f64>, Vec<f64>) = points[start..end]
            .iter()
            .map(|(x, y)| (*x as f64, *y))
            .unzip();
        match regressor.fit(&x, &y) {
            Ok(fit) => {
                let flagged = fit.outliers.iter().filter(|o| **o).count();
                debug!(segment = k, points = x.len(), flagged, slope = fit.line.slope, "robust segment fit");
                mask[start..end].copy_from_slice(&fit.outliers);
            }
            Err(e) => {
                debug!(segment = k, points = x.len(), error = %e, "robust segment fit failed, keeping all points");
            }
        }
    }
    mask
}

fn residuals(line: &LinearFit, x: &[f64], y: &[f64]) -> Vec<f64> {
    x.iter().zip(y).map(|(x, y)| y - line.predict(*x)).collect()
}

fn robust_scale(residuals: &[f64]) -> f64 {
    let mut abs: Vec<f64> = residuals.iter().map(|r| r.abs()).collect();
    abs.sort_by(|a, b| a.total_cmp(b));
    let mid = abs.len() / 2;
    let median = if abs.is_empty() {
        0.0
    } else if abs.len() % 2 == 0 {
        (abs[mid - 1] + abs[mid]) / 2.0
    } else {
        abs[mid]
    };
    (median / MAD_TO_SIGMA).max(SCALE_FLOOR)
}

fn weighted_line(x: &[f64], y: &[f64], w: &[f64]) -> ForecastResult<LinearFit> {
    let sw: f64 = w.iter().sum();
    if sw <= 0.0 {
        return Err(ForecastError::Numerical("all weights vanished".to_string()));
    }
    let mx = x.iter().zip(w).map(|(x, w)| w * x).sum::<f64>() / sw;
    let my = y.iter().zip(w).map(|(y, w)| w * y).sum::<f64>() / sw;
    let (sxx, sxy) = x
        .iter()
        .zip(y)
        .zip(w)
        .fold((0.0, 0.0), |(sxx, sxy), ((x, y), w)| {
            (sxx + w * (x - mx) * (x - mx), sxy + w * (x - mx) * (y - my))
        });
    if sxx <= f64::EPSILON * sw {
        return Err(ForecastError::Numerical(
            "singular design: no spread in day-index".to_string(),
        ));
    }
    let slope = sxy / sxx;
    Ok(LinearFit {
        slope,
        intercept: my - slope * mx,
    })
}
