//! Continuous piecewise-linear least squares with fixed breakpoints
//!
//! The regression basis is `[1, x - b0, (x - b1)+, ..., (x - b(n-2))+]`, so
//! the coefficients are an intercept, the first slope and one slope increment
//! per interior breakpoint. Value continuity at every breakpoint holds by
//! construction; derivative continuity does not.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::error::{ForecastError, ForecastResult};

const SINGULAR_EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Segment {
    pub start: i64,
    pub end: i64,
    pub slope: f64,
    /// Value of the line at day-index 0, not at `start`.
    pub intercept: f64,
}

impl Segment {
    pub fn predict(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PiecewiseModel {
    breaks: Vec<i64>,
    beta: Vec<f64>,
}

impl PiecewiseModel {
    pub fn new(breaks: Vec<i64>, beta: Vec<f64>) -> ForecastResult<Self> {
        if breaks.len() < 2 {
            return Err(ForecastError::invalid(
                "breaks",
                "at least two breakpoints are required",
            ));
        }
        if beta.len() != breaks.len() {
            return Err(ForecastError::invalid(
                "beta",
                format!("{} coefficients for {} breakpoints", beta.len(), breaks.len()),
            ));
        }
        Ok(PiecewiseModel { breaks, beta })
    }

    pub fn breakpoints(&self) -> &[i64] {
        &self.breaks
    }

    /// Intercept, first slope, then slope increments.
    pub fn coefficients(&self) -> &[f64] {
        &self.beta
    }

    pub fn num_segments(&self) -> usize {
        self.breaks.len() - 1
    }

    pub fn slope(&self, segment: usize) -> f64 {
        let last = segment.min(self.num_segments() - 1);
        self.beta[1..=last + 1].iter().sum()
    }

    pub fn predict(&self, x: f64) -> f64 {
        basis(&self.breaks, x)
            .iter()
            .zip(&self.beta)
            .map(|(a, b)| a * b)
            .sum()
    }

    pub fn segments(&self) -> Vec<Segment> {
        (0..self.num_segments())
            .map(|k| {
                let start = self.breaks[k];
                let slope = self.slope(k);
                Segment {
                    start,
                    end: self.breaks[k + 1],
                    slope,
                    intercept: self.predict(start as f64) - slope * start as f64,
                }
            })
            .collect()
    }

    /// Same model with the final segment's slope replaced; the value at the
    /// last interior breakpoint is unchanged.
    pub fn with_last_slope(&self, slope: f64) -> PiecewiseModel {
        let mut beta = self.beta.clone();
        let last = beta.len() - 1;
        if self.num_segments() == 1 {
            beta[last] = slope;
        } else {
            beta[last] = slope - self.slope(self.num_segments() - 2);
        }
        PiecewiseModel {
            breaks: self.breaks.clone(),
            beta,
        }
    }
}

/// A fitted model plus what is needed for its prediction variance.
#[derive(Debug, Clone)]
pub struct PiecewiseFit {
    pub model: PiecewiseModel,
    pub sigma2: f64,
    pub n_points: usize,
    xtx_pinv: DMatrix<f64>,
}

impl PiecewiseFit {
    /// Variance of the fitted mean at `x`: `sigma2 * a(x)' (A'A)^+ a(x)`.
    pub fn prediction_variance(&self, x: f64) -> f64 {
        let a = DVector::from_vec(basis(self.model.breakpoints(), x));
        let quad = a.dot(&(&self.xtx_pinv * &a));
        (self.sigma2 * quad).max(0.0)
    }
}

/// Least-squares fit of a continuous piecewise-linear function.
///
/// Solved through the SVD, so a segment that holds no data receives the
/// minimum-norm solution (no slope change) instead of a singular system.
pub fn fit_with_breaks(x: &[f64], y: &[f64], breaks: &[i64]) -> ForecastResult<PiecewiseFit> {
    if x.len() != y.len() {
        return Err(ForecastError::InvalidSeries(format!(
            "{} regressors but {} targets",
            x.len(),
            y.len()
        )));
    }
    if x.is_empty() {
        return Err(ForecastError::insufficient(
            "piecewise fit",
            "no data points to fit",
        ));
    }
    if breaks.len() < 2 {
        return Err(ForecastError::invalid(
            "breaks",
            "at least two breakpoints are required",
        ));
    }
    let n = x.len();
    let p = breaks.len();
    let rows: Vec<Vec<f64>> = x.iter().map(|x| basis(breaks, *x)).collect();
    let a = DMatrix::from_fn(n, p, |i, j| rows[i][j]);
    let b = DVector::from_column_slice(y);

    let beta = a
        .clone()
        .svd(true, true)
        .solve(&b, SINGULAR_EPS)
        .map_err(|e| ForecastError::Numerical(format!("least squares failed: {e}")))?;
    if beta.iter().any(|v| !v.is_finite()) {
        return Err(ForecastError::Numerical(
            "least squares produced non-finite coefficients".to_string(),
        ));
    }

    let residuals = &b - &a * &beta;
    let dof = n.saturating_sub(p).max(1);
    let sigma2 = residuals.norm_squared() / dof as f64;
    let xtx_pinv = (a.transpose() * &a)
        .pseudo_inverse(SINGULAR_EPS)
        .map_err(|e| ForecastError::Numerical(format!("covariance failed: {e}")))?;

    Ok(PiecewiseFit {
        model: PiecewiseModel {
            breaks: breaks.to_vec(),
            beta: beta.iter().copied().collect(),
        },
        sigma2,
        n_points: n,
        xtx_pinv,
    })
}

fn basis(breaks: &[i64], x: f64) -> Vec<f64> {
    let mut row = Vec::with_capacity(breaks.len());
    row.push(1.0);
    row.push(x - breaks[0] as f64);
    for b in &breaks[1..breaks.len() - 1] {
        row.push((x - *b as f64).max(0.0));
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hinge(x: f64) -> f64 {
        if x < 20.0 { 1.0 + 0.2 * x } else { 5.0 - 0.1 * (x - 20.0) }
    }

    #[test]
    fn test_recovers_exact_hinge() {
        let x: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|x| hinge(*x)).collect();
        let fit = fit_with_breaks(&x, &y, &[0, 20, 60]).expect("fit should succeed");
        let model = &fit.model;
        assert_eq!(model.num_segments(), 2);
        assert!((model.slope(0) - 0.2).abs() < 1e-9);
        assert!((model.slope(1) + 0.1).abs() < 1e-9);
        assert!((model.predict(50.0) - hinge(50.0)).abs() < 1e-8);
        assert!(fit.sigma2 < 1e-12);
    }

    #[test]
    fn test_segments_are_continuous() {
        let x: Vec<f64> = (0..45).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .map(|x| (x * 0.37).sin() + 0.05 * x)
            .collect();
        let fit = fit_with_breaks(&x, &y, &[0, 12, 25, 31, 70]).expect("fit should succeed");
        let segments = fit.model.segments();
        assert_eq!(segments.len(), 4);
        for pair in segments.windows(2) {
            let at = pair[0].end as f64;
            assert!((pair[0].predict(at) - pair[1].predict(at)).abs() < 1e-9);
        }
        for s in &segments {
            let mid = (s.start + s.end) as f64 / 2.0;
            assert!((s.predict(mid) - fit.model.predict(mid)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_empty_segment_keeps_previous_slope() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|x| 2.0 + 0.3 * x).collect();
        let fit = fit_with_breaks(&x, &y, &[0, 25, 50]).expect("fit should succeed");
        assert!((fit.model.slope(1) - 0.3).abs() < 1e-9);
        assert!(fit.prediction_variance(40.0).is_finite());
    }

    #[test]
    fn test_with_last_slope_preserves_breakpoint_value() {
        let model = PiecewiseModel::new(vec![0, 10, 30], vec![1.0, 0.5, -0.2]).expect("valid model");
        let before = model.predict(10.0);
        let changed = model.with_last_slope(-0.54);
        assert!((changed.slope(1) + 0.54).abs() < 1e-12);
        assert!((changed.predict(10.0) - before).abs() < 1e-12);
        assert_eq!(changed.slope(0), model.slope(0));
    }

    #[test]
    fn test_prediction_variance_grows_outside_data() {
        let x: Vec<f64> = (0..30).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, x)| 1.0 + 0.1 * x + if i % 2 == 0 { 0.05 } else { -0.05 })
            .collect();
        let fit = fit_with_breaks(&x, &y, &[0, 60]).expect("fit should succeed");
        let inside = fit.prediction_variance(15.0);
        let outside = fit.prediction_variance(55.0);
        assert!(inside > 0.0);
        assert!(outside > inside);
    }

    #[test]
    fn test_fit_requires_points() {
        let err = fit_with_breaks(&[], &[], &[0, 10]).expect_err("empty fit must fail");
        assert!(err.is_insufficient_data());
    }
}
