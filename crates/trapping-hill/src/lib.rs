//! # Trapping Hill
//!
//! Conventional concentration-response block and its calibration.
//!
//! ```text
//! response(c) = 1 / (1 + (c / IC50)^n)
//! ```
//!
//! [`HillOptimiser`] fits `(n, IC50)` to normalised peak currents by
//! Levenberg-Marquardt on `(n, ln IC50)`. Fitting is deterministic: the same
//! data and initial guess always give the same answer. A failed fit is a
//! [`FitResult::DidNotConverge`] marker, never a parameter pair.

use log::{debug, warn};
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use trapping_core::{Concentration, HillCurveParameters, IonScale, Result, TrappingError};

// =============================================================================
// MODEL
// =============================================================================

/// Fraction of current remaining at concentration `c`.
///
/// Exactly 1 at `c = 0` and for the no-effect curve.
pub fn response(params: &HillCurveParameters, c: Concentration) -> f64 {
    if c == 0.0 || params.is_no_effect() {
        return 1.0;
    }
    1.0 / (1.0 + (c / params.ic50).powf(params.hill_coef))
}

/// Two-parameter Hill model
#[derive(Debug, Clone, Copy, Default)]
pub struct HillModel;

impl HillModel {
    pub fn n_parameters(&self) -> usize {
        2
    }

    pub fn simulate(&self, params: &HillCurveParameters, concentrations: &[Concentration]) -> Vec<f64> {
        concentrations.iter().map(|&c| response(params, c)).collect()
    }
}

/// Conductance scale factors of every channel with literature Hill data for `drug`
pub fn ion_scale(drug: &str, concentration: Concentration) -> Result<IonScale> {
    let mut scale = IonScale::new();
    for (channel, curve) in trapping_library::hill_curves(drug)? {
        scale.set(channel, response(&curve, concentration));
    }
    Ok(scale)
}

// =============================================================================
// FIT RESULT
// =============================================================================

/// Outcome of a Hill curve fit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitResult {
    Converged(HillCurveParameters),
    DidNotConverge { reason: String },
}

impl FitResult {
    pub fn failed(reason: &str) -> Self {
        Self::DidNotConverge { reason: reason.to_string() }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged(_))
    }

    pub fn parameters(&self) -> Option<HillCurveParameters> {
        match self {
            Self::Converged(p) => Some(*p),
            Self::DidNotConverge { .. } => None,
        }
    }

    /// Fitted curve, or `FitDidNotConverge`
    pub fn into_result(self) -> Result<HillCurveParameters> {
        match self {
            Self::Converged(p) => Ok(p),
            Self::DidNotConverge { reason } => Err(TrappingError::FitDidNotConverge(reason)),
        }
    }

    /// `(Hill_coef, IC50)`; NaN twice for a failed fit
    pub fn to_values(&self) -> [f64; 2] {
        match self {
            Self::Converged(p) => [p.hill_coef, p.ic50],
            Self::DidNotConverge { .. } => [f64::NAN, f64::NAN],
        }
    }

    /// Inverse of [`FitResult::to_values`]; any NaN reads as a failed fit
    pub fn from_values(values: [f64; 2]) -> Self {
        if values.iter().any(|v| v.is_nan()) {
            Self::failed("recorded as not-a-number")
        } else {
            Self::Converged(HillCurveParameters::new(values[0], values[1]))
        }
    }

    /// Two-line text record `Hill_coef\nIC50\n`
    pub fn to_record(&self) -> String {
        self.to_values()
            .iter()
            .map(|v| if v.is_nan() { "nan".to_string() } else { v.to_string() })
            .map(|line| line + "\n")
            .collect()
    }

    pub fn from_record(text: &str) -> Result<Self> {
        let values = text
            .split_whitespace()
            .map(|token| {
                token
                    .to_ascii_lowercase()
                    .parse::<f64>()
                    .map_err(|e| TrappingError::ParseError(format!("'{}': {}", token, e)))
            })
            .collect::<Result<Vec<f64>>>()?;
        match values.as_slice() {
            [hill_coef, ic50] => Ok(Self::from_values([*hill_coef, *ic50])),
            _ => Err(TrappingError::ParseError(format!(
                "Hill record needs 2 values, found {}",
                values.len()
            ))),
        }
    }

    pub fn write_record<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_record())?;
        Ok(())
    }

    pub fn read_record<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_record(&fs::read_to_string(path)?)
    }
}

// =============================================================================
// OPTIMISER
// =============================================================================

/// Levenberg-Marquardt least-squares fit of a Hill curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HillOptimiser {
    pub max_iterations: usize,
    /// Relative change in cost or step at which the fit has converged
    pub tolerance: f64,
    /// Initial damping
    pub lambda: f64,
}

impl Default for HillOptimiser {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            tolerance: 1e-12,
            lambda: 1e-3,
        }
    }
}

const LAMBDA_MAX: f64 = 1e16;

/// Residuals and Jacobian rows in `(n, ln IC50)` coordinates
struct Problem<'a> {
    log_c: Vec<f64>,
    observed: &'a [f64],
    baseline: f64,
}

impl Problem<'_> {
    fn residuals(&self, theta: &Vector2<f64>) -> Vec<f64> {
        let mut r: Vec<f64> = self
            .log_c
            .iter()
            .zip(self.observed)
            .map(|(lc, y)| 1.0 / (1.0 + (theta[0] * (lc - theta[1])).exp()) - y)
            .collect();
        r.push(self.baseline);
        r
    }

    fn cost(&self, theta: &Vector2<f64>) -> f64 {
        self.residuals(theta).iter().map(|r| r * r).sum()
    }

    /// Normal matrix `J^T J` and gradient `J^T r`
    fn normal_equations(&self, theta: &Vector2<f64>) -> (Matrix2<f64>, Vector2<f64>) {
        let mut a = Matrix2::zeros();
        let mut g = Vector2::zeros();
        for (lc, y) in self.log_c.iter().zip(self.observed) {
            let f = 1.0 / (1.0 + (theta[0] * (lc - theta[1])).exp());
            let slope = f * (1.0 - f);
            let row = Vector2::new(-slope * (lc - theta[1]), slope * theta[0]);
            a += row * row.transpose();
            g += row * (f - y);
        }
        (a, g)
    }
}

impl HillOptimiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fit `(Hill_coef, IC50)` to normalised responses.
    ///
    /// Mismatched or empty input is an error. Degenerate data (constant
    /// response, fewer than two distinct positive concentrations) and
    /// numerical failure give [`FitResult::DidNotConverge`].
    pub fn fit(
        &self,
        concentrations: &[Concentration],
        responses: &[f64],
        initial_guess: Option<HillCurveParameters>,
    ) -> Result<FitResult> {
        if concentrations.len() != responses.len() || concentrations.is_empty() {
            return Err(TrappingError::InvalidSignal(format!(
                "{} concentrations for {} responses",
                concentrations.len(),
                responses.len()
            )));
        }
        if concentrations.iter().chain(responses).any(|v| !v.is_finite()) {
            return Ok(self.reject("non-finite input"));
        }
        if concentrations.iter().any(|c| *c < 0.0) {
            return Ok(self.reject("negative concentration"));
        }
        let (lo, hi) = responses
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &y| (lo.min(y), hi.max(y)));
        if hi - lo < 1e-12 {
            return Ok(self.reject("constant response"));
        }

        let mut positive: Vec<(f64, f64)> = concentrations
            .iter()
            .zip(responses)
            .filter(|(c, _)| **c > 0.0)
            .map(|(c, y)| (*c, *y))
            .collect();
        positive.sort_by(|a, b| a.0.total_cmp(&b.0));
        positive.dedup_by(|a, b| a.0 == b.0 && a.1 == b.1);
        if positive.windows(2).filter(|w| w[0].0 < w[1].0).count() < 1 {
            return Ok(self.reject("fewer than two distinct positive concentrations"));
        }

        // Zero-concentration points have a fixed residual
        let baseline = concentrations
            .iter()
            .zip(responses)
            .filter(|(c, _)| **c == 0.0)
            .map(|(_, y)| (1.0 - y) * (1.0 - y))
            .sum::<f64>()
            .sqrt();
        let observed: Vec<f64> = positive.iter().map(|(_, y)| *y).collect();
        let problem = Problem {
            log_c: positive.iter().map(|(c, _)| c.ln()).collect(),
            observed: &observed,
            baseline,
        };

        let guess = match initial_guess {
            Some(p) if p.hill_coef.is_finite() && p.ic50 > 0.0 => p,
            Some(p) => {
                return Err(TrappingError::InvalidConfig(format!(
                    "invalid initial guess {:?}",
                    p
                )))
            }
            None => HillCurveParameters::new(1.0, half_response_concentration(&positive)),
        };
        debug!("Hill fit from n = {}, IC50 = {}", guess.hill_coef, guess.ic50);
        Ok(self.minimise(&problem, Vector2::new(guess.hill_coef, guess.ic50.ln())))
    }

    fn reject(&self, reason: &str) -> FitResult {
        warn!("Hill fit rejected: {}", reason);
        FitResult::failed(reason)
    }

    fn minimise(&self, problem: &Problem<'_>, mut theta: Vector2<f64>) -> FitResult {
        let mut cost = problem.cost(&theta);
        let mut lambda = self.lambda;

        for iteration in 0..self.max_iterations {
            let (a, g) = problem.normal_equations(&theta);
            let mut accepted = false;
            while lambda <= LAMBDA_MAX {
                let damping = Matrix2::from_diagonal(&a.diagonal().map(|d| d.max(1e-12)));
                let Some(step) = (a + damping * lambda).lu().solve(&(-g)) else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate = theta + step;
                let candidate_cost = problem.cost(&candidate);
                if candidate_cost.is_finite() && candidate_cost < cost {
                    let improvement = cost - candidate_cost;
                    theta = candidate;
                    cost = candidate_cost;
                    lambda = (lambda / 10.0).max(1e-12);
                    accepted = true;
                    let small_step = step.norm() <= self.tolerance * (theta.norm() + self.tolerance);
                    if improvement <= self.tolerance * (1.0 + cost) || small_step {
                        return self.finish(theta, cost, iteration + 1);
                    }
                    break;
                }
                lambda *= 10.0;
            }
            if !accepted {
                // No downhill step at any damping: stationary point or failure
                if cost <= self.tolerance || g.norm() <= 1e-8 {
                    return self.finish(theta, cost, iteration + 1);
                }
                return self.reject("no descent direction");
            }
        }
        self.reject("iteration limit reached")
    }

    fn finish(&self, theta: Vector2<f64>, cost: f64, iterations: usize) -> FitResult {
        let params = HillCurveParameters::new(theta[0], theta[1].exp());
        if !params.hill_coef.is_finite() || !params.ic50.is_finite() || params.ic50 <= 0.0 {
            return self.reject("non-finite parameters");
        }
        debug!(
            "Hill fit converged after {} iterations: n = {}, IC50 = {}, cost = {:e}",
            iterations, params.hill_coef, params.ic50, cost
        );
        FitResult::Converged(params)
    }
}

/// Log-interpolated concentration where the response crosses 0.5.
///
/// Falls back to the geometric mean of the concentrations.
fn half_response_concentration(sorted: &[(f64, f64)]) -> f64 {
    for w in sorted.windows(2) {
        let ((c0, y0), (c1, y1)) = (w[0], w[1]);
        if (y0 - 0.5) * (y1 - 0.5) <= 0.0 && y0 != y1 {
            let s = (0.5 - y0) / (y1 - y0);
            return (c0.ln() + s * (c1.ln() - c0.ln())).exp();
        }
    }
    let mean_log = sorted.iter().map(|(c, _)| c.ln()).sum::<f64>() / sorted.len() as f64;
    mean_log.exp()
}
