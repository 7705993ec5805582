//! # Trapping Compare
//!
//! Compares action potential durations from the state-dependent (SD) binding
//! model with those of a conductance-scaling (CS) surrogate whose Hill curve
//! is calibrated on the SD channel model.
//!
//! For one drug:
//!
//! 1. Concentrations are rescaled by `EC50^(1/N)` so the binding EC50 is 1.
//! 2. The channel model is paced across a grid around the expected half-block
//!    concentration and the last-pulse peaks are min-max normalised.
//! 3. A Hill curve is fitted to the normalised peaks.
//! 4. Both action potential models are paced across a grid spanning the same
//!    range and APD90 is extracted from each run.
//! 5. RMSE and mean error summarise the difference.
//!
//! A failed fit makes every downstream value NaN. A failed simulation makes
//! only its own point NaN.

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use trapping_core::{
    logspace, Concentration, KineticParameters, Model, Result, SignalLog, SimulationConfig,
    Time, TrappingError,
};
use trapping_hill::{FitResult, HillOptimiser};
use trapping_kinetics::{extract_peak, Apd90Strategy, BindingKinetics};

/// Membrane potential of the action potential model
pub const DEFAULT_VOLTAGE: &str = "membrane.V";

// =============================================================================
// SETTINGS
// =============================================================================

/// Sweep sizes and solver settings of a comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonSettings {
    /// Pulses of each channel run; only the last one is recorded
    pub channel_pulses: usize,
    /// Pulses of each action potential run
    pub ap_pulses: usize,
    /// Trailing action potential pulses recorded for APD90
    pub ap_pulses_kept: usize,
    /// Points of the action potential concentration grid
    pub apd_points: usize,
    /// Points of the channel grid, zero concentration included
    pub hill_points: usize,
    /// Stimulus time within each action potential pulse (ms)
    pub offset: Time,
    /// Decades either side of the expected half-block concentration
    pub decades: f64,
    /// Run sweep points and drugs on the rayon pool
    pub parallel: bool,
    /// Timestep and tolerances of the channel runs.
    ///
    /// Its `pulses_to_discard` and `pulses_to_keep` are ignored and replaced
    /// by `channel_pulses` and a single kept pulse.
    pub channel_config: SimulationConfig,
    /// Timestep and tolerances of the action potential runs.
    ///
    /// Its pulse counts are ignored and replaced by `ap_pulses` and
    /// `ap_pulses_kept`.
    pub ap_config: SimulationConfig,
    pub apd_strategy: Apd90Strategy,
}

impl Default for ComparisonSettings {
    fn default() -> Self {
        Self {
            channel_pulses: 1000,
            ap_pulses: 1000,
            ap_pulses_kept: 2,
            apd_points: 20,
            hill_points: 20,
            offset: 50.0,
            decades: 3.0,
            parallel: false,
            channel_config: SimulationConfig::default().with_tolerance(1e-7, 1e-8),
            ap_config: SimulationConfig::default().with_tolerance(1e-7, 1e-10),
            apd_strategy: Apd90Strategy::default(),
        }
    }
}

impl ComparisonSettings {
    pub fn validate(&self) -> Result<()> {
        if self.hill_points < 3 {
            return Err(TrappingError::InvalidConfig(format!(
                "channel grid needs at least 3 points, got {}",
                self.hill_points
            )));
        }
        if self.apd_points == 0 {
            return Err(TrappingError::InvalidConfig(
                "action potential grid needs at least one point".into(),
            ));
        }
        if !(self.decades > 0.0) || !self.decades.is_finite() {
            return Err(TrappingError::InvalidConfig(format!(
                "decades must be positive, got {}",
                self.decades
            )));
        }
        if !(self.offset >= 0.0) {
            return Err(TrappingError::InvalidConfig(format!(
                "stimulus offset must be non-negative, got {}",
                self.offset
            )));
        }
        self.channel_run_config()?.validate()?;
        self.ap_run_config()?.validate()
    }

    /// Channel run configuration; the pulse counts come from the settings
    pub fn channel_run_config(&self) -> Result<SimulationConfig> {
        self.channel_config.clone().with_pulses(self.channel_pulses, 1)
    }

    /// Action potential run configuration; the pulse counts come from the settings
    pub fn ap_run_config(&self) -> Result<SimulationConfig> {
        self.ap_config
            .clone()
            .with_pulses(self.ap_pulses, self.ap_pulses_kept)
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// APD90 of both models at one concentration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRecord {
    /// Normalised concentration
    pub concentration: Concentration,
    #[serde(rename = "APD90_detailed")]
    pub apd90_detailed: f64,
    #[serde(rename = "APD90_simplified")]
    pub apd90_simplified: f64,
}

impl ComparisonRecord {
    fn missing(concentration: Concentration) -> Self {
        Self {
            concentration,
            apd90_detailed: f64::NAN,
            apd90_simplified: f64::NAN,
        }
    }
}

/// Channel sweep and the Hill curve fitted to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HillCalibration {
    /// Normalised concentrations, starting at zero
    pub concentrations: Vec<Concentration>,
    /// Last-pulse peak current at each concentration
    pub peaks: Vec<f64>,
    /// Peaks min-max scaled to `[0, 1]`
    pub normalised_peaks: Vec<f64>,
    pub fit: FitResult,
}

/// Per-drug comparison outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrugEvaluation {
    pub drug: String,
    /// Binding kinetics on the original concentration scale
    pub parameters: KineticParameters,
    /// `EC50^(1/N)`; multiply a normalised concentration by it to get nM
    pub normalising_constant: f64,
    pub calibration: HillCalibration,
    /// One record per action potential concentration, increasing
    pub records: Vec<ComparisonRecord>,
    pub rmse: f64,
    pub me: f64,
    /// The sweep was aborted before every point was issued
    pub cancelled: bool,
}

impl DrugEvaluation {
    /// Fitted `(Hill_coef, IC50)`, NaN twice for a failed fit
    pub fn hill_values(&self) -> [f64; 2] {
        self.calibration.fit.to_values()
    }

    pub fn ap_concentrations(&self) -> Vec<Concentration> {
        self.records.iter().map(|r| r.concentration).collect()
    }

    pub fn apd90_detailed(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.apd90_detailed).collect()
    }

    pub fn apd90_simplified(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.apd90_simplified).collect()
    }
}

// =============================================================================
// ERROR METRICS
// =============================================================================

fn differences(a: &[f64], b: &[f64]) -> Option<Vec<f64>> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| x - y).collect())
}

/// Root-mean-square difference; NaN if either side holds a NaN
pub fn rmse(a: &[f64], b: &[f64]) -> f64 {
    match differences(a, b) {
        Some(d) => (d.iter().map(|x| x * x).sum::<f64>() / d.len() as f64).sqrt(),
        None => f64::NAN,
    }
}

/// Mean signed difference `a - b`; NaN if either side holds a NaN
pub fn mean_error(a: &[f64], b: &[f64]) -> f64 {
    match differences(a, b) {
        Some(d) => d.iter().sum::<f64>() / d.len() as f64,
        None => f64::NAN,
    }
}

/// Min-max scaling to `[0, 1]`. A NaN or a constant series gives NaN.
pub fn normalise_peaks(peaks: &[f64]) -> Vec<f64> {
    let lo = peaks.iter().copied().fold(f64::INFINITY, nan_min);
    let hi = peaks.iter().copied().fold(f64::NEG_INFINITY, nan_max);
    let range = hi - lo;
    peaks
        .iter()
        .map(|p| if range > 0.0 { (p - lo) / range } else { f64::NAN })
        .collect()
}

fn nan_min(m: f64, v: f64) -> f64 {
    if m.is_nan() || v.is_nan() {
        f64::NAN
    } else {
        m.min(v)
    }
}

fn nan_max(m: f64, v: f64) -> f64 {
    if m.is_nan() || v.is_nan() {
        f64::NAN
    } else {
        m.max(v)
    }
}

/// Normalised concentration at which roughly half the channels are bound.
///
/// Solves `Kmax * x / (1 + x) = 1` for `x = D^N` with EC50 at 1. Drugs that
/// never reach half block centre on 1.
pub fn expected_half_block(params: &KineticParameters) -> Concentration {
    if params.kmax > 1.0 && params.n > 0.0 {
        (params.kmax - 1.0).powf(-1.0 / params.n)
    } else {
        1.0
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// SD vs CS comparison over one channel driver and one action potential driver
pub struct ModelComparison<C: Model, A: Model> {
    channel: BindingKinetics<C>,
    action_potential: BindingKinetics<A>,
    settings: ComparisonSettings,
    optimiser: HillOptimiser,
    current_variable: String,
    voltage_variable: String,
    abort: Arc<AtomicBool>,
}

impl<C: Model, A: Model> ModelComparison<C, A> {
    /// Comparison recording `<head>.IKr` on the channel model and
    /// [`DEFAULT_VOLTAGE`] on the action potential model
    pub fn new(
        channel: BindingKinetics<C>,
        action_potential: BindingKinetics<A>,
        settings: ComparisonSettings,
    ) -> Result<Self> {
        let current = format!("{}.IKr", channel.current_head());
        Self::with_signals(channel, action_potential, settings, &current, DEFAULT_VOLTAGE)
    }

    pub fn with_signals(
        channel: BindingKinetics<C>,
        action_potential: BindingKinetics<A>,
        settings: ComparisonSettings,
        current_variable: &str,
        voltage_variable: &str,
    ) -> Result<Self> {
        settings.validate()?;
        channel.model().get(current_variable)?;
        action_potential.model().get(voltage_variable)?;
        Ok(Self {
            channel,
            action_potential,
            settings,
            optimiser: HillOptimiser::new(),
            current_variable: current_variable.to_string(),
            voltage_variable: voltage_variable.to_string(),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_optimiser(mut self, optimiser: HillOptimiser) -> Self {
        self.optimiser = optimiser;
        self
    }

    pub fn settings(&self) -> &ComparisonSettings {
        &self.settings
    }

    /// Flag that stops further sweep points from being issued once set
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn is_cancelled(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Channel grid: zero, then log-spaced points around the expected half block
    pub fn channel_concentrations(&self, params: &KineticParameters) -> Vec<Concentration> {
        let centre = expected_half_block(&params.normalised()).log10();
        let mut grid = vec![0.0];
        grid.extend(logspace(
            centre - self.settings.decades,
            centre + self.settings.decades,
            self.settings.hill_points - 1,
        ));
        grid
    }

    /// Action potential grid spanning the positive part of `channel_grid`
    pub fn ap_concentrations(&self, channel_grid: &[Concentration]) -> Vec<Concentration> {
        let lowest = channel_grid.iter().copied().find(|c| *c > 0.0).unwrap_or(1.0);
        let highest = channel_grid.iter().copied().fold(lowest, f64::max);
        logspace(lowest.log10(), highest.log10(), self.settings.apd_points)
    }

    /// Pace the channel model across its grid and fit a Hill curve to the peaks
    pub fn calibrate(&self, params: &KineticParameters) -> Result<HillCalibration> {
        let normalised = params.normalised();
        let config = self
            .settings
            .channel_run_config()?
            .with_variables(&[self.current_variable.as_str()]);
        let concentrations = self.channel_concentrations(params);

        let peaks = self.sweep(&concentrations, |c| {
            let log = self
                .channel
                .run_custom_parameter_simulation(&normalised, c, &config, None)?;
            Ok(extract_peak(&log, &self.current_variable)?.last())
        })?;
        let normalised_peaks = normalise_peaks(&peaks);

        let fit = if normalised_peaks.iter().any(|p| p.is_nan()) {
            FitResult::failed("peak currents are constant or missing")
        } else {
            self.optimiser.fit(&concentrations, &normalised_peaks, None)?
        };
        match &fit {
            FitResult::Converged(p) => {
                debug!("Hill curve: n = {:.4}, IC50 = {:.4e}", p.hill_coef, p.ic50)
            }
            FitResult::DidNotConverge { reason } => warn!("Hill fit failed: {}", reason),
        }
        Ok(HillCalibration {
            concentrations,
            peaks,
            normalised_peaks,
            fit,
        })
    }

    /// APD90 of the SD and CS action potential models at each concentration
    pub fn apd_sweep(
        &self,
        params: &KineticParameters,
        fit: &FitResult,
        concentrations: &[Concentration],
    ) -> Result<Vec<ComparisonRecord>> {
        let Some(hill) = fit.parameters() else {
            return Ok(concentrations.iter().map(|c| ComparisonRecord::missing(*c)).collect());
        };
        let normalised = params.normalised();
        let config = self
            .settings
            .ap_run_config()?
            .with_variables(&[self.voltage_variable.as_str()]);
        let base = self.action_potential.base_conductance();

        let detailed = self.sweep(concentrations, |c| {
            let log = self
                .action_potential
                .run_custom_parameter_simulation(&normalised, c, &config, None)?;
            self.apd90(&log, &config)
        })?;
        let simplified = self.sweep(concentrations, |c| {
            let conductance = base * trapping_hill::response(&hill, c);
            let log = self
                .action_potential
                .run_conductance_simulation(conductance, &config, None)?;
            self.apd90(&log, &config)
        })?;

        Ok(concentrations
            .iter()
            .zip(detailed.into_iter().zip(simplified))
            .map(|(c, (d, s))| ComparisonRecord {
                concentration: *c,
                apd90_detailed: d,
                apd90_simplified: s,
            })
            .collect())
    }

    /// Full comparison for arbitrary binding kinetics
    pub fn evaluate_parameters(&self, drug: &str, params: &KineticParameters) -> Result<DrugEvaluation> {
        if !params.is_finite() || !(params.n > 0.0) || !(params.ec50 > 0.0) {
            return Err(TrappingError::InvalidConfig(format!(
                "{}: kinetics {:?} cannot be normalised",
                drug,
                params.values()
            )));
        }
        info!("comparing SD and CS models for {}", drug);

        let calibration = self.calibrate(params)?;
        let ap_grid = self.ap_concentrations(&calibration.concentrations);
        let records = self.apd_sweep(params, &calibration.fit, &ap_grid)?;

        let detailed: Vec<f64> = records.iter().map(|r| r.apd90_detailed).collect();
        let simplified: Vec<f64> = records.iter().map(|r| r.apd90_simplified).collect();
        let rmse = rmse(&detailed, &simplified);
        let me = mean_error(&detailed, &simplified);
        if rmse.is_nan() {
            warn!("{}: APD90 difference is not a number", drug);
        } else {
            info!("{}: RMSE = {:.3} ms, ME = {:.3} ms", drug, rmse, me);
        }

        Ok(DrugEvaluation {
            drug: drug.to_string(),
            parameters: *params,
            normalising_constant: params.normalising_constant(),
            calibration,
            records,
            rmse,
            me,
            cancelled: self.is_cancelled(),
        })
    }

    /// Full comparison for a library drug
    pub fn evaluate_drug(&self, drug: &str) -> Result<DrugEvaluation> {
        let params = trapping_library::binding_parameters(drug)?.kinetics;
        self.evaluate_parameters(drug, &params)
    }

    /// Compare several library drugs; a failure affects its own entry only
    pub fn evaluate_drugs(&self, drugs: &[&str]) -> Vec<(String, Result<DrugEvaluation>)> {
        let evaluate = |drug: &&str| {
            let result = self.evaluate_drug(drug);
            if let Err(e) = &result {
                warn!("{}: {}", drug, e);
            }
            (drug.to_string(), result)
        };
        if self.settings.parallel {
            drugs.par_iter().map(evaluate).collect()
        } else {
            drugs.iter().map(evaluate).collect()
        }
    }

    /// Largest APD90 over the recorded pulses; NaN pulses propagate
    fn apd90(&self, log: &SignalLog, config: &SimulationConfig) -> Result<f64> {
        let period = self.action_potential.protocol_period(config);
        let per_pulse = self.settings.apd_strategy.per_pulse(
            log,
            &self.voltage_variable,
            self.settings.offset,
            period,
            config.timestep,
        )?;
        if per_pulse.is_empty() {
            return Ok(f64::NAN);
        }
        Ok(per_pulse.into_iter().fold(f64::NEG_INFINITY, nan_max))
    }

    /// Run `task` at every concentration.
    ///
    /// Local failures and points skipped after an abort are NaN. Any other
    /// error stops the sweep.
    fn sweep<F>(&self, concentrations: &[Concentration], task: F) -> Result<Vec<f64>>
    where
        F: Fn(Concentration) -> Result<f64> + Sync + Send,
    {
        let point = |c: &Concentration| -> Result<f64> {
            if self.is_cancelled() {
                return Ok(f64::NAN);
            }
            match task(*c) {
                Ok(v) => Ok(v),
                Err(e) if e.is_local() => {
                    warn!("concentration {:.4e}: {}", c, e);
                    Ok(f64::NAN)
                }
                Err(e) => Err(e),
            }
        };
        if self.settings.parallel {
            concentrations.par_iter().map(point).collect()
        } else {
            concentrations.iter().map(point).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_error_metrics() {
        let a = [1.0, 2.0, 3.0];
        let b = [1.0, 1.0, 1.0];
        assert_relative_eq!(rmse(&a, &b), (5.0f64 / 3.0).sqrt());
        assert_relative_eq!(mean_error(&a, &b), 1.0);
        assert_eq!(rmse(&a, &a), 0.0);
    }

    #[test]
    fn test_metrics_propagate_nan() {
        let a = [1.0, f64::NAN, 3.0];
        let b = [1.0, 2.0, 3.0];
        assert!(rmse(&a, &b).is_nan());
        assert!(mean_error(&b, &a).is_nan());
        assert!(rmse(&a[..1], &b).is_nan());
        assert!(mean_error(&[], &[]).is_nan());
    }

    #[test]
    fn test_normalise_peaks() {
        let peaks = normalise_peaks(&[4.0, 3.0, 2.0]);
        assert_eq!(peaks, vec![1.0, 0.5, 0.0]);
        assert!(normalise_peaks(&[1.0, 1.0]).iter().all(|p| p.is_nan()));
        assert!(normalise_peaks(&[1.0, f64::NAN, 0.0]).iter().all(|p| p.is_nan()));
    }

    #[test]
    fn test_expected_half_block() {
        let p = KineticParameters::new(-1.0, 1e8 + 1.0, 1e-5, 1.0, 1.0);
        assert_relative_eq!(expected_half_block(&p), 1e-8, max_relative = 1e-12);
        let weak = KineticParameters::new(-1.0, 0.5, 1e-5, 1.0, 1.0);
        assert_eq!(expected_half_block(&weak), 1.0);
    }

    #[test]
    fn test_settings_defaults() {
        let s = ComparisonSettings::default();
        assert_eq!(s.channel_pulses, 1000);
        assert_eq!(s.ap_pulses_kept, 2);
        assert_eq!(s.ap_config.rel_tol, 1e-10);
        assert!(s.validate().is_ok());

        let config = s.ap_run_config().unwrap();
        assert_eq!(config.pulses_to_discard, 998);
        assert_eq!(config.pulses_to_keep, 2);
    }

    #[test]
    fn test_embedded_pulse_counts_are_replaced() {
        let s = ComparisonSettings {
            channel_pulses: 7,
            ap_pulses: 9,
            ap_pulses_kept: 3,
            channel_config: SimulationConfig::paced(50, 10).unwrap().with_timestep(0.5),
            ap_config: SimulationConfig::paced(40, 1).unwrap(),
            ..Default::default()
        };
        let channel = s.channel_run_config().unwrap();
        assert_eq!(channel.pulses_to_discard, 6);
        assert_eq!(channel.pulses_to_keep, 1);
        assert_eq!(channel.timestep, 0.5);

        let ap = s.ap_run_config().unwrap();
        assert_eq!(ap.pulses_to_discard, 6);
        assert_eq!(ap.pulses_to_keep, 3);
    }

    #[test]
    fn test_settings_validation() {
        let s = ComparisonSettings {
            hill_points: 2,
            ..Default::default()
        };
        assert!(matches!(s.validate(), Err(TrappingError::InvalidConfig(_))));
        let s = ComparisonSettings {
            ap_pulses_kept: 5,
            ap_pulses: 3,
            ..Default::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_settings_from_partial_json() {
        let s: ComparisonSettings =
            serde_json::from_str(r#"{"channel_pulses": 10, "parallel": true}"#).unwrap();
        assert_eq!(s.channel_pulses, 10);
        assert!(s.parallel);
        assert_eq!(s.apd_points, 20);
    }

    #[test]
    fn test_record_field_names() {
        let r = ComparisonRecord {
            concentration: 1.0,
            apd90_detailed: 300.0,
            apd90_simplified: 310.0,
        };
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("APD90_detailed"));
        assert!(json.contains("APD90_simplified"));
    }
}
