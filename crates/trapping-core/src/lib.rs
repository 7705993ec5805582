//! # Trapping Core
//!
//! Shared types for state-dependent hERG drug-binding simulation.
//!
//! ## Components Built On This Crate
//!
//! | Crate | Role |
//! |-------|------|
//! | trapping-library | Drug, protocol and concentration tables |
//! | trapping-engine | Reference channel engine (voltage clamp) |
//! | trapping-kinetics | Simulation driver and signal analysis |
//! | trapping-hill | Hill curve model and optimiser |
//! | trapping-compare | SD vs CS model comparison |
//!
//! ## Design Philosophy
//!
//! 1. The ODE engine is an injected dependency ([`Model`], [`Simulation`])
//! 2. Degraded numerical results are NaN, never a plausible default
//! 3. Configuration errors are fatal and reported immediately

pub mod protocol;
pub mod signal;
pub mod solver;

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub use protocol::{Protocol, ProtocolEvent};
pub use signal::{SignalKey, SignalLog};
pub use solver::{Model, Simulation, Variable, VariableKind};

/// Common errors
#[derive(Debug, Error)]
pub enum TrappingError {
    #[error("Unknown drug: {0}")]
    UnknownDrug(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Simulation diverged: {0}")]
    SimulationDivergence(String),

    #[error("Hill curve fit did not converge: {0}")]
    FitDidNotConverge(String),

    #[error("No repolarization crossing in pulse {pulse}")]
    NoRepolarizationCrossing { pulse: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TrappingError {
    /// Local numerical failures degrade a single result entry to NaN.
    /// Everything else is a configuration error and aborts the call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::SimulationDivergence(_)
                | Self::NoRepolarizationCrossing { .. }
                | Self::FitDidNotConverge(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TrappingError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current (A/F)
pub type Current = f64;

/// Conductance (mS/uF)
pub type Conductance = f64;

/// Drug concentration (nM)
pub type Concentration = f64;

/// State vector for ODE systems
pub type StateVector = Array1<f64>;

/// Trafficking rate between bound-open and bound-closed states (1/ms).
///
/// Fixed for every drug; not a fitted parameter.
pub const TRAFFICKING_RATE: f64 = 3.5e-5;

// =============================================================================
// KINETIC PARAMETERS
// =============================================================================

/// Kinetic constants of the state-dependent binding scheme
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KineticParameters {
    /// Half-activation voltage of trapped-channel reopening (mV)
    #[serde(rename = "Vhalf")]
    pub vhalf: f64,
    /// Maximum drug effect at saturating concentration
    #[serde(rename = "Kmax")]
    pub kmax: f64,
    /// Unbinding rate (1/ms)
    #[serde(rename = "Ku")]
    pub ku: f64,
    /// Hill coefficient of the binding rate
    #[serde(rename = "N")]
    pub n: f64,
    /// Concentration term of half-maximal binding rate (nM^N)
    #[serde(rename = "EC50")]
    pub ec50: f64,
}

impl KineticParameters {
    pub fn new(vhalf: f64, kmax: f64, ku: f64, n: f64, ec50: f64) -> Self {
        Self { vhalf, kmax, ku, n, ec50 }
    }

    /// Concentration scale `EC50^(1/N)` that maps the half-maximal binding
    /// concentration to 1 without changing the Hill exponent.
    pub fn normalising_constant(&self) -> f64 {
        self.ec50.powf(1.0 / self.n)
    }

    /// Same kinetics expressed on the normalised concentration scale.
    pub fn normalised(&self) -> Self {
        Self { ec50: 1.0, ..*self }
    }

    /// Values in canonical order `(Vhalf, Kmax, Ku, N, EC50)`
    pub fn values(&self) -> [f64; 5] {
        [self.vhalf, self.kmax, self.ku, self.n, self.ec50]
    }

    pub fn is_finite(&self) -> bool {
        self.values().iter().all(|v| v.is_finite())
    }
}

/// Conventional concentration-response block of one ion current.
///
/// `hill_coef = 0, ic50 = 0` encodes "no measurable effect".
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HillCurveParameters {
    #[serde(rename = "Hill_coef")]
    pub hill_coef: f64,
    #[serde(rename = "IC50")]
    pub ic50: f64,
}

impl HillCurveParameters {
    pub fn new(hill_coef: f64, ic50: f64) -> Self {
        Self { hill_coef, ic50 }
    }

    pub fn no_effect() -> Self {
        Self { hill_coef: 0.0, ic50: 0.0 }
    }

    pub fn is_no_effect(&self) -> bool {
        self.hill_coef == 0.0 && self.ic50 == 0.0
    }
}

// =============================================================================
// ION CHANNELS
// =============================================================================

/// Ion currents with literature block data
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    IKr,
    INaL,
    ICaL,
    INa,
    Ito,
    IK1,
    IKs,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::IKr,
        Channel::INaL,
        Channel::ICaL,
        Channel::INa,
        Channel::Ito,
        Channel::IK1,
        Channel::IKs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::IKr => "IKr",
            Self::INaL => "INaL",
            Self::ICaL => "ICaL",
            Self::INa => "INa",
            Self::Ito => "Ito",
            Self::IK1 => "IK1",
            Self::IKs => "IKs",
        }
    }

    /// Maximal-conductance constant of this current in a whole-cell model
    pub fn conductance_variable(&self) -> &'static str {
        match self {
            Self::IKr => "ikr.gKr",
            Self::INaL => "inal.gNaL",
            Self::ICaL => "ical.base",
            Self::INa => "ina.gNa",
            Self::Ito => "ito.gto",
            Self::IK1 => "ik1.gK1",
            Self::IKs => "iks.gKs",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Channel {
    type Err = TrappingError;

    fn from_str(s: &str) -> Result<Self> {
        Channel::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TrappingError::ParseError(format!("unknown channel '{}'", s)))
    }
}

/// Per-channel conductance scale factors; missing channels are unscaled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IonScale {
    factors: BTreeMap<Channel, f64>,
}

impl IonScale {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, channel: Channel, factor: f64) {
        self.factors.insert(channel, factor);
    }

    pub fn with(mut self, channel: Channel, factor: f64) -> Self {
        self.set(channel, factor);
        self
    }

    pub fn get(&self, channel: Channel) -> f64 {
        self.factors.get(&channel).copied().unwrap_or(1.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, f64)> + '_ {
        self.factors.iter().map(|(c, f)| (*c, *f))
    }
}

// =============================================================================
// MODEL STATE
// =============================================================================

/// Named state vector of an ODE model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    names: Vec<String>,
    values: StateVector,
}

impl ModelState {
    pub fn new(names: Vec<String>, values: StateVector) -> Result<Self> {
        if names.len() != values.len() {
            return Err(TrappingError::InvalidConfig(format!(
                "state has {} names but {} values",
                names.len(),
                values.len()
            )));
        }
        Ok(Self { names, values })
    }

    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let (names, values): (Vec<String>, Vec<f64>) =
            pairs.into_iter().map(|(n, v)| (n.to_string(), v)).unzip();
        Self {
            names,
            values: Array1::from(values),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &StateVector {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.index_of(name).map(|i| self.values[i])
    }

    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        let i = self
            .index_of(name)
            .ok_or_else(|| TrappingError::UnknownVariable(name.to_string()))?;
        self.values[i] = value;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Largest absolute component difference against another state
    pub fn max_abs_diff(&self, other: &ModelState) -> f64 {
        self.iter()
            .map(|(name, v)| match other.get(name) {
                Some(w) => (v - w).abs(),
                None => f64::INFINITY,
            })
            .fold(0.0, f64::max)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

// =============================================================================
// SIMULATION CONFIGURATION
// =============================================================================

/// Per-call simulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Logging interval (ms)
    pub timestep: Time,
    /// Protocol periods advanced without recording
    pub pulses_to_discard: usize,
    /// Protocol periods recorded at the end of the run
    pub pulses_to_keep: usize,
    /// Solver absolute tolerance
    pub abs_tol: f64,
    /// Solver relative tolerance
    pub rel_tol: f64,
    /// Variables to log; empty logs everything the engine offers
    pub recorded_variables: Vec<String>,
    /// Protocol period override; defaults to the protocol's characteristic time
    pub protocol_period: Option<Time>,
    /// Wall-clock budget for one call, checked at period boundaries
    pub time_budget: Option<Duration>,
    /// Stop pre-pacing once successive end-of-period states agree to this tolerance
    pub steady_state_tolerance: Option<f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            timestep: 0.1,
            pulses_to_discard: 0,
            pulses_to_keep: 1,
            abs_tol: 1e-6,
            rel_tol: 1e-4,
            recorded_variables: Vec::new(),
            protocol_period: None,
            time_budget: None,
            steady_state_tolerance: None,
        }
    }
}

impl SimulationConfig {
    /// Pace `total` periods and record the last `recorded` of them.
    pub fn paced(total: usize, recorded: usize) -> Result<Self> {
        Self::default().with_pulses(total, recorded)
    }

    pub fn with_pulses(mut self, total: usize, recorded: usize) -> Result<Self> {
        if recorded == 0 || recorded > total {
            return Err(TrappingError::InvalidConfig(format!(
                "need total >= recorded >= 1, got total {} recorded {}",
                total, recorded
            )));
        }
        self.pulses_to_discard = total - recorded;
        self.pulses_to_keep = recorded;
        Ok(self)
    }

    pub fn with_tolerance(mut self, abs_tol: f64, rel_tol: f64) -> Self {
        self.abs_tol = abs_tol;
        self.rel_tol = rel_tol;
        self
    }

    pub fn with_timestep(mut self, timestep: Time) -> Self {
        self.timestep = timestep;
        self
    }

    pub fn with_variables(mut self, variables: &[&str]) -> Self {
        self.recorded_variables = variables.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn total_pulses(&self) -> usize {
        self.pulses_to_discard + self.pulses_to_keep
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.abs_tol > 0.0) || !(self.rel_tol > 0.0) {
            return Err(TrappingError::InvalidConfig(format!(
                "tolerances must be positive (abs {}, rel {})",
                self.abs_tol, self.rel_tol
            )));
        }
        if !(self.timestep > 0.0) || !self.timestep.is_finite() {
            return Err(TrappingError::InvalidConfig(format!(
                "timestep must be positive, got {}",
                self.timestep
            )));
        }
        if self.pulses_to_keep == 0 {
            return Err(TrappingError::InvalidConfig(
                "at least one pulse must be recorded".into(),
            ));
        }
        if let Some(period) = self.protocol_period {
            if !(period > 0.0) {
                return Err(TrappingError::InvalidConfig(format!(
                    "protocol period must be positive, got {}",
                    period
                )));
            }
        }
        if let Some(tol) = self.steady_state_tolerance {
            if !(tol > 0.0) {
                return Err(TrappingError::InvalidConfig(format!(
                    "steady-state tolerance must be positive, got {}",
                    tol
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// GRIDS
// =============================================================================

/// `n` points `10^x` with `x` evenly spaced on `[lo, hi]`
pub fn logspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    Array1::logspace(10.0, lo, hi, n).to_vec()
}

/// `n` evenly spaced points on `[lo, hi]`
pub fn linspace(lo: f64, hi: f64, n: usize) -> Vec<f64> {
    Array1::linspace(lo, hi, n).to_vec()
}
