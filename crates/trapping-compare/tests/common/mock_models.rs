//! Synthetic engines with closed-form responses
//!
//! Both engines derive a steady-state bound fraction directly from the
//! installed binding constants instead of integrating anything:
//!
//! `b = Kmax * x / (Kmax * x + 1)` with `x = D^n / (D^n + halfmax)`
//!
//! so the comparison pipeline can be checked against known answers.

use trapping_core::{
    Model, ModelState, Protocol, Result, SignalLog, Simulation, Time, TrappingError, Variable,
    VariableKind,
};

pub const TIME: &str = "engine.time";
pub const VOLTAGE: &str = "membrane.V";
pub const IKR: &str = "ikr.IKr";

/// Declared IKr conductance
pub const BASE_GKR: f64 = 0.1;
/// Action potential duration without block (ms)
pub const BASE_DURATION: f64 = 300.0;
pub const STIMULUS: Time = 50.0;
const REST: f64 = -85.0;
const PEAK: f64 = 30.0;

const CONSTANTS: [(&str, f64); 7] = [
    ("ikr.Vhalf", 1.0),
    ("ikr.Kmax", 0.0),
    ("ikr.Ku", 0.0),
    ("ikr.n", 1.0),
    ("ikr.halfmax", 1.0),
    ("ikr.Kt", 0.0),
    ("ikr.gKr", BASE_GKR),
];

// =================================================================================================
// Models
// =================================================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Output {
    /// IKr is `gKr * (1 - b)` while the clamp is depolarised
    Channel,
    /// Triangular action potential lengthened by IKr block
    ActionPotential,
}

/// Synthetic trapping engine
#[derive(Debug, Clone)]
pub struct SyntheticModel {
    pub output: Output,
    /// Runs with more drug than this report divergence
    pub diverge_above: Option<f64>,
}

impl SyntheticModel {
    pub fn channel() -> Self {
        Self { output: Output::Channel, diverge_above: None }
    }

    pub fn action_potential() -> Self {
        Self { output: Output::ActionPotential, diverge_above: None }
    }

    pub fn diverging_above(mut self, concentration: f64) -> Self {
        self.diverge_above = Some(concentration);
        self
    }
}

/// Steady-state bound fraction
pub fn bound_fraction(kmax: f64, n: f64, halfmax: f64, drug: f64) -> f64 {
    let dn = drug.max(0.0).powf(n);
    let x = if dn + halfmax > 0.0 { dn / (dn + halfmax) } else { 0.0 };
    kmax * x / (kmax * x + 1.0)
}

/// Action potential duration for a fraction `block` of IKr removed
pub fn duration(block: f64) -> f64 {
    BASE_DURATION * (1.0 + 0.5 * block)
}

impl Model for SyntheticModel {
    type Sim = SyntheticSim;

    fn name(&self) -> &str {
        match self.output {
            Output::Channel => "synthetic-channel",
            Output::ActionPotential => "synthetic-cell",
        }
    }

    fn get(&self, qname: &str) -> Result<Variable> {
        match qname {
            "ikr.D" | "ikr.O" => Ok(Variable::new(qname, VariableKind::State, 0.0)),
            TIME | VOLTAGE => Ok(Variable::new(qname, VariableKind::Bound, 0.0)),
            IKR => Ok(Variable::new(qname, VariableKind::Intermediate, 0.0)),
            _ => CONSTANTS
                .iter()
                .find(|(n, _)| *n == qname)
                .map(|(n, v)| Variable::new(n, VariableKind::Constant, *v))
                .ok_or_else(|| TrappingError::UnknownVariable(qname.to_string())),
        }
    }

    fn states(&self) -> Vec<String> {
        vec!["ikr.O".into(), "ikr.D".into()]
    }

    fn initial_state(&self) -> ModelState {
        ModelState::from_pairs([("ikr.O", 0.0), ("ikr.D", 0.0)])
    }

    fn time_variable(&self) -> &str {
        TIME
    }

    fn simulation(&self, protocol: &Protocol) -> Result<SyntheticSim> {
        Ok(SyntheticSim {
            model: self.clone(),
            period: protocol.characteristic_time(),
            constants: CONSTANTS.iter().map(|(n, v)| (n.to_string(), *v)).collect(),
            state: self.initial_state(),
            time: 0.0,
        })
    }
}

// =================================================================================================
// Simulation
// =================================================================================================

pub struct SyntheticSim {
    model: SyntheticModel,
    period: Time,
    constants: Vec<(String, f64)>,
    state: ModelState,
    time: Time,
}

impl SyntheticSim {
    fn value(&self, name: &str) -> f64 {
        self.constant(name).unwrap_or(f64::NAN)
    }

    fn block(&self) -> f64 {
        let drug = self.state.get("ikr.D").unwrap_or(0.0);
        let bound = bound_fraction(
            self.value("ikr.Kmax"),
            self.value("ikr.n"),
            self.value("ikr.halfmax"),
            drug,
        );
        1.0 - self.value("ikr.gKr") / BASE_GKR * (1.0 - bound)
    }

    fn sample(&self, t: Time) -> f64 {
        let phase = t % self.period;
        match self.model.output {
            Output::Channel => {
                if (100.0..600.0).contains(&phase) {
                    BASE_GKR * (1.0 - self.block())
                } else {
                    0.0
                }
            }
            Output::ActionPotential => {
                let d = duration(self.block());
                let s = phase - STIMULUS;
                if s < 0.0 || s >= d {
                    REST
                } else {
                    PEAK - (PEAK - REST) * s / d
                }
            }
        }
    }
}

impl Simulation for SyntheticSim {
    fn set_constant(&mut self, qname: &str, value: f64) -> Result<()> {
        let slot = self
            .constants
            .iter_mut()
            .find(|(n, _)| n == qname)
            .ok_or_else(|| TrappingError::UnknownVariable(qname.to_string()))?;
        slot.1 = value;
        Ok(())
    }

    fn constant(&self, qname: &str) -> Result<f64> {
        self.constants
            .iter()
            .find(|(n, _)| n == qname)
            .map(|(_, v)| *v)
            .ok_or_else(|| TrappingError::UnknownVariable(qname.to_string()))
    }

    fn set_state(&mut self, state: &ModelState) -> Result<()> {
        for (n, v) in state.iter() {
            self.state.set(n, v)?;
        }
        Ok(())
    }

    fn state(&self) -> ModelState {
        self.state.clone()
    }

    fn set_tolerance(&mut self, _abs_tol: f64, _rel_tol: f64) {}

    fn pre(&mut self, duration: Time) -> Result<()> {
        self.time += duration;
        Ok(())
    }

    fn run(&mut self, duration: Time, log: &[String], log_interval: Time) -> Result<SignalLog> {
        let drug = self.state.get("ikr.D").unwrap_or(0.0);
        if let Some(limit) = self.model.diverge_above {
            if drug > limit {
                return Err(TrappingError::SimulationDivergence(format!(
                    "synthetic divergence at D = {}",
                    drug
                )));
            }
        }

        let n = (duration / log_interval).round() as usize;
        let time: Vec<f64> = (0..n).map(|k| self.time + k as f64 * log_interval).collect();
        let mut out = SignalLog::new(TIME);
        for name in log {
            let series = match name.as_str() {
                TIME => time.clone(),
                VOLTAGE | IKR => time.iter().map(|t| self.sample(*t)).collect(),
                other => return Err(TrappingError::UnknownVariable(other.to_string())),
            };
            out.insert(name, series)?;
        }
        self.time += duration;
        Ok(out)
    }

    fn reset(&mut self) {
        self.time = 0.0;
        self.state = self.model.initial_state();
    }

    fn time(&self) -> Time {
        self.time
    }
}
