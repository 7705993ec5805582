//! # Trapping Engine
//!
//! Reference implementation of the [`Model`] / [`Simulation`] interface: a
//! reduced hERG channel with drug binding and trapping, held under a
//! piecewise-constant voltage clamp.
//!
//! ## Scheme
//!
//! ```text
//!   C  <-> O  <-> IO            unbound
//!          |       |            kon = Kmax * Ku * D^n / (D^n + halfmax), koff = Ku
//!   Cb <-> Ob <-> IOb           bound; Cb is the trapped state
//! ```
//!
//! `C` is implied by conservation. Bound channels leave the trapped state
//! with rate `Kt / (1 + exp(-(V - Vhalf) / 6.789))` and enter it with `Kt`.
//!
//! ## Integration
//!
//! The clamp level is constant between protocol breakpoints, so each run is
//! split at breakpoints and into chunks of at most [`MAX_SEGMENT`] ms. Every
//! piece is integrated once with Dopri5. Recorded pieces start on a sample
//! time and take their samples from the dense output.

use log::debug;
use ode_solvers::{Dopri5, System, Vector6};
use trapping_core::{
    Model, ModelState, Protocol, Result, SignalLog, Simulation, Time, TrappingError, Variable,
    VariableKind, Voltage,
};

type State = Vector6<f64>;

/// Logged simulation time
pub const TIME: &str = "engine.time";
/// Clamp voltage
pub const VOLTAGE: &str = "membrane.V";
/// hERG current
pub const IKR: &str = "ikr.IKr";
/// Unbound closed fraction
pub const CLOSED: &str = "ikr.C";

/// Integrated states, in state-vector order
pub const STATES: [&str; 6] = [
    "ikr.O",
    "ikr.IO",
    "ikr.Obound",
    "ikr.IObound",
    "ikr.Cbound",
    "ikr.D",
];

const DRUG: usize = 5;

/// Longest piece handed to one Dopri5 run (ms)
pub const MAX_SEGMENT: Time = 100.0;

const EPS: f64 = 1e-9;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Literal constants of the channel
#[derive(Debug, Clone, Copy, PartialEq)]
struct Constants {
    vhalf: f64,
    kmax: f64,
    ku: f64,
    n: f64,
    halfmax: f64,
    kt: f64,
    gkr: f64,
    ek: Voltage,
}

impl Default for Constants {
    fn default() -> Self {
        // No drug effect until a driver installs binding kinetics
        Self {
            vhalf: 1.0,
            kmax: 0.0,
            ku: 0.0,
            n: 1.0,
            halfmax: 1.0,
            kt: 0.0,
            gkr: 0.0466,
            ek: -86.0,
        }
    }
}

impl Constants {
    fn slot(&mut self, qname: &str) -> Option<&mut f64> {
        Some(match qname {
            "ikr.Vhalf" => &mut self.vhalf,
            "ikr.Kmax" => &mut self.kmax,
            "ikr.Ku" => &mut self.ku,
            "ikr.n" => &mut self.n,
            "ikr.halfmax" => &mut self.halfmax,
            "ikr.Kt" => &mut self.kt,
            "ikr.gKr" => &mut self.gkr,
            "ikr.EK" => &mut self.ek,
            _ => return None,
        })
    }

    fn get(&self, qname: &str) -> Option<f64> {
        let mut copy = *self;
        copy.slot(qname).map(|v| *v)
    }

    fn set(&mut self, qname: &str, value: f64) -> Result<()> {
        let slot = self
            .slot(qname)
            .ok_or_else(|| TrappingError::UnknownVariable(qname.to_string()))?;
        *slot = value;
        Ok(())
    }

    fn binding_rate(&self, drug: f64) -> f64 {
        let dn = drug.max(0.0).powf(self.n);
        let denominator = dn + self.halfmax;
        if denominator > 0.0 {
            self.kmax * self.ku * dn / denominator
        } else {
            0.0
        }
    }
}

// =============================================================================
// ODE SYSTEM
// =============================================================================

/// Channel right-hand side at a fixed clamp voltage
struct TrappingSystem {
    constants: Constants,
    voltage: Voltage,
}

impl System<f64, State> for TrappingSystem {
    fn system(&self, _t: f64, y: &State, dy: &mut State) {
        let k = &self.constants;
        let v = self.voltage;

        let alpha = 0.01 * (0.03 * v).exp();
        let beta = 0.004 * (-0.04 * v).exp();
        let alpha_i = 0.08 * (0.025 * v).exp();
        let beta_i = 0.03 * (-0.025 * v).exp();
        let kon = k.binding_rate(y[DRUG]);
        let untrap = k.kt / (1.0 + (-(v - k.vhalf) / 6.789).exp());

        let (o, io, ob, iob, cb) = (y[0], y[1], y[2], y[3], y[4]);
        let c = 1.0 - o - io - ob - iob - cb;

        dy[0] = alpha * c - beta * o + beta_i * io - alpha_i * o - kon * o + k.ku * ob;
        dy[1] = alpha_i * o - beta_i * io - kon * io + k.ku * iob;
        dy[2] = kon * o - k.ku * ob + beta_i * iob - alpha_i * ob + untrap * cb - k.kt * ob;
        dy[3] = kon * io - k.ku * iob + alpha_i * ob - beta_i * iob + untrap * cb - k.kt * iob;
        dy[4] = k.kt * (ob + iob) - 2.0 * untrap * cb;
        dy[DRUG] = 0.0;
    }
}

// =============================================================================
// MODEL
// =============================================================================

/// Compiled trapping channel model
#[derive(Debug, Clone)]
pub struct HergTrappingModel {
    name: String,
    constants: Constants,
    initial: State,
}

impl Default for HergTrappingModel {
    fn default() -> Self {
        Self {
            name: "herg-trapping".to_string(),
            constants: Constants::default(),
            initial: State::zeros(),
        }
    }
}

impl HergTrappingModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change a declared constant
    pub fn with_constant(mut self, qname: &str, value: f64) -> Result<Self> {
        self.constants.set(qname, value)?;
        Ok(self)
    }

    /// Change a declared initial state value
    pub fn with_initial(mut self, qname: &str, value: f64) -> Result<Self> {
        let i = state_index(qname)?;
        self.initial[i] = value;
        Ok(self)
    }

    /// Every variable a run can log
    pub fn loggable() -> Vec<&'static str> {
        let mut names = vec![TIME, VOLTAGE, IKR, CLOSED];
        names.extend(STATES);
        names
    }
}

fn state_index(qname: &str) -> Result<usize> {
    STATES
        .iter()
        .position(|s| *s == qname)
        .ok_or_else(|| TrappingError::UnknownVariable(qname.to_string()))
}

fn closed_fraction(y: &State) -> f64 {
    1.0 - y.iter().take(DRUG).sum::<f64>()
}

fn to_model_state(y: &State) -> ModelState {
    ModelState::from_pairs(STATES.iter().copied().zip(y.iter().copied()))
}

impl Model for HergTrappingModel {
    type Sim = HergSimulation;

    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, qname: &str) -> Result<Variable> {
        if let Ok(i) = state_index(qname) {
            return Ok(Variable::new(qname, VariableKind::State, self.initial[i]));
        }
        if let Some(value) = self.constants.get(qname) {
            return Ok(Variable::new(qname, VariableKind::Constant, value));
        }
        match qname {
            TIME | VOLTAGE => Ok(Variable::new(qname, VariableKind::Bound, 0.0)),
            CLOSED => Ok(Variable::new(
                qname,
                VariableKind::Intermediate,
                closed_fraction(&self.initial),
            )),
            IKR => Ok(Variable::new(
                qname,
                VariableKind::Intermediate,
                self.constants.gkr * self.initial[0] * (0.0 - self.constants.ek),
            )),
            _ => Err(TrappingError::UnknownVariable(qname.to_string())),
        }
    }

    fn states(&self) -> Vec<String> {
        STATES.iter().map(|s| s.to_string()).collect()
    }

    fn initial_state(&self) -> ModelState {
        to_model_state(&self.initial)
    }

    fn time_variable(&self) -> &str {
        TIME
    }

    fn simulation(&self, protocol: &Protocol) -> Result<HergSimulation> {
        if protocol.events().is_empty() {
            return Err(TrappingError::InvalidConfig(
                "voltage clamp needs a non-empty protocol".into(),
            ));
        }
        Ok(HergSimulation {
            protocol: protocol.clone(),
            constants: self.constants,
            initial: self.initial,
            state: self.initial,
            time: 0.0,
            abs_tol: 1e-6,
            rel_tol: 1e-4,
        })
    }
}

// =============================================================================
// SIMULATION
// =============================================================================

/// Voltage-clamp run of [`HergTrappingModel`]
#[derive(Debug, Clone)]
pub struct HergSimulation {
    protocol: Protocol,
    constants: Constants,
    initial: State,
    state: State,
    time: Time,
    abs_tol: f64,
    rel_tol: f64,
}

impl HergSimulation {
    fn advance(&mut self, target: Time) -> Result<()> {
        while self.time < target - EPS {
            let next = self.piece_end(target);
            let voltage = self.protocol.level_at(0.5 * (self.time + next));
            self.integrate(next, voltage)?;
        }
        Ok(())
    }

    /// Next piece boundary after the current time, at most `target`
    fn piece_end(&self, target: Time) -> Time {
        self.protocol
            .next_change(self.time)
            .unwrap_or(f64::INFINITY)
            .min(target)
            .min(self.time + MAX_SEGMENT)
    }

    /// One Dopri5 run at a fixed clamp voltage.
    ///
    /// With `dx > 0` the output holds the dense samples `time, time + dx, ..`
    /// up to `until`; otherwise it holds the accepted steps. The simulation
    /// is left at the last output point.
    fn solve(&mut self, until: Time, voltage: Voltage, dx: Time) -> Result<Vec<(Time, State)>> {
        let system = TrappingSystem {
            constants: self.constants,
            voltage,
        };
        let mut stepper = Dopri5::new(
            system,
            self.time,
            until,
            dx,
            self.state,
            self.rel_tol,
            self.abs_tol,
        );
        stepper.integrate().map_err(|e| {
            TrappingError::SimulationDivergence(format!(
                "integration failed on [{}, {}] ms: {:?}",
                self.time, until, e
            ))
        })?;
        let output: Vec<(Time, State)> = stepper
            .x_out()
            .iter()
            .copied()
            .zip(stepper.y_out().iter().copied())
            .collect();
        let (t, y) = output.last().copied().ok_or_else(|| {
            TrappingError::SimulationDivergence(format!("no output at t = {} ms", until))
        })?;
        if let Some((t, _)) = output.iter().find(|(_, y)| y.iter().any(|v| !v.is_finite())) {
            return Err(TrappingError::SimulationDivergence(format!(
                "non-finite state at t = {} ms",
                t
            )));
        }
        self.state = y;
        self.time = t;
        Ok(output)
    }

    fn integrate(&mut self, until: Time, voltage: Voltage) -> Result<()> {
        self.solve(until, voltage, 0.0)?;
        self.time = until;
        Ok(())
    }

    /// Integrate one constant-voltage piece from a sample time, returning
    /// the dense samples that fall before the piece ends
    fn integrate_sampled(
        &mut self,
        until: Time,
        voltage: Voltage,
        log_interval: Time,
    ) -> Result<Vec<State>> {
        let dense = self.solve(until, voltage, log_interval)?;
        if until - self.time > EPS {
            self.integrate(until, voltage)?;
        } else {
            self.time = until;
        }
        // Samples on the breakpoint belong to the next piece
        Ok(dense
            .into_iter()
            .filter(|(t, _)| *t < until - EPS)
            .map(|(_, y)| y)
            .collect())
    }

    fn observe(&self, name: &str, time: Time, y: &State) -> f64 {
        match name {
            TIME => time,
            VOLTAGE => self.protocol.level_at(time),
            CLOSED => closed_fraction(y),
            IKR => {
                let v = self.protocol.level_at(time);
                self.constants.gkr * y[0] * (v - self.constants.ek)
            }
            _ => state_index(name).map(|i| y[i]).unwrap_or(f64::NAN),
        }
    }
}

impl Simulation for HergSimulation {
    fn set_constant(&mut self, qname: &str, value: f64) -> Result<()> {
        self.constants.set(qname, value)
    }

    fn constant(&self, qname: &str) -> Result<f64> {
        self.constants
            .get(qname)
            .ok_or_else(|| TrappingError::UnknownVariable(qname.to_string()))
    }

    fn set_state(&mut self, state: &ModelState) -> Result<()> {
        let mut next = self.state;
        for (name, value) in state.iter() {
            next[state_index(name)?] = value;
        }
        self.state = next;
        Ok(())
    }

    fn state(&self) -> ModelState {
        to_model_state(&self.state)
    }

    fn set_tolerance(&mut self, abs_tol: f64, rel_tol: f64) {
        self.abs_tol = abs_tol;
        self.rel_tol = rel_tol;
    }

    fn pre(&mut self, duration: Time) -> Result<()> {
        let target = self.time + duration;
        self.advance(target)
    }

    fn run(&mut self, duration: Time, log: &[String], log_interval: Time) -> Result<SignalLog> {
        if !(log_interval > 0.0) {
            return Err(TrappingError::InvalidConfig(format!(
                "log interval must be positive, got {}",
                log_interval
            )));
        }
        let loggable = HergTrappingModel::loggable();
        let names: Vec<String> = if log.is_empty() {
            loggable.iter().map(|s| s.to_string()).collect()
        } else {
            log.to_vec()
        };
        if let Some(unknown) = names.iter().find(|n| !loggable.contains(&n.as_str())) {
            return Err(TrappingError::UnknownVariable(unknown.clone()));
        }

        let t0 = self.time;
        let end = t0 + duration;
        let samples = (duration / log_interval).round() as usize;
        debug!(
            "engine run from {} ms for {} ms, {} samples of {} variables",
            t0,
            duration,
            samples,
            names.len()
        );

        let mut series: Vec<Vec<f64>> = vec![Vec::with_capacity(samples); names.len()];
        let mut recorded = 0;
        while recorded < samples {
            self.advance(t0 + recorded as f64 * log_interval)?;
            let until = self.piece_end(end);
            let voltage = self.protocol.level_at(0.5 * (self.time + until));
            let piece = self.integrate_sampled(until, voltage, log_interval)?;
            for y in piece.iter().take(samples - recorded) {
                let time = t0 + recorded as f64 * log_interval;
                for (name, values) in names.iter().zip(series.iter_mut()) {
                    values.push(self.observe(name, time, y));
                }
                recorded += 1;
            }
        }
        self.advance(end)?;

        let mut signal = SignalLog::new(TIME);
        for (name, values) in names.iter().zip(series) {
            signal.insert(name, values)?;
        }
        Ok(signal)
    }

    fn reset(&mut self) {
        self.state = self.initial;
        self.time = 0.0;
    }

    fn time(&self) -> Time {
        self.time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn step_protocol() -> Protocol {
        Protocol::new()
            .with_event(-80.0, 0.0, 100.0, 1000.0)
            .unwrap()
            .with_event(0.0, 100.0, 500.0, 1000.0)
            .unwrap()
            .with_event(-80.0, 600.0, 400.0, 1000.0)
            .unwrap()
    }

    #[test]
    fn test_model_variables() {
        let model = HergTrappingModel::new();
        assert_eq!(model.get("ikr.D").unwrap().kind, VariableKind::State);
        assert_eq!(model.get("ikr.gKr").unwrap().eval(), 0.0466);
        assert_eq!(model.get("ikr.C").unwrap().eval(), 1.0);
        assert!(model.get("ikr.foo").is_err());
        assert_eq!(model.states().len(), 6);
        assert_eq!(model.states()[0], "ikr.O");
    }

    #[test]
    fn test_run_sampling() {
        let model = HergTrappingModel::new();
        let mut sim = model.simulation(&step_protocol()).unwrap();
        let log = sim
            .run(1000.0, &[TIME.to_string(), VOLTAGE.to_string(), IKR.to_string()], 1.0)
            .unwrap();
        assert_eq!(log.len(), 1000);
        assert_relative_eq!(sim.time(), 1000.0, epsilon = 1e-9);

        let v = log.require(VOLTAGE).unwrap();
        assert_eq!(v[50], -80.0);
        assert_eq!(v[300], 0.0);

        // Channels open on depolarisation
        let i = log.require(IKR).unwrap();
        assert!(i[550] > i[50]);
        assert!(i.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_dense_samples_match_stepwise_integration() {
        let model = HergTrappingModel::new();
        let mut sim = model.simulation(&step_protocol()).unwrap();
        sim.set_tolerance(1e-10, 1e-10);
        let log = sim
            .run(1000.0, &[TIME.to_string(), "ikr.O".to_string()], 0.1)
            .unwrap();
        assert_eq!(log.len(), 10_000);
        assert_relative_eq!(sim.time(), 1000.0, epsilon = 1e-9);

        let time = log.require(TIME).unwrap();
        let open = log.require("ikr.O").unwrap();
        assert!(time.windows(2).all(|w| (w[1] - w[0] - 0.1).abs() < 1e-9));
        for k in [0, 999, 1000, 1001, 3333, 6000, 9999] {
            let mut reference = model.simulation(&step_protocol()).unwrap();
            reference.set_tolerance(1e-10, 1e-10);
            reference.pre(k as f64 * 0.1).unwrap();
            let expected = reference.state().get("ikr.O").unwrap();
            assert_relative_eq!(open[k], expected, epsilon = 1e-7);
        }

        let mut whole = model.simulation(&step_protocol()).unwrap();
        whole.set_tolerance(1e-10, 1e-10);
        whole.pre(1000.0).unwrap();
        assert_relative_eq!(
            sim.state().get("ikr.O").unwrap(),
            whole.state().get("ikr.O").unwrap(),
            epsilon = 1e-7
        );
    }

    #[test]
    fn test_sampling_off_the_breakpoints() {
        // 0.3 ms does not divide the 100 ms and 600 ms breakpoints
        let model = HergTrappingModel::new();
        let mut sim = model.simulation(&step_protocol()).unwrap();
        let log = sim
            .run(1000.0, &[TIME.to_string(), VOLTAGE.to_string()], 0.3)
            .unwrap();
        assert_eq!(log.len(), 3333);
        let time = log.require(TIME).unwrap();
        let v = log.require(VOLTAGE).unwrap();
        for (t, v) in time.iter().zip(v) {
            if (t - 600.0).abs() < 1e-6 {
                continue;
            }
            let expected = if (100.0..600.0).contains(t) { 0.0 } else { -80.0 };
            assert_eq!(*v, expected, "t = {}", t);
        }
        assert_relative_eq!(sim.time(), 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_conservation() {
        let model = HergTrappingModel::new().with_initial("ikr.D", 1000.0).unwrap();
        let mut sim = model.simulation(&step_protocol()).unwrap();
        sim.set_constant("ikr.Kmax", 50.0).unwrap();
        sim.set_constant("ikr.Ku", 0.01).unwrap();
        sim.set_constant("ikr.halfmax", 100.0).unwrap();
        sim.set_constant("ikr.Kt", 3.5e-5).unwrap();
        sim.pre(2000.0).unwrap();

        let state = sim.state();
        let bound = state.get("ikr.Obound").unwrap() + state.get("ikr.IObound").unwrap();
        assert!(bound > 0.0);
        let total: f64 = state.iter().filter(|(n, _)| *n != "ikr.D").map(|(_, v)| v).sum();
        assert!(total <= 1.0 + 1e-6);
        assert_eq!(state.get("ikr.D"), Some(1000.0));
    }

    #[test]
    fn test_reset_and_state() {
        let model = HergTrappingModel::new();
        let mut sim = model.simulation(&step_protocol()).unwrap();
        sim.pre(500.0).unwrap();
        assert!(sim.state().get("ikr.O").unwrap() > 0.0);
        sim.reset();
        assert_eq!(sim.time(), 0.0);
        assert_eq!(sim.state(), model.initial_state());

        let partial = ModelState::from_pairs([("ikr.D", 3.0)]);
        sim.set_state(&partial).unwrap();
        assert_eq!(sim.state().get("ikr.D"), Some(3.0));
        let unknown = ModelState::from_pairs([("ikr.X", 3.0)]);
        assert!(sim.set_state(&unknown).is_err());
    }

    #[test]
    fn test_unknown_log_variable() {
        let model = HergTrappingModel::new();
        let mut sim = model.simulation(&step_protocol()).unwrap();
        assert!(matches!(
            sim.run(10.0, &["ikr.X".to_string()], 1.0),
            Err(TrappingError::UnknownVariable(_))
        ));
        assert!(sim.set_constant("ikr.X", 1.0).is_err());
    }

    #[test]
    fn test_empty_protocol_rejected() {
        assert!(HergTrappingModel::new().simulation(&Protocol::new()).is_err());
    }
}
