//! # Trapping Kinetics
//!
//! Simulation driver for state-dependent hERG drug binding.
//!
//! [`BindingKinetics`] owns one model and one pacing protocol. Every run
//! builds a fresh simulation, installs the constants of the requested mode,
//! pre-paces to periodic steady state and records the last pulses:
//!
//! | Mode | Binding constants | IKr conductance |
//! |------|-------------------|-----------------|
//! | drug | library kinetics, `Kt = 3.5e-5` | original |
//! | custom | caller kinetics, `Kt = 3.5e-5` | original |
//! | conductance | original (no drug) | caller value |
//!
//! The multichannel variants additionally scale other ion currents.
//! Signal post-processing lives in [`analysis`].

pub mod analysis;

pub use analysis::{
    apd90_fixed_offset, apd90_interpolated, extract_peak, state_occupancy, Apd90Strategy,
    PeakCurrent, REFRACTORY_WINDOW,
};

use log::debug;
use std::time::Instant;
use trapping_core::{
    Channel, Concentration, Conductance, IonScale, KineticParameters, Model, ModelState,
    Protocol, Result, SignalLog, Simulation, SimulationConfig, Time, TrappingError,
    TRAFFICKING_RATE,
};

/// Binding constants of the current model, as declared
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OriginalConstants {
    pub vhalf: f64,
    pub kmax: f64,
    pub ku: f64,
    pub n: f64,
    pub halfmax: f64,
    pub kt: f64,
    pub gkr: Conductance,
}

/// Constant set installed before a run
enum Binding {
    Drug(KineticParameters),
    Conductance(Conductance),
}

/// Drives one model under one protocol through paced simulations
pub struct BindingKinetics<M: Model> {
    model: M,
    protocol: Protocol,
    current_head: String,
    original: OriginalConstants,
}

impl<M: Model> BindingKinetics<M> {
    /// Driver whose current is the component of the model's first state
    pub fn new(model: M, protocol: Protocol) -> Result<Self> {
        let head = model
            .states()
            .first()
            .and_then(|s| s.split('.').next())
            .map(str::to_string)
            .ok_or_else(|| TrappingError::InvalidConfig(format!("model '{}' has no states", model.name())))?;
        Self::with_current_head(model, protocol, &head)
    }

    /// Driver for the binding current declared in component `head`
    pub fn with_current_head(model: M, protocol: Protocol, head: &str) -> Result<Self> {
        let constant = |name: &str| -> Result<f64> { Ok(model.get(&format!("{}.{}", head, name))?.eval()) };
        let original = OriginalConstants {
            vhalf: constant("Vhalf")?,
            kmax: constant("Kmax")?,
            ku: constant("Ku")?,
            n: constant("n")?,
            halfmax: constant("halfmax")?,
            kt: constant("Kt")?,
            gkr: constant("gKr")?,
        };
        model.get(&format!("{}.D", head))?;
        debug!("driver for '{}' on current '{}'", model.name(), head);
        Ok(Self {
            model,
            protocol,
            current_head: head.to_string(),
            original,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    pub fn current_head(&self) -> &str {
        &self.current_head
    }

    pub fn original_constants(&self) -> &OriginalConstants {
        &self.original
    }

    /// Maximal IKr conductance as declared by the model
    pub fn base_conductance(&self) -> Conductance {
        self.original.gkr
    }

    /// Qualified name of the drug-concentration state
    pub fn drug_variable(&self) -> String {
        self.var("D")
    }

    /// Period used for pacing under `config`
    pub fn protocol_period(&self, config: &SimulationConfig) -> Time {
        config
            .protocol_period
            .unwrap_or_else(|| self.protocol.characteristic_time())
    }

    /// Paced run with the library kinetics of `drug`
    pub fn run_drug_simulation(
        &self,
        drug: &str,
        concentration: Concentration,
        config: &SimulationConfig,
        starting_state: Option<&ModelState>,
    ) -> Result<SignalLog> {
        let params = trapping_library::binding_parameters(drug)?.kinetics;
        debug!("drug simulation: {} at {} nM", drug, concentration);
        self.simulate(Binding::Drug(params), Some(concentration), &IonScale::new(), config, starting_state)
    }

    /// Paced run with arbitrary kinetics
    pub fn run_custom_parameter_simulation(
        &self,
        params: &KineticParameters,
        concentration: Concentration,
        config: &SimulationConfig,
        starting_state: Option<&ModelState>,
    ) -> Result<SignalLog> {
        if !params.is_finite() {
            return Err(TrappingError::InvalidConfig(format!(
                "non-finite kinetic parameters {:?}",
                params.values()
            )));
        }
        debug!("custom simulation: {:?} at {}", params.values(), concentration);
        self.simulate(Binding::Drug(*params), Some(concentration), &IonScale::new(), config, starting_state)
    }

    /// Paced run of the drug-free model with IKr conductance `conductance`
    pub fn run_conductance_simulation(
        &self,
        conductance: Conductance,
        config: &SimulationConfig,
        starting_state: Option<&ModelState>,
    ) -> Result<SignalLog> {
        debug!("conductance simulation: gKr = {}", conductance);
        self.simulate(Binding::Conductance(conductance), None, &IonScale::new(), config, starting_state)
    }

    /// Drug simulation with the other ion currents scaled by `ion_scale`.
    ///
    /// The IKr factor is ignored; IKr block comes from the binding kinetics.
    pub fn run_multichannel_drug_simulation(
        &self,
        drug: &str,
        concentration: Concentration,
        ion_scale: &IonScale,
        config: &SimulationConfig,
        starting_state: Option<&ModelState>,
    ) -> Result<SignalLog> {
        let params = trapping_library::binding_parameters(drug)?.kinetics;
        let mut others = IonScale::new();
        for (channel, factor) in ion_scale.iter().filter(|(c, _)| *c != Channel::IKr) {
            others.set(channel, factor);
        }
        debug!("multichannel drug simulation: {} at {} nM", drug, concentration);
        self.simulate(Binding::Drug(params), Some(concentration), &others, config, starting_state)
    }

    /// Drug-free simulation with every current, IKr included, scaled by `ion_scale`
    pub fn run_multichannel_conductance_simulation(
        &self,
        ion_scale: &IonScale,
        config: &SimulationConfig,
        starting_state: Option<&ModelState>,
    ) -> Result<SignalLog> {
        let gkr = self.original.gkr * ion_scale.get(Channel::IKr);
        let mut others = IonScale::new();
        for (channel, factor) in ion_scale.iter().filter(|(c, _)| *c != Channel::IKr) {
            others.set(channel, factor);
        }
        debug!("multichannel conductance simulation: gKr = {}", gkr);
        self.simulate(Binding::Conductance(gkr), None, &others, config, starting_state)
    }

    fn var(&self, name: &str) -> String {
        format!("{}.{}", self.current_head, name)
    }

    fn simulate(
        &self,
        binding: Binding,
        concentration: Option<Concentration>,
        scale: &IonScale,
        config: &SimulationConfig,
        starting_state: Option<&ModelState>,
    ) -> Result<SignalLog> {
        config.validate()?;
        let period = self.protocol_period(config);
        if !(period > 0.0) || !period.is_finite() {
            return Err(TrappingError::InvalidConfig(format!(
                "protocol period must be positive, got {}",
                period
            )));
        }
        if let Some(c) = concentration {
            if !(c >= 0.0) || !c.is_finite() {
                return Err(TrappingError::InvalidConfig(format!(
                    "drug concentration must be finite and non-negative, got {}",
                    c
                )));
            }
        }

        let mut sim = self.model.simulation(&self.protocol)?;
        sim.reset();
        sim.set_tolerance(config.abs_tol, config.rel_tol);

        let mut state = self.model.initial_state();
        if let Some(start) = starting_state {
            for (name, value) in start.iter() {
                state.set(name, value)?;
            }
        }
        if let Some(c) = concentration {
            state.set(&self.drug_variable(), c)?;
        }
        sim.set_state(&state)?;

        let (params, kt, gkr) = match binding {
            Binding::Drug(p) => (p, TRAFFICKING_RATE, self.original.gkr),
            Binding::Conductance(g) => {
                let o = &self.original;
                (KineticParameters::new(o.vhalf, o.kmax, o.ku, o.n, o.halfmax), o.kt, g)
            }
        };
        sim.set_constant(&self.var("Vhalf"), params.vhalf)?;
        sim.set_constant(&self.var("Kmax"), params.kmax)?;
        sim.set_constant(&self.var("Ku"), params.ku)?;
        sim.set_constant(&self.var("n"), params.n)?;
        sim.set_constant(&self.var("halfmax"), params.ec50)?;
        sim.set_constant(&self.var("Kt"), kt)?;
        sim.set_constant(&self.var("gKr"), gkr)?;

        for (channel, factor) in scale.iter() {
            let name = channel.conductance_variable();
            let base = self.model.get(name)?.eval();
            sim.set_constant(name, base * factor)?;
        }

        let started = Instant::now();
        self.pre_pace(&mut sim, period, config, started)?;

        let mut recorded = config.recorded_variables.clone();
        let time_variable = self.model.time_variable().to_string();
        if !recorded.is_empty() && !recorded.contains(&time_variable) {
            recorded.insert(0, time_variable);
        }
        let log = sim.run(period * config.pulses_to_keep as f64, &recorded, config.timestep)?;
        check_budget(config, started, "recording")?;
        if let Some(name) = log.first_non_finite() {
            return Err(TrappingError::SimulationDivergence(format!(
                "non-finite values recorded for '{}'",
                name
            )));
        }

        if config.pulses_to_keep > 1 {
            log.fold(period)
        } else {
            Ok(log)
        }
    }

    /// Advance through the discarded pulses.
    ///
    /// Without a time budget or steady-state tolerance this is one solver
    /// call; otherwise pacing goes period by period so both can be checked.
    fn pre_pace(
        &self,
        sim: &mut M::Sim,
        period: Time,
        config: &SimulationConfig,
        started: Instant,
    ) -> Result<()> {
        let pulses = config.pulses_to_discard;
        if pulses == 0 {
            return Ok(());
        }
        if config.time_budget.is_none() && config.steady_state_tolerance.is_none() {
            return sim.pre(period * pulses as f64);
        }

        let mut previous = sim.state();
        for pulse in 0..pulses {
            check_budget(config, started, &format!("{} of {} pre-pacing pulses", pulse, pulses))?;
            sim.pre(period)?;
            check_budget(config, started, &format!("{} of {} pre-pacing pulses", pulse + 1, pulses))?;
            let current = sim.state();
            if let Some(tol) = config.steady_state_tolerance {
                if current.max_abs_diff(&previous) < tol {
                    debug!("steady state after {} pre-pacing pulses", pulse + 1);
                    break;
                }
            }
            previous = current;
        }
        Ok(())
    }
}

/// `SimulationDivergence` once the wall-clock budget of `config` is spent
fn check_budget(config: &SimulationConfig, started: Instant, stage: &str) -> Result<()> {
    match config.time_budget {
        Some(budget) if started.elapsed() >= budget => Err(TrappingError::SimulationDivergence(
            format!("time budget of {:?} exceeded after {}", budget, stage),
        )),
        _ => Ok(()),
    }
}
