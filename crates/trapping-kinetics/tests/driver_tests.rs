//! Driver tests against the reference trapping engine

use approx::assert_relative_eq;
use std::time::Duration;
use trapping_core::{Model, Protocol, SimulationConfig, TrappingError};
use trapping_engine::{HergTrappingModel, IKR, TIME};
use trapping_kinetics::{extract_peak, state_occupancy, BindingKinetics};

/// 1 s step protocol: 100 ms at -80 mV, 500 ms at 0 mV, back to -80 mV
fn step_protocol() -> Protocol {
    Protocol::new()
        .with_event(-80.0, 0.0, 100.0, 1000.0)
        .and_then(|p| p.with_event(0.0, 100.0, 500.0, 1000.0))
        .and_then(|p| p.with_event(-80.0, 600.0, 400.0, 1000.0))
        .unwrap()
}

fn driver() -> BindingKinetics<HergTrappingModel> {
    BindingKinetics::new(HergTrappingModel::new(), step_protocol()).unwrap()
}

fn config() -> SimulationConfig {
    SimulationConfig::paced(10, 1)
        .unwrap()
        .with_timestep(1.0)
        .with_tolerance(1e-8, 1e-6)
        .with_variables(&[TIME, IKR])
}

#[test]
fn test_monotonic_dose_suppression() {
    let driver = driver();
    let peaks: Vec<f64> = [0.0, 100.0, 1000.0, 10000.0]
        .iter()
        .map(|&c| {
            let log = driver.run_drug_simulation("verapamil", c, &config(), None).unwrap();
            extract_peak(&log, IKR).unwrap().last()
        })
        .collect();

    assert!(peaks[0] > 0.0);
    for pair in peaks.windows(2) {
        assert!(pair[1] <= pair[0] * (1.0 + 1e-6), "peaks {:?}", peaks);
    }
    assert!(peaks[3] < peaks[0], "peaks {:?}", peaks);
}

#[test]
fn test_idempotent_reconfiguration() {
    let driver = driver();
    let first = driver.run_drug_simulation("verapamil", 1000.0, &config(), None).unwrap();
    // An unrelated run in between must not leak into the next one
    driver.run_drug_simulation("dofetilide", 30.0, &config(), None).unwrap();
    let second = driver.run_drug_simulation("verapamil", 1000.0, &config(), None).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_custom_parameters_match_library_drug() {
    let driver = driver();
    let kinetics = trapping_library::binding_parameters("verapamil").unwrap().kinetics;
    let custom = driver
        .run_custom_parameter_simulation(&kinetics, 300.0, &config(), None)
        .unwrap();
    let library = driver.run_drug_simulation("verapamil", 300.0, &config(), None).unwrap();
    assert_eq!(custom, library);
}

#[test]
fn test_conductance_scaling_is_linear() {
    let driver = driver();
    let g = driver.base_conductance();
    let full = driver.run_conductance_simulation(g, &config(), None).unwrap();
    let half = driver.run_conductance_simulation(0.5 * g, &config(), None).unwrap();
    let full_peak = extract_peak(&full, IKR).unwrap().last();
    let half_peak = extract_peak(&half, IKR).unwrap().last();
    assert_relative_eq!(half_peak, 0.5 * full_peak, max_relative = 1e-9);
}

#[test]
fn test_unknown_drug() {
    assert!(matches!(
        driver().run_drug_simulation("aspirin", 1.0, &config(), None),
        Err(TrappingError::UnknownDrug(_))
    ));
}

#[test]
fn test_multi_pulse_folding() {
    let driver = driver();
    let config = SimulationConfig::paced(3, 2)
        .unwrap()
        .with_timestep(1.0)
        .with_variables(&[IKR]);
    let log = driver.run_drug_simulation("dofetilide", 10.0, &config, None).unwrap();
    assert_eq!(log.pulses(), 2);
    assert_eq!(log.get_pulse(IKR, 1).unwrap().len(), 1000);
    assert_eq!(log.get_pulse(TIME, 1).unwrap()[0], 0.0);

    let peak = extract_peak(&log, IKR).unwrap();
    assert_eq!(peak.peaks.len(), 2);
}

#[test]
fn test_state_occupancy_is_complete() {
    let driver = driver();
    let config = SimulationConfig::paced(2, 1).unwrap().with_timestep(5.0);
    let log = driver.run_drug_simulation("bepridil", 100.0, &config, None).unwrap();
    let states = driver.model().states();
    let occupancy = state_occupancy(&log, &states, "ikr", None).unwrap();

    let labels: Vec<&str> = occupancy.iter().map(|(l, _)| l.as_str()).collect();
    assert_eq!(labels, vec!["O", "IO", "O*", "IO*", "C*"]);

    let closed = log.require("ikr.C").unwrap();
    for (k, c) in closed.iter().enumerate() {
        let total: f64 = c + occupancy.iter().map(|(_, s)| s[k]).sum::<f64>();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }
}

#[test]
fn test_time_budget_covers_recording() {
    let driver = driver();
    // Nothing to pre-pace: the budget must still apply to the recorded pulse
    let config = SimulationConfig {
        time_budget: Some(Duration::ZERO),
        ..SimulationConfig::paced(1, 1).unwrap().with_timestep(10.0)
    };
    assert_eq!(config.pulses_to_discard, 0);
    assert!(matches!(
        driver.run_drug_simulation("verapamil", 100.0, &config, None),
        Err(TrappingError::SimulationDivergence(_))
    ));

    let generous = SimulationConfig {
        time_budget: Some(Duration::from_secs(600)),
        ..config
    };
    assert!(driver.run_drug_simulation("verapamil", 100.0, &generous, None).is_ok());
}
