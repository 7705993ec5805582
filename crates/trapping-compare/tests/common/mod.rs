//! Common utilities for comparison tests

pub mod mock_models;

pub use mock_models::{duration, SyntheticModel};

use trapping_compare::{ComparisonSettings, ModelComparison};
use trapping_core::{Protocol, SimulationConfig};
use trapping_kinetics::BindingKinetics;

/// Short sweeps that keep the closed-form engines cheap
pub fn quick_settings() -> ComparisonSettings {
    ComparisonSettings {
        channel_pulses: 2,
        ap_pulses: 3,
        ap_pulses_kept: 2,
        apd_points: 8,
        hill_points: 15,
        channel_config: SimulationConfig::default().with_timestep(10.0),
        ap_config: SimulationConfig::default().with_timestep(1.0),
        ..Default::default()
    }
}

pub fn comparison_with(
    channel: SyntheticModel,
    cell: SyntheticModel,
    settings: ComparisonSettings,
) -> ModelComparison<SyntheticModel, SyntheticModel> {
    let clamp = Protocol::new().with_event(0.0, 100.0, 500.0, 1000.0).unwrap();
    let pacing = trapping_library::current_impulse(1000.0).unwrap();
    ModelComparison::new(
        BindingKinetics::new(channel, clamp).unwrap(),
        BindingKinetics::new(cell, pacing).unwrap(),
        settings,
    )
    .unwrap()
}

pub fn comparison() -> ModelComparison<SyntheticModel, SyntheticModel> {
    comparison_with(
        SyntheticModel::channel(),
        SyntheticModel::action_potential(),
        quick_settings(),
    )
}
