//! # Trapping Library
//!
//! Read-only parameter tables for hERG trapping studies.
//!
//! ## Tables
//!
//! | Table | Key | Source |
//! |-------|-----|--------|
//! | Binding kinetics | drug | Li et al. 2017, Table 2 |
//! | Hill curves | drug, channel | Li et al. 2017, multichannel block |
//! | Protocols | name | Milnes, Pneg80, P0, P40, current impulse |
//! | Concentration grids | drug, grid kind | coarse, fine, literature default |
//! | Parameter ranges | parameter | plausible kinetic ranges |
//!
//! Every lookup validates its key and fails with a typed error.
//!
//! Reference: Li Z, Dutta S, Sheng J, et al. Improving the In Silico
//! Assessment of Proarrhythmia Risk by Combining hERG Channel-Drug Binding
//! Kinetics and Multichannel Pharmacology. Circ Arrhythm Electrophysiol.
//! 2017;10(2):e004628.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use trapping_core::{
    linspace, logspace, Channel, Concentration, HillCurveParameters, KineticParameters, Protocol,
    Result, Time, TrappingError, Voltage,
};

// =============================================================================
// BINDING KINETICS
// =============================================================================

/// Binding kinetics of one drug plus its free therapeutic plasma concentration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BindingParameters {
    #[serde(flatten)]
    pub kinetics: KineticParameters,
    /// Free Cmax (nM)
    #[serde(rename = "Cmax")]
    pub cmax: Concentration,
}

/// `(drug, [Vhalf, Kmax, Ku, N, EC50, Cmax])`
const BINDING_TABLE: &[(&str, [f64; 6])] = &[
    ("dofetilide", [-1.147, 1e8, 1.79e-5, 0.9999, 5.483e8, 2.0]),
    ("bepridil", [-54.93, 3.735e7, 1.765e-4, 0.9365, 1e9, 33.0]),
    ("terfenadine", [-77.49, 9884.0, 8.18e-5, 0.65, 41380.0, 4.0]),
    ("cisapride", [-199.5, 9.997, 4.161e-4, 0.9728, 42.06, 2.6]),
    ("cisapride_kmax_verapamil", [-199.5, 4.646e4, 4.161e-4, 0.9728, 42.06, 2.6]),
    ("cisapride_kmax_bepridil", [-199.5, 3.735e7, 4.161e-4, 0.9728, 42.06, 2.6]),
    ("cisapride_EC50_ranolazine", [-199.5, 9.997, 4.161e-4, 0.9728, 1.472e5, 2.6]),
    ("cisapride_EC50_verapamil", [-199.5, 9.997, 4.161e-4, 0.9728, 9.184e6, 2.6]),
    ("cisapride_kmax_EC50_verapamil", [-199.5, 4.646e4, 4.161e-4, 0.9728, 9.184e6, 2.6]),
    ("verapamil", [-100.0, 4.646e4, 7.927e-4, 1.043, 9.184e6, 81.0]),
    ("ranolazine", [-94.87, 55.84, 1.929e-2, 0.95, 1.472e5, 1948.2]),
    ("mexiletine", [-86.26, 9.996, 9.967e-2, 1.304, 2.308e6, 4129.0]),
    ("quinidine", [-64.87, 5770.0, 1e-2, 0.8311, 1e6, 3237.0]),
    ("sotalol", [-55.0, 2403.0, 1.985e-2, 0.7516, 9.619e6, 14690.0]),
    ("chlorpromazine", [-14.57, 206000.0, 3.866e-2, 0.8871, 5.677e7, 38.0]),
    ("ondansetron", [-82.11, 33540.0, 2.325e-2, 0.8874, 9.95e6, 139.0]),
    ("diltiazem", [-90.89, 251.0, 2.816e-1, 0.9485, 1e6, 122.0]),
    ("droperidol", [-78.68, 14.21, 1.256e-3, 0.578, 116.5, 6.33]),
    ("pimozide", [-78.68, 10.07, 4.576e-5, 0.8714, 5.601, 0.431]),
];

/// Canonical drug set, in reference order
const DRUG_COMPOUNDS: [&str; 13] = [
    "dofetilide",
    "bepridil",
    "terfenadine",
    "cisapride",
    "verapamil",
    "ranolazine",
    "quinidine",
    "sotalol",
    "chlorpromazine",
    "ondansetron",
    "diltiazem",
    "mexiletine",
    "droperidol",
];

pub fn drug_compounds() -> &'static [&'static str] {
    &DRUG_COMPOUNDS
}

/// Every drug with binding kinetics, including synthetic variants
pub fn binding_drugs() -> impl Iterator<Item = &'static str> {
    BINDING_TABLE.iter().map(|(name, _)| *name)
}

pub fn binding_parameters(drug: &str) -> Result<BindingParameters> {
    BINDING_TABLE
        .iter()
        .find(|(name, _)| *name == drug)
        .map(|(_, [vhalf, kmax, ku, n, ec50, cmax])| BindingParameters {
            kinetics: KineticParameters::new(*vhalf, *kmax, *ku, *n, *ec50),
            cmax: *cmax,
        })
        .ok_or_else(|| TrappingError::UnknownDrug(drug.to_string()))
}

// =============================================================================
// HILL CURVES
// =============================================================================

/// `(drug, [(Hill_coef, IC50); 7])`, channels in [`Channel::ALL`] order
const HILL_TABLE: &[(&str, [(f64, f64); 7])] = &[
    (
        "dofetilide",
        [(0.9, 4.9), (0.3, 75316.4), (1.2, 260.3), (0.9, 380.5), (0.8, 18.8), (0.8, 394.3), (0.0, 0.0)],
    ),
    (
        "bepridil",
        [(0.9, 50.0), (1.4, 1813.9), (0.6, 2808.1), (1.2, 2929.3), (3.5, 8594.0), (0.0, 0.0), (0.7, 28628.3)],
    ),
    (
        "terfenadine",
        [(0.6, 23.0), (0.6, 20056.0), (0.7, 700.4), (1.0, 4803.2), (0.3, 239960.8), (0.0, 0.0), (0.5, 399754.0)],
    ),
    (
        "cisapride",
        [(0.7, 10.1), (0.0, 0.0), (0.4, 9258076.0), (0.0, 0.0), (0.2, 219112.4), (0.5, 29498.0), (0.3, 81192862.0)],
    ),
    (
        "verapamil",
        [(1.0, 288.0), (1.0, 7028.0), (1.1, 201.8), (0.0, 0.0), (0.8, 13429.2), (0.3, 3.49e8), (0.0, 0.0)],
    ),
    (
        "ranolazine",
        [(0.9, 8270.0), (0.9, 7884.5), (0.0, 0.0), (1.4, 68774.0), (0.0, 0.0), (0.0, 0.0), (0.5, 36155020.0)],
    ),
    (
        "mexiletine",
        [(0.9, 28880.0), (1.4, 8956.8), (1.0, 38243.6), (0.0, 0.0), (0.0, 0.0), (0.0, 0.0), (0.0, 0.0)],
    ),
    (
        "quinidine",
        [(0.8, 992.0), (1.3, 9417.0), (0.6, 51592.3), (1.5, 12329.0), (1.3, 3487.4), (0.4, 39589919.0), (1.4, 4898.9)],
    ),
    (
        "sotalol",
        [(0.8, 110600.0), (0.0, 0.0), (0.9, 7061527.0), (0.5, 1.14e9), (0.7, 43143455.0), (1.2, 3050260.0), (1.2, 4221856.0)],
    ),
    (
        "chlorpromazine",
        [(0.8, 929.2), (0.9, 4559.6), (0.8, 8191.9), (2.0, 4535.6), (0.4, 17616711.0), (0.7, 9269.9), (0.0, 0.0)],
    ),
    (
        "ondansetron",
        [(0.9, 1320.0), (1.0, 19180.8), (0.8, 22551.4), (1.0, 57666.4), (1.0, 1023378.0), (0.0, 0.0), (0.7, 569807.0)],
    ),
    (
        "diltiazem",
        [(0.9, 13150.0), (0.7, 21868.5), (0.7, 112.1), (0.7, 110859.0), (0.2, 2.82e9), (0.0, 0.0), (0.0, 0.0)],
    ),
];

/// Drugs with multichannel Hill data
pub fn hill_drugs() -> impl Iterator<Item = &'static str> {
    HILL_TABLE.iter().map(|(name, _)| *name)
}

/// Literature Hill curves of every channel for `drug`
pub fn hill_curves(drug: &str) -> Result<Vec<(Channel, HillCurveParameters)>> {
    let (_, row) = HILL_TABLE
        .iter()
        .find(|(name, _)| *name == drug)
        .ok_or_else(|| TrappingError::UnknownDrug(drug.to_string()))?;
    Ok(Channel::ALL
        .iter()
        .zip(row.iter())
        .map(|(channel, (hill_coef, ic50))| (*channel, HillCurveParameters::new(*hill_coef, *ic50)))
        .collect())
}

pub fn hill_curve(drug: &str, channel: Channel) -> Result<HillCurveParameters> {
    hill_curves(drug)?
        .into_iter()
        .find(|(c, _)| *c == channel)
        .map(|(_, curve)| curve)
        .ok_or_else(|| TrappingError::UnknownDrug(format!("{} ({})", drug, channel)))
}

// =============================================================================
// PROTOCOLS
// =============================================================================

/// Named pacing protocol with its default period
#[derive(Debug, Clone, Copy)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    /// Default period (ms)
    pub pulse_time: Time,
    /// Builds the protocol for a given period
    pub waveform: fn(Time) -> Result<Protocol>,
    /// Distinct clamp levels (mV)
    pub voltage_points: &'static [Voltage],
}

impl ProtocolDescriptor {
    /// Protocol at the default period
    pub fn build(&self) -> Result<Protocol> {
        (self.waveform)(self.pulse_time)
    }
}

const PROTOCOLS: [ProtocolDescriptor; 4] = [
    ProtocolDescriptor {
        name: "Milnes",
        pulse_time: 25e3,
        waveform: milnes,
        voltage_points: &[-80.0, 0.0],
    },
    ProtocolDescriptor {
        name: "Pneg80",
        pulse_time: 5400.0,
        waveform: pneg80,
        voltage_points: &[-80.0, -50.0, 20.0],
    },
    ProtocolDescriptor {
        name: "P0",
        pulse_time: 5400.0,
        waveform: p0,
        voltage_points: &[-80.0, -60.0, 0.0],
    },
    ProtocolDescriptor {
        name: "P40",
        pulse_time: 5400.0,
        waveform: p40,
        voltage_points: &[-80.0, -60.0, 40.0],
    },
];

pub fn protocol_names() -> impl Iterator<Item = &'static str> {
    PROTOCOLS.iter().map(|p| p.name)
}

pub fn protocol(name: &str) -> Result<ProtocolDescriptor> {
    PROTOCOLS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name))
        .copied()
        .ok_or_else(|| TrappingError::UnknownProtocol(name.to_string()))
}

/// Schedule consecutive clamp steps, then hold `rest` until the period ends.
fn clamp_steps(period: Time, steps: &[(Voltage, Time)], rest: Voltage) -> Result<Protocol> {
    let busy: Time = steps.iter().map(|(_, d)| d).sum();
    if !(period > busy) {
        return Err(TrappingError::InvalidConfig(format!(
            "protocol period {} is shorter than its {} ms of steps",
            period, busy
        )));
    }
    let mut protocol = Protocol::new();
    let mut start = 0.0;
    for &(level, duration) in steps {
        protocol.schedule(level, start, duration, period)?;
        start += duration;
    }
    protocol.schedule(rest, start, period - start, period)?;
    Ok(protocol)
}

/// Milnes protocol: a 10 s step to 0 mV after a short -90 mV leak step
pub fn milnes(period: Time) -> Result<Protocol> {
    clamp_steps(
        period,
        &[(-80.0, 800.0), (-90.0, 100.0), (-80.0, 100.0), (0.0, 10_000.0)],
        -80.0,
    )
}

fn three_level(period: Time, points: [Voltage; 3]) -> Result<Protocol> {
    clamp_steps(
        period,
        &[(points[0], 100.0), (points[1], 100.0), (points[2], 5000.0)],
        points[0],
    )
}

pub fn pneg80(period: Time) -> Result<Protocol> {
    three_level(period, [-80.0, -50.0, 20.0])
}

pub fn p0(period: Time) -> Result<Protocol> {
    three_level(period, [-80.0, -60.0, 0.0])
}

pub fn p40(period: Time) -> Result<Protocol> {
    three_level(period, [-80.0, -60.0, 40.0])
}

/// Stimulus start within each action-potential pacing period (ms)
pub const STIMULUS_OFFSET: Time = 50.0;

/// Unit stimulus of 0.5 ms at [`STIMULUS_OFFSET`] into every period
pub fn current_impulse(period: Time) -> Result<Protocol> {
    if !(period > STIMULUS_OFFSET + 0.5) {
        return Err(TrappingError::InvalidConfig(format!(
            "pacing period {} does not fit the stimulus",
            period
        )));
    }
    Protocol::new().with_event(1.0, STIMULUS_OFFSET, 0.5, period)
}

// =============================================================================
// CONCENTRATION GRIDS
// =============================================================================

/// Kind of default concentration grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridKind {
    /// Hand-picked points including zero
    Coarse,
    /// 20 log-spaced points
    Fine,
    /// Concentrations used in the literature
    LitDefault,
}

impl FromStr for GridKind {
    type Err = TrappingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "coarse" => Ok(Self::Coarse),
            "fine" => Ok(Self::Fine),
            "lit" | "lit_default" => Ok(Self::LitDefault),
            other => Err(TrappingError::ParseError(format!("unknown grid kind '{}'", other))),
        }
    }
}

impl fmt::Display for GridKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Coarse => "coarse",
            Self::Fine => "fine",
            Self::LitDefault => "lit_default",
        })
    }
}

/// Points in a fine grid
pub const FINE_GRID_POINTS: usize = 20;

struct GridEntry {
    drug: &'static str,
    coarse: &'static [f64],
    /// Decade bounds of the fine grid
    fine: (f64, f64),
    lit_default: [f64; 4],
}

const GRID_TABLE: &[GridEntry] = &[
    GridEntry {
        drug: "dofetilide",
        coarse: &[0.0, 0.1, 1.0, 10.0, 30.0, 100.0, 300.0, 500.0, 1000.0],
        fine: (-1.0, 2.5),
        lit_default: [1.0, 3.0, 10.0, 30.0],
    },
    GridEntry {
        drug: "verapamil",
        coarse: &[0.0, 0.1, 1.0, 30.0, 300.0, 1000.0, 10000.0, 1e5],
        fine: (-1.0, 5.0),
        lit_default: [30.0, 100.0, 300.0, 1000.0],
    },
    GridEntry {
        drug: "bepridil",
        coarse: &[0.0, 0.1, 1.0, 30.0, 100.0, 300.0, 1000.0, 10000.0],
        fine: (-1.0, 5.0),
        lit_default: [10.0, 30.0, 100.0, 300.0],
    },
    GridEntry {
        drug: "terfenadine",
        coarse: &[0.0, 0.1, 1.0, 10.0, 30.0, 100.0, 300.0, 500.0, 1000.0, 10000.0],
        fine: (-1.0, 5.0),
        lit_default: [3.0, 10.0, 30.0, 100.0],
    },
    GridEntry {
        drug: "cisapride",
        coarse: &[0.0, 0.1, 1.0, 10.0, 30.0, 100.0, 300.0, 500.0, 1000.0, 3000.0],
        fine: (-1.0, 3.0),
        lit_default: [1.0, 10.0, 100.0, 300.0],
    },
    GridEntry {
        drug: "ranolazine",
        coarse: &[0.0, 1.0, 30.0, 300.0, 500.0, 1000.0, 10000.0, 1e5, 1e6],
        fine: (1.0, 5.5),
        lit_default: [1000.0, 1e4, 3e4, 1e5],
    },
    GridEntry {
        drug: "quinidine",
        coarse: &[0.0, 1.0, 30.0, 300.0, 500.0, 1000.0, 3000.0, 10000.0, 1e5],
        fine: (-1.0, 5.0),
        lit_default: [100.0, 300.0, 1000.0, 10000.0],
    },
    GridEntry {
        drug: "sotalol",
        coarse: &[0.0, 1.0, 30.0, 100.0, 300.0, 1000.0, 10000.0, 3e4, 1e5, 3e5, 1e6, 1e7],
        fine: (-1.0, 7.0),
        lit_default: [1e4, 3e4, 1e5, 3e5],
    },
    GridEntry {
        drug: "chlorpromazine",
        coarse: &[0.0, 1.0, 30.0, 300.0, 500.0, 1000.0, 3000.0, 10000.0, 1e5],
        fine: (-1.0, 4.5),
        lit_default: [100.0, 300.0, 1000.0, 3000.0],
    },
    GridEntry {
        drug: "ondansetron",
        coarse: &[0.0, 1.0, 30.0, 300.0, 500.0, 1000.0, 3000.0, 10000.0, 1e5, 3e5],
        fine: (-1.0, 5.5),
        lit_default: [300.0, 1000.0, 3000.0, 1e4],
    },
    GridEntry {
        drug: "diltiazem",
        coarse: &[0.0, 1.0, 30.0, 100.0, 300.0, 1000.0, 3000.0, 10000.0, 3e4, 1e5, 1e6, 1e7],
        fine: (-1.0, 6.0),
        lit_default: [3000.0, 1e4, 3e4, 1e5],
    },
    GridEntry {
        drug: "mexiletine",
        coarse: &[0.0, 1.0, 30.0, 100.0, 300.0, 1000.0, 10000.0, 3e4, 1e5, 1e6, 1e7],
        fine: (-1.0, 7.0),
        lit_default: [1e4, 3e4, 1e5, 3e5],
    },
];

/// Default concentrations (nM) of `drug`, in increasing order
pub fn concentration_grid(drug: &str, kind: GridKind) -> Result<Vec<Concentration>> {
    let entry = GRID_TABLE
        .iter()
        .find(|e| e.drug == drug)
        .ok_or_else(|| TrappingError::UnknownDrug(drug.to_string()))?;
    Ok(match kind {
        GridKind::Coarse => entry.coarse.to_vec(),
        GridKind::Fine => logspace(entry.fine.0, entry.fine.1, FINE_GRID_POINTS),
        GridKind::LitDefault => entry.lit_default.to_vec(),
    })
}

// =============================================================================
// PARAMETER RANGES
// =============================================================================

/// Kinetic parameter names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterName {
    Vhalf,
    Kmax,
    Ku,
    N,
    EC50,
}

impl ParameterName {
    pub const ALL: [ParameterName; 5] = [Self::Vhalf, Self::Kmax, Self::Ku, Self::N, Self::EC50];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Vhalf => "Vhalf",
            Self::Kmax => "Kmax",
            Self::Ku => "Ku",
            Self::N => "N",
            Self::EC50 => "EC50",
        }
    }

    /// Plausible `(low, high)` range
    pub fn range(&self) -> (f64, f64) {
        match self {
            Self::Vhalf => (-150.0, -50.0),
            Self::Kmax => (30.0, 1e6),
            Self::Ku => (5e-3, 7e-2),
            Self::N => (0.8, 1.2),
            Self::EC50 => (1e3, 1e8),
        }
    }

    /// Parameters spanning several decades are sampled in log space
    pub fn is_logarithmic(&self) -> bool {
        matches!(self, Self::Kmax | Self::Ku | Self::EC50)
    }

    pub fn contains(&self, value: f64) -> bool {
        let (lo, hi) = self.range();
        value >= lo && value <= hi
    }

    /// `n` sample points covering the range
    pub fn sample(&self, n: usize) -> Vec<f64> {
        let (lo, hi) = self.range();
        if self.is_logarithmic() {
            logspace(lo.log10(), hi.log10(), n)
        } else {
            linspace(lo, hi, n)
        }
    }

    /// Value of this parameter in a kinetic parameter set
    pub fn value_in(&self, params: &KineticParameters) -> f64 {
        match self {
            Self::Vhalf => params.vhalf,
            Self::Kmax => params.kmax,
            Self::Ku => params.ku,
            Self::N => params.n,
            Self::EC50 => params.ec50,
        }
    }
}

impl fmt::Display for ParameterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ParameterName {
    type Err = TrappingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TrappingError::ParseError(format!("unknown parameter '{}'", s)))
    }
}

/// Parameters of `params` lying outside their plausible range
pub fn out_of_range(params: &KineticParameters) -> Vec<ParameterName> {
    ParameterName::ALL
        .iter()
        .copied()
        .filter(|p| !p.contains(p.value_in(params)))
        .collect()
}
