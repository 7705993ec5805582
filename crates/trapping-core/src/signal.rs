//! Recorded simulation output.
//!
//! A [`SignalLog`] maps variable names to time series. After [`SignalLog::fold`]
//! each series is also addressable per pulse. All series under the same
//! pulse index share one time base and length.

use crate::{ModelState, Result, Time, TrappingError};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Variable name, optionally indexed by pulse number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SignalKey {
    pub name: String,
    pub pulse: Option<usize>,
}

impl SignalKey {
    pub fn flat(name: &str) -> Self {
        Self { name: name.to_string(), pulse: None }
    }

    pub fn pulse(name: &str, pulse: usize) -> Self {
        Self { name: name.to_string(), pulse: Some(pulse) }
    }
}

/// Ordered mapping from variable name to recorded series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalLog {
    time_key: String,
    entries: Vec<(SignalKey, Vec<f64>)>,
    pulses: usize,
}

impl SignalLog {
    pub fn new(time_key: &str) -> Self {
        Self {
            time_key: time_key.to_string(),
            entries: Vec::new(),
            pulses: 0,
        }
    }

    /// Insert or replace a flat series.
    ///
    /// Every other flat series must have the same number of samples.
    pub fn insert(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        let mismatch = self
            .entries
            .iter()
            .find(|(k, v)| k.pulse.is_none() && k.name != name && v.len() != values.len());
        if let Some((key, existing)) = mismatch {
            return Err(TrappingError::InvalidSignal(format!(
                "series '{}' has {} samples, '{}' has {}",
                name,
                values.len(),
                key.name,
                existing.len()
            )));
        }
        let key = SignalKey::flat(name);
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = values,
            None => self.entries.push((key, values)),
        }
        Ok(())
    }

    pub fn time_key(&self) -> &str {
        &self.time_key
    }

    pub fn time(&self) -> Option<&[f64]> {
        self.get(&self.time_key)
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.lookup(&SignalKey::flat(name))
    }

    pub fn get_pulse(&self, name: &str, pulse: usize) -> Option<&[f64]> {
        self.lookup(&SignalKey::pulse(name, pulse))
    }

    pub fn require(&self, name: &str) -> Result<&[f64]> {
        self.get(name)
            .ok_or_else(|| TrappingError::UnknownVariable(name.to_string()))
    }

    pub fn require_pulse(&self, name: &str, pulse: usize) -> Result<&[f64]> {
        self.get_pulse(name, pulse)
            .ok_or_else(|| TrappingError::UnknownVariable(format!("{}[{}]", name, pulse)))
    }

    /// Names of the flat series, in insertion order
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries
            .iter()
            .filter(|(k, _)| k.pulse.is_none())
            .map(|(k, _)| k.name.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &SignalKey> + '_ {
        self.entries.iter().map(|(k, _)| k)
    }

    /// Samples per flat series
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .find(|(k, _)| k.pulse.is_none())
            .map(|(_, v)| v.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of pulses the log is folded into; zero when unfolded
    pub fn pulses(&self) -> usize {
        self.pulses
    }

    /// Number of per-pulse series recorded for `name`
    pub fn pulse_count(&self, name: &str) -> usize {
        self.entries
            .iter()
            .filter(|(k, _)| k.name == name && k.pulse.is_some())
            .count()
    }

    /// First flat series containing a NaN or infinite value
    pub fn first_non_finite(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, v)| v.iter().any(|x| !x.is_finite()))
            .map(|(k, _)| k.name.as_str())
    }

    /// Split every flat series into consecutive pulses of length `period`.
    ///
    /// Returns a new log holding the flat series plus one entry per
    /// `(name, pulse)`. Per-pulse time is measured from the pulse start.
    /// Fails if the pulses would not all have the same number of samples.
    pub fn fold(&self, period: Time) -> Result<SignalLog> {
        if !(period > 0.0) {
            return Err(TrappingError::InvalidSignal(format!(
                "fold period must be positive, got {}",
                period
            )));
        }
        let time = self.require(&self.time_key)?;
        let Some(&t0) = time.first() else {
            return Err(TrappingError::InvalidSignal("cannot fold an empty log".into()));
        };

        let index: Vec<usize> = time
            .iter()
            .map(|t| ((t - t0) / period + 1e-9).floor().max(0.0) as usize)
            .collect();
        let pulses = index.last().map_or(0, |i| i + 1);
        let per_pulse = time.len() / pulses;
        let uniform = per_pulse * pulses == time.len()
            && index.iter().enumerate().all(|(k, &i)| i == k / per_pulse);
        if !uniform {
            return Err(TrappingError::InvalidSignal(format!(
                "{} samples do not split into uniform pulses of period {}",
                time.len(),
                period
            )));
        }

        let flat: Vec<_> = self
            .entries
            .iter()
            .filter(|(k, _)| k.pulse.is_none())
            .cloned()
            .collect();
        let mut folded = SignalLog {
            time_key: self.time_key.clone(),
            entries: flat.clone(),
            pulses,
        };
        for (key, values) in flat {
            let matrix = Array2::from_shape_vec((pulses, per_pulse), values)
                .map_err(|e| TrappingError::InvalidSignal(e.to_string()))?;
            for (i, row) in matrix.rows().into_iter().enumerate() {
                let mut row = row.to_vec();
                if key.name == self.time_key {
                    let start = t0 + i as f64 * period;
                    row.iter_mut().for_each(|t| *t -= start);
                }
                folded.entries.push((SignalKey::pulse(&key.name, i), row));
            }
        }
        Ok(folded)
    }

    /// `pulses x samples` view of a folded series
    pub fn pulse_matrix(&self, name: &str) -> Result<Array2<f64>> {
        if self.pulses == 0 {
            return Err(TrappingError::InvalidSignal(format!(
                "log is not folded; cannot build pulse matrix for '{}'",
                name
            )));
        }
        let rows: Vec<&[f64]> = (0..self.pulses)
            .map(|i| self.require_pulse(name, i))
            .collect::<Result<_>>()?;
        let per_pulse = rows[0].len();
        let data: Vec<f64> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Array2::from_shape_vec((self.pulses, per_pulse), data)
            .map_err(|e| TrappingError::InvalidSignal(e.to_string()))
    }

    /// Last recorded value of each named state, for use as a starting state
    pub fn final_state(&self, states: &[String]) -> Result<ModelState> {
        let values = states
            .iter()
            .map(|name| {
                self.require(name)?
                    .last()
                    .copied()
                    .ok_or_else(|| TrappingError::InvalidSignal(format!("'{}' is empty", name)))
            })
            .collect::<Result<Vec<f64>>>()?;
        ModelState::new(states.to_vec(), values.into())
    }

    fn lookup(&self, key: &SignalKey) -> Option<&[f64]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}
