//! Stateless analysis of recorded signals.
//!
//! Degraded results are NaN. Malformed input (empty or inconsistent series)
//! is an error.

use log::debug;
use serde::{Deserialize, Serialize};
use trapping_core::{Result, SignalLog, Time, TrappingError};

/// Time after the stimulus ignored when searching for repolarisation (ms)
pub const REFRACTORY_WINDOW: Time = 5.0;

/// Fraction of the amplitude above the minimum that marks 90% repolarisation
const REPOLARISATION_LEVEL: f64 = 0.1;

// =============================================================================
// PEAK CURRENT
// =============================================================================

/// Per-pulse peaks of a recorded current
#[derive(Debug, Clone, PartialEq)]
pub struct PeakCurrent {
    pub peaks: Vec<f64>,
    /// `(first - last) / first`, zero when the first peak is zero
    pub reduction: f64,
}

impl PeakCurrent {
    /// Peak of the last recorded pulse
    pub fn last(&self) -> f64 {
        self.peaks.last().copied().unwrap_or(f64::NAN)
    }
}

/// Maximum that propagates NaN
fn nan_max(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, |m, v| {
        if m.is_nan() || v.is_nan() {
            f64::NAN
        } else {
            m.max(v)
        }
    })
}

fn nan_min(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::INFINITY, |m, v| {
        if m.is_nan() || v.is_nan() {
            f64::NAN
        } else {
            m.min(v)
        }
    })
}

/// Peak of `variable` in every recorded pulse.
///
/// An unfolded log counts as a single pulse.
pub fn extract_peak(log: &SignalLog, variable: &str) -> Result<PeakCurrent> {
    let series: Vec<&[f64]> = if log.pulses() == 0 {
        vec![log.require(variable)?]
    } else {
        (0..log.pulses())
            .map(|i| log.require_pulse(variable, i))
            .collect::<Result<_>>()?
    };
    if series.iter().any(|s| s.is_empty()) {
        return Err(TrappingError::InvalidSignal(format!(
            "'{}' has an empty pulse",
            variable
        )));
    }

    let peaks: Vec<f64> = series.iter().map(|s| nan_max(s)).collect();
    let first = peaks[0];
    let last = peaks[peaks.len() - 1];
    let reduction = if first == 0.0 { 0.0 } else { (first - last) / first };
    Ok(PeakCurrent { peaks, reduction })
}

// =============================================================================
// APD90
// =============================================================================

/// Amplitude-based 90% repolarisation threshold
fn repolarisation_threshold(voltage: &[f64]) -> f64 {
    let min = nan_min(voltage);
    min + REPOLARISATION_LEVEL * (nan_max(voltage) - min)
}

/// Nearest-sample APD90 of a single pulse.
///
/// The duration is measured from `offset` to the first sample closest to
/// the 90% repolarisation level. A duration below 1 ms means no action
/// potential was found; the whole series length is returned instead.
pub fn apd90_fixed_offset(voltage: &[f64], offset: Time, timestep: Time) -> f64 {
    if voltage.is_empty() {
        return f64::NAN;
    }
    let threshold = repolarisation_threshold(voltage);
    if threshold.is_nan() {
        return f64::NAN;
    }
    let mut index = 0;
    let mut best = f64::INFINITY;
    for (i, v) in voltage.iter().enumerate() {
        let distance = (v - threshold).abs();
        if distance < best {
            best = distance;
            index = i;
        }
    }
    let apd = index as f64 * timestep - offset;
    if apd < 1.0 {
        voltage.len() as f64 * timestep
    } else {
        apd
    }
}

/// Interpolated APD90 of every pulse in `voltage`.
///
/// `time` is either the time base of one pulse or of the whole series. The
/// sampling interval is taken from it and pulses are `period` long. Within
/// each pulse the first sample below the 90% repolarisation level, searched
/// from [`REFRACTORY_WINDOW`] past `offset`, is linearly interpolated with
/// its predecessor. A pulse without such a sample yields NaN.
pub fn apd90_interpolated(
    time: &[f64],
    voltage: &[f64],
    offset: Time,
    period: Time,
) -> Result<Vec<f64>> {
    if time.len() < 2 || voltage.is_empty() {
        return Err(TrappingError::InvalidSignal(
            "APD90 needs at least two time samples and a voltage trace".into(),
        ));
    }
    if !(period > 0.0) || !(offset >= 0.0) {
        return Err(TrappingError::InvalidSignal(format!(
            "invalid APD90 window: offset {} period {}",
            offset, period
        )));
    }
    let dt = (time[time.len() - 1] - time[0]) / (time.len() - 1) as f64;
    if !(dt > 0.0) {
        return Err(TrappingError::InvalidSignal("time base is not increasing".into()));
    }

    let per_pulse = ((period / dt).round() as usize).clamp(1, voltage.len());
    if voltage.len() % per_pulse != 0 {
        return Err(TrappingError::InvalidSignal(format!(
            "{} voltage samples do not split into pulses of {}",
            voltage.len(),
            per_pulse
        )));
    }
    let flat_time = time.len() == voltage.len();
    if !flat_time && time.len() < per_pulse {
        return Err(TrappingError::InvalidSignal(format!(
            "time base of {} samples is shorter than one pulse of {}",
            time.len(),
            per_pulse
        )));
    }

    let offset_index = (offset / dt).round() as usize;
    let refractory = (REFRACTORY_WINDOW / dt).round() as usize;
    if offset_index >= per_pulse {
        return Err(TrappingError::InvalidSignal(format!(
            "offset {} lies beyond a pulse of {} ms",
            offset, period
        )));
    }

    let pulses = voltage.len() / per_pulse;
    let apds = (0..pulses)
        .map(|pulse| {
            let base = pulse * per_pulse;
            let pulse_time = if flat_time {
                &time[base..base + per_pulse]
            } else {
                &time[..per_pulse]
            };
            let pulse_voltage = &voltage[base..base + per_pulse];
            match pulse_apd90(pulse_time, pulse_voltage, offset_index, refractory, pulse) {
                Ok(apd) => apd,
                Err(e) => {
                    debug!("{}", e);
                    f64::NAN
                }
            }
        })
        .collect();
    Ok(apds)
}

fn pulse_apd90(
    time: &[f64],
    voltage: &[f64],
    offset_index: usize,
    refractory: usize,
    pulse: usize,
) -> Result<f64> {
    let threshold = repolarisation_threshold(voltage);
    let search_from = offset_index + refractory;
    let crossing = voltage
        .iter()
        .enumerate()
        .skip(search_from)
        .find(|(_, v)| **v < threshold)
        .map(|(j, _)| j)
        .ok_or(TrappingError::NoRepolarizationCrossing { pulse })?;

    let end = if crossing == 0 {
        time[0]
    } else {
        let (t_prev, v_prev) = (time[crossing - 1], voltage[crossing - 1]);
        let (t_cur, v_cur) = (time[crossing], voltage[crossing]);
        // Already repolarised when the search starts: nothing to interpolate
        if v_prev < threshold || v_cur == v_prev {
            t_cur
        } else {
            t_prev + (threshold - v_prev) / (v_cur - v_prev) * (t_cur - t_prev)
        }
    };
    Ok(end - time[offset_index])
}

/// APD90 extraction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Apd90Strategy {
    /// Nearest sample, measured from a fixed offset
    LegacyNearestSample,
    /// Linear interpolation after a refractory window
    #[default]
    Interpolated,
}

impl Apd90Strategy {
    /// APD90 of every pulse of `voltage_variable` in `log`
    pub fn per_pulse(
        &self,
        log: &SignalLog,
        voltage_variable: &str,
        offset: Time,
        period: Time,
        timestep: Time,
    ) -> Result<Vec<f64>> {
        match self {
            Self::LegacyNearestSample => {
                if log.pulses() == 0 {
                    let v = log.require(voltage_variable)?;
                    return Ok(vec![apd90_fixed_offset(v, offset, timestep)]);
                }
                (0..log.pulses())
                    .map(|i| {
                        log.require_pulse(voltage_variable, i)
                            .map(|v| apd90_fixed_offset(v, offset, timestep))
                    })
                    .collect()
            }
            Self::Interpolated => {
                let time = if log.pulses() == 0 {
                    log.require(log.time_key())?
                } else {
                    log.require_pulse(log.time_key(), 0)?
                };
                apd90_interpolated(time, log.require(voltage_variable)?, offset, period)
            }
        }
    }
}

// =============================================================================
// STATE OCCUPANCY
// =============================================================================

fn occupancy_label(name: &str) -> String {
    match name {
        "Obound" => "O*".to_string(),
        "Cbound" => "C*".to_string(),
        "IObound" => "IO*".to_string(),
        other => other.to_string(),
    }
}

/// Occupancy series of the channel states in component `head`.
///
/// The drug concentration state is excluded and bound states are labelled
/// `O*`, `C*` and `IO*`. `pulse` selects one pulse of a folded log.
pub fn state_occupancy(
    log: &SignalLog,
    states: &[String],
    head: &str,
    pulse: Option<usize>,
) -> Result<Vec<(String, Vec<f64>)>> {
    let prefix = format!("{}.", head);
    states
        .iter()
        .filter_map(|qname| {
            let name = qname.strip_prefix(&prefix)?;
            (name != "D").then_some((qname, name))
        })
        .map(|(qname, name)| -> Result<(String, Vec<f64>)> {
            let series = match pulse {
                Some(i) => log.require_pulse(qname, i)?,
                None => log.require(qname)?,
            };
            Ok((occupancy_label(name), series.to_vec()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Upstroke at `t = 0` to +40 mV, linear decay to -80 mV over `d`
    fn triangle_ap(d: f64, dt: f64, period: f64) -> (Vec<f64>, Vec<f64>) {
        let n = (period / dt).round() as usize;
        let time: Vec<f64> = (0..n).map(|k| k as f64 * dt).collect();
        let voltage = time
            .iter()
            .map(|&t| if t < d { 40.0 - 120.0 * t / d } else { -80.0 })
            .collect();
        (time, voltage)
    }

    #[test]
    fn test_apd90_interpolated_triangle() {
        let (time, voltage) = triangle_ap(300.0, 0.1, 1000.0);
        let apd = apd90_interpolated(&time, &voltage, 0.0, 1000.0).unwrap();
        assert_eq!(apd.len(), 1);
        assert!((apd[0] - 270.0).abs() <= 0.1, "apd {}", apd[0]);
    }

    #[test]
    fn test_apd90_interpolated_two_pulses() {
        let (time, mut voltage) = triangle_ap(300.0, 0.5, 1000.0);
        let (_, second) = triangle_ap(200.0, 0.5, 1000.0);
        voltage.extend(second);
        let apd = apd90_interpolated(&time, &voltage, 0.0, 1000.0).unwrap();
        assert_eq!(apd.len(), 2);
        assert_relative_eq!(apd[0], 270.0, epsilon = 0.5);
        assert_relative_eq!(apd[1], 180.0, epsilon = 0.5);

        // Same answer from a flat time base
        let flat: Vec<f64> = (0..voltage.len()).map(|k| k as f64 * 0.5).collect();
        let apd_flat = apd90_interpolated(&flat, &voltage, 0.0, 1000.0).unwrap();
        assert_relative_eq!(apd_flat[1], apd[1], epsilon = 1e-9);
    }

    #[test]
    fn test_apd90_no_crossing_is_nan() {
        // Never returns below the 90% level after the upstroke
        let time: Vec<f64> = (0..1000).map(|k| k as f64).collect();
        let voltage: Vec<f64> = time
            .iter()
            .map(|&t| if t < 1.0 { -80.0 } else { 40.0 })
            .collect();
        let apd = apd90_interpolated(&time, &voltage, 0.0, 1000.0).unwrap();
        assert!(apd[0].is_nan());
    }

    #[test]
    fn test_apd90_flat_at_search_start() {
        // Back at rest before the refractory window ends
        let time: Vec<f64> = (0..100).map(|k| k as f64).collect();
        let voltage: Vec<f64> = time
            .iter()
            .map(|&t| if t < 1.0 { 30.0 } else { -85.0 })
            .collect();
        let apd = apd90_interpolated(&time, &voltage, 0.0, 100.0).unwrap();
        assert!(apd[0].is_finite());
        assert_eq!(apd[0], REFRACTORY_WINDOW);
    }

    #[test]
    fn test_apd90_malformed_input() {
        assert!(apd90_interpolated(&[0.0], &[1.0], 0.0, 1.0).is_err());
        let time: Vec<f64> = (0..10).map(|k| k as f64).collect();
        assert!(apd90_interpolated(&time, &[0.0; 15], 0.0, 10.0).is_err());
        assert!(apd90_interpolated(&time, &[0.0; 10], 20.0, 10.0).is_err());
    }

    #[test]
    fn test_apd90_fixed_offset() {
        let (_, voltage) = triangle_ap(300.0, 0.1, 1000.0);
        let shifted: Vec<f64> = std::iter::repeat(-80.0)
            .take(500)
            .chain(voltage.into_iter())
            .take(10000)
            .collect();
        let apd = apd90_fixed_offset(&shifted, 50.0, 0.1);
        assert_relative_eq!(apd, 270.0, epsilon = 0.1);
    }

    #[test]
    fn test_apd90_fixed_offset_without_ap() {
        // The closest sample sits before the offset: whole length returned
        let voltage: Vec<f64> = (0..100).map(|k| if k < 10 { 0.0 } else { 10.0 }).collect();
        assert_eq!(apd90_fixed_offset(&voltage, 50.0, 1.0), 100.0);
        assert!(apd90_fixed_offset(&[], 50.0, 1.0).is_nan());
    }

    #[test]
    fn test_extract_peak() {
        let mut log = SignalLog::new("engine.time");
        log.insert("engine.time", (0..6).map(|k| k as f64).collect()).unwrap();
        log.insert("ikr.IKr", vec![0.0, 2.0, 1.0, 0.0, 1.5, 0.5]).unwrap();
        let folded = log.fold(3.0).unwrap();

        let peak = extract_peak(&folded, "ikr.IKr").unwrap();
        assert_eq!(peak.peaks, vec![2.0, 1.5]);
        assert_relative_eq!(peak.reduction, 0.25);
        assert_eq!(peak.last(), 1.5);

        let flat = extract_peak(&log, "ikr.IKr").unwrap();
        assert_eq!(flat.peaks, vec![2.0]);
        assert_eq!(flat.reduction, 0.0);
    }

    #[test]
    fn test_extract_peak_zero_first_peak() {
        let mut log = SignalLog::new("engine.time");
        log.insert("engine.time", (0..4).map(|k| k as f64).collect()).unwrap();
        log.insert("ikr.IKr", vec![0.0, -1.0, 3.0, 1.0]).unwrap();
        let peak = extract_peak(&log.fold(2.0).unwrap(), "ikr.IKr").unwrap();
        assert_eq!(peak.peaks, vec![0.0, 3.0]);
        assert_eq!(peak.reduction, 0.0);
    }

    #[test]
    fn test_strategies_agree_on_clean_ap() {
        let dt = 0.5;
        let (_, ap) = triangle_ap(300.0, dt, 950.0);
        let voltage: Vec<f64> = std::iter::repeat(-80.0).take(100).chain(ap).collect();
        let mut log = SignalLog::new("engine.time");
        log.insert("engine.time", (0..voltage.len()).map(|k| k as f64 * dt).collect())
            .unwrap();
        log.insert("membrane.V", voltage).unwrap();

        let legacy = Apd90Strategy::LegacyNearestSample
            .per_pulse(&log, "membrane.V", 50.0, 1000.0, dt)
            .unwrap();
        let interpolated = Apd90Strategy::Interpolated
            .per_pulse(&log, "membrane.V", 50.0, 1000.0, dt)
            .unwrap();
        assert_relative_eq!(legacy[0], interpolated[0], epsilon = dt);
    }

    #[test]
    fn test_state_occupancy() {
        let mut log = SignalLog::new("engine.time");
        log.insert("engine.time", vec![0.0, 1.0]).unwrap();
        log.insert("ikr.O", vec![0.1, 0.2]).unwrap();
        log.insert("ikr.Obound", vec![0.3, 0.4]).unwrap();
        log.insert("ikr.D", vec![10.0, 10.0]).unwrap();
        let states: Vec<String> = ["ikr.O", "ikr.Obound", "ikr.D"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let occupancy = state_occupancy(&log, &states, "ikr", None).unwrap();
        assert_eq!(occupancy.len(), 2);
        assert_eq!(occupancy[1].0, "O*");
        assert_eq!(occupancy[1].1, vec![0.3, 0.4]);
    }
}
