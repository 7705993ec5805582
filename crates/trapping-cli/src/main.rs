//! # Trapping CLI
//!
//! Command-line interface for hERG drug trapping simulations.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use trapping_compare::{normalise_peaks, ComparisonSettings};
use trapping_core::{Channel, Concentration, HillCurveParameters, TrappingError};
use trapping_engine::{HergTrappingModel, IKR};
use trapping_hill::{FitResult, HillOptimiser};
use trapping_kinetics::{extract_peak, BindingKinetics};
use trapping_library::{BindingParameters, GridKind};

#[derive(Parser)]
#[command(name = "trapping")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "hERG drug trapping simulation and Hill curve calibration", long_about = None)]
struct Cli {
    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Comparison settings file (JSON)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List drugs, protocols and channels
    List,

    /// Show the library entries of a drug
    Params {
        /// Drug name
        drug: String,
    },

    /// Evaluate a literature Hill curve
    Hill {
        /// Drug name
        drug: String,
        /// Ion channel
        #[arg(short, long, default_value = "IKr")]
        channel: String,
        /// Concentrations (nM); defaults to the literature grid
        #[arg(long, num_args = 1..)]
        conc: Vec<f64>,
    },

    /// Fit a Hill curve to concentration-response data
    Fit {
        /// Two columns: concentration, normalised response
        data: PathBuf,
        /// Write the two-value record here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sweep the reference channel engine across a drug's concentrations
    Sweep {
        /// Drug name
        drug: String,
        /// Voltage clamp protocol
        #[arg(short, long, default_value = "Milnes")]
        protocol: String,
        /// Concentration grid: coarse, fine or lit
        #[arg(short, long, default_value = "coarse")]
        grid: String,
        /// Total pulses per concentration; the last one is recorded
        #[arg(long)]
        pulses: Option<usize>,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::List => list(cli.json)?,
        Commands::Params { drug } => params(&drug, cli.json)?,
        Commands::Hill { drug, channel, conc } => hill(&drug, &channel, conc, cli.json)?,
        Commands::Fit { data, output } => fit(&data, output.as_deref(), cli.json)?,
        Commands::Sweep {
            drug,
            protocol,
            grid,
            pulses,
        } => {
            let settings = load_settings(cli.settings.as_deref())?;
            sweep(&drug, &protocol, &grid, pulses, &settings, cli.json)?
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<ComparisonSettings> {
    let Some(path) = path else {
        return Ok(ComparisonSettings::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading settings {}", path.display()))?;
    let settings: ComparisonSettings = serde_json::from_str(&text)
        .with_context(|| format!("parsing settings {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

// =============================================================================
// LIBRARY
// =============================================================================

#[derive(Serialize)]
struct Listing {
    compounds: Vec<&'static str>,
    binding_drugs: Vec<&'static str>,
    hill_drugs: Vec<&'static str>,
    protocols: Vec<&'static str>,
    channels: Vec<&'static str>,
}

fn list(json: bool) -> anyhow::Result<()> {
    let listing = Listing {
        compounds: trapping_library::drug_compounds().to_vec(),
        binding_drugs: trapping_library::binding_drugs().collect(),
        hill_drugs: trapping_library::hill_drugs().collect(),
        protocols: trapping_library::protocol_names().collect(),
        channels: Channel::ALL.iter().map(|c| c.name()).collect(),
    };
    if json {
        return print_json(&listing);
    }

    println!("{}", "Binding kinetics:".green().bold());
    for drug in &listing.binding_drugs {
        let marker = if listing.compounds.contains(drug) { "*" } else { " " };
        println!("  {} {}", marker, drug.cyan());
    }
    println!("  (* canonical compound set)");
    println!();
    println!("{}", "Hill curves:".green().bold());
    println!("  {}", listing.hill_drugs.join(", "));
    println!();
    println!("{}", "Protocols:".green().bold());
    for name in &listing.protocols {
        let descriptor = trapping_library::protocol(name)?;
        println!("  {} - {} ms", name.cyan(), descriptor.pulse_time);
    }
    println!();
    println!("{}", "Channels:".green().bold());
    println!("  {}", listing.channels.join(", "));
    Ok(())
}

#[derive(Serialize)]
struct DrugReport {
    drug: String,
    binding: Option<BindingParameters>,
    hill: Vec<(Channel, HillCurveParameters)>,
    grids: Vec<(GridKind, Vec<Concentration>)>,
}

fn params(drug: &str, json: bool) -> anyhow::Result<()> {
    let report = DrugReport {
        drug: drug.to_string(),
        binding: trapping_library::binding_parameters(drug).ok(),
        hill: trapping_library::hill_curves(drug).unwrap_or_default(),
        grids: [GridKind::Coarse, GridKind::Fine, GridKind::LitDefault]
            .into_iter()
            .filter_map(|kind| Some((kind, trapping_library::concentration_grid(drug, kind).ok()?)))
            .collect(),
    };
    if report.binding.is_none() && report.hill.is_empty() {
        return Err(TrappingError::UnknownDrug(drug.to_string()).into());
    }
    if json {
        return print_json(&report);
    }

    println!("{} {}", "Drug:".green().bold(), drug.cyan());
    if let Some(b) = &report.binding {
        let k = &b.kinetics;
        println!();
        println!("{}", "Binding kinetics:".green().bold());
        println!("  Vhalf = {} mV", k.vhalf);
        println!("  Kmax  = {}", k.kmax);
        println!("  Ku    = {} 1/ms", k.ku);
        println!("  N     = {}", k.n);
        println!("  EC50  = {:e}", k.ec50);
        println!("  Cmax  = {} nM", b.cmax);
        println!("  EC50^(1/N) = {:.4e}", k.normalising_constant());
        let outside = trapping_library::out_of_range(k);
        if !outside.is_empty() {
            let names: Vec<String> = outside.iter().map(|p| p.to_string()).collect();
            println!("  {} {}", "outside sampled range:".yellow(), names.join(", "));
        }
    }
    if !report.hill.is_empty() {
        println!();
        println!("{}", "Hill curves:".green().bold());
        for (channel, curve) in &report.hill {
            if curve.is_no_effect() {
                println!("  {:<5} no effect", channel.name());
            } else {
                println!("  {:<5} n = {:<8} IC50 = {} nM", channel.name(), curve.hill_coef, curve.ic50);
            }
        }
    }
    for (kind, grid) in &report.grids {
        println!();
        println!("{} {}", "Grid".green().bold(), kind.to_string().cyan());
        let values: Vec<String> = grid.iter().map(|c| format!("{:.4e}", c)).collect();
        println!("  {}", values.join(" "));
    }
    Ok(())
}

// =============================================================================
// HILL CURVES
// =============================================================================

#[derive(Serialize)]
struct HillPoint {
    concentration: Concentration,
    response: f64,
}

fn hill(drug: &str, channel: &str, conc: Vec<f64>, json: bool) -> anyhow::Result<()> {
    let channel: Channel = channel.parse()?;
    let curve = trapping_library::hill_curve(drug, channel)?;
    let concentrations = if conc.is_empty() {
        trapping_library::concentration_grid(drug, GridKind::LitDefault)
            .context("no literature grid for this drug; pass --conc")?
    } else {
        conc
    };
    let points: Vec<HillPoint> = concentrations
        .iter()
        .map(|&c| HillPoint {
            concentration: c,
            response: trapping_hill::response(&curve, c),
        })
        .collect();
    if json {
        return print_json(&points);
    }

    println!(
        "{} {} on {} (n = {}, IC50 = {} nM)",
        "Hill curve:".green().bold(),
        drug.cyan(),
        channel,
        curve.hill_coef,
        curve.ic50
    );
    println!("  {:>14}  {:>10}", "conc (nM)", "response");
    for p in &points {
        println!("  {:>14.4e}  {:>10.6}", p.concentration, p.response);
    }
    Ok(())
}

/// Two numeric columns separated by commas or whitespace.
///
/// Blank lines, `#` comments and a leading header line are skipped.
fn parse_columns(text: &str) -> anyhow::Result<(Vec<f64>, Vec<f64>)> {
    let mut x = Vec::new();
    let mut y = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        let parsed: Option<Vec<f64>> = fields.iter().map(|f| f.parse().ok()).collect();
        match parsed {
            Some(values) if values.len() >= 2 => {
                x.push(values[0]);
                y.push(values[1]);
            }
            None if x.is_empty() => continue,
            _ => bail!("line {}: expected two numbers, got '{}'", number + 1, line),
        }
    }
    if x.is_empty() {
        bail!("no data rows");
    }
    Ok((x, y))
}

fn fit(data: &Path, output: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(data)
        .with_context(|| format!("reading {}", data.display()))?;
    let (concentrations, responses) = parse_columns(&text)?;
    let result = HillOptimiser::new().fit(&concentrations, &responses, None)?;

    if let Some(path) = output {
        result.write_record(path)?;
        info!("Hill record written to {}", path.display());
    }
    if json {
        return print_json(&result);
    }
    report_fit(&result);
    Ok(())
}

fn report_fit(result: &FitResult) {
    match result {
        FitResult::Converged(p) => println!(
            "{} n = {:.4}, IC50 = {:.4e}",
            "Hill fit:".green().bold(),
            p.hill_coef,
            p.ic50
        ),
        FitResult::DidNotConverge { reason } => {
            println!("{} {}", "Hill fit did not converge:".yellow().bold(), reason)
        }
    }
}

// =============================================================================
// SWEEP
// =============================================================================

#[derive(Serialize)]
struct SweepReport {
    drug: String,
    protocol: String,
    pulses: usize,
    concentrations: Vec<Concentration>,
    peaks: Vec<f64>,
    normalised_peaks: Vec<f64>,
    fit: FitResult,
}

fn sweep(
    drug: &str,
    protocol: &str,
    grid: &str,
    pulses: Option<usize>,
    settings: &ComparisonSettings,
    json: bool,
) -> anyhow::Result<()> {
    let descriptor = trapping_library::protocol(protocol)?;
    let kind: GridKind = grid.parse()?;
    trapping_library::binding_parameters(drug)?;
    let concentrations = trapping_library::concentration_grid(drug, kind)?;

    let pulses = pulses.unwrap_or(settings.channel_pulses);
    let config = settings
        .channel_config
        .clone()
        .with_pulses(pulses, 1)?
        .with_variables(&[IKR]);
    let driver = BindingKinetics::new(HergTrappingModel::new(), descriptor.build()?)?;

    let pb = if json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(concentrations.len() as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg}\n{bar:40.cyan/blue} {pos}/{len} ({eta})")?
            .progress_chars("##-"),
    );
    pb.set_message(format!("{} under {} ({} pulses)", drug, descriptor.name, pulses));

    let mut peaks = Vec::with_capacity(concentrations.len());
    for &c in &concentrations {
        let peak = match driver.run_drug_simulation(drug, c, &config, None) {
            Ok(log) => extract_peak(&log, IKR)?.last(),
            Err(e) if e.is_local() => {
                warn!("{} nM: {}", c, e);
                f64::NAN
            }
            Err(e) => return Err(e.into()),
        };
        peaks.push(peak);
        pb.inc(1);
    }
    pb.finish_with_message("sweep complete");

    let normalised_peaks = normalise_peaks(&peaks);
    let fit = if normalised_peaks.iter().any(|p| p.is_nan()) {
        FitResult::failed("peak currents are constant or missing")
    } else {
        HillOptimiser::new().fit(&concentrations, &normalised_peaks, None)?
    };

    let report = SweepReport {
        drug: drug.to_string(),
        protocol: descriptor.name.to_string(),
        pulses,
        concentrations,
        peaks,
        normalised_peaks,
        fit,
    };
    if json {
        return print_json(&report);
    }

    println!();
    println!("  {:>14}  {:>14}  {:>10}", "conc (nM)", "peak IKr", "normalised");
    for ((c, p), n) in report
        .concentrations
        .iter()
        .zip(&report.peaks)
        .zip(&report.normalised_peaks)
    {
        println!("  {:>14.4e}  {:>14.6e}  {:>10.6}", c, p, n);
    }
    println!();
    report_fit(&report.fit);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_columns() {
        let text = "# dose response\nconc,response\n0,1\n10, 0.5\n\n100\t0.1\n";
        let (x, y) = parse_columns(text).unwrap();
        assert_eq!(x, vec![0.0, 10.0, 100.0]);
        assert_eq!(y, vec![1.0, 0.5, 0.1]);
    }

    #[test]
    fn test_parse_columns_rejects_bad_rows() {
        assert!(parse_columns("1 0.5\n2 abc\n").is_err());
        assert!(parse_columns("1\n").is_err());
        assert!(parse_columns("# nothing\n").is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["trapping", "sweep", "verapamil", "--grid", "fine", "--json"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Sweep { drug, protocol, grid, pulses } => {
                assert_eq!(drug, "verapamil");
                assert_eq!(protocol, "Milnes");
                assert_eq!(grid, "fine");
                assert_eq!(pulses, None);
            }
            _ => panic!("expected sweep"),
        }
    }
}
