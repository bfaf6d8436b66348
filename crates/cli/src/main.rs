use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use tender_common::{CalibrationStore, CallSite, TenderConfig};
use tender_core::{
    fake_quantize_rows, reconstruction_error, ActivationSite, CalibrationRecord, ErrorStats,
};

#[derive(Parser, Debug)]
#[command(name = "tender", about = "Chunked magnitude-decomposition quantisation of tensors")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the default quantisation config.
    InitConfig(InitConfigArgs),
    /// Decompose every tensor of a safetensors file and write the reconstruction.
    Quantize(QuantizeArgs),
    /// Capture calibration records for every tensor of a safetensors file.
    Calibrate(CalibrateArgs),
    /// Fake-quantise weight matrices per output row.
    Weights(WeightsArgs),
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "tender.json")]
    output: PathBuf,
    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

#[derive(Parser, Debug)]
struct QuantizeArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Call site whose decomposition settings apply.
    #[arg(long, default_value = "mlp")]
    site: CallSite,
    /// Calibration store from `tender calibrate`, keyed by tensor name.
    #[arg(long)]
    calibration: Option<PathBuf>,
    /// Worker threads (0 = rayon default).
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

#[derive(Parser, Debug)]
struct CalibrateArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "mlp")]
    site: CallSite,
    #[arg(long, default_value_t = 0)]
    threads: usize,
}

#[derive(Parser, Debug)]
struct WeightsArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value_t = 4)]
    bits: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig(args) => cmd_init_config(args),
        Command::Quantize(args) => cmd_quantize(args),
        Command::Calibrate(args) => cmd_calibrate(args),
        Command::Weights(args) => cmd_weights(args),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────────

/// Load the config, creating a default file when the path does not exist.
fn load_config(path: Option<&Path>) -> Result<TenderConfig> {
    let config = match path {
        Some(p) if p.exists() => TenderConfig::load(p)
            .with_context(|| format!("reading config {}", p.display()))?,
        Some(p) => {
            let default = TenderConfig::default();
            default.save(p)?;
            eprintln!("Created default config at {}", p.display());
            default
        }
        None => TenderConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_threads(threads: usize) -> Result<()> {
    if threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}

fn load_tensors(path: &Path) -> Result<Vec<(String, Tensor)>> {
    let tensors = candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut tensors: Vec<_> = tensors.into_iter().collect();
    tensors.sort_by(|a, b| a.0.cmp(&b.0));
    tracing::info!(tensors = tensors.len(), path = %path.display(), "Loaded");
    Ok(tensors)
}

fn save_tensors(tensors: HashMap<String, Tensor>, path: &Path) -> Result<()> {
    candle_core::safetensors::save(&tensors, path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn progress(len: usize, what: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!("[{{elapsed_precise}}] {{bar:40}} {{pos}}/{{len}} {what}"))?
            .progress_chars("=>-"),
    );
    Ok(pb)
}

/// Per-tensor outcome of `quantize`.
struct TensorReport {
    name: String,
    shape: Vec<usize>,
    bands: Vec<usize>,
    error: ErrorStats,
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (pass --force to overwrite)",
            args.output.display()
        );
    }
    TenderConfig::default().save(&args.output)?;
    eprintln!("Wrote default config to {}", args.output.display());
    Ok(())
}

fn cmd_quantize(args: QuantizeArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    init_threads(args.threads)?;
    let site_config = config.site(args.site);
    let store = match &args.calibration {
        Some(p) => Some(
            CalibrationStore::load(p)
                .with_context(|| format!("reading calibration {}", p.display()))?,
        ),
        None => None,
    };
    let tensors = load_tensors(&args.input)?;
    tracing::info!(
        site = args.site.as_str(),
        bits = site_config.bits,
        factor = site_config.decomposition_factor,
        chunk_size = site_config.chunk_size,
        "Quantising"
    );

    let pb = progress(tensors.len(), "tensors")?;
    let results = tensors
        .into_par_iter()
        .map(|(name, tensor)| -> Result<(String, Tensor, Option<TensorReport>)> {
            if tensor.rank() < 2 {
                tracing::warn!(tensor = %name, shape = ?tensor.dims(), "Rank < 2, copied unchanged");
                pb.inc(1);
                return Ok((name, tensor, None));
            }
            let mut site = ActivationSite::new(site_config)?;
            if let Some(store) = &store {
                match store.get(&name) {
                    Some(stored) => site.set_calibration(Some(CalibrationRecord::from_stored(
                        stored,
                        tensor.device(),
                    )?)),
                    None => tracing::warn!(tensor = %name, "No calibration record, recomputing"),
                }
            }
            let d = site
                .decompose(&tensor)?
                .context("decomposition site is disabled")?;
            let out = d.reconstruct()?.reshape(tensor.shape())?;
            let error = reconstruction_error(&tensor, &out)?;
            let report = TensorReport {
                name: name.clone(),
                shape: tensor.dims().to_vec(),
                bands: d.stats().band_counts.clone(),
                error,
            };
            tracing::info!(
                tensor = %name,
                chunks = d.stats().chunks,
                mse = error.mse,
                sqnr_db = error.sqnr_db,
                "Decomposed"
            );
            pb.inc(1);
            Ok((name, out, Some(report)))
        })
        .collect::<Result<Vec<_>>>()?;
    pb.finish_with_message("done");

    let mut output = HashMap::with_capacity(results.len());
    let mut reports = Vec::new();
    for (name, tensor, report) in results {
        output.insert(name, tensor);
        reports.extend(report);
    }
    let total = output.len();
    save_tensors(output, &args.output)?;

    for r in &reports {
        println!(
            "{:<40} {:>16}  mse {:.3e}  max {:.3e}  sqnr {:>6.2} dB  bands {:?}",
            r.name,
            format!("{:?}", r.shape),
            r.error.mse,
            r.error.max_abs_err,
            r.error.sqnr_db,
            r.bands
        );
    }
    eprintln!(
        "Wrote {total} tensors ({} decomposed) to {}",
        reports.len(),
        args.output.display()
    );
    Ok(())
}

fn cmd_calibrate(args: CalibrateArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    init_threads(args.threads)?;
    let site_config = config.site(args.site);
    let tensors = load_tensors(&args.input)?;

    let pb = progress(tensors.len(), "tensors")?;
    let records = tensors
        .par_iter()
        .filter(|(name, tensor)| {
            let keep = tensor.rank() >= 2;
            if !keep {
                tracing::warn!(tensor = %name, "Rank < 2, skipped");
                pb.inc(1);
            }
            keep
        })
        .map(|(name, tensor)| -> Result<(String, CalibrationRecord)> {
            let site = ActivationSite::new(site_config)?;
            site.decompose(tensor)?;
            let record = site
                .last_calibration()
                .context("decomposition captured no calibration")?;
            pb.inc(1);
            Ok((name.clone(), record))
        })
        .collect::<Result<Vec<_>>>()?;
    pb.finish_with_message("done");

    let mut store = CalibrationStore::new();
    for (name, record) in &records {
        store.insert(name.clone(), record.to_stored()?);
    }
    store.save(&args.output)?;
    eprintln!(
        "Saved {} calibration records ({} site) to {}",
        store.len(),
        args.site.as_str(),
        args.output.display()
    );
    Ok(())
}

fn cmd_weights(args: WeightsArgs) -> Result<()> {
    anyhow::ensure!(
        (2..=16).contains(&args.bits),
        "--bits must be in 2..=16, got {}",
        args.bits
    );
    let tensors = load_tensors(&args.input)?;
    let mut output = HashMap::with_capacity(tensors.len());
    let mut quantized = 0usize;
    for (name, tensor) in tensors {
        if tensor.rank() == 2 {
            let q = fake_quantize_rows(&tensor, args.bits)?;
            let error = reconstruction_error(&tensor, &q)?;
            tracing::info!(tensor = %name, bits = args.bits, sqnr_db = error.sqnr_db, "Quantised weight");
            output.insert(name, q);
            quantized += 1;
        } else {
            output.insert(name, tensor);
        }
    }
    let total = output.len();
    save_tensors(output, &args.output)?;
    eprintln!(
        "Quantised {quantized}/{total} tensors to {} bits -> {}",
        args.bits,
        args.output.display()
    );
    Ok(())
}
