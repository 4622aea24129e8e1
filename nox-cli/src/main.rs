//! NOX CLI entrypoint.
//!
//! ```bash
//! nox denoise --input noisy.pfm --output clean.pfm --albedo albedo.pfm --normals normals.pfm
//! nox denoise -i frame2.pfm -o out2.pfm --flow flow2.pfm --previous out1.pfm --json
//! nox probe --json
//! ```

mod pfm;

use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Args, Parser, Subcommand};
use serde_json::json;

use nox_core::backend::DenoiserBackend;
use nox_core::context::GpuContext;
use nox_core::device::DeviceMemory;
use nox_core::error::{EngineError, Result};
use nox_core::image::HostImage;
use nox_pipeline::mock::{HostMemory, PassthroughDenoiser};
use nox_pipeline::{Denoiser, Runtime, RuntimeConfig};

const JSON_SCHEMA_VERSION: u32 = 1;

#[derive(Parser, Debug)]
#[command(
    name = "nox",
    version,
    about = "OptiX AI denoiser front end",
    arg_required_else_help = true,
    after_help = "Examples:\n  nox probe --json\n  nox denoise -i noisy.pfm -o clean.pfm --albedo albedo.pfm --normals normals.pfm\n  nox denoise -i frame.pfm -o out.pfm --flow flow.pfm --previous prev.pfm"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Denoise one PFM frame, optionally with guides or temporally.
    Denoise(DenoiseArgs),
    /// Initialize CUDA and OptiX and print basic status.
    Probe(ProbeArgs),
}

#[derive(Args, Debug, Clone)]
struct RuntimeArgs {
    /// JSON runtime config; flags below override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// CUDA device ordinal.
    #[arg(short = 'd', long)]
    device: Option<usize>,

    /// Explicit OptiX driver library.
    #[arg(long = "optix-lib")]
    optix_lib: Option<PathBuf>,

    /// Enable OptiX validation mode.
    #[arg(long)]
    validation: bool,

    /// Hard VRAM cap in MiB.
    #[arg(long = "vram-limit-mib")]
    vram_limit_mib: Option<usize>,

    /// Run against the host-memory passthrough engine instead of the GPU.
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Emit a single JSON object on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct DenoiseArgs {
    /// Noisy beauty image (PFM).
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Denoised output image (PFM).
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Albedo guide (PFM).
    #[arg(long)]
    albedo: Option<PathBuf>,

    /// Normal guide (PFM, left-handed camera space).  Ignored without --albedo.
    #[arg(long)]
    normals: Option<PathBuf>,

    /// Motion flow to the previous frame (PFM, first two channels used).
    #[arg(long, requires = "previous")]
    flow: Option<PathBuf>,

    /// Denoised previous frame (PFM).
    #[arg(long, requires = "flow")]
    previous: Option<PathBuf>,

    #[command(flatten)]
    runtime: RuntimeArgs,
}

#[derive(Args, Debug, Clone)]
struct ProbeArgs {
    #[command(flatten)]
    runtime: RuntimeArgs,
}

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Denoise(args) if args.runtime.json => Some("denoise"),
        Commands::Probe(args) if args.runtime.json => Some("probe"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Denoise(args) => run_denoise(args),
        Commands::Probe(args) => run_probe(args),
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err.to_string()));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

/// Config file first, then CLI overrides.
fn resolve_config(args: &RuntimeArgs) -> Result<RuntimeConfig> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_json_file(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(path) = &args.optix_lib {
        config.optix_library = Some(path.clone());
    }
    if args.validation {
        config.validation_mode = true;
    }
    if let Some(limit) = args.vram_limit_mib {
        config.vram_limit_mib = Some(limit);
    }
    Ok(config)
}

struct Frame {
    noisy: HostImage,
    albedo: Option<HostImage>,
    normals: Option<HostImage>,
    temporal: Option<(HostImage, HostImage)>,
}

impl Frame {
    fn load(args: &DenoiseArgs) -> Result<Self> {
        let read_opt = |path: &Option<PathBuf>| path.as_deref().map(pfm::read).transpose();
        let temporal = match (&args.flow, &args.previous) {
            (Some(flow), Some(previous)) => Some((pfm::read_flow(flow)?, pfm::read(previous)?)),
            _ => None,
        };
        Ok(Self {
            noisy: pfm::read(&args.input)?,
            albedo: read_opt(&args.albedo)?,
            normals: read_opt(&args.normals)?,
            temporal,
        })
    }

    fn denoise<M, B>(&self, denoiser: &Denoiser<'_, M, B>) -> Result<HostImage>
    where
        M: DeviceMemory,
        B: DenoiserBackend + ?Sized,
    {
        match &self.temporal {
            Some((flow, previous)) => denoiser.denoise_temporal(
                &self.noisy,
                flow,
                previous,
                self.albedo.as_ref(),
                self.normals.as_ref(),
            ),
            None => denoiser.denoise(&self.noisy, self.albedo.as_ref(), self.normals.as_ref()),
        }
    }
}

fn run_denoise(args: DenoiseArgs) -> Result<()> {
    let config = resolve_config(&args.runtime)?;
    let frame = Frame::load(&args)?;
    let started = Instant::now();

    let (output, backend_name, peak_bytes) = if args.runtime.dry_run {
        let memory = HostMemory::new();
        let backend = PassthroughDenoiser::new(memory.heap());
        let output = frame.denoise(&Denoiser::new(&memory, &backend))?;
        (output, backend.name().to_string(), memory.ledger().peak_bytes)
    } else {
        let runtime = Runtime::new(&config)?;
        let output = frame.denoise(&runtime.denoiser())?;
        let (_, peak) = runtime.context().vram_usage();
        (output, runtime.backend().name().to_string(), peak)
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    pfm::write(&args.output, &output)?;

    if args.runtime.json {
        let value = json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "denoise",
            "ok": true,
            "dry_run": args.runtime.dry_run,
            "backend": backend_name,
            "input": args.input.display().to_string(),
            "output": args.output.display().to_string(),
            "width": output.width(),
            "height": output.height(),
            "guide_albedo": frame.albedo.is_some(),
            "guide_normal": frame.albedo.is_some() && frame.normals.is_some(),
            "temporal": frame.temporal.is_some(),
            "elapsed_ms": elapsed_ms,
            "peak_device_mb": peak_bytes / (1024 * 1024),
        });
        println!("{value}");
    } else {
        println!(
            "Denoised {} -> {} ({}x{}, backend={backend_name}, {elapsed_ms} ms)",
            args.input.display(),
            args.output.display(),
            output.width(),
            output.height(),
        );
    }
    Ok(())
}

fn run_probe(args: ProbeArgs) -> Result<()> {
    let config = resolve_config(&args.runtime)?;

    let value = if args.runtime.dry_run {
        json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "probe",
            "ok": true,
            "dry_run": true,
            "backend": "passthrough",
        })
    } else {
        let device_count = GpuContext::device_count()?;
        let runtime = Runtime::new(&config)?;
        let name = runtime
            .context()
            .device()
            .name()
            .map_err(EngineError::Cuda)?;
        json!({
            "schema_version": JSON_SCHEMA_VERSION,
            "command": "probe",
            "ok": true,
            "dry_run": false,
            "device": config.device,
            "device_count": device_count,
            "name": name,
            "optix_library": runtime.backend().library(),
            "validation_mode": config.validation_mode,
        })
    };

    if args.runtime.json {
        println!("{value}");
    } else if let Some(name) = value.get("name").and_then(|v| v.as_str()) {
        println!("CUDA device {}: {name}", config.device);
        println!("OptiX library: {}", runtime_library(&value));
    } else {
        println!("Passthrough engine ready (dry run)");
    }
    Ok(())
}

fn runtime_library(value: &serde_json::Value) -> &str {
    value
        .get("optix_library")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
}

fn command_error_json(command: &str, error: &str) -> String {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": error,
    })
    .to_string()
}
