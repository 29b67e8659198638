//! matmul-validator - runs an accelerator matrix-multiplication kernel and
//! checks its output against a host reference.
//!
//! Exit codes: 0 success, 1 mismatch, 2 runtime failure, -1 usage.

use clap::error::ErrorKind;
use clap::Parser;
use matmul_validator::accel::EmulatedRuntime;
use matmul_validator::config::{Backend, Config};
use matmul_validator::pipeline::{run, Report};
use matmul_validator::verify::Verdict;
use matmul_validator::{debug, Error, Result};
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser, Debug)]
#[command(name = "matmul-validator")]
#[command(author = "PAIML Team")]
#[command(version)]
#[command(
    about = "Validate an accelerator matmul kernel against a host reference",
    long_about = None
)]
struct Cli {
    /// Precompiled accelerator program (e.g. matmul.aocx)
    binary: PathBuf,

    /// Config file path (default: <config dir>/matmul-validator/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed for the input matrices
    #[arg(short, long)]
    seed: Option<u64>,

    /// Runtime backend
    #[arg(short, long, value_enum)]
    backend: Option<Backend>,

    /// Only use platforms whose name contains this string
    #[arg(short, long)]
    platform: Option<String>,

    /// Enable debug logging to stderr
    #[arg(long)]
    debug: bool,
}

fn program_name() -> String {
    std::env::args()
        .next()
        .and_then(|arg| {
            Path::new(&arg)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| "matmul-validator".to_string())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default_path()
            .map(Config::load_or_default)
            .unwrap_or_default(),
    };

    config.apply_env()?;

    if let Some(seed) = cli.seed {
        config.seed = seed;
    }
    if let Some(backend) = cli.backend {
        config.device.backend = backend;
    }
    if let Some(platform) = &cli.platform {
        config.device.platform = Some(platform.clone());
    }
    config.validate()?;
    Ok(config)
}

fn run_backend(binary: &Path, config: &Config) -> Result<Report> {
    matmul_validator::info!(
        "main",
        "backend={} kernel={} dims={:?} seed={}",
        config.device.backend,
        config.kernel.name,
        config.matrix,
        config.seed
    );

    match config.device.backend {
        Backend::Emulator => {
            let runtime = EmulatedRuntime::matmul(&config.kernel.name, config.matrix);
            run(runtime, binary, config)
        }
        #[cfg(feature = "opencl")]
        Backend::Opencl => {
            let platform = config.device.platform.clone();
            let runtime = matmul_validator::accel::OpenClRuntime::new(platform);
            run(runtime, binary, config)
        }
        #[cfg(not(feature = "opencl"))]
        Backend::Opencl => Err(Error::Initialization(
            "built without the `opencl` feature; \
             rebuild with --features opencl or pass --backend emulator"
                .to_string(),
        )),
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            if e.kind() != ErrorKind::MissingRequiredArgument {
                eprint!("{e}");
            }
            let usage = Error::Usage {
                program: program_name(),
            };
            eprintln!("{usage}");
            process::exit(usage.exit_code());
        }
    };

    if cli.debug {
        debug::enable();
    } else {
        debug::init_from_env();
    }

    let outcome = load_config(&cli).and_then(|config| run_backend(&cli.binary, &config));
    match outcome {
        Ok(report) => match report.verdict {
            Verdict::Match => {
                println!("Test ran successfully.");
            }
            mismatch @ Verdict::Mismatch { .. } => {
                if let Err(e) = mismatch.into_result() {
                    println!("{e}");
                    process::exit(e.exit_code());
                }
            }
        },
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(e.exit_code());
        }
    }
}
