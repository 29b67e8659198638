//! Configuration for a validation run.
//!
//! YAML file with precedence: CLI > ENV > file > defaults.

use crate::dims::MatrixDims;
use crate::error::{Error, Result};
use crate::host::ACCEL_ALIGNMENT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`Config::seed`].
pub const ENV_SEED: &str = "MATMUL_SEED";
/// Environment variable overriding [`DeviceConfig::backend`].
pub const ENV_BACKEND: &str = "MATMUL_BACKEND";
/// Environment variable overriding [`DeviceConfig::platform`].
pub const ENV_PLATFORM: &str = "MATMUL_PLATFORM";
/// Environment variable overriding [`KernelConfig::name`].
pub const ENV_KERNEL: &str = "MATMUL_KERNEL";

/// Which runtime executes the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Vendor OpenCL runtime (requires the `opencl` feature).
    Opencl,
    /// In-process host emulation.
    Emulator,
}

impl Backend {
    /// Name as written in configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opencl => "opencl",
            Self::Emulator => "emulator",
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "opencl" => Ok(Self::Opencl),
            "emulator" => Ok(Self::Emulator),
            other => Err(Error::ConfigInvalid {
                key: "device.backend".to_string(),
                message: format!("unknown backend '{other}' (expected opencl or emulator)"),
            }),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_backend() -> Backend {
    if cfg!(feature = "opencl") {
        Backend::Opencl
    } else {
        Backend::Emulator
    }
}

/// Kernel selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Kernel entry point inside the program binary.
    #[serde(default = "default_kernel_name")]
    pub name: String,
}

fn default_kernel_name() -> String {
    crate::DEFAULT_KERNEL_NAME.to_string()
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            name: default_kernel_name(),
        }
    }
}

/// Device and runtime selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Runtime backend.
    #[serde(default = "default_backend")]
    pub backend: Backend,

    /// Substring a platform name must contain to be selected.
    #[serde(default)]
    pub platform: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            platform: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Kernel settings.
    #[serde(default)]
    pub kernel: KernelConfig,

    /// Matrix shape.
    #[serde(default)]
    pub matrix: MatrixDims,

    /// Seed for input generation.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Host buffer alignment in bytes.
    #[serde(default = "default_alignment")]
    pub alignment: usize,

    /// Device settings.
    #[serde(default)]
    pub device: DeviceConfig,
}

fn default_version() -> u32 {
    1
}
fn default_seed() -> u64 {
    // Seed of a default-constructed linear congruential engine.
    1
}
fn default_alignment() -> usize {
    ACCEL_ALIGNMENT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            kernel: KernelConfig::default(),
            matrix: MatrixDims::default(),
            seed: default_seed(),
            alignment: default_alignment(),
            device: DeviceConfig::default(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .map_err(|_| Error::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parses and validates configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error with line number if parsing fails.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml).map_err(|e| {
            let line = e.location().map(|l| l.line()).unwrap_or(0);
            Error::ConfigParse {
                line,
                message: e.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration with fallback to defaults.
    #[must_use]
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Default configuration file location
    /// (`$XDG_CONFIG_HOME/matmul-validator/config.yaml` on Linux).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("matmul-validator").join("config.yaml"))
    }

    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.matrix.validate()?;
        if !self.alignment.is_power_of_two() {
            return Err(Error::ConfigInvalid {
                key: "alignment".to_string(),
                message: format!("{} is not a power of two", self.alignment),
            });
        }
        if self.kernel.name.trim().is_empty() {
            return Err(Error::ConfigInvalid {
                key: "kernel.name".to_string(),
                message: "kernel name is empty".to_string(),
            });
        }
        Ok(())
    }

    /// Applies `MATMUL_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies `MATMUL_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(seed) = lookup(ENV_SEED) {
            self.seed = seed.trim().parse().map_err(|_| Error::ConfigInvalid {
                key: ENV_SEED.to_string(),
                message: format!("'{seed}' is not an unsigned integer"),
            })?;
        }
        if let Some(backend) = lookup(ENV_BACKEND) {
            self.device.backend = backend.parse()?;
        }
        if let Some(platform) = lookup(ENV_PLATFORM) {
            self.device.platform = Some(platform).filter(|p| !p.is_empty());
        }
        if let Some(kernel) = lookup(ENV_KERNEL) {
            self.kernel.name = kernel;
        }
        self.validate()
    }
}
