//! # matmul-validator
//!
//! Host-side validation harness for an accelerator matrix-multiplication
//! kernel (typically an FPGA bitstream driven through OpenCL).
//!
//! A run fills two aligned host matrices with seeded uniform values, pushes
//! them through the accelerator kernel, reads the product back, recomputes it
//! on the host, and reports the first element that differs by `1e-3` or more.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use matmul_validator::prelude::*;
//! use std::path::Path;
//!
//! let config = Config::default();
//! let runtime = EmulatedRuntime::matmul(&config.kernel.name, config.matrix);
//! let report = run(runtime, Path::new("matmul.aocx"), &config)?;
//! report.verdict.into_result()?;
//! # Ok::<(), matmul_validator::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `opencl`: Real accelerator backend via the system OpenCL ICD loader

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
// Allow unwrap() in tests only - banned in production code
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::many_single_char_names)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

// ============================================================================
// Problem Definition
// ============================================================================

/// Scalar type of every matrix element, on host and device.
pub type Element = f32;

/// Default rows of A and C.
pub const DIM_N: usize = 64;

/// Default columns of B and C.
pub const DIM_M: usize = 64;

/// Default inner dimension (columns of A, rows of B).
pub const DIM_K: usize = 64;

/// Kernel entry point looked up in the program binary by default.
pub const DEFAULT_KERNEL_NAME: &str = "MatrixMultiplication";

/// Matrix shapes.
pub mod dims;

// ============================================================================
// Host Side
// ============================================================================

/// Aligned host buffers and input generation.
pub mod host;

/// Host reference multiplication.
pub mod reference;

/// Result comparison.
pub mod verify;

// ============================================================================
// Accelerator Side
// ============================================================================

/// Runtime seam, session state machine and backends.
pub mod accel;

/// End-to-end run orchestration.
pub mod pipeline;

// ============================================================================
// Ambient
// ============================================================================

/// Configuration (YAML + environment).
pub mod config;

/// Debug logging (`--debug` or `MATMUL_DEBUG=1`).
pub mod debug;

/// Error types for matmul-validator operations.
pub mod error;

pub use error::{Error, Result};

// ============================================================================
// Prelude
// ============================================================================

/// Commonly used types for convenient imports.
///
/// ```rust
/// use matmul_validator::prelude::*;
/// ```
pub mod prelude {
    pub use crate::accel::{
        AcceleratorSession, BufferSpec, EmulatedRuntime, KernelArg, Runtime, SessionState,
    };
    pub use crate::config::{Backend, Config};
    pub use crate::dims::MatrixDims;
    pub use crate::error::{Error, Result};
    pub use crate::host::{AlignedBuffer, HostBuffers};
    pub use crate::pipeline::{execute, run, Report};
    pub use crate::reference::{reference_matmul, reference_product};
    pub use crate::verify::{verify, Verdict, TOLERANCE};
    pub use crate::Element;

    #[cfg(feature = "opencl")]
    pub use crate::accel::OpenClRuntime;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_dims_are_consistent() {
        let dims = dims::MatrixDims::default();
        assert_eq!(dims.a_len(), DIM_N * DIM_K);
        assert_eq!(dims.b_len(), DIM_K * DIM_M);
        assert_eq!(dims.c_len(), DIM_N * DIM_M);
    }
}
