//! End-to-end validation run.
//!
//! ```text
//! allocate host → fill A,B → open session → allocate device → upload A,B
//!   → bind (A, B, C) + dispatch → await → download C → close
//!   → reference C → verify
//! ```
//!
//! Every exit path releases accelerator resources: early returns drop the
//! session, which closes it.

use crate::accel::{AcceleratorSession, BufferSpec, KernelArg, Runtime};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::host::HostBuffers;
use crate::reference::reference_product;
use crate::verify::{verify, Verdict, TOLERANCE};
use crate::Element;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct Report {
    /// Comparison outcome.
    pub verdict: Verdict,
    /// Host reference C.
    pub reference: Vec<Element>,
    /// Platform the kernel ran on.
    pub platform: String,
    /// Device the kernel ran on.
    pub device: String,
}

/// Allocates and seeds host inputs from `config`, then runs [`execute`].
///
/// # Errors
///
/// Any allocation, initialization, sequencing or transfer failure. A
/// numerical mismatch is not an error; it is reported in [`Report::verdict`].
pub fn run<R: Runtime>(runtime: R, binary_path: &Path, config: &Config) -> Result<Report> {
    crate::time_scope!("pipeline", "run");
    config.validate()?;

    let mut host = HostBuffers::allocate(config.matrix, config.alignment)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    host.fill_random(&mut rng);
    crate::debug!(
        "pipeline",
        "host buffers {}x{}x{} seeded with {}",
        config.matrix.n,
        config.matrix.m,
        config.matrix.k,
        config.seed
    );

    execute(runtime, binary_path, &config.kernel.name, &mut host)
}

/// Runs the kernel on already-populated host buffers and verifies the result.
///
/// On return `host.c_accel` holds the downloaded accelerator output.
pub fn execute<R: Runtime>(
    runtime: R,
    binary_path: &Path,
    kernel_name: &str,
    host: &mut HostBuffers,
) -> Result<Report> {
    let dims = host.dims();

    let kernel_names = [kernel_name.to_string()];
    let mut session = AcceleratorSession::open_with(runtime, binary_path, &kernel_names)?;
    let (platform, device) = session
        .environment()
        .map(|env| (env.platform.clone(), env.device.clone()))
        .unwrap_or_default();
    let kernel = session
        .kernel(kernel_name)
        .ok_or_else(|| Error::Initialization(format!("kernel '{kernel_name}' not resolved")))?;

    let ids = session.allocate_device_buffers(&[
        BufferSpec::input(dims.a_len()),
        BufferSpec::input(dims.b_len()),
        BufferSpec::output(dims.c_len()),
    ])?;
    let &[a, b, c] = ids.as_slice() else {
        return Err(Error::Allocation {
            what: "device buffers".to_string(),
            message: format!("expected 3 handles, runtime returned {}", ids.len()),
        });
    };

    session.upload(&host.a, a)?;
    session.upload(&host.b, b)?;
    session.bind_and_dispatch(
        kernel,
        &[KernelArg::input(a), KernelArg::input(b), KernelArg::output(c)],
    )?;
    session.await_completion()?;
    session.download(c, &mut host.c_accel)?;
    session.close();
    crate::info!("pipeline", "accelerator run on '{device}' complete");

    let reference = {
        crate::time_scope!("pipeline", "reference");
        reference_product(&host.a, &host.b, dims)?
    };

    let verdict = verify(&reference, &host.c_accel, dims, TOLERANCE)?;
    match verdict {
        Verdict::Match => {
            crate::info!("pipeline", "all {} elements within tolerance", dims.c_len());
        }
        Verdict::Mismatch { row, col, .. } => {
            crate::warn!("pipeline", "mismatch at ({row}, {col})");
        }
    }

    Ok(Report {
        verdict,
        reference,
        platform,
        device,
    })
}
