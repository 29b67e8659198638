//! Accelerator runtime interface and the session that drives it.
//!
//! [`Runtime`] is the narrow seam to the vendor runtime: environment bootstrap
//! (platform, device, context, program, kernels, queues), buffer creation,
//! blocking transfers, argument binding, task enqueue, queue drain, and
//! release. [`AcceleratorSession`] owns a runtime and enforces the order in
//! which those calls may happen.
//!
//! ## Backends
//!
//! ```text
//! accel/
//! ├── mod.rs        # Runtime trait and handle types
//! ├── session.rs    # AcceleratorSession state machine
//! ├── emulator.rs   # In-process runtime with host kernels
//! └── opencl.rs     # OpenCL runtime (feature `opencl`)
//! ```

use crate::error::Result;
use crate::Element;
use std::path::Path;

pub mod emulator;
pub mod session;

#[cfg(feature = "opencl")]
#[cfg_attr(docsrs, doc(cfg(feature = "opencl")))]
pub mod opencl;

pub use emulator::{EmulatedRuntime, Faults, HostKernel, ReleaseLog};
pub use session::{AcceleratorSession, SessionState};

#[cfg(feature = "opencl")]
pub use opencl::OpenClRuntime;

/// Handle to a device buffer created by a [`Runtime`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub usize);

/// Handle to a kernel resolved by [`Runtime::init_environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub usize);

/// Handle to a command queue created by [`Runtime::init_environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub usize);

/// How the kernel may access a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Kernel input.
    ReadOnly,
    /// Kernel output.
    WriteOnly,
    /// Kernel input and output.
    ReadWrite,
}

impl AccessMode {
    /// Returns true if the kernel may write this buffer.
    #[must_use]
    pub const fn kernel_writes(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Size and access mode of one device buffer to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSpec {
    /// Element count.
    pub len: usize,
    /// Kernel access mode.
    pub access: AccessMode,
}

impl BufferSpec {
    /// Kernel input of `len` elements.
    #[must_use]
    pub const fn input(len: usize) -> Self {
        Self {
            len,
            access: AccessMode::ReadOnly,
        }
    }

    /// Kernel output of `len` elements.
    #[must_use]
    pub const fn output(len: usize) -> Self {
        Self {
            len,
            access: AccessMode::WriteOnly,
        }
    }

    /// Size in bytes.
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<Element>()
    }
}

/// One positional kernel argument. A slice of these is bound in order:
/// the first entry becomes argument 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelArg {
    /// Buffer bound at this position.
    pub buffer: BufferId,
    /// Access mode the kernel expects; must match the allocation.
    pub access: AccessMode,
}

impl KernelArg {
    /// Read-only input argument.
    #[must_use]
    pub const fn input(buffer: BufferId) -> Self {
        Self {
            buffer,
            access: AccessMode::ReadOnly,
        }
    }

    /// Write-only output argument.
    #[must_use]
    pub const fn output(buffer: BufferId) -> Self {
        Self {
            buffer,
            access: AccessMode::WriteOnly,
        }
    }
}

/// Everything [`Runtime::init_environment`] acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Name of the selected platform.
    pub platform: String,
    /// Name of the selected device.
    pub device: String,
    /// One kernel per requested name, in request order.
    pub kernels: Vec<(String, KernelId)>,
    /// One queue per requested name, in request order.
    pub queues: Vec<QueueId>,
}

impl Environment {
    /// Looks up a kernel by name.
    #[must_use]
    pub fn kernel(&self, name: &str) -> Option<KernelId> {
        self.kernels.iter().find(|(n, _)| n == name).map(|&(_, id)| id)
    }
}

/// Runtime resources, listed in release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Device buffers.
    Buffers,
    /// Command queues.
    Queues,
    /// Kernel objects.
    Kernels,
    /// Compiled program.
    Program,
    /// Context.
    Context,
    /// Device handle.
    Device,
}

impl HandleKind {
    /// Reverse of acquisition order.
    pub const RELEASE_ORDER: [HandleKind; 6] = [
        HandleKind::Buffers,
        HandleKind::Queues,
        HandleKind::Kernels,
        HandleKind::Program,
        HandleKind::Context,
        HandleKind::Device,
    ];
}

/// Accelerator runtime operations.
///
/// Every transfer is blocking. Implementations keep whatever they acquired
/// during a failed [`init_environment`](Runtime::init_environment) so that
/// [`release`](Runtime::release) can free it.
pub trait Runtime {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Discovers a platform and device, creates a context, loads the program
    /// at `binary_path`, and resolves one kernel and one queue per name.
    fn init_environment(&mut self, binary_path: &Path, kernel_names: &[String])
        -> Result<Environment>;

    /// Creates a device buffer of `len` elements.
    fn create_buffer(&mut self, len: usize, access: AccessMode) -> Result<BufferId>;

    /// Blocking copy from host memory into `buffer`.
    fn write_buffer(&mut self, queue: QueueId, buffer: BufferId, data: &[Element]) -> Result<()>;

    /// Binds `buffer` as positional argument `index` of `kernel`.
    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, buffer: BufferId) -> Result<()>;

    /// Enqueues one single-work-item invocation of `kernel`.
    fn enqueue_task(&mut self, queue: QueueId, kernel: KernelId) -> Result<()>;

    /// Blocks until all work on `queue` has retired.
    fn finish(&mut self, queue: QueueId) -> Result<()>;

    /// Blocking copy from `buffer` into host memory.
    fn read_buffer(&mut self, queue: QueueId, buffer: BufferId, out: &mut [Element]) -> Result<()>;

    /// Releases every handle of `kind`. Releasing nothing is not an error.
    fn release(&mut self, kind: HandleKind);
}
