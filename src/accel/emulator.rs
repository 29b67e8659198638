//! In-process accelerator runtime.
//!
//! Mirrors the behavior of an in-order OpenCL queue on host memory: writes
//! and reads are blocking, an enqueued task runs when the queue is drained
//! (by `finish` or by the next blocking transfer), and kernels are plain Rust
//! closures registered by name. Used when no accelerator is present and as
//! the backend for pipeline tests.

use super::{AccessMode, BufferId, Environment, HandleKind, KernelId, QueueId, Runtime};
use crate::dims::MatrixDims;
use crate::error::{Error, Result};
use crate::reference::reference_matmul;
use crate::Element;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// A host kernel. Receives the bound arguments in positional order; buffers
/// the kernel may write are copied back to the device afterwards.
pub type HostKernel = Box<dyn FnMut(&mut [Vec<Element>]) -> Result<()> + Send>;

/// Name of the platform reported by the emulator.
pub const EMULATOR_PLATFORM: &str = "Host Emulation Platform";

/// Name of the device reported by the emulator.
pub const EMULATOR_DEVICE: &str = "Host Emulated Accelerator";

/// Failures the emulator can be told to produce.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Report that no compatible device exists.
    pub no_device: bool,
    /// Reject every `enqueue_task`.
    pub reject_enqueue: bool,
    /// Reject `set_kernel_arg` at this argument index.
    pub reject_arg: Option<u32>,
    /// Fail buffer creation above this many elements.
    pub max_buffer_elements: Option<usize>,
}

/// Shared record of which handle kinds were actually released, in order.
#[derive(Debug, Clone, Default)]
pub struct ReleaseLog(Arc<Mutex<Vec<HandleKind>>>);

impl ReleaseLog {
    fn push(&self, kind: HandleKind) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(kind);
    }

    /// Snapshot of releases so far.
    #[must_use]
    pub fn entries(&self) -> Vec<HandleKind> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

struct EmuBuffer {
    data: Vec<Element>,
    access: AccessMode,
}

struct Pending {
    kernel: usize,
    args: Vec<BufferId>,
}

struct Resolved {
    name: String,
    args: Vec<Option<BufferId>>,
}

/// Host-memory implementation of [`Runtime`].
pub struct EmulatedRuntime {
    registry: Vec<(String, HostKernel)>,
    faults: Faults,
    release_log: ReleaseLog,
    device: Option<&'static str>,
    context: bool,
    program: Option<PathBuf>,
    kernels: Vec<Resolved>,
    queues: Vec<Vec<Pending>>,
    buffers: Vec<Option<EmuBuffer>>,
}

impl std::fmt::Debug for EmulatedRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<&str> = self.registry.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("EmulatedRuntime")
            .field("registered", &registered)
            .field("faults", &self.faults)
            .field("program", &self.program)
            .field("queues", &self.queues.len())
            .field("buffers", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

impl Default for EmulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedRuntime {
    /// Creates an emulator with no registered kernels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Vec::new(),
            faults: Faults::default(),
            release_log: ReleaseLog::default(),
            device: None,
            context: false,
            program: None,
            kernels: Vec::new(),
            queues: Vec::new(),
            buffers: Vec::new(),
        }
    }

    /// Creates an emulator whose program provides a matrix-multiplication
    /// kernel named `kernel_name` for `dims`, with arguments (A, B, C).
    #[must_use]
    pub fn matmul(kernel_name: &str, dims: MatrixDims) -> Self {
        Self::new().with_kernel(kernel_name, matmul_kernel(dims))
    }

    /// Registers a kernel under `name`.
    #[must_use]
    pub fn with_kernel(mut self, name: &str, kernel: HostKernel) -> Self {
        self.registry.push((name.to_string(), kernel));
        self
    }

    /// Sets the failures to inject.
    #[must_use]
    pub fn with_faults(mut self, faults: Faults) -> Self {
        self.faults = faults;
        self
    }

    /// Handle to the release record; stays valid after the runtime is dropped.
    #[must_use]
    pub fn release_log(&self) -> ReleaseLog {
        self.release_log.clone()
    }

    fn buffer(&self, id: BufferId) -> Result<&EmuBuffer> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Transfer(format!("invalid device buffer {id:?}")))
    }

    fn queue_index(&self, queue: QueueId) -> Result<usize> {
        if queue.0 < self.queues.len() {
            Ok(queue.0)
        } else {
            Err(Error::Dispatch(format!("invalid command queue {queue:?}")))
        }
    }

    /// Runs every pending task on `queue` in submission order.
    fn drain(&mut self, queue: usize) -> Result<()> {
        let pending = std::mem::take(&mut self.queues[queue]);
        for task in pending {
            let mut args = Vec::with_capacity(task.args.len());
            for &id in &task.args {
                args.push(self.buffer(id)?.data.clone());
            }

            let name = &self.kernels[task.kernel].name;
            let (_, kernel) = self
                .registry
                .iter_mut()
                .find(|(n, _)| n == name)
                .ok_or_else(|| Error::Dispatch(format!("kernel '{name}' vanished")))?;
            kernel(args.as_mut_slice())
                .map_err(|e| Error::Dispatch(format!("kernel '{name}' failed: {e}")))?;

            for (id, data) in task.args.iter().zip(args) {
                if let Some(Some(buffer)) = self.buffers.get_mut(id.0) {
                    if buffer.access.kernel_writes() {
                        buffer.data = data;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Runtime for EmulatedRuntime {
    fn name(&self) -> &'static str {
        "emulator"
    }

    fn init_environment(
        &mut self,
        binary_path: &Path,
        kernel_names: &[String],
    ) -> Result<Environment> {
        if self.faults.no_device {
            return Err(Error::Initialization("no compatible accelerator device found".to_string()));
        }
        self.device = Some(EMULATOR_DEVICE);
        self.context = true;

        let meta = std::fs::metadata(binary_path).map_err(|e| {
            Error::Initialization(format!(
                "cannot load program binary '{}': {e}",
                binary_path.display()
            ))
        })?;
        if !meta.is_file() {
            return Err(Error::Initialization(format!(
                "program binary '{}' is not a file",
                binary_path.display()
            )));
        }
        self.program = Some(binary_path.to_path_buf());

        let mut kernels = Vec::with_capacity(kernel_names.len());
        let mut queues = Vec::with_capacity(kernel_names.len());
        for name in kernel_names {
            if !self.registry.iter().any(|(n, _)| n == name) {
                return Err(Error::Initialization(format!(
                    "kernel '{name}' not found in program '{}'",
                    binary_path.display()
                )));
            }
            kernels.push((name.clone(), KernelId(self.kernels.len())));
            self.kernels.push(Resolved {
                name: name.clone(),
                args: Vec::new(),
            });
            queues.push(QueueId(self.queues.len()));
            self.queues.push(Vec::new());
        }

        Ok(Environment {
            platform: EMULATOR_PLATFORM.to_string(),
            device: EMULATOR_DEVICE.to_string(),
            kernels,
            queues,
        })
    }

    fn create_buffer(&mut self, len: usize, access: AccessMode) -> Result<BufferId> {
        if !self.context {
            return Err(Error::Allocation {
                what: "device buffer".to_string(),
                message: "no context".to_string(),
            });
        }
        if len == 0 {
            return Err(Error::Allocation {
                what: "device buffer".to_string(),
                message: "invalid buffer size 0".to_string(),
            });
        }
        if let Some(max) = self.faults.max_buffer_elements {
            if len > max {
                return Err(Error::Allocation {
                    what: "device buffer".to_string(),
                    message: format!("out of device memory: {len} elements requested, limit {max}"),
                });
            }
        }

        self.buffers.push(Some(EmuBuffer {
            data: vec![0.0; len],
            access,
        }));
        Ok(BufferId(self.buffers.len() - 1))
    }

    fn write_buffer(&mut self, queue: QueueId, buffer: BufferId, data: &[Element]) -> Result<()> {
        let queue = self.queue_index(queue)?;
        self.drain(queue)?;
        let target = self
            .buffers
            .get_mut(buffer.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::Transfer(format!("invalid device buffer {buffer:?}")))?;
        if target.data.len() != data.len() {
            return Err(Error::Transfer(format!(
                "write of {} elements into buffer of {}",
                data.len(),
                target.data.len()
            )));
        }
        target.data.copy_from_slice(data);
        Ok(())
    }

    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, buffer: BufferId) -> Result<()> {
        if self.faults.reject_arg == Some(index) {
            return Err(Error::Dispatch(format!("argument {index} rejected: invalid arg size")));
        }
        self.buffer(buffer)
            .map_err(|_| Error::Dispatch(format!("argument {index}: invalid mem object")))?;
        let resolved = self
            .kernels
            .get_mut(kernel.0)
            .ok_or_else(|| Error::Dispatch(format!("invalid kernel {kernel:?}")))?;

        let index = index as usize;
        if resolved.args.len() <= index {
            resolved.args.resize(index + 1, None);
        }
        resolved.args[index] = Some(buffer);
        Ok(())
    }

    fn enqueue_task(&mut self, queue: QueueId, kernel: KernelId) -> Result<()> {
        let queue = self.queue_index(queue)?;
        if self.faults.reject_enqueue {
            return Err(Error::Dispatch("command queue is in an error state".to_string()));
        }
        let resolved = self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| Error::Dispatch(format!("invalid kernel {kernel:?}")))?;

        let mut args = Vec::with_capacity(resolved.args.len());
        for (index, arg) in resolved.args.iter().enumerate() {
            let id = arg.ok_or_else(|| {
                Error::Dispatch(format!("kernel '{}' argument {index} not set", resolved.name))
            })?;
            args.push(id);
        }

        self.queues[queue].push(Pending {
            kernel: kernel.0,
            args,
        });
        Ok(())
    }

    fn finish(&mut self, queue: QueueId) -> Result<()> {
        let queue = self.queue_index(queue)?;
        self.drain(queue)
    }

    fn read_buffer(&mut self, queue: QueueId, buffer: BufferId, out: &mut [Element]) -> Result<()> {
        let queue = self.queue_index(queue)?;
        self.drain(queue)?;
        let source = self.buffer(buffer)?;
        if source.data.len() != out.len() {
            return Err(Error::Transfer(format!(
                "read of {} elements from buffer of {}",
                out.len(),
                source.data.len()
            )));
        }
        out.copy_from_slice(&source.data);
        Ok(())
    }

    fn release(&mut self, kind: HandleKind) {
        let held = match kind {
            HandleKind::Buffers => {
                let held = !self.buffers.is_empty();
                self.buffers.clear();
                held
            }
            HandleKind::Queues => {
                let held = !self.queues.is_empty();
                self.queues.clear();
                held
            }
            HandleKind::Kernels => {
                let held = !self.kernels.is_empty();
                self.kernels.clear();
                held
            }
            HandleKind::Program => self.program.take().is_some(),
            HandleKind::Context => std::mem::replace(&mut self.context, false),
            HandleKind::Device => self.device.take().is_some(),
        };
        if held {
            self.release_log.push(kind);
        }
    }
}

/// Host kernel computing C = A × B for `dims`, bound as (A, B, C).
#[must_use]
pub fn matmul_kernel(dims: MatrixDims) -> HostKernel {
    Box::new(move |args: &mut [Vec<Element>]| {
        let count = args.len();
        let [a, b, c] = args else {
            return Err(Error::Dispatch(format!("expected 3 arguments, got {count}")));
        };
        reference_matmul(a, b, c, dims)
    })
}
