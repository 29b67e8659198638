//! OpenCL accelerator runtime.
//!
//! Loads a precompiled program binary (e.g. an FPGA `.aocx` image), resolves
//! kernels by name, and drives one in-order queue per kernel with blocking
//! transfers and single work-item tasks.

use super::{AccessMode, BufferId, Environment, HandleKind, KernelId, QueueId, Runtime};
use crate::error::{Error, Result};
use crate::Element;
use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_ALL};
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_mem_flags, CL_BLOCKING};
use std::path::Path;
use std::ptr;

/// OpenCL implementation of [`Runtime`].
///
/// Handles are held in `Option`/`Vec` fields so [`Runtime::release`] can drop
/// each kind independently; dropping an `opencl3` wrapper releases the
/// underlying object.
pub struct OpenClRuntime {
    platform_filter: Option<String>,
    device: Option<Device>,
    context: Option<Context>,
    program: Option<Program>,
    kernels: Vec<Kernel>,
    queues: Vec<CommandQueue>,
    buffers: Vec<Buffer<Element>>,
}

// SAFETY: OpenCL 1.2+ guarantees thread safety for context, command queue,
// kernel and memory objects; the wrapped pointers are opaque runtime handles.
#[allow(unsafe_code)]
unsafe impl Send for OpenClRuntime {}

impl std::fmt::Debug for OpenClRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClRuntime")
            .field("platform_filter", &self.platform_filter)
            .field("kernels", &self.kernels.len())
            .field("queues", &self.queues.len())
            .field("buffers", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

impl OpenClRuntime {
    /// Creates a runtime that will pick the first platform whose name
    /// contains `platform_filter`, or any platform if `None`.
    #[must_use]
    pub fn new(platform_filter: Option<String>) -> Self {
        Self {
            platform_filter,
            device: None,
            context: None,
            program: None,
            kernels: Vec::new(),
            queues: Vec::new(),
            buffers: Vec::new(),
        }
    }

    /// Finds a (platform name, device id) pair. Accelerator-class devices win
    /// over any other device type on the same platform.
    fn select_device(&self) -> Result<(String, cl_device_id)> {
        let platforms = get_platforms()
            .map_err(|e| Error::Initialization(format!("no OpenCL platforms: {e}")))?;

        for platform in platforms {
            let name = platform.name().unwrap_or_default().trim().to_string();
            if let Some(filter) = &self.platform_filter {
                if !name.contains(filter.as_str()) {
                    crate::debug!("opencl", "skipping platform '{name}'");
                    continue;
                }
            }

            let accelerators = platform
                .get_devices(CL_DEVICE_TYPE_ACCELERATOR)
                .unwrap_or_default();
            let candidates = if accelerators.is_empty() {
                platform.get_devices(CL_DEVICE_TYPE_ALL).unwrap_or_default()
            } else {
                accelerators
            };
            if let Some(&id) = candidates.first() {
                return Ok((name, id));
            }
        }

        Err(Error::Initialization(match &self.platform_filter {
            Some(filter) => format!("no OpenCL device on a platform matching '{filter}'"),
            None => "no OpenCL device found".to_string(),
        }))
    }

    fn queue(&self, queue: QueueId) -> Result<&CommandQueue> {
        self.queues
            .get(queue.0)
            .ok_or_else(|| Error::Dispatch(format!("invalid command queue {queue:?}")))
    }

    fn cl_buffer(&self, buffer: BufferId) -> Result<&Buffer<Element>> {
        self.buffers
            .get(buffer.0)
            .ok_or_else(|| Error::Transfer(format!("invalid device buffer {buffer:?}")))
    }
}

fn mem_flags(access: AccessMode) -> cl_mem_flags {
    match access {
        AccessMode::ReadOnly => CL_MEM_READ_ONLY,
        AccessMode::WriteOnly => CL_MEM_WRITE_ONLY,
        AccessMode::ReadWrite => CL_MEM_READ_WRITE,
    }
}

impl Runtime for OpenClRuntime {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn init_environment(
        &mut self,
        binary_path: &Path,
        kernel_names: &[String],
    ) -> Result<Environment> {
        let (platform, device_id) = self.select_device()?;
        let device = Device::new(device_id);
        let device_name = device.name().unwrap_or_default().trim().to_string();
        crate::info!("opencl", "platform '{platform}', device '{device_name}'");

        let context = Context::from_device(&device)
            .map_err(|e| Error::Initialization(format!("context creation failed: {e}")))?;
        self.device = Some(device);
        let context = self.context.insert(context);

        let binary = std::fs::read(binary_path).map_err(|e| {
            Error::Initialization(format!(
                "cannot load program binary '{}': {e}",
                binary_path.display()
            ))
        })?;
        crate::debug!("opencl", "program binary: {} bytes", binary.len());
        let program = Program::create_and_build_from_binary(context, &[binary.as_slice()], "")
            .map_err(|e| Error::Initialization(format!("program build failed: {e}")))?;
        let program = self.program.insert(program);

        let mut kernels = Vec::with_capacity(kernel_names.len());
        let mut queues = Vec::with_capacity(kernel_names.len());
        for name in kernel_names {
            let kernel = Kernel::create(program, name).map_err(|e| {
                Error::Initialization(format!("kernel '{name}' not found: {e}"))
            })?;
            #[allow(deprecated)]
            let queue = CommandQueue::create_default(context, 0).map_err(|e| {
                Error::Initialization(format!("command queue creation failed: {e}"))
            })?;

            kernels.push((name.clone(), KernelId(self.kernels.len())));
            self.kernels.push(kernel);
            queues.push(QueueId(self.queues.len()));
            self.queues.push(queue);
        }

        Ok(Environment {
            platform,
            device: device_name,
            kernels,
            queues,
        })
    }

    fn create_buffer(&mut self, len: usize, access: AccessMode) -> Result<BufferId> {
        let context = self.context.as_ref().ok_or_else(|| Error::Allocation {
            what: "device buffer".to_string(),
            message: "no context".to_string(),
        })?;

        // SAFETY: no host pointer is passed, so the runtime owns the storage.
        #[allow(unsafe_code)]
        let buffer = unsafe {
            Buffer::<Element>::create(context, mem_flags(access), len, ptr::null_mut())
        }
        .map_err(|e| Error::Allocation {
            what: "device buffer".to_string(),
            message: e.to_string(),
        })?;

        self.buffers.push(buffer);
        Ok(BufferId(self.buffers.len() - 1))
    }

    fn write_buffer(&mut self, queue: QueueId, buffer: BufferId, data: &[Element]) -> Result<()> {
        let queue = self
            .queues
            .get(queue.0)
            .ok_or_else(|| Error::Dispatch(format!("invalid command queue {queue:?}")))?;
        let target = self
            .buffers
            .get_mut(buffer.0)
            .ok_or_else(|| Error::Transfer(format!("invalid device buffer {buffer:?}")))?;

        // SAFETY: blocking write; `data` outlives the call.
        #[allow(unsafe_code)]
        let event = unsafe { queue.enqueue_write_buffer(target, CL_BLOCKING, 0, data, &[]) }
            .map_err(|e| Error::Transfer(format!("write to {buffer:?} failed: {e}")))?;
        event
            .wait()
            .map_err(|e| Error::Transfer(format!("write to {buffer:?} failed: {e}")))
    }

    fn set_kernel_arg(&mut self, kernel: KernelId, index: u32, buffer: BufferId) -> Result<()> {
        let mem = self
            .cl_buffer(buffer)
            .map_err(|_| Error::Dispatch(format!("argument {index}: invalid mem object")))?
            .get();
        let kernel = self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| Error::Dispatch(format!("invalid kernel {kernel:?}")))?;

        // SAFETY: `mem` is a live buffer handle owned by this runtime.
        #[allow(unsafe_code)]
        let bound = unsafe { kernel.set_arg(index, &mem) };
        bound.map_err(|e| Error::Dispatch(format!("argument {index} rejected: {e}")))
    }

    fn enqueue_task(&mut self, queue: QueueId, kernel: KernelId) -> Result<()> {
        let queue = self.queue(queue)?;
        let kernel = self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| Error::Dispatch(format!("invalid kernel {kernel:?}")))?;

        // SAFETY: every argument was bound by `set_kernel_arg` to a live buffer.
        #[allow(unsafe_code, deprecated)]
        let enqueued = unsafe { queue.enqueue_task(kernel.get(), &[]) };
        enqueued.map_err(|e| Error::Dispatch(format!("enqueue failed: {e}")))?;
        Ok(())
    }

    fn finish(&mut self, queue: QueueId) -> Result<()> {
        self.queue(queue)?
            .finish()
            .map_err(|e| Error::Dispatch(format!("queue finish failed: {e}")))
    }

    fn read_buffer(&mut self, queue: QueueId, buffer: BufferId, out: &mut [Element]) -> Result<()> {
        let queue = self.queue(queue)?;
        let source = self.cl_buffer(buffer)?;

        // SAFETY: blocking read; `out` outlives the call.
        #[allow(unsafe_code)]
        let event = unsafe { queue.enqueue_read_buffer(source, CL_BLOCKING, 0, out, &[]) }
            .map_err(|e| Error::Transfer(format!("read from {buffer:?} failed: {e}")))?;
        event
            .wait()
            .map_err(|e| Error::Transfer(format!("read from {buffer:?} failed: {e}")))
    }

    fn release(&mut self, kind: HandleKind) {
        match kind {
            HandleKind::Buffers => self.buffers.clear(),
            HandleKind::Queues => self.queues.clear(),
            HandleKind::Kernels => self.kernels.clear(),
            HandleKind::Program => self.program = None,
            HandleKind::Context => self.context = None,
            HandleKind::Device => self.device = None,
        }
    }
}
