//! Strictly ordered accelerator session.
//!
//! ```text
//! Unopened → Opened → BuffersAllocated → DataUploaded → Dispatched
//!          → Completed → DataDownloaded → Closed
//! ```
//!
//! Each operation checks the state it requires and fails with
//! [`Error::Sequence`] otherwise. `Closed` is terminal and reachable from any
//! state; dropping the session closes it.

use super::{
    AccessMode, BufferId, BufferSpec, Environment, HandleKind, KernelArg, KernelId, QueueId,
    Runtime,
};
use crate::error::{Error, Result};
use crate::Element;
use std::path::Path;

/// Where a session is in its one-way lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No runtime resources acquired yet.
    Unopened,
    /// Device, context, program, kernels and queues are live.
    Opened,
    /// Device buffers exist.
    BuffersAllocated,
    /// At least one input has been copied to the device.
    DataUploaded,
    /// The kernel has been enqueued.
    Dispatched,
    /// The queue has drained.
    Completed,
    /// The output has been copied back.
    DataDownloaded,
    /// Everything released.
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct DeviceBuffer {
    id: BufferId,
    len: usize,
    access: AccessMode,
    uploaded: bool,
}

/// Owns a [`Runtime`] and the handles it acquired for one validation run.
pub struct AcceleratorSession<R: Runtime> {
    runtime: R,
    state: SessionState,
    env: Option<Environment>,
    buffers: Vec<DeviceBuffer>,
}

impl<R: Runtime> std::fmt::Debug for AcceleratorSession<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratorSession")
            .field("runtime", &self.runtime.name())
            .field("state", &self.state)
            .field("env", &self.env)
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

impl<R: Runtime> AcceleratorSession<R> {
    /// Wraps `runtime` in an unopened session.
    pub fn new(runtime: R) -> Self {
        Self {
            runtime,
            state: SessionState::Unopened,
            env: None,
            buffers: Vec::new(),
        }
    }

    /// Creates a session and opens it in one step.
    ///
    /// On failure the partially acquired handles are already released.
    pub fn open_with(runtime: R, binary_path: &Path, kernel_names: &[String]) -> Result<Self> {
        let mut session = Self::new(runtime);
        session.open(binary_path, kernel_names)?;
        Ok(session)
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// The environment acquired by [`open`](Self::open), if any.
    #[must_use]
    pub fn environment(&self) -> Option<&Environment> {
        self.env.as_ref()
    }

    /// The wrapped runtime.
    #[must_use]
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Resolved kernel handle for `name`.
    #[must_use]
    pub fn kernel(&self, name: &str) -> Option<KernelId> {
        self.env.as_ref().and_then(|env| env.kernel(name))
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: &'static str,
        accepted: &[SessionState],
    ) -> Result<()> {
        if accepted.contains(&self.state) {
            Ok(())
        } else {
            crate::error!(
                "session",
                "{operation} called in state {:?}, expected {expected}",
                self.state
            );
            Err(Error::Sequence {
                operation,
                expected,
                actual: self.state,
            })
        }
    }

    fn queue(&self) -> Result<QueueId> {
        self.env
            .as_ref()
            .and_then(|env| env.queues.first().copied())
            .ok_or_else(|| Error::Initialization("runtime returned no command queue".to_string()))
    }

    fn device_buffer(&self, id: BufferId) -> Option<DeviceBuffer> {
        self.buffers.iter().find(|b| b.id == id).copied()
    }

    /// Bootstraps the runtime environment for `kernel_names`.
    ///
    /// # Errors
    ///
    /// [`Error::Initialization`] if no device is found, the binary fails to
    /// load, or a kernel cannot be resolved. The session is closed before the
    /// error is returned.
    pub fn open(&mut self, binary_path: &Path, kernel_names: &[String]) -> Result<()> {
        self.expect_state("open", "Unopened", &[SessionState::Unopened])?;
        crate::time_scope!("session", "open");

        let env = match self.runtime.init_environment(binary_path, kernel_names) {
            Ok(env) => env,
            Err(e) => {
                crate::error!("session", "init_environment failed: {e}");
                self.close();
                return Err(e);
            }
        };

        if env.queues.len() < kernel_names.len()
            || kernel_names.iter().any(|name| env.kernel(name).is_none())
        {
            self.close();
            return Err(Error::Initialization(format!(
                "runtime resolved {} kernel(s) and {} queue(s) for {} requested name(s)",
                env.kernels.len(),
                env.queues.len(),
                kernel_names.len()
            )));
        }

        crate::info!(
            "session",
            "opened {} on '{}' / '{}'",
            self.runtime.name(),
            env.platform,
            env.device
        );
        self.env = Some(env);
        self.state = SessionState::Opened;
        Ok(())
    }

    /// Creates one device buffer per spec, in order.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] if the runtime cannot satisfy a request. Buffers
    /// created before the failure are released when the session closes.
    pub fn allocate_device_buffers(&mut self, specs: &[BufferSpec]) -> Result<Vec<BufferId>> {
        self.expect_state("allocate_device_buffers", "Opened", &[SessionState::Opened])?;
        crate::time_scope!("session", "allocate_device_buffers");

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self.runtime.create_buffer(spec.len, spec.access)?;
            crate::debug!(
                "session",
                "device buffer {:?}: {} bytes {:?}",
                id,
                spec.byte_len(),
                spec.access
            );
            self.buffers.push(DeviceBuffer {
                id,
                len: spec.len,
                access: spec.access,
                uploaded: false,
            });
            ids.push(id);
        }

        self.state = SessionState::BuffersAllocated;
        Ok(ids)
    }

    /// Blocking copy of `host` into `device`.
    ///
    /// Returns only after the data has landed, so a later dispatch cannot
    /// observe a partial copy.
    ///
    /// # Errors
    ///
    /// [`Error::Transfer`] if `device` is unknown, is a kernel-output
    /// (`WriteOnly`) buffer, or has already been uploaded to.
    pub fn upload(&mut self, host: &[Element], device: BufferId) -> Result<()> {
        self.expect_state(
            "upload",
            "BuffersAllocated or DataUploaded",
            &[SessionState::BuffersAllocated, SessionState::DataUploaded],
        )?;

        let target = self
            .device_buffer(device)
            .ok_or_else(|| Error::Transfer(format!("unknown device buffer {device:?}")))?;
        if target.access == AccessMode::WriteOnly {
            return Err(Error::Transfer(format!(
                "device buffer {device:?} is a kernel output and cannot be uploaded to"
            )));
        }
        if target.uploaded {
            return Err(Error::Transfer(format!(
                "device buffer {device:?} has already been uploaded"
            )));
        }
        if target.len != host.len() {
            return Err(Error::BufferSize {
                what: "upload",
                expected: target.len,
                actual: host.len(),
            });
        }

        crate::time_scope!("session", format!("upload {device:?}"));
        let queue = self.queue()?;
        self.runtime.write_buffer(queue, device, host)?;
        if let Some(buffer) = self.buffers.iter_mut().find(|b| b.id == device) {
            buffer.uploaded = true;
        }
        self.state = SessionState::DataUploaded;
        Ok(())
    }

    /// Binds `args` positionally (first entry is argument 0) and enqueues one
    /// task-style invocation of `kernel`.
    ///
    /// # Errors
    ///
    /// [`Error::Dispatch`] if an argument names an unknown buffer, its access
    /// mode disagrees with the allocation, the runtime rejects the binding, or
    /// the enqueue fails.
    pub fn bind_and_dispatch(&mut self, kernel: KernelId, args: &[KernelArg]) -> Result<()> {
        self.expect_state("bind_and_dispatch", "DataUploaded", &[SessionState::DataUploaded])?;
        crate::time_scope!("session", "bind_and_dispatch");

        let known_kernel = self
            .env
            .as_ref()
            .is_some_and(|env| env.kernels.iter().any(|&(_, id)| id == kernel));
        if !known_kernel {
            return Err(Error::Dispatch(format!("unknown kernel {kernel:?}")));
        }

        for (index, arg) in args.iter().enumerate() {
            let bound = self.device_buffer(arg.buffer).ok_or_else(|| {
                Error::Dispatch(format!("argument {index}: unknown buffer {:?}", arg.buffer))
            })?;
            if bound.access != arg.access {
                return Err(Error::Dispatch(format!(
                    "argument {index}: buffer {:?} allocated {:?} but bound as {:?}",
                    arg.buffer, bound.access, arg.access
                )));
            }
            let index = u32::try_from(index)
                .map_err(|_| Error::Dispatch(format!("argument index {index} out of range")))?;
            self.runtime.set_kernel_arg(kernel, index, arg.buffer)?;
        }

        let queue = self.queue()?;
        self.runtime.enqueue_task(queue, kernel)?;
        self.state = SessionState::Dispatched;
        Ok(())
    }

    /// Blocks until the dispatched kernel has retired.
    pub fn await_completion(&mut self) -> Result<()> {
        self.expect_state("await_completion", "Dispatched", &[SessionState::Dispatched])?;
        crate::time_scope!("session", "await_completion");

        let queue = self.queue()?;
        self.runtime.finish(queue)?;
        self.state = SessionState::Completed;
        Ok(())
    }

    /// Blocking copy of `device` into `host`. Only valid after
    /// [`await_completion`](Self::await_completion).
    pub fn download(&mut self, device: BufferId, host: &mut [Element]) -> Result<()> {
        self.expect_state("download", "Completed", &[SessionState::Completed])?;

        let source = self
            .device_buffer(device)
            .ok_or_else(|| Error::Transfer(format!("unknown device buffer {device:?}")))?;
        if source.len != host.len() {
            return Err(Error::BufferSize {
                what: "download",
                expected: source.len,
                actual: host.len(),
            });
        }

        crate::time_scope!("session", format!("download {device:?}"));
        let queue = self.queue()?;
        self.runtime.read_buffer(queue, device, host)?;
        self.state = SessionState::DataDownloaded;
        Ok(())
    }

    /// Drains the queues, then releases buffers, queues, kernels, program,
    /// context and device in that order.
    ///
    /// Idempotent, and safe in every state including after a failed
    /// [`open`](Self::open).
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        crate::time_scope!("session", "close");

        if let Some(env) = &self.env {
            for &queue in &env.queues {
                if let Err(e) = self.runtime.finish(queue) {
                    crate::warn!("session", "queue {:?} did not drain cleanly: {e}", queue);
                }
            }
        }
        for kind in HandleKind::RELEASE_ORDER {
            self.runtime.release(kind);
        }

        self.buffers.clear();
        self.env = None;
        self.state = SessionState::Closed;
    }
}

impl<R: Runtime> Drop for AcceleratorSession<R> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::{EmulatedRuntime, Faults};
    use crate::dims::MatrixDims;
    use std::io::Write;

    const KERNEL: &str = "MatrixMultiplication";

    fn binary() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"aocx").unwrap();
        file
    }

    fn opened(dims: MatrixDims) -> (AcceleratorSession<EmulatedRuntime>, tempfile::NamedTempFile) {
        let bin = binary();
        let runtime = EmulatedRuntime::matmul(KERNEL, dims);
        let session =
            AcceleratorSession::open_with(runtime, bin.path(), &[KERNEL.to_string()]).unwrap();
        (session, bin)
    }

    #[test]
    fn test_full_lifecycle_states() {
        let dims = MatrixDims::new(2, 2, 2).unwrap();
        let (mut session, _bin) = opened(dims);
        assert_eq!(session.state(), SessionState::Opened);

        let ids = session
            .allocate_device_buffers(&[
                BufferSpec::input(4),
                BufferSpec::input(4),
                BufferSpec::output(4),
            ])
            .unwrap();
        assert_eq!(session.state(), SessionState::BuffersAllocated);

        session.upload(&[1.0, 2.0, 3.0, 4.0], ids[0]).unwrap();
        session.upload(&[5.0, 6.0, 7.0, 8.0], ids[1]).unwrap();
        assert_eq!(session.state(), SessionState::DataUploaded);

        let kernel = session.kernel(KERNEL).unwrap();
        session
            .bind_and_dispatch(
                kernel,
                &[
                    KernelArg::input(ids[0]),
                    KernelArg::input(ids[1]),
                    KernelArg::output(ids[2]),
                ],
            )
            .unwrap();
        assert_eq!(session.state(), SessionState::Dispatched);

        session.await_completion().unwrap();
        let mut c = [0.0; 4];
        session.download(ids[2], &mut c).unwrap();
        assert_eq!(session.state(), SessionState::DataDownloaded);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_dispatch_before_allocation_is_sequence_error() {
        let (mut session, _bin) = opened(MatrixDims::default());
        let kernel = session.kernel(KERNEL).unwrap();
        let err = session.bind_and_dispatch(kernel, &[]).unwrap_err();
        assert!(matches!(
            err,
            Error::Sequence {
                operation: "bind_and_dispatch",
                actual: SessionState::Opened,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Opened);
    }

    #[test]
    fn test_download_before_completion_is_sequence_error() {
        let (mut session, _bin) = opened(MatrixDims::new(1, 1, 1).unwrap());
        let ids = session.allocate_device_buffers(&[BufferSpec::output(1)]).unwrap();
        let mut out = [0.0];
        let err = session.download(ids[0], &mut out).unwrap_err();
        assert!(matches!(err, Error::Sequence { operation: "download", .. }));
    }

    #[test]
    fn test_operations_after_close_rejected() {
        let (mut session, _bin) = opened(MatrixDims::default());
        session.close();
        let err = session.allocate_device_buffers(&[BufferSpec::input(1)]).unwrap_err();
        assert!(matches!(err, Error::Sequence { actual: SessionState::Closed, .. }));
    }

    #[test]
    fn test_upload_length_mismatch() {
        let (mut session, _bin) = opened(MatrixDims::default());
        let ids = session.allocate_device_buffers(&[BufferSpec::input(4)]).unwrap();
        let err = session.upload(&[1.0; 3], ids[0]).unwrap_err();
        assert!(matches!(err, Error::BufferSize { what: "upload", expected: 4, actual: 3 }));
        assert_eq!(session.state(), SessionState::BuffersAllocated);
    }

    #[test]
    fn test_upload_into_output_buffer_rejected() {
        let (mut session, _bin) = opened(MatrixDims::new(1, 1, 1).unwrap());
        let ids = session
            .allocate_device_buffers(&[BufferSpec::input(1), BufferSpec::output(1)])
            .unwrap();
        let err = session.upload(&[1.0], ids[1]).unwrap_err();
        assert!(matches!(err, Error::Transfer(_)), "{err}");
        assert_eq!(session.state(), SessionState::BuffersAllocated);
    }

    #[test]
    fn test_second_upload_to_same_buffer_rejected() {
        let (mut session, _bin) = opened(MatrixDims::new(1, 1, 1).unwrap());
        let ids = session.allocate_device_buffers(&[BufferSpec::input(1)]).unwrap();
        session.upload(&[1.0], ids[0]).unwrap();
        let err = session.upload(&[2.0], ids[0]).unwrap_err();
        assert!(err.to_string().contains("already been uploaded"), "{err}");
        assert_eq!(session.state(), SessionState::DataUploaded);
    }

    #[test]
    fn test_access_mode_mismatch_rejected() {
        let (mut session, _bin) = opened(MatrixDims::new(1, 1, 1).unwrap());
        let ids = session
            .allocate_device_buffers(&[
                BufferSpec::input(1),
                BufferSpec::input(1),
                BufferSpec::output(1),
            ])
            .unwrap();
        session.upload(&[1.0], ids[0]).unwrap();
        let kernel = session.kernel(KERNEL).unwrap();
        let err = session
            .bind_and_dispatch(kernel, &[KernelArg::output(ids[0])])
            .unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));
        assert_eq!(session.state(), SessionState::DataUploaded);
    }

    #[test]
    fn test_failed_open_releases_partial_handles() {
        let runtime = EmulatedRuntime::new();
        let log = runtime.release_log();
        let bin = binary();
        let err = AcceleratorSession::open_with(runtime, bin.path(), &[KERNEL.to_string()])
            .unwrap_err();
        assert!(matches!(err, Error::Initialization(_)));
        assert_eq!(
            log.entries(),
            vec![HandleKind::Program, HandleKind::Context, HandleKind::Device]
        );
    }

    #[test]
    fn test_no_device_releases_nothing() {
        let runtime = EmulatedRuntime::matmul(KERNEL, MatrixDims::default()).with_faults(Faults {
            no_device: true,
            ..Faults::default()
        });
        let log = runtime.release_log();
        let bin = binary();
        let result = AcceleratorSession::open_with(runtime, bin.path(), &[KERNEL.to_string()]);
        assert!(result.is_err());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_drop_releases_in_reverse_order() {
        let dims = MatrixDims::new(1, 1, 1).unwrap();
        let bin = binary();
        let runtime = EmulatedRuntime::matmul(KERNEL, dims);
        let log = runtime.release_log();
        {
            let mut session =
                AcceleratorSession::open_with(runtime, bin.path(), &[KERNEL.to_string()]).unwrap();
            session.allocate_device_buffers(&[BufferSpec::input(1)]).unwrap();
        }
        assert_eq!(log.entries(), HandleKind::RELEASE_ORDER.to_vec());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut session, _bin) = opened(MatrixDims::default());
        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.environment().is_none());
    }
}
