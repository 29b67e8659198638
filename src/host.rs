//! Aligned host memory for the matrices exchanged with the accelerator.
//!
//! Accelerator runtimes DMA directly out of host memory when it is aligned to
//! their boundary (64 bytes for the Intel FPGA OpenCL runtime); unaligned
//! buffers force an extra staging copy or are rejected outright.

use crate::dims::MatrixDims;
use crate::error::{Error, Result};
use crate::Element;
use rand::distributions::{Distribution, Standard};
use rand::Rng;
use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Alignment boundary required by the accelerator runtime, in bytes.
pub const ACCEL_ALIGNMENT: usize = 64;

/// A zero-initialized, heap-allocated slice of [`Element`]s with a guaranteed
/// alignment. Freed on drop.
pub struct AlignedBuffer {
    ptr: NonNull<Element>,
    len: usize,
    layout: Layout,
}

// SAFETY: AlignedBuffer uniquely owns its allocation, like Vec<Element>.
#[allow(unsafe_code)]
unsafe impl Send for AlignedBuffer {}
#[allow(unsafe_code)]
unsafe impl Sync for AlignedBuffer {}

#[allow(unsafe_code)]
impl AlignedBuffer {
    /// Allocates `len` zeroed elements aligned to `alignment` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if `len` is zero, the layout is invalid
    /// (alignment not a power of two, size overflow), or the allocator fails.
    pub fn new(what: &str, len: usize, alignment: usize) -> Result<Self> {
        let fail = |message: String| Error::Allocation {
            what: what.to_string(),
            message,
        };

        if len == 0 {
            return Err(fail("zero-length buffer".to_string()));
        }
        let bytes = len
            .checked_mul(std::mem::size_of::<Element>())
            .ok_or_else(|| fail(format!("{len} elements overflow usize")))?;
        let align = alignment.max(std::mem::align_of::<Element>());
        let layout = Layout::from_size_align(bytes, align)
            .map_err(|e| fail(format!("invalid layout size={bytes} alignment={align}: {e}")))?;

        // SAFETY: layout has non-zero size (len > 0 and Element is not a ZST).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw.cast::<Element>()) else {
            return Err(fail(format!("allocator returned null for {bytes} bytes")));
        };

        crate::trace!("host", "allocated {what}: {len} elements ({bytes} bytes, align {align})");
        Ok(Self { ptr, len, layout })
    }

    /// Number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Always false: zero-length buffers are rejected at allocation.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size in bytes.
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.len * std::mem::size_of::<Element>()
    }

    /// Returns true if the start address is a multiple of `alignment`.
    /// Always false for an `alignment` that is not a power of two.
    #[must_use]
    pub fn is_aligned(&self, alignment: usize) -> bool {
        alignment.is_power_of_two() && (self.ptr.as_ptr() as usize) & (alignment - 1) == 0
    }

    /// Elements as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[Element] {
        // SAFETY: ptr is valid for len initialized (zeroed) elements for our lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Elements as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [Element] {
        // SAFETY: as above, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[allow(unsafe_code)]
impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated in `new` with exactly this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr().cast::<u8>(), self.layout) };
    }
}

impl Deref for AlignedBuffer {
    type Target = [Element];

    fn deref(&self) -> &[Element] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [Element] {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish_non_exhaustive()
    }
}

/// Host-side A, B and accelerator-output C buffers for one run.
#[derive(Debug)]
pub struct HostBuffers {
    /// Input A (N×K), row-major.
    pub a: AlignedBuffer,
    /// Input B (K×M), row-major.
    pub b: AlignedBuffer,
    /// Output C read back from the accelerator (N×M), row-major.
    pub c_accel: AlignedBuffer,
    dims: MatrixDims,
}

impl HostBuffers {
    /// Allocates all three buffers for `dims` at the given alignment.
    ///
    /// Buffers allocated before a failing one are released on the error path.
    pub fn allocate(dims: MatrixDims, alignment: usize) -> Result<Self> {
        dims.validate()?;
        let a = AlignedBuffer::new("A", dims.a_len(), alignment)?;
        let b = AlignedBuffer::new("B", dims.b_len(), alignment)?;
        let c_accel = AlignedBuffer::new("C", dims.c_len(), alignment)?;
        Ok(Self { a, b, c_accel, dims })
    }

    /// Dimensions these buffers were sized for.
    #[must_use]
    pub const fn dims(&self) -> MatrixDims {
        self.dims
    }

    /// Fills A then B with independent uniform draws from `[0, 1)`.
    ///
    /// C is left untouched.
    pub fn fill_random<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        fill_uniform(&mut self.a, rng);
        fill_uniform(&mut self.b, rng);
    }
}

/// Overwrites `data` with values from the element type's standard distribution.
pub fn fill_uniform<R: Rng + ?Sized>(data: &mut [Element], rng: &mut R) {
    for (slot, value) in data.iter_mut().zip(Standard.sample_iter(&mut *rng)) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_aligned_buffer_zeroed_and_aligned() {
        let buf = AlignedBuffer::new("A", 100, ACCEL_ALIGNMENT).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.byte_len(), 100 * std::mem::size_of::<Element>());
        assert!(buf.is_aligned(ACCEL_ALIGNMENT));
        assert!(buf.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_aligned_buffer_large_alignment() {
        let buf = AlignedBuffer::new("A", 3, 4096).unwrap();
        assert!(buf.is_aligned(4096));
    }

    #[test]
    fn test_aligned_buffer_rejects_zero_length() {
        let err = AlignedBuffer::new("B", 0, ACCEL_ALIGNMENT).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }));
        assert!(err.to_string().contains("B"));
    }

    #[test]
    fn test_aligned_buffer_rejects_bad_alignment() {
        let err = AlignedBuffer::new("C", 8, 48).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }), "{err}");
    }

    #[test]
    fn test_aligned_buffer_rejects_overflow() {
        let err = AlignedBuffer::new("C", usize::MAX, ACCEL_ALIGNMENT).unwrap_err();
        assert!(matches!(err, Error::Allocation { .. }), "{err}");
    }

    #[test]
    fn test_is_aligned_rejects_invalid_alignment() {
        let buf = AlignedBuffer::new("A", 4, ACCEL_ALIGNMENT).unwrap();
        assert!(!buf.is_aligned(0));
        assert!(!buf.is_aligned(48));
        assert!(buf.is_aligned(1));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_allocate_rejects_oversized_dims() {
        let dims = MatrixDims { n: 1 << 32, m: 1, k: 1 << 32 };
        let err = HostBuffers::allocate(dims, ACCEL_ALIGNMENT).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }), "{err}");
    }

    #[test]
    fn test_aligned_buffer_mutation() {
        let mut buf = AlignedBuffer::new("A", 4, ACCEL_ALIGNMENT).unwrap();
        buf[0] = 1.5;
        buf.as_mut_slice()[3] = -2.0;
        assert_eq!(buf.as_slice(), &[1.5, 0.0, 0.0, -2.0]);
    }

    #[test]
    fn test_host_buffers_sized_from_dims() {
        let dims = MatrixDims::new(3, 5, 7).unwrap();
        let bufs = HostBuffers::allocate(dims, ACCEL_ALIGNMENT).unwrap();
        assert_eq!(bufs.a.len(), 21);
        assert_eq!(bufs.b.len(), 35);
        assert_eq!(bufs.c_accel.len(), 15);
        assert_eq!(bufs.dims(), dims);
    }

    #[test]
    fn test_fill_random_touches_inputs_only() {
        let dims = MatrixDims::new(4, 4, 4).unwrap();
        let mut bufs = HostBuffers::allocate(dims, ACCEL_ALIGNMENT).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        bufs.fill_random(&mut rng);

        assert!(bufs.a.iter().all(|&v| (0.0..1.0).contains(&v)));
        assert!(bufs.b.iter().all(|&v| (0.0..1.0).contains(&v)));
        assert!(bufs.a.iter().any(|&v| v != 0.0));
        assert!(bufs.c_accel.iter().all(|&v| v == 0.0));
        assert_ne!(bufs.a.as_slice(), bufs.b.as_slice());
    }

    #[test]
    fn test_fill_random_is_deterministic_for_seed() {
        let dims = MatrixDims::new(2, 3, 4).unwrap();
        let mut first = HostBuffers::allocate(dims, ACCEL_ALIGNMENT).unwrap();
        let mut second = HostBuffers::allocate(dims, ACCEL_ALIGNMENT).unwrap();
        first.fill_random(&mut StdRng::seed_from_u64(7));
        second.fill_random(&mut StdRng::seed_from_u64(7));
        assert_eq!(first.a.as_slice(), second.a.as_slice());
        assert_eq!(first.b.as_slice(), second.b.as_slice());
    }
}
