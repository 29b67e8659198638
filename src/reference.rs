//! Host reference matrix multiplication.
//!
//! The golden result the accelerator output is judged against. Accumulation
//! happens in [`Element`] itself, in ascending `k` order, which is the same
//! arithmetic the kernel performs.

use crate::dims::MatrixDims;
use crate::error::{Error, Result};
use crate::Element;

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Error::BufferSize {
            what,
            expected,
            actual,
        })
    }
}

/// Computes `c[n*M + m] = Σ_k a[n*K + k] * b[k*M + m]`.
///
/// Every element of `c` is overwritten.
///
/// # Errors
///
/// Returns [`Error::BufferSize`] if a slice length disagrees with `dims`.
///
/// # Example
///
/// ```
/// use matmul_validator::dims::MatrixDims;
/// use matmul_validator::reference::reference_matmul;
///
/// let dims = MatrixDims::new(2, 2, 2).unwrap();
/// let mut c = [0.0; 4];
/// reference_matmul(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], &mut c, dims).unwrap();
/// assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
/// ```
pub fn reference_matmul(
    a: &[Element],
    b: &[Element],
    c: &mut [Element],
    dims: MatrixDims,
) -> Result<()> {
    check_len("A", dims.a_len(), a.len())?;
    check_len("B", dims.b_len(), b.len())?;
    check_len("C", dims.c_len(), c.len())?;

    let MatrixDims { n: rows, m: cols, k: depth } = dims;
    for n in 0..rows {
        for m in 0..cols {
            let mut acc: Element = 0.0;
            for k in 0..depth {
                acc += a[n * depth + k] * b[k * cols + m];
            }
            c[n * cols + m] = acc;
        }
    }
    Ok(())
}

/// Allocating convenience wrapper around [`reference_matmul`].
pub fn reference_product(a: &[Element], b: &[Element], dims: MatrixDims) -> Result<Vec<Element>> {
    let mut c = vec![0.0; dims.c_len()];
    reference_matmul(a, b, &mut c, dims)?;
    Ok(c)
}
