//! Matrix shapes for C = A × B.

use crate::error::{Error, Result};
use crate::Element;
use serde::{Deserialize, Serialize};

/// Dimensions of a multiplication A:(N×K) × B:(K×M) = C:(N×M).
///
/// All host and device buffer sizes derive from this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixDims {
    /// Rows of A and C.
    pub n: usize,
    /// Columns of B and C.
    pub m: usize,
    /// Columns of A, rows of B.
    pub k: usize,
}

impl MatrixDims {
    /// Creates dimensions, rejecting zero or unaddressably large extents.
    pub fn new(n: usize, m: usize, k: usize) -> Result<Self> {
        let dims = Self { n, m, k };
        dims.validate()?;
        Ok(dims)
    }

    /// Checks that every extent is at least one and that every buffer's
    /// element and byte count fits in `usize`.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [("matrix.n", self.n), ("matrix.m", self.m), ("matrix.k", self.k)] {
            if value == 0 {
                return Err(Error::ConfigInvalid {
                    key: key.to_string(),
                    message: "dimension must be at least 1".to_string(),
                });
            }
        }

        let shapes = [("A", self.n, self.k), ("B", self.k, self.m), ("C", self.n, self.m)];
        for (what, rows, cols) in shapes {
            let fits = rows
                .checked_mul(cols)
                .and_then(|len| len.checked_mul(std::mem::size_of::<Element>()))
                .is_some();
            if !fits {
                return Err(Error::ConfigInvalid {
                    key: "matrix".to_string(),
                    message: format!("{what} ({rows}x{cols}) is too large to address"),
                });
            }
        }
        Ok(())
    }

    /// Element count of A (N×K).
    #[must_use]
    pub const fn a_len(&self) -> usize {
        self.n * self.k
    }

    /// Element count of B (K×M).
    #[must_use]
    pub const fn b_len(&self) -> usize {
        self.k * self.m
    }

    /// Element count of C (N×M).
    #[must_use]
    pub const fn c_len(&self) -> usize {
        self.n * self.m
    }

    /// Splits a row-major index into C into `(row, col)`.
    #[must_use]
    pub const fn c_position(&self, index: usize) -> (usize, usize) {
        (index / self.m, index % self.m)
    }
}

impl Default for MatrixDims {
    fn default() -> Self {
        Self {
            n: crate::DIM_N,
            m: crate::DIM_M,
            k: crate::DIM_K,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths() {
        let dims = MatrixDims::new(2, 3, 4).unwrap();
        assert_eq!(dims.a_len(), 8);
        assert_eq!(dims.b_len(), 12);
        assert_eq!(dims.c_len(), 6);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let err = MatrixDims::new(4, 0, 4).unwrap_err();
        assert!(err.to_string().contains("matrix.m"), "{err}");
    }

    #[test]
    fn test_oversized_product_rejected() {
        let half = 1usize << (usize::BITS / 2);
        let err = MatrixDims::new(half, 1, half).unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { ref key, .. } if key == "matrix"), "{err}");

        // Element count fits but byte count does not
        let err = MatrixDims::new(usize::MAX / 2, 1, 1).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
    }

    #[test]
    fn test_c_position_is_row_major() {
        let dims = MatrixDims::new(3, 4, 2).unwrap();
        assert_eq!(dims.c_position(0), (0, 0));
        assert_eq!(dims.c_position(3), (0, 3));
        assert_eq!(dims.c_position(4), (1, 0));
        assert_eq!(dims.c_position(11), (2, 3));
    }

    #[test]
    fn test_default_matches_constants() {
        let dims = MatrixDims::default();
        assert_eq!((dims.n, dims.m, dims.k), (crate::DIM_N, crate::DIM_M, crate::DIM_K));
    }
}
