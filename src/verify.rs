//! Element-wise comparison of accelerator output against the reference.

use crate::dims::MatrixDims;
use crate::error::{Error, Result};
use crate::Element;

/// Maximum absolute difference tolerated between reference and accelerator.
pub const TOLERANCE: f64 = 1e-3;

/// Outcome of a verification pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Every element is within tolerance.
    Match,
    /// First (row-major) element outside tolerance.
    Mismatch {
        /// Row of the offending element.
        row: usize,
        /// Column of the offending element.
        col: usize,
        /// Reference value.
        expected: Element,
        /// Accelerator value.
        actual: Element,
    },
}

impl Verdict {
    /// Returns true for [`Verdict::Match`].
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match)
    }

    /// Converts a mismatch into [`Error::Mismatch`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Match => Ok(()),
            Self::Mismatch {
                row,
                col,
                expected,
                actual,
            } => Err(Error::Mismatch {
                row,
                col,
                expected,
                actual,
            }),
        }
    }
}

/// Scans `actual` against `reference` in row-major order and stops at the
/// first index where `|reference - actual| >= tolerance`.
///
/// The difference is taken in [`Element`] and widened to `f64` for the
/// comparison. A NaN on either side is always a mismatch.
///
/// # Errors
///
/// Returns [`Error::BufferSize`] if either slice is not `dims.c_len()` long.
#[allow(clippy::neg_cmp_op_on_partial_ord)]
pub fn verify(
    reference: &[Element],
    actual: &[Element],
    dims: MatrixDims,
    tolerance: f64,
) -> Result<Verdict> {
    for (what, len) in [("C_ref", reference.len()), ("C_accel", actual.len())] {
        if len != dims.c_len() {
            return Err(Error::BufferSize {
                what,
                expected: dims.c_len(),
                actual: len,
            });
        }
    }

    let first_bad = reference.iter().zip(actual).position(|(&expected, &got)| {
        let diff = f64::from((expected - got).abs());
        // Written as a negated `<` so NaN lands on the mismatch side.
        !(diff < tolerance)
    });

    Ok(match first_bad {
        None => Verdict::Match,
        Some(index) => {
            let (row, col) = dims.c_position(index);
            crate::debug!("verify", "first mismatch at index {index} -> ({row}, {col})");
            Verdict::Mismatch {
                row,
                col,
                expected: reference[index],
                actual: actual[index],
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims2() -> MatrixDims {
        MatrixDims::new(2, 2, 2).unwrap()
    }

    #[test]
    fn test_identical_buffers_match() {
        let c = [19.0, 22.0, 43.0, 50.0];
        assert_eq!(verify(&c, &c, dims2(), TOLERANCE).unwrap(), Verdict::Match);
    }

    #[test]
    fn test_first_mismatch_is_row_major() {
        let reference = [1.0, 2.0, 3.0, 4.0];
        let actual = [1.0, 2.5, 3.5, 4.0];
        let verdict = verify(&reference, &actual, dims2(), TOLERANCE).unwrap();
        assert_eq!(
            verdict,
            Verdict::Mismatch {
                row: 0,
                col: 1,
                expected: 2.0,
                actual: 2.5
            }
        );
    }

    #[test]
    fn test_tolerance_boundary_is_exclusive() {
        let dims = MatrixDims::new(1, 1, 1).unwrap();
        let at_tolerance = verify(&[0.0], &[1e-3], dims, TOLERANCE).unwrap();
        assert!(!at_tolerance.is_match(), "difference of exactly 1e-3 must mismatch");

        let below = verify(&[0.0], &[9.99e-4], dims, TOLERANCE).unwrap();
        assert!(below.is_match(), "difference of 9.99e-4 must match");
    }

    #[test]
    fn test_nan_is_mismatch() {
        let dims = MatrixDims::new(1, 2, 1).unwrap();
        let verdict = verify(&[1.0, 2.0], &[1.0, Element::NAN], dims, TOLERANCE).unwrap();
        assert!(matches!(verdict, Verdict::Mismatch { row: 0, col: 1, .. }));

        let verdict = verify(&[Element::NAN, 2.0], &[1.0, 2.0], dims, TOLERANCE).unwrap();
        assert!(matches!(verdict, Verdict::Mismatch { row: 0, col: 0, .. }));
    }

    #[test]
    fn test_infinity_is_mismatch() {
        let dims = MatrixDims::new(1, 1, 1).unwrap();
        let verdict = verify(&[1.0], &[Element::INFINITY], dims, TOLERANCE).unwrap();
        assert!(!verdict.is_match());
    }

    #[test]
    fn test_injected_fault_reported_with_values() {
        let reference = [19.0, 22.0, 43.0, 50.0];
        let actual = [19.0, 22.0, 43.0, 50.01];
        let verdict = verify(&reference, &actual, dims2(), TOLERANCE).unwrap();
        let err = verdict.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Mismatch at (1, 1): 50.01 (should be 50).");
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let err = verify(&[0.0; 4], &[0.0; 3], dims2(), TOLERANCE).unwrap_err();
        assert!(matches!(err, Error::BufferSize { what: "C_accel", .. }));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The reported index is the smallest differing one, whatever else differs.
        #[test]
        fn prop_reports_smallest_failing_index(
            (rows, cols, bad) in (1usize..8, 1usize..8).prop_flat_map(|(r, c)| (
                Just(r),
                Just(c),
                prop::collection::btree_set(0..r * c, 1..=(r * c)),
            ))
        ) {
            let dims = MatrixDims { n: rows, m: cols, k: 1 };
            let reference = vec![1.0; dims.c_len()];
            let mut actual = reference.clone();
            for &i in &bad {
                actual[i] = 2.0;
            }

            let first = *bad.iter().next().unwrap();
            let verdict = verify(&reference, &actual, dims, TOLERANCE).unwrap();
            prop_assert_eq!(
                verdict,
                Verdict::Mismatch {
                    row: first / cols,
                    col: first % cols,
                    expected: 1.0,
                    actual: 2.0,
                }
            );
        }

        /// Perturbations well inside the tolerance never fail.
        #[test]
        fn prop_small_noise_matches(
            values in prop::collection::vec(-100.0f32..100.0, 1..64),
            noise in -4.0e-4f32..4.0e-4,
        ) {
            let dims = MatrixDims { n: 1, m: values.len(), k: 1 };
            let actual: Vec<Element> = values.iter().map(|v| v + noise).collect();
            prop_assert!(verify(&values, &actual, dims, TOLERANCE).unwrap().is_match());
        }
    }
}
