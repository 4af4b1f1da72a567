//! Element-wise comparison of candidate outputs against a reference.

use super::Tensor;
use crate::config::Tolerance;
use crate::errors::{StageFault, ToleranceExceededError};
use serde::{Deserialize, Serialize};

/// Summary of a successful comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// Number of elements compared.
    pub elements: usize,
    /// Largest absolute deviation.
    pub max_abs_error: f64,
    /// Largest relative deviation (infinite when the reference is zero).
    pub max_rel_error: f64,
    /// Effective absolute tolerance, including the quantization allowance.
    pub atol: f64,
    /// Relative tolerance.
    pub rtol: f64,
}

struct Violation {
    output: usize,
    index: usize,
    candidate: f64,
    reference: f64,
    excess: f64,
}

/// Compares `candidate` to `reference` element-wise.
///
/// An element passes if `|c - r| <= atol + qtol * scale + rtol * |r|`.
/// Identical values pass, including equal infinities, and two NaNs
/// compare equal; a NaN against a number never passes. When
/// several elements fail, the error locates the one exceeding its
/// allowance by the most.
///
/// # Errors
///
/// Returns [`StageFault::Tolerance`] when an element is out of tolerance and
/// a plain fault when output counts or shapes differ.
#[allow(clippy::float_cmp)]
pub fn compare_outputs(
    reference: &[Tensor],
    candidate: &[Tensor],
    tolerance: &Tolerance,
    quantization_scale: Option<f64>,
) -> Result<ComparisonReport, StageFault> {
    if reference.len() != candidate.len() {
        return Err(StageFault::msg(format!(
            "expected {} outputs, got {}",
            reference.len(),
            candidate.len()
        )));
    }

    let atol = tolerance.effective_atol(quantization_scale);
    let rtol = tolerance.rtol;
    let mut elements = 0;
    let mut max_abs_error = 0.0_f64;
    let mut max_rel_error = 0.0_f64;
    let mut worst: Option<Violation> = None;

    for (output, (expected, actual)) in reference.iter().zip(candidate).enumerate() {
        if expected.shape() != actual.shape() {
            return Err(StageFault::msg(format!(
                "output {output}: expected shape {:?}, got {:?}",
                expected.shape(),
                actual.shape()
            )));
        }

        if expected.len() != actual.len() {
            return Err(StageFault::msg(format!(
                "output {output}: expected {} elements, got {}",
                expected.len(),
                actual.len()
            )));
        }

        for (index, (&r, &c)) in expected.data().iter().zip(actual.data()).enumerate() {
            elements += 1;
            if c == r || (r.is_nan() && c.is_nan()) {
                continue;
            }

            let diff = (c - r).abs();
            let allowed = atol + rtol * r.abs();
            let excess = if diff.is_nan() { f64::INFINITY } else { diff - allowed };

            if !diff.is_nan() {
                max_abs_error = max_abs_error.max(diff);
                let rel = if r == 0.0 {
                    if diff == 0.0 { 0.0 } else { f64::INFINITY }
                } else {
                    diff / r.abs()
                };
                max_rel_error = max_rel_error.max(rel);
            }

            if excess > 0.0 && worst.as_ref().map_or(true, |w| excess > w.excess) {
                worst = Some(Violation {
                    output,
                    index,
                    candidate: c,
                    reference: r,
                    excess,
                });
            }
        }
    }

    if let Some(violation) = worst {
        return Err(StageFault::Tolerance(ToleranceExceededError {
            output: violation.output,
            index: violation.index,
            candidate: violation.candidate,
            reference: violation.reference,
            max_abs_error,
            max_rel_error,
            atol,
            rtol,
        }));
    }

    Ok(ComparisonReport {
        elements,
        max_abs_error,
        max_rel_error,
        atol,
        rtol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f64]) -> Vec<Tensor> {
        vec![Tensor::from_vec(data.to_vec())]
    }

    fn tolerance_error(fault: StageFault) -> ToleranceExceededError {
        match fault {
            StageFault::Tolerance(err) => err,
            StageFault::Fault(other) => panic!("expected tolerance error, got {other}"),
        }
    }

    #[test]
    fn test_within_absolute_tolerance() {
        let report = compare_outputs(
            &t(&[1.0, 2.0]),
            &t(&[1.0001, 2.0]),
            &Tolerance::new(0.001, 0.0),
            None,
        )
        .unwrap();

        assert_eq!(report.elements, 2);
        assert!(report.max_abs_error > 0.0 && report.max_abs_error < 0.001);
    }

    #[test]
    fn test_tight_tolerance_reports_index() {
        let fault = compare_outputs(
            &t(&[1.0, 2.0]),
            &t(&[1.0001, 2.0]),
            &Tolerance::new(0.00001, 0.0),
            None,
        )
        .unwrap_err();

        let err = tolerance_error(fault);
        assert_eq!(err.output, 0);
        assert_eq!(err.index, 0);
        assert!(err.max_abs_error > 0.00001);
    }

    #[test]
    fn test_worst_element_is_reported() {
        let fault = compare_outputs(
            &t(&[2.0, 4.0, 6.0]),
            &t(&[2.01, 4.0, 7.0]),
            &Tolerance::default(),
            None,
        )
        .unwrap_err();

        let err = tolerance_error(fault);
        assert_eq!(err.index, 2);
        assert!((err.candidate - 7.0).abs() < f64::EPSILON);
        assert!((err.max_abs_error - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_relative_tolerance_scales_with_reference() {
        let tolerance = Tolerance::new(0.0, 0.01);
        assert!(compare_outputs(&t(&[1000.0]), &t(&[1005.0]), &tolerance, None).is_ok());
        assert!(compare_outputs(&t(&[1.0]), &t(&[1.05]), &tolerance, None).is_err());
    }

    #[test]
    fn test_quantization_steps_widen_atol() {
        let tolerance = Tolerance::new(0.001, 0.0).with_qtol(1.0);
        let report = compare_outputs(&t(&[1.0]), &t(&[1.05]), &tolerance, Some(0.1)).unwrap();
        assert!((report.atol - 0.101).abs() < 1e-12);
        assert!(compare_outputs(&t(&[1.0]), &t(&[1.05]), &tolerance, None).is_err());
    }

    #[test]
    fn test_nan_handling() {
        let tolerance = Tolerance::default();
        assert!(compare_outputs(&t(&[f64::NAN]), &t(&[f64::NAN]), &tolerance, None).is_ok());
        assert!(compare_outputs(&t(&[1.0]), &t(&[f64::NAN]), &tolerance, None).is_err());
    }

    #[test]
    fn test_equal_infinities_pass() {
        let tolerance = Tolerance::new(0.0, 0.0);
        let values = [f64::INFINITY, f64::NEG_INFINITY, 1.0];
        let report = compare_outputs(&t(&values), &t(&values), &tolerance, None).unwrap();
        assert_eq!(report.elements, 3);
        assert!(report.max_abs_error.abs() < f64::EPSILON);

        assert!(compare_outputs(&t(&[f64::INFINITY]), &t(&[f64::NEG_INFINITY]), &tolerance, None).is_err());
        assert!(compare_outputs(&t(&[f64::INFINITY]), &t(&[1.0]), &Tolerance::default(), None).is_err());
    }

    #[test]
    fn test_short_output_is_a_fault() {
        let reference = t(&[2.0, 4.0, 6.0]);
        let candidate: Vec<Tensor> =
            vec![serde_json::from_str::<Tensor>(r#"{"shape":[2],"data":[2.0,4.0]}"#).unwrap()];
        let fault = compare_outputs(&reference, &candidate, &Tolerance::default(), None).unwrap_err();
        assert!(matches!(fault, StageFault::Fault(_)));
    }

    #[test]
    fn test_shape_mismatch_is_a_fault() {
        let reference = vec![Tensor::ones(vec![2, 2])];
        let candidate = vec![Tensor::ones(vec![4])];
        let fault = compare_outputs(&reference, &candidate, &Tolerance::default(), None).unwrap_err();
        assert!(matches!(fault, StageFault::Fault(_)));

        let fault = compare_outputs(&reference, &[], &Tolerance::default(), None).unwrap_err();
        assert!(fault.to_string().contains("expected 1 outputs"));
    }
}
