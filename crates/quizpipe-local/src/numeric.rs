use quizpipe_core::{Error, Result};

/// Sum every numeric cell of a comma/newline grid.
///
/// Cells that do not parse as `f64` are discarded silently. With a threshold, only
/// values strictly greater than it are summed. No numeric cells sums to `0`.
///
/// A total that is not finite (an `inf` cell, or a `nan` cell that survives the
/// threshold) is reported as an error rather than returned.
pub fn try_sum_numeric_cells(data: &str, threshold: Option<f64>) -> Result<f64> {
    let total: f64 = data
        .trim()
        .split('\n')
        .flat_map(|row| row.split(','))
        .filter_map(|cell| cell.trim().parse::<f64>().ok())
        .filter(|v| threshold.map_or(true, |t| *v > t))
        .sum();
    if !total.is_finite() {
        return Err(Error::Aggregate(format!("sum is not finite ({total})")));
    }
    Ok(total)
}

/// [`try_sum_numeric_cells`], with failures logged and turned into `None`.
pub fn sum_numeric_cells(data: &str, threshold: Option<f64>) -> Option<f64> {
    match try_sum_numeric_cells(data, threshold) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(error = %e, "numeric aggregation failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sums_all_cells_without_threshold() {
        assert_eq!(sum_numeric_cells("1,2,3\n4,5", None), Some(15.0));
    }

    #[test]
    fn threshold_is_strict() {
        assert_eq!(sum_numeric_cells("1,10,20", Some(5.0)), Some(30.0));
        assert_eq!(sum_numeric_cells("5,6", Some(5.0)), Some(6.0));
    }

    #[test]
    fn non_numeric_cells_sum_to_zero() {
        assert_eq!(sum_numeric_cells("a,b,c", None), Some(0.0));
        assert_eq!(sum_numeric_cells("", None), Some(0.0));
    }

    #[test]
    fn mixed_grid_with_header_and_crlf() {
        let csv = "id,value\r\n1, 2.5\r\n2,-1\r\nx,1e2\r\n";
        assert_eq!(sum_numeric_cells(csv, None), Some(1.0 + 2.5 + 2.0 - 1.0 + 100.0));
    }

    #[test]
    fn non_finite_total_is_no_result() {
        assert_eq!(sum_numeric_cells("1,inf", None), None);
        assert!(matches!(
            try_sum_numeric_cells("nan,2", None),
            Err(Error::Aggregate(_))
        ));
        // NaN never passes a threshold, so it cannot poison a filtered sum.
        assert_eq!(sum_numeric_cells("1,nan", Some(0.0)), Some(1.0));
    }

    proptest! {
        #[test]
        fn integer_grids_sum_exactly(
            rows in prop::collection::vec(prop::collection::vec(-1000i64..1000, 1..6), 0..6),
            threshold in proptest::option::of(-500i64..500),
        ) {
            let data = rows
                .iter()
                .map(|r| r.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(","))
                .collect::<Vec<_>>()
                .join("\n");
            let expected: i64 = rows
                .iter()
                .flatten()
                .filter(|v| threshold.map_or(true, |t| **v > t))
                .sum();
            let got = sum_numeric_cells(&data, threshold.map(|t| t as f64));
            prop_assert_eq!(got, Some(expected as f64));
        }
    }
}
