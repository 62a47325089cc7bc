use tracing::warn;

/// Binary classification quality with success as the positive class.
///
/// Ratios whose denominator is zero are reported as `0.0`, never NaN.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClassificationReport {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub true_negatives: usize,
}

impl ClassificationReport {
    /// Scores a predicted label stream against the ground truth. Streams of
    /// unequal length are compared over their common prefix.
    pub fn from_labels(truth: &[bool], predicted: &[bool]) -> Self {
        if truth.len() != predicted.len() {
            warn!(
                "label streams differ in length ({} vs {}); scoring the common prefix",
                truth.len(),
                predicted.len()
            );
        }
        let mut report = Self::default();
        for (&t, &p) in truth.iter().zip(predicted) {
            match (t, p) {
                (true, true) => report.true_positives += 1,
                (false, true) => report.false_positives += 1,
                (true, false) => report.false_negatives += 1,
                (false, false) => report.true_negatives += 1,
            }
        }
        let (tp, fp, fn_, tn) = (
            report.true_positives,
            report.false_positives,
            report.false_negatives,
            report.true_negatives,
        );
        report.precision = ratio("precision", tp, tp + fp);
        report.recall = ratio("recall", tp, tp + fn_);
        report.f1 = ratio("f1", 2 * tp, 2 * tp + fp + fn_);
        report.accuracy = ratio("accuracy", tp + tn, tp + fp + fn_ + tn);
        report
    }

    pub fn total(&self) -> usize {
        self.true_positives + self.false_positives + self.false_negatives + self.true_negatives
    }
}

fn ratio(metric: &str, num: usize, den: usize) -> f64 {
    if den == 0 {
        warn!("{metric} is ill-defined (zero denominator), reporting 0.0");
        0.0
    } else {
        num as f64 / den as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_stream() {
        let truth = [true, true, false, false, true];
        let pred = [true, false, true, false, true];
        let r = ClassificationReport::from_labels(&truth, &pred);
        assert_eq!((r.true_positives, r.false_positives), (2, 1));
        assert_eq!((r.false_negatives, r.true_negatives), (1, 1));
        assert!((r.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((r.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((r.f1 - 2.0 / 3.0).abs() < 1e-12);
        assert!((r.accuracy - 0.6).abs() < 1e-12);
    }

    #[test]
    fn single_class_truth_is_zero_not_nan() {
        let r = ClassificationReport::from_labels(&[false, false, false], &[false, false, false]);
        assert_eq!(r.precision, 0.0);
        assert_eq!(r.recall, 0.0);
        assert_eq!(r.f1, 0.0);
        assert_eq!(r.accuracy, 1.0);
    }

    #[test]
    fn empty_stream_is_all_zero() {
        let r = ClassificationReport::from_labels(&[], &[]);
        assert_eq!(r, ClassificationReport::default());
        assert_eq!(r.total(), 0);
    }

    #[test]
    fn never_predicting_positive() {
        let r = ClassificationReport::from_labels(&[true, true], &[false, false]);
        assert_eq!(r.precision, 0.0);
        assert_eq!(r.recall, 0.0);
        assert_eq!(r.accuracy, 0.0);
        assert!(!r.f1.is_nan());
    }
}
