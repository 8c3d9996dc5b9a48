//! Running maxima of the evaluation metrics.

/// Best R², best MCC and best `R² + MCC` seen so far, each with the other
/// metric's value at the step it was reached.
///
/// Every field starts at `0.0`. The value is never mutated in place:
/// [`RunningBest::update`] returns the successor.
///
/// # Example
///
/// ```
/// use ssa_metrics::RunningBest;
///
/// let best = RunningBest::default()
///     .update(0.4, 0.9)
///     .update(0.6, 0.5);
/// assert_eq!(best.best_r2, 0.6);
/// assert_eq!(best.mcc_at_best_r2, 0.5);
/// assert_eq!(best.best_mcc, 0.9);
/// assert_eq!(best.r2_at_best_mcc, 0.4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RunningBest {
    pub best_r2: f64,
    pub mcc_at_best_r2: f64,
    pub best_mcc: f64,
    pub r2_at_best_mcc: f64,
    pub best_sum: f64,
    pub best_sum_mcc: f64,
    pub best_sum_r2: f64,
}

impl RunningBest {
    /// Folds one evaluation into the running maxima.
    ///
    /// Comparisons use `>=`, so a tie replaces the paired value with the
    /// latest observation.
    #[must_use]
    pub fn update(self, r2: f64, mcc: f64) -> Self {
        let mut next = self;
        if r2 >= self.best_r2 {
            next.best_r2 = r2;
            next.mcc_at_best_r2 = mcc;
        }
        if mcc >= self.best_mcc {
            next.best_mcc = mcc;
            next.r2_at_best_mcc = r2;
        }
        if r2 + mcc >= self.best_sum {
            next.best_sum = r2 + mcc;
            next.best_sum_mcc = mcc;
            next.best_sum_r2 = r2;
        }
        next
    }

    /// The six values reported after every evaluation, in emission order.
    pub fn reported(&self) -> [(&'static str, f64); 6] {
        [
            ("best_r2", self.best_r2),
            ("mcc_at_best_r2", self.mcc_at_best_r2),
            ("best_mcc", self.best_mcc),
            ("r2_at_best_mcc", self.r2_at_best_mcc),
            ("best_sum_mcc", self.best_sum_mcc),
            ("best_sum_r2", self.best_sum_r2),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let best = RunningBest::default();
        assert!(best.reported().iter().all(|(_, v)| *v == 0.0));
        assert_eq!(best.best_sum, 0.0);
    }

    #[test]
    fn ties_take_latest_pairing() {
        let best = RunningBest::default().update(0.5, 0.2).update(0.5, 0.3);
        assert_eq!(best.mcc_at_best_r2, 0.3);

        let best = RunningBest::default().update(0.1, 0.7).update(0.4, 0.7);
        assert_eq!(best.r2_at_best_mcc, 0.4);
    }

    #[test]
    fn update_does_not_touch_input() {
        let before = RunningBest::default().update(0.3, 0.3);
        let after = before.update(0.9, 0.9);
        assert_eq!(before.best_r2, 0.3);
        assert_eq!(after.best_r2, 0.9);
    }

    #[test]
    fn negative_scores_never_replace_initial_zero() {
        let best = RunningBest::default().update(-0.2, -0.1);
        assert_eq!(best, RunningBest::default());
    }
}
