use std::collections::BTreeMap;

use tracing::info;

use crate::rollout::RolloutSummary;

/// Which metric most recently triggered a save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CkptReason {
    Return,
    Success,
}

impl CkptReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CkptReason::Return => "return",
            CkptReason::Success => "success",
        }
    }
}

/// Outcome of [`should_save_from_rollout_logs`].
#[derive(Debug, Clone, PartialEq)]
pub struct SaveDecision {
    /// Proposed name with one suffix appended per triggering improvement.
    pub epoch_ckpt_name: String,
    pub should_save_ckpt: bool,
    /// Last improvement (in environment order) that enabled saving.
    pub ckpt_reason: Option<CkptReason>,
}

/// Running best-so-far metrics, keyed by environment name. Environments not
/// seen yet compare as negative infinity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BestMetrics {
    pub best_return: BTreeMap<String, f64>,
    pub best_success_rate: BTreeMap<String, f64>,
}

/// Updates `best` with this epoch's rollout results and decides whether to
/// persist a checkpoint and under which name.
///
/// Bests are updated on every strict improvement regardless of the enable
/// flags; the flags only gate saving.
pub fn should_save_from_rollout_logs(
    all_rollout_logs: &BTreeMap<String, RolloutSummary>,
    best: &mut BestMetrics,
    epoch_ckpt_name: &str,
    save_on_best_rollout_return: bool,
    save_on_best_rollout_success_rate: bool,
) -> SaveDecision {
    let mut decision = SaveDecision {
        epoch_ckpt_name: epoch_ckpt_name.to_string(),
        should_save_ckpt: false,
        ckpt_reason: None,
    };

    for (env_name, logs) in all_rollout_logs {
        let best_return = best
            .best_return
            .entry(env_name.clone())
            .or_insert(f64::NEG_INFINITY);
        if logs.ret > *best_return {
            *best_return = logs.ret;
            if save_on_best_rollout_return {
                decision
                    .epoch_ckpt_name
                    .push_str(&format!("_{}_return_{:?}", env_name, logs.ret));
                decision.should_save_ckpt = true;
                decision.ckpt_reason = Some(CkptReason::Return);
            }
        }

        let best_success = best
            .best_success_rate
            .entry(env_name.clone())
            .or_insert(f64::NEG_INFINITY);
        if logs.success_rate > *best_success {
            *best_success = logs.success_rate;
            if save_on_best_rollout_success_rate {
                decision
                    .epoch_ckpt_name
                    .push_str(&format!("_{}_success_{:?}", env_name, logs.success_rate));
                decision.should_save_ckpt = true;
                decision.ckpt_reason = Some(CkptReason::Success);
            }
        }
    }

    if decision.should_save_ckpt {
        info!(
            "checkpoint {} selected (reason: {})",
            decision.epoch_ckpt_name,
            decision.ckpt_reason.map(|r| r.as_str()).unwrap_or("none")
        );
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs(entries: &[(&str, f64, f64)]) -> BTreeMap<String, RolloutSummary> {
        entries
            .iter()
            .map(|&(name, ret, success_rate)| {
                (
                    name.to_string(),
                    RolloutSummary {
                        ret,
                        success_rate,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn first_call_always_improves() {
        let mut best = BestMetrics::default();
        let d = should_save_from_rollout_logs(
            &logs(&[("Reach", 3.0, 0.5)]),
            &mut best,
            "model_epoch_10",
            true,
            true,
        );
        assert!(d.should_save_ckpt);
        assert_eq!(
            d.epoch_ckpt_name,
            "model_epoch_10_Reach_return_3.0_Reach_success_0.5"
        );
        assert_eq!(d.ckpt_reason, Some(CkptReason::Success));
        assert_eq!(best.best_return["Reach"], 3.0);
        assert_eq!(best.best_success_rate["Reach"], 0.5);
    }

    #[test]
    fn no_improvement_no_save() {
        let mut best = BestMetrics::default();
        let reach = logs(&[("Reach", 3.0, 0.5)]);
        should_save_from_rollout_logs(&reach, &mut best, "a", true, true);
        let d = should_save_from_rollout_logs(&reach, &mut best, "b", true, true);
        assert!(!d.should_save_ckpt);
        assert_eq!(d.epoch_ckpt_name, "b");
        assert_eq!(d.ckpt_reason, None);
    }

    #[test]
    fn bests_update_even_when_saving_disabled() {
        let mut best = BestMetrics::default();
        let d = should_save_from_rollout_logs(
            &logs(&[("Reach", 7.0, 1.0)]),
            &mut best,
            "x",
            false,
            false,
        );
        assert!(!d.should_save_ckpt);
        assert_eq!(d.epoch_ckpt_name, "x");
        assert_eq!(best.best_return["Reach"], 7.0);
        assert_eq!(best.best_success_rate["Reach"], 1.0);
    }

    #[test]
    fn reason_is_last_write_in_env_order() {
        let mut best = BestMetrics::default();
        best.best_return.insert("A".into(), 0.0);
        best.best_success_rate.insert("A".into(), 0.0);
        best.best_return.insert("B".into(), 0.0);
        best.best_success_rate.insert("B".into(), 1.0);
        // A improves success, B improves return later in iteration order
        let d = should_save_from_rollout_logs(
            &logs(&[("B", 2.0, 1.0), ("A", 0.0, 0.5)]),
            &mut best,
            "e",
            true,
            true,
        );
        assert_eq!(d.epoch_ckpt_name, "e_A_success_0.5_B_return_2.0");
        assert_eq!(d.ckpt_reason, Some(CkptReason::Return));
    }

    #[test]
    fn best_return_is_monotone_over_non_decreasing_returns() {
        let mut best = BestMetrics::default();
        let mut previous = f64::NEG_INFINITY;
        for (i, ret) in [1.0, 1.0, 2.5, 2.5, 4.0, 4.0].into_iter().enumerate() {
            let d = should_save_from_rollout_logs(
                &logs(&[("Reach", ret, 0.0)]),
                &mut best,
                "m",
                true,
                false,
            );
            let tracked = best.best_return["Reach"];
            assert!(tracked >= previous);
            assert_eq!(d.should_save_ckpt, ret > previous, "call {i}");
            previous = tracked;
        }
    }
}
