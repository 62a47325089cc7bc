//! Evaluation rollouts with online success classification.
//!
//! This module provides:
//! - `episode`: one episode, its online window scores and diagnostic video
//! - `batch`: many episodes per environment, classifier retraining, statistics
//! - `plot`: rasterised panels for diagnostic frames
//! - `video`: video targets and the GIF sink

mod batch;
mod episode;
mod plot;
mod video;

pub use batch::*;
pub use episode::*;
pub use plot::DIAGNOSTIC_FRAME_SIZE;
pub use video::*;

use std::collections::BTreeMap;

use probe_env::TASK_SUCCESS_KEY;

use crate::metrics::ClassificationReport;

/// Outcome of one rollout episode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolloutResult {
    pub ret: f64,
    /// 1-based index of the last step attempted.
    pub horizon: usize,
    /// Per-criterion success, OR-ed over the episode.
    pub success: BTreeMap<String, bool>,
    pub true_labels: Vec<bool>,
    pub predicted_labels: Vec<bool>,
}

impl RolloutResult {
    pub fn task_success(&self) -> bool {
        self.success.get(TASK_SUCCESS_KEY).copied().unwrap_or(false)
    }
}

/// Episode metrics of one environment averaged over a rollout batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RolloutSummary {
    pub ret: f64,
    pub horizon: f64,
    pub success_rate: f64,
    /// `<criterion>_Success_Rate` for every criterion besides `task`.
    pub criteria: BTreeMap<String, f64>,
    /// Total episode wall time in minutes.
    pub time_episode: f64,
    pub classifier: ClassificationReport,
    pub num_episodes: usize,
}

impl RolloutSummary {
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::from([
            ("Return".to_string(), self.ret),
            ("Horizon".to_string(), self.horizon),
            ("Success_Rate".to_string(), self.success_rate),
            ("Time_Episode".to_string(), self.time_episode),
            ("Classifier Precision".to_string(), self.classifier.precision),
            ("Classifier Recall".to_string(), self.classifier.recall),
            ("Classifier F1".to_string(), self.classifier.f1),
            ("Classifier Accuracy".to_string(), self.classifier.accuracy),
        ]);
        for (k, v) in &self.criteria {
            out.insert(format!("{k}_Success_Rate"), *v);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_keys() {
        let summary = RolloutSummary {
            ret: 2.0,
            success_rate: 0.5,
            criteria: BTreeMap::from([("near_goal".to_string(), 1.0)]),
            ..Default::default()
        };
        let map = summary.to_map();
        assert_eq!(map["Return"], 2.0);
        assert_eq!(map["Success_Rate"], 0.5);
        assert_eq!(map["near_goal_Success_Rate"], 1.0);
        for key in [
            "Horizon",
            "Time_Episode",
            "Classifier Precision",
            "Classifier Recall",
            "Classifier F1",
            "Classifier Accuracy",
        ] {
            assert!(map.contains_key(key), "{key}");
        }
    }
}
