//! Registered observations and best-so-far tracking.

use serde::{Deserialize, Serialize};

use tb_types::{Metrics, OptimizationDirection, Status, Trial, TunableGroups, TunableSnapshot};

/// One completed evaluation fed back to an optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub tunables: TunableSnapshot,
    pub status: Status,
    /// Present for succeeded trials only.
    pub result: Option<Metrics>,
}

impl Observation {
    pub fn new(tunables: TunableSnapshot, status: Status, result: Option<Metrics>) -> Self {
        Self {
            tunables,
            status,
            result,
        }
    }

    pub fn succeeded(tunables: TunableSnapshot, result: Metrics) -> Self {
        Self::new(tunables, Status::Succeeded, Some(result))
    }

    pub fn failed(tunables: TunableSnapshot) -> Self {
        Self::new(tunables, Status::Failed, None)
    }
}

impl From<&Trial> for Observation {
    fn from(trial: &Trial) -> Self {
        let result = trial.status.is_succeeded().then(|| trial.result.clone());
        Self::new(trial.tunables.clone(), trial.status, result)
    }
}

/// Best observation seen so far for one target and direction.
#[derive(Debug, Clone)]
pub struct BestObservation {
    direction: OptimizationDirection,
    best: Option<(TunableGroups, f64)>,
}

impl BestObservation {
    pub fn new(direction: OptimizationDirection) -> Self {
        Self { direction, best: None }
    }

    /// Keep `tunables` if `score` improves on the incumbent. Ties keep the
    /// earlier observation.
    pub fn offer(&mut self, tunables: &TunableGroups, score: f64) -> bool {
        if score.is_nan() {
            return false;
        }
        let improves = match &self.best {
            None => true,
            Some((_, incumbent)) => self.direction.is_better(score, *incumbent),
        };
        if improves {
            self.best = Some((tunables.clone(), score));
        }
        improves
    }

    pub fn get(&self) -> Option<(TunableGroups, f64)> {
        self.best.clone()
    }

    pub fn score(&self) -> Option<f64> {
        self.best.as_ref().map(|(_, score)| *score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tunables(workers: i64) -> TunableGroups {
        let mut groups = TunableGroups::from_json(&json!({
            "app": {"cost": 1, "params": {"workers": {"type": "int", "default": 4, "range": [1, 32]}}}
        }))
        .unwrap();
        groups.set("workers", workers).unwrap();
        groups
    }

    #[test]
    fn tracks_minimum() {
        let mut best = BestObservation::new(OptimizationDirection::Min);
        assert!(best.get().is_none());
        assert!(best.offer(&tunables(1), 10.0));
        assert!(best.offer(&tunables(2), 5.0));
        assert!(!best.offer(&tunables(3), 7.0));
        assert!(!best.offer(&tunables(4), 5.0));
        assert!(!best.offer(&tunables(5), f64::NAN));

        let (config, score) = best.get().unwrap();
        assert_eq!(score, 5.0);
        assert_eq!(config.get("workers").unwrap().as_i64(), Some(2));
    }

    #[test]
    fn tracks_maximum() {
        let mut best = BestObservation::new(OptimizationDirection::Max);
        best.offer(&tunables(1), 10.0);
        best.offer(&tunables(2), 50.0);
        best.offer(&tunables(3), 20.0);
        assert_eq!(best.score(), Some(50.0));
    }

    #[test]
    fn observation_from_trial_drops_failed_results() {
        let mut trial = Trial::new("exp", 1, 1, tunables(8).snapshot(), 0);
        trial.mark_completed(
            Status::Failed,
            Metrics::from([("score".to_string(), 1.0)]),
            Some("boom".into()),
        );
        let observation = Observation::from(&trial);
        assert_eq!(observation.status, Status::Failed);
        assert!(observation.result.is_none());
    }
}
