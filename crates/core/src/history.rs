//! Boundary types exchanged with the dataset and reporting collaborators.
//!
//! The dataset indexer yields [`VolumeRecord`]s; the training harness fills
//! a [`TrainingHistory`] that the reporting tool consumes. Neither side's
//! logic lives in this crate.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One dataset item: a volume path plus its multi-label target vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub image: PathBuf,
    /// One entry per pathology, 0.0 or 1.0.
    pub label: Vec<f32>,
    pub volume_name: String,
}

/// Per-epoch scalars produced by the external training loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub val_loss: Vec<f64>,
    /// Named metrics per epoch (AUROC, F1, ...), keyed for stable output.
    pub metrics: Vec<BTreeMap<String, f64>>,
    /// Index into the epoch vectors of the checkpointed best epoch.
    pub best_epoch: usize,
}

impl TrainingHistory {
    pub fn record_epoch(
        &mut self,
        train_loss: f64,
        val_loss: f64,
        metrics: BTreeMap<String, f64>,
    ) {
        self.train_loss.push(train_loss);
        self.val_loss.push(val_loss);
        self.metrics.push(metrics);
        if let Some(best) = self
            .val_loss
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
        {
            self.best_epoch = best.0;
        }
    }

    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }

    pub fn best_val_loss(&self) -> Option<f64> {
        self.val_loss.get(self.best_epoch).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_epoch_tracks_lowest_val_loss() {
        let mut history = TrainingHistory::default();
        history.record_epoch(1.0, 0.9, BTreeMap::new());
        history.record_epoch(0.8, 0.7, BTreeMap::new());
        history.record_epoch(0.6, 0.75, BTreeMap::new());
        assert_eq!(history.epochs(), 3);
        assert_eq!(history.best_epoch, 1);
        assert_eq!(history.best_val_loss(), Some(0.7));
    }

    #[test]
    fn roundtrips_through_json() {
        let mut history = TrainingHistory::default();
        let mut metrics = BTreeMap::new();
        metrics.insert("auroc".to_string(), 0.81);
        history.record_epoch(0.5, 0.4, metrics);

        let json = serde_json::to_string(&history).unwrap();
        let back: TrainingHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.val_loss, vec![0.4]);
        assert_eq!(back.metrics[0]["auroc"], 0.81);
    }
}
