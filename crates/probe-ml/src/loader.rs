use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom};

use crate::{epoch::BatchSource, window::TrajectoryWindowDataset};

/// A stacked batch of windows: inputs `[B, state_dim, time]`, labels `[B]`.
#[derive(Debug, Clone)]
pub struct WindowBatch {
    pub inputs: Tensor,
    pub labels: Tensor,
}

impl WindowBatch {
    pub fn batch_size(&self) -> usize {
        self.labels.dims1().unwrap_or(0)
    }
}

/// Serves [`WindowBatch`]es from a dataset, optionally reshuffled every pass.
/// The last batch of a pass may be short.
pub struct WindowLoader<'a> {
    dataset: &'a TrajectoryWindowDataset,
    batch_size: usize,
    device: Device,
    rng: Option<StdRng>,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> WindowLoader<'a> {
    pub fn new(dataset: &'a TrajectoryWindowDataset, batch_size: usize, device: &Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            device: device.clone(),
            rng: None,
            order: (0..dataset.len()).collect(),
            cursor: 0,
        }
    }

    /// Shuffle the window order at the start of every pass.
    pub fn shuffled(mut self, rng: StdRng) -> Self {
        self.rng = Some(rng);
        self
    }

    pub fn dataset(&self) -> &TrajectoryWindowDataset {
        self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Stacks the windows at `indices` into one batch.
    pub fn collate(&self, indices: &[usize]) -> Result<WindowBatch> {
        ensure!(!indices.is_empty(), "cannot collate an empty batch");
        let mut values = Vec::new();
        let mut labels = Vec::with_capacity(indices.len());
        let mut shape = None;
        for &k in indices {
            let w = self.dataset.window(k)?;
            let dims = (w.state_dim, w.time_len());
            match shape {
                None => shape = Some(dims),
                Some(s) => ensure!(
                    s == dims,
                    "window {} has shape {:?}, batch has {:?}",
                    k,
                    dims,
                    s
                ),
            }
            values.extend(w.values);
            labels.push(w.label);
        }
        let (state_dim, time_len) = shape.unwrap_or((0, 0));
        let n = labels.len();
        Ok(WindowBatch {
            inputs: Tensor::from_vec(values, (n, state_dim, time_len), &self.device)?,
            labels: Tensor::from_vec(labels, n, &self.device)?,
        })
    }
}

impl BatchSource for WindowLoader<'_> {
    type Batch = WindowBatch;

    fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    fn restart(&mut self) {
        if let Some(rng) = self.rng.as_mut() {
            self.order.shuffle(rng);
        }
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<WindowBatch>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let batch = self.collate(&self.order[self.cursor..end])?;
        self.cursor = end;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::window::{Trajectory, WindowMode};

    fn dataset(len: usize) -> Result<TrajectoryWindowDataset> {
        let t = Trajectory {
            states: (0..len).map(|i| vec![i as f32, 0.5]).collect(),
            actions: (0..len).map(|i| vec![-(i as f32)]).collect(),
            success: true,
        };
        TrajectoryWindowDataset::from_trajectories([t], 1, 1, WindowMode::Train)
    }

    #[test]
    fn batches_cover_the_dataset_once_per_pass() -> Result<()> {
        let ds = dataset(12)?; // 10 windows
        let mut loader = WindowLoader::new(&ds, 4, &Device::Cpu);
        assert_eq!(loader.num_batches(), 3);
        loader.restart();
        let mut sizes = Vec::new();
        while let Some(b) = loader.next_batch()? {
            assert_eq!(b.inputs.dims()[1..], [2, 5]);
            sizes.push(b.batch_size());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        Ok(())
    }

    #[test]
    fn shuffled_pass_is_a_permutation() -> Result<()> {
        let ds = dataset(30)?;
        let mut loader = WindowLoader::new(&ds, 8, &Device::Cpu)
            .shuffled(StdRng::seed_from_u64(7));
        loader.restart();
        let mut anchors = Vec::new();
        while let Some(b) = loader.next_batch()? {
            // column 1 of feature 0 is the anchor state's first value
            let x = b.inputs.to_vec3::<f32>()?;
            anchors.extend(x.iter().map(|w| w[0][1] as usize));
        }
        let mut sorted = anchors.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..29).collect::<Vec<_>>());
        assert_ne!(anchors, sorted);
        Ok(())
    }
}
