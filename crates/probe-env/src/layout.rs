use std::ops::Range;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Per-task index ranges that compress a flattened observation into the
/// classifier's state vector.
///
/// Each environment supplies its own layout, so new tasks never touch the
/// windowing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLayout {
    ranges: Vec<Range<usize>>,
}

impl StateLayout {
    pub fn new(ranges: Vec<Range<usize>>) -> Self {
        Self { ranges }
    }

    /// Keeps the first `dim` scalars unchanged.
    pub fn identity(dim: usize) -> Self {
        Self::new(vec![0..dim])
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Length of the compressed state.
    pub fn state_dim(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    /// Concatenates `flat[r]` for every range, in order.
    pub fn compress(&self, flat: &[f32]) -> Result<Vec<f32>> {
        let mut out = Vec::with_capacity(self.state_dim());
        for r in &self.ranges {
            ensure!(
                r.start <= r.end && r.end <= flat.len(),
                "state range {:?} out of bounds for observation of length {}",
                r,
                flat.len()
            );
            out.extend_from_slice(&flat[r.clone()]);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_concatenates_ranges() -> Result<()> {
        let layout = StateLayout::new(vec![0..2, 5..7]);
        let flat: Vec<f32> = (0..8).map(|v| v as f32).collect();
        assert_eq!(layout.compress(&flat)?, vec![0.0, 1.0, 5.0, 6.0]);
        assert_eq!(layout.state_dim(), 4);
        Ok(())
    }

    #[test]
    fn compress_rejects_out_of_bounds() {
        let layout = StateLayout::new(vec![0..10]);
        assert!(layout.compress(&[0.0; 4]).is_err());
    }
}
