//! Fixed-shape supervised examples cut out of variable-length trajectories.
//!
//! A window anchored at global position `i` covers the states `[i-p, i]` and
//! the actions `[i-p, i+f]`, every action zero-padded to the state width. The
//! label of every window is the outcome of the trajectory it was cut from.

use anyhow::{Result, bail, ensure};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    Train,
    /// Past and future horizons merge into one past horizon; no future steps.
    Inference,
}

impl WindowMode {
    /// `(past, future)` actually used for a configured pair of horizons.
    pub fn horizons(self, num_past: usize, num_future: usize) -> (usize, usize) {
        match self {
            WindowMode::Train => (num_past, num_future),
            WindowMode::Inference => (num_past + num_future, 0),
        }
    }
}

/// Location of one window: owning trajectory and anchor position in the
/// flattened step sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowIndex {
    pub trajectory: usize,
    pub position: usize,
}

/// Enumerates every valid window anchor.
///
/// Trajectory `t` of length `L` contributes the positions `past..L-future`,
/// offset by the summed length of the trajectories before it. The output is
/// trajectory-major, then position-ascending; [`TrajectoryWindowDataset::trajectory_windows`]
/// depends on that order.
pub fn window_indices(lengths: &[usize], past: usize, future: usize) -> Vec<WindowIndex> {
    let mut indices = Vec::new();
    let mut offset = 0;
    for (trajectory, &len) in lengths.iter().enumerate() {
        for i in past..len.saturating_sub(future) {
            indices.push(WindowIndex {
                trajectory,
                position: offset + i,
            });
        }
        offset += len;
    }
    indices
}

/// States and actions of a single episode plus its outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub states: Vec<Vec<f32>>,
    pub actions: Vec<Vec<f32>>,
    pub success: bool,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Flattened storage for many trajectories, filled episode by episode.
#[derive(Debug, Clone, Default)]
pub struct TrajectorySet {
    states: Vec<Vec<f32>>,
    actions: Vec<Vec<f32>>,
    labels: Vec<bool>,
    lengths: Vec<usize>,
}

impl TrajectorySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, trajectory: Trajectory) {
        debug_assert_eq!(trajectory.states.len(), trajectory.actions.len());
        self.lengths.push(trajectory.states.len());
        self.labels.push(trajectory.success);
        self.states.extend(trajectory.states);
        self.actions.extend(trajectory.actions);
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn into_dataset(
        self,
        num_past: usize,
        num_future: usize,
        mode: WindowMode,
    ) -> Result<TrajectoryWindowDataset> {
        TrajectoryWindowDataset::new(
            self.states,
            self.actions,
            self.labels,
            self.lengths,
            num_past,
            num_future,
            mode,
        )
    }
}

/// One materialised window, laid out `[state_dim, state_len + action_len]`
/// row-major: for every feature, the state slice over time followed by the
/// padded action slice over time.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub values: Vec<f32>,
    pub state_dim: usize,
    pub state_len: usize,
    pub action_len: usize,
    pub label: f32,
}

impl Window {
    pub fn time_len(&self) -> usize {
        self.state_len + self.action_len
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.values,
            (self.state_dim, self.time_len()),
            device,
        )?)
    }
}

/// Random-access windows over flattened multi-trajectory data.
///
/// Precondition: `trajectory_lengths` sums to the number of state rows and of
/// action rows. This is the caller's contract and is only debug-checked.
#[derive(Debug, Clone)]
pub struct TrajectoryWindowDataset {
    states: Vec<Vec<f32>>,
    actions: Vec<Vec<f32>>,
    labels: Vec<bool>,
    num_past: usize,
    num_future: usize,
    mode: WindowMode,
    state_dim: usize,
    indices: Vec<WindowIndex>,
}

impl TrajectoryWindowDataset {
    /// # Errors
    /// Fails when state rows differ in width or an action is wider than the
    /// state, since zero-padding cannot represent it.
    pub fn new(
        states: Vec<Vec<f32>>,
        actions: Vec<Vec<f32>>,
        labels: Vec<bool>,
        trajectory_lengths: Vec<usize>,
        num_past: usize,
        num_future: usize,
        mode: WindowMode,
    ) -> Result<Self> {
        debug_assert_eq!(trajectory_lengths.iter().sum::<usize>(), states.len());
        debug_assert_eq!(trajectory_lengths.iter().sum::<usize>(), actions.len());
        debug_assert_eq!(trajectory_lengths.len(), labels.len());

        let state_dim = states.first().map_or(0, Vec::len);
        ensure!(
            states.iter().all(|s| s.len() == state_dim),
            "all states must have width {}",
            state_dim
        );
        if let Some(wide) = actions.iter().find(|a| a.len() > state_dim) {
            bail!(
                "action of width {} does not fit in state width {}",
                wide.len(),
                state_dim
            );
        }

        let (past, future) = mode.horizons(num_past, num_future);
        let indices = window_indices(&trajectory_lengths, past, future);
        Ok(Self {
            states,
            actions,
            labels,
            num_past,
            num_future,
            mode,
            state_dim,
            indices,
        })
    }

    pub fn from_trajectories(
        trajectories: impl IntoIterator<Item = Trajectory>,
        num_past: usize,
        num_future: usize,
        mode: WindowMode,
    ) -> Result<Self> {
        let mut set = TrajectorySet::new();
        for t in trajectories {
            set.push(t);
        }
        set.into_dataset(num_past, num_future, mode)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[WindowIndex] {
        &self.indices
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn num_past(&self) -> usize {
        self.num_past
    }

    pub fn num_future(&self) -> usize {
        self.num_future
    }

    /// Logical indices of the windows cut from `trajectory`.
    pub fn trajectory_windows(&self, trajectory: usize) -> std::ops::Range<usize> {
        let start = self.indices.partition_point(|w| w.trajectory < trajectory);
        let end = self.indices.partition_point(|w| w.trajectory <= trajectory);
        start..end
    }

    pub fn window(&self, k: usize) -> Result<Window> {
        let Some(&WindowIndex {
            trajectory,
            position: i,
        }) = self.indices.get(k)
        else {
            bail!("window {k} out of range for {} windows", self.indices.len());
        };
        let (past, future) = self.mode.horizons(self.num_past, self.num_future);
        let start = i.saturating_sub(past);
        let states = &self.states[start..=i];
        let actions = &self.actions[start..=i + future];

        let state_len = states.len();
        let action_len = actions.len();
        let time_len = state_len + action_len;
        let mut values = vec![0f32; self.state_dim * time_len];
        for (t, s) in states.iter().enumerate() {
            for (d, &v) in s.iter().enumerate() {
                values[d * time_len + t] = v;
            }
        }
        for (t, a) in actions.iter().enumerate() {
            for (d, &v) in a.iter().enumerate() {
                values[d * time_len + state_len + t] = v;
            }
        }

        Ok(Window {
            values,
            state_dim: self.state_dim,
            state_len,
            action_len,
            label: if self.labels[trajectory] { 1.0 } else { 0.0 },
        })
    }

    /// `(window tensor, trajectory label)` for logical index `k`.
    pub fn get(&self, k: usize, device: &Device) -> Result<(Tensor, f32)> {
        let w = self.window(k)?;
        Ok((w.to_tensor(device)?, w.label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp_trajectory(
        len: usize,
        state_dim: usize,
        action_dim: usize,
        success: bool,
    ) -> Trajectory {
        Trajectory {
            states: (0..len)
                .map(|t| (0..state_dim).map(|d| (t * 10 + d) as f32).collect())
                .collect(),
            actions: (0..len)
                .map(|t| (0..action_dim).map(|d| -((t * 10 + d) as f32)).collect())
                .collect(),
            success,
        }
    }

    fn positions(indices: &[WindowIndex]) -> Vec<usize> {
        indices.iter().map(|w| w.position).collect()
    }

    #[test]
    fn train_mode_positions() -> Result<()> {
        let ds = TrajectoryWindowDataset::from_trajectories(
            [ramp_trajectory(20, 3, 2, true)],
            5,
            5,
            WindowMode::Train,
        )?;
        assert_eq!(ds.len(), 10);
        assert_eq!(positions(ds.indices()), (5..15).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn inference_mode_shifts_positions() -> Result<()> {
        let ds = TrajectoryWindowDataset::from_trajectories(
            [ramp_trajectory(20, 3, 2, true)],
            5,
            5,
            WindowMode::Inference,
        )?;
        assert_eq!(ds.len(), 10);
        assert_eq!(positions(ds.indices()), (10..20).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn short_trajectory_has_no_windows() {
        assert!(window_indices(&[8], 5, 5).is_empty());
        assert!(window_indices(&[3], 5, 5).is_empty());
        assert!(window_indices(&[0], 0, 0).is_empty());
    }

    #[test]
    fn window_count_formula() {
        for len in 0..30 {
            for p in 0..6 {
                for f in 0..6 {
                    let n = window_indices(&[len], p, f).len();
                    assert_eq!(n, len.saturating_sub(p + f), "L={len} p={p} f={f}");
                }
            }
        }
    }

    #[test]
    fn indices_are_trajectory_major_with_offsets() {
        let idx = window_indices(&[4, 1, 5], 1, 1);
        let pairs: Vec<(usize, usize)> = idx.iter().map(|w| (w.trajectory, w.position)).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (2, 6), (2, 7), (2, 8)]);
        assert_eq!(idx, window_indices(&[4, 1, 5], 1, 1));
    }

    #[test]
    fn window_layout_and_padding() -> Result<()> {
        let ds = TrajectoryWindowDataset::from_trajectories(
            [ramp_trajectory(10, 3, 2, false)],
            2,
            1,
            WindowMode::Train,
        )?;
        // first anchor is position 2: states [0, 2], actions [0, 3]
        let w = ds.window(0)?;
        assert_eq!((w.state_len, w.action_len), (3, 4));
        assert_eq!(w.values.len(), 3 * 7);
        assert_eq!(w.label, 0.0);
        // feature 0: states 0,10,20 then actions -0,-10,-20,-30
        assert_eq!(
            &w.values[0..7],
            &[0.0, 10.0, 20.0, -0.0, -10.0, -20.0, -30.0]
        );
        // feature 2 has no action component, so the action part is padding
        assert_eq!(&w.values[14..21], &[2.0, 12.0, 22.0, 0.0, 0.0, 0.0, 0.0]);

        let (t, label) = ds.get(0, &Device::Cpu)?;
        assert_eq!(t.dims(), &[3, 7]);
        assert_eq!(label, 0.0);
        Ok(())
    }

    #[test]
    fn every_window_has_the_same_shape() -> Result<()> {
        let (p, f, sd) = (3, 2, 4);
        let ds = TrajectoryWindowDataset::from_trajectories(
            [
                ramp_trajectory(12, sd, 3, true),
                ramp_trajectory(9, sd, 3, false),
            ],
            p,
            f,
            WindowMode::Train,
        )?;
        for k in 0..ds.len() {
            let w = ds.window(k)?;
            assert_eq!(w.state_len, p + 1);
            assert_eq!(w.action_len, p + f + 1);
            assert_eq!(w.values.len(), (p + 1) * sd + (p + f + 1) * sd);
        }
        Ok(())
    }

    #[test]
    fn windows_never_cross_trajectories() -> Result<()> {
        let ds = TrajectoryWindowDataset::from_trajectories(
            [ramp_trajectory(6, 1, 1, true), ramp_trajectory(6, 1, 1, false)],
            2,
            1,
            WindowMode::Train,
        )?;
        let range = ds.trajectory_windows(1);
        assert_eq!(range, 3..6);
        let first = ds.window(range.start)?;
        // trajectory 1 starts at flattened row 6, whose state value is 0 again
        assert_eq!(first.values[0], 0.0);
        assert_eq!(first.label, 0.0);
        assert_eq!(ds.window(0)?.label, 1.0);
        Ok(())
    }

    #[test]
    fn trajectory_windows_for_empty_trajectory() -> Result<()> {
        let ds = TrajectoryWindowDataset::from_trajectories(
            [
                ramp_trajectory(6, 1, 1, true),
                ramp_trajectory(2, 1, 1, true),
                ramp_trajectory(6, 1, 1, true),
            ],
            2,
            1,
            WindowMode::Train,
        )?;
        assert!(ds.trajectory_windows(1).is_empty());
        assert_eq!(ds.trajectory_windows(2).len(), 3);
        Ok(())
    }

    #[test]
    fn wide_action_is_rejected() {
        let t = ramp_trajectory(8, 2, 3, true);
        let res = TrajectoryWindowDataset::from_trajectories([t], 1, 1, WindowMode::Train);
        assert!(res.is_err());
    }

    #[test]
    fn out_of_range_window_errors() -> Result<()> {
        let ds = TrajectoryWindowDataset::from_trajectories(
            [ramp_trajectory(5, 2, 1, true)],
            1,
            1,
            WindowMode::Train,
        )?;
        assert!(ds.window(ds.len()).is_err());
        Ok(())
    }
}
