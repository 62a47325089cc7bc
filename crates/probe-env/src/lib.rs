//! Environment and policy contracts consumed by the rollout orchestrator.
//!
//! This crate provides:
//! - `observation`: ordered named observation vectors
//! - `env`: the [`Environment`] / [`RolloutPolicy`] traits and their error type
//! - `layout`: per-task state compression ([`StateLayout`])
//! - `reach`: a small 2-D reaching task with a scripted expert, used by the
//!   playground binaries and the integration tests

pub mod env;
pub mod layout;
pub mod observation;
pub mod reach;

pub use env::*;
pub use layout::*;
pub use observation::*;
pub use reach::*;
