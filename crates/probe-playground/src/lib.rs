//! Runnable pieces shared by the playground binaries: expert demonstrations,
//! a behaviour-cloning policy, and logging setup.

pub mod bc_policy;
pub mod demos;
pub mod logging;
