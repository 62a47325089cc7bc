pub mod checkpointer;
pub mod classifier;
pub mod config;
pub mod dirs;
pub mod epoch;
pub mod loader;
pub mod metrics;
pub mod record;
pub mod rollout;
pub mod selector;
pub mod tensor;
pub mod window;

pub use checkpointer::*;
pub use classifier::*;
pub use config::*;
pub use dirs::*;
pub use epoch::*;
pub use loader::*;
pub use metrics::*;
pub use record::*;
pub use selector::*;
pub use window::*;

use candle_core::Device;

pub fn device() -> Device {
    if cfg!(feature = "candle-cuda") {
        Device::new_cuda(0).unwrap_or(Device::Cpu)
    } else if cfg!(feature = "candle-metal") {
        Device::new_metal(0).unwrap_or(Device::Cpu)
    } else {
        Device::Cpu
    }
}
