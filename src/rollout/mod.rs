//! Group rollouts: sampling completions and recording each step.

pub mod sampler;
pub mod types;

pub use sampler::{sample_group, TemperatureSchedule};
pub use types::{Completion, StepRecord};
