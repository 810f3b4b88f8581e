//! Step execution: the single-step lifecycle and history rollback.

pub mod rollback;
pub mod runner;

pub use rollback::rollback;
pub use runner::{StepOptions, StepOutcome, StepRunner};
