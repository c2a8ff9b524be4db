pub mod engine;
pub mod limiter;

pub use engine::{EngineSettings, Outcome, SubmitterEngine};
pub use limiter::ProcessingLimiter;
