pub mod tracker;

pub use tracker::{LedgerReading, LedgerTracker, TrackerStatus};
