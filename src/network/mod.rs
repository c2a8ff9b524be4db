pub mod envelope;
pub mod errors;
pub mod horizon;
#[cfg(test)]
pub mod mock;

pub use errors::{Rejection, RejectionClass};
pub use horizon::{HorizonClient, NetworkClient, OnChainTransaction, SubmitFailure, SubmitResult};
