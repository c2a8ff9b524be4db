pub mod cancellation;
pub mod completion;
pub mod handoff;

pub use cancellation::ReadyPaymentCanceller;
pub use completion::{CompletionSync, SyncReport};
pub use handoff::{HandoffReport, PaymentToSubmitter};
