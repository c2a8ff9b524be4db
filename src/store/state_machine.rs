use chrono::Utc;

use crate::error::StateError;
use crate::store::models::{Payment, PaymentStatus, SubmissionTransaction, TransactionStatus};

use PaymentStatus::*;

/// Directed graph of allowed payment transitions.
const PAYMENT_TRANSITIONS: &[(PaymentStatus, PaymentStatus)] = &[
    (Draft, Ready),
    (Ready, Pending),
    (Pending, Success),
    (Pending, Failed),
    (Ready, Paused),
    (Paused, Ready),
    (Failed, Ready),
    (Ready, Canceled),
];

pub fn can_transition(from: PaymentStatus, to: PaymentStatus) -> bool {
    PAYMENT_TRANSITIONS.contains(&(from, to))
}

pub fn validate_transition(from: PaymentStatus, to: PaymentStatus) -> Result<(), StateError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(StateError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

impl Payment {
    /// Moves to `to` and appends one history entry. On error nothing changes.
    pub fn transition(&mut self, to: PaymentStatus, message: Option<String>) -> Result<(), StateError> {
        validate_transition(self.status, to)?;
        self.status = to;
        self.status_history.append(to, message);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Failed -> Ready, recording who asked and which network transaction failed.
    /// The previous network transaction id is cleared so the next attempt gets a fresh one.
    pub fn retry(&mut self, user_email: &str) -> Result<(), StateError> {
        validate_transition(self.status, Ready)?;
        let message = format!(
            "User {} has requested to retry the payment - Previous Stellar Transaction ID: {}",
            user_email,
            self.network_tx_id.as_deref().unwrap_or("")
        );
        self.transition(Ready, Some(message))?;
        self.network_tx_id = None;
        Ok(())
    }
}

const TRANSACTION_TRANSITIONS: &[(TransactionStatus, TransactionStatus)] = &[
    (TransactionStatus::Pending, TransactionStatus::Processing),
    (TransactionStatus::Processing, TransactionStatus::Pending),
    (TransactionStatus::Processing, TransactionStatus::Success),
    (TransactionStatus::Processing, TransactionStatus::Error),
    (TransactionStatus::Pending, TransactionStatus::Error),
];

impl SubmissionTransaction {
    /// Applies a status change to the row.
    ///
    /// Repeating the current terminal status is accepted and leaves the row
    /// untouched; the return value tells whether anything changed.
    pub fn transition(
        &mut self,
        to: TransactionStatus,
        hash: Option<String>,
        message: Option<String>,
    ) -> Result<bool, StateError> {
        if self.status == to && to.is_terminal() {
            return Ok(false);
        }
        if !TRANSACTION_TRANSITIONS.contains(&(self.status, to)) {
            return Err(StateError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        self.status = to;
        self.status_history.append(to, message.clone());
        if message.is_some() {
            self.status_message = message;
        }
        if hash.is_some() {
            self.network_tx_hash = hash;
        }
        match to {
            TransactionStatus::Processing => {
                self.locked_at = Some(now);
                self.attempts += 1;
            }
            TransactionStatus::Pending => {
                self.locked_at = None;
                self.locked_until = None;
            }
            TransactionStatus::Success | TransactionStatus::Error => {
                self.locked_at = None;
                self.locked_until = None;
                self.retry_after = None;
                self.completed_at = Some(now);
            }
        }
        self.updated_at = now;
        Ok(true)
    }
}
