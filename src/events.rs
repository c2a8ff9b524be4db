use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::models::{PaymentStatus, SubmissionTransaction, TransactionStatus};

pub const PAYMENT_COMPLETED_TOPIC: &str = "payment_completed";
pub const PAYMENT_COMPLETED_SUCCESS: &str = "payment_completed_success";
pub const PAYMENT_COMPLETED_ERROR: &str = "payment_completed_error";

pub const PAYMENT_READY_TOPIC: &str = "payment_ready";
pub const PAYMENT_READY: &str = "payment_ready";

/// Event exchanged with the disbursement platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub key: String,
    pub tenant_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentCompletedData {
    pub transaction_id: Uuid,
    pub payment_id: Uuid,
    pub payment_status: PaymentStatus,
    pub payment_status_message: String,
    pub payment_completed_at: DateTime<Utc>,
    pub stellar_transaction_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReadyData {
    pub payment_ids: Vec<Uuid>,
}

impl Message {
    /// Completion event for a row in a terminal state.
    pub fn payment_completed(tx: &SubmissionTransaction) -> AppResult<Self> {
        let (event_type, payment_status) = match tx.status {
            TransactionStatus::Success => (PAYMENT_COMPLETED_SUCCESS, PaymentStatus::Success),
            TransactionStatus::Error => (PAYMENT_COMPLETED_ERROR, PaymentStatus::Failed),
            other => {
                return Err(AppError::InvalidInput(format!(
                    "transaction {} is {}, not terminal",
                    tx.id, other
                )))
            }
        };

        let data = PaymentCompletedData {
            transaction_id: tx.id,
            payment_id: tx.external_id,
            payment_status,
            payment_status_message: tx.status_message.clone().unwrap_or_default(),
            payment_completed_at: tx.completed_at.unwrap_or(tx.updated_at),
            stellar_transaction_id: tx.network_tx_hash.clone().unwrap_or_default(),
        };

        Ok(Self {
            topic: PAYMENT_COMPLETED_TOPIC.to_string(),
            key: tx.external_id.to_string(),
            tenant_id: tx.tenant_id.clone(),
            event_type: event_type.to_string(),
            data: serde_json::to_value(data)?,
        })
    }

    pub fn payment_ready(tenant_id: &str, payment_ids: Vec<Uuid>) -> AppResult<Self> {
        let key = payment_ids
            .first()
            .map(ToString::to_string)
            .unwrap_or_default();
        Ok(Self {
            topic: PAYMENT_READY_TOPIC.to_string(),
            key,
            tenant_id: tenant_id.to_string(),
            event_type: PAYMENT_READY.to_string(),
            data: serde_json::to_value(PaymentReadyData { payment_ids })?,
        })
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| AppError::InvalidInput(format!("invalid {} event data: {}", self.event_type, e)))
    }
}

#[async_trait]
pub trait EventProducer: Send + Sync {
    async fn write(&self, messages: Vec<Message>) -> AppResult<()>;
}

/// Feeds events to an in-process consumer.
pub struct ChannelEventProducer {
    sender: mpsc::Sender<Message>,
}

impl ChannelEventProducer {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventProducer for ChannelEventProducer {
    async fn write(&self, messages: Vec<Message>) -> AppResult<()> {
        for message in messages {
            self.sender
                .send(message)
                .await
                .map_err(|e| AppError::Internal(format!("event channel closed: {}", e)))?;
        }
        Ok(())
    }
}

/// Logs events instead of delivering them.
pub struct LogEventProducer;

#[async_trait]
impl EventProducer for LogEventProducer {
    async fn write(&self, messages: Vec<Message>) -> AppResult<()> {
        for message in messages {
            match serde_json::to_string(&message) {
                Ok(json) => info!(topic = %message.topic, key = %message.key, "📨 event: {}", json),
                Err(e) => warn!(topic = %message.topic, "unserializable event: {}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{NewSubmissionTransaction, Payment};

    fn terminal_row(status: TransactionStatus) -> SubmissionTransaction {
        let payment = Payment::draft("tenant-a", "10.0000000", "XLM", None, "GDEST");
        let mut tx = NewSubmissionTransaction::for_payment(&payment, "GDIST").into_transaction();
        tx.transition(TransactionStatus::Processing, None, None).unwrap();
        tx.transition(status, Some("abc123".into()), Some("done".into())).unwrap();
        tx
    }

    #[test]
    fn test_payment_completed_success() {
        let tx = terminal_row(TransactionStatus::Success);
        let message = Message::payment_completed(&tx).unwrap();
        assert_eq!(message.topic, PAYMENT_COMPLETED_TOPIC);
        assert_eq!(message.event_type, PAYMENT_COMPLETED_SUCCESS);
        assert_eq!(message.key, tx.external_id.to_string());
        assert_eq!(message.tenant_id, "tenant-a");

        let data: PaymentCompletedData = message.data_as().unwrap();
        assert_eq!(data.payment_status, PaymentStatus::Success);
        assert_eq!(data.stellar_transaction_id, "abc123");
        assert_eq!(data.transaction_id, tx.id);
    }

    #[test]
    fn test_payment_completed_rejects_open_rows() {
        let payment = Payment::draft("t", "1", "XLM", None, "GDEST");
        let tx = NewSubmissionTransaction::for_payment(&payment, "GDIST").into_transaction();
        assert!(Message::payment_completed(&tx).is_err());
    }

    #[test]
    fn test_wire_format_uses_type_field() {
        let id = Uuid::new_v4();
        let message = Message::payment_ready("t", vec![id]).unwrap();
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], PAYMENT_READY);
        assert_eq!(json["data"]["payment_ids"][0], id.to_string());
    }

    #[tokio::test]
    async fn test_channel_producer_delivers_in_order() {
        let (producer, mut receiver) = ChannelEventProducer::new(4);
        let first = Message::payment_ready("t", vec![Uuid::new_v4()]).unwrap();
        let second = Message::payment_completed(&terminal_row(TransactionStatus::Error)).unwrap();
        producer.write(vec![first.clone(), second.clone()]).await.unwrap();

        assert_eq!(receiver.recv().await.unwrap(), first);
        assert_eq!(receiver.recv().await.unwrap(), second);
    }
}
