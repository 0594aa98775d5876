//! Broker port - メッセージキューの抽象化
//!
//! AMQP 風のセマンティクスを想定しています。
//! - `get` / `consume` は auto-ack しない（必ず `ack` / `nack` で応答する）
//! - `nack(requeue = false)` は queue の dead-letter binding に従って DLQ へ送られる

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{BrokerError, Delivery, DeliveryTag, Message};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish to a declared queue. Honors `Message::delay_ms`.
    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError>;

    /// Non-blocking fetch (basic_get).
    async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Wait up to `wait` for a delivery.
    async fn consume(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// `requeue = false` dead-letters the message.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;
}
