// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The bus core talks to the broker only through the `Transport` trait: it
//! publishes `OutboundMessage`s and registers `DeliveryHandler`s that answer
//! each delivery with an `Acknowledgement`. `RabbitMQTransport` is the lapin
//! implementation; tests plug in their own.

use async_trait::async_trait;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crate::{
    context::DomainContext,
    errors::{AmqpError, BusError},
    naming::ResolvedTopology,
};

#[cfg(test)]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Typed header value, converted to the matching AMQP field type on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Bool(bool),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
    Timestamp(u64),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::LongLongInt(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

/// Transport-level properties of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub headers: BTreeMap<String, HeaderValue>,
    pub content_type: String,
    pub expiration: Option<Duration>,
    pub priority: Option<u8>,
    pub persistent: bool,
}

impl Default for MessageProperties {
    fn default() -> Self {
        MessageProperties {
            headers: BTreeMap::new(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            expiration: None,
            priority: None,
            persistent: false,
        }
    }
}

impl MessageProperties {
    pub fn header(&mut self, key: &str, value: impl Into<HeaderValue>) -> &mut Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topology: ResolvedTopology,
    pub payload: Vec<u8>,
    pub context: DomainContext,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn exchange(&self) -> &str {
        self.topology.exchange.name()
    }

    pub fn routing_key(&self) -> &str {
        &self.topology.routing_key
    }

    pub fn message_type(&self) -> &str {
        &self.topology.message_type
    }
}

/// A decoded delivery, with its context already stamped by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message_type: String,
    pub payload: Vec<u8>,
    pub context: DomainContext,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

/// The consumer's verdict on one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Fully consumed, remove from the queue
    Ack,
    /// Permanently dropped, dead-lettered by the transport
    Reject,
    /// Park the message and redeliver it after the delay
    RetryAfter(Duration),
}

/// Callback registered with the transport for one subscription.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Returns the acknowledgement decision for the delivery.
    ///
    /// `Err(BusError::Cancelled)` leaves the decision to the transport's own
    /// shutdown semantics. Any other error is an unrecovered failure the
    /// subscription asked to propagate.
    async fn handle(&self, message: InboundMessage) -> Result<Acknowledgement, BusError>;
}

/// Broker client consumed by the publisher and the subscriber.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message to the exchange named by its topology.
    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError>;

    /// Declares the topology and starts delivering its queue to `handler`.
    async fn subscribe(
        &self,
        topology: ResolvedTopology,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError>;
}
