// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queues, their bindings and the consumer settings a subscription uses.
//! A work queue can carry a `-dlq` companion for rejected messages and a
//! `-retry` companion that parks messages for the retry interval before
//! dead-lettering them back.

use crate::transport::HeaderValue;
use std::collections::BTreeMap;

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) arguments: BTreeMap<String, HeaderValue>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Message TTL in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Extra `x-` arguments passed verbatim on declaration.
    pub fn arguments(mut self, arguments: BTreeMap<String, HeaderValue>) -> Self {
        self.arguments.extend(arguments);
        self
    }

    /// Adds a `{name}-dlq` queue receiving rejected messages.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a `{name}-retry` queue holding messages for `ttl` milliseconds
    /// before sending them back to this queue.
    pub fn with_retry(mut self, ttl: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retry_ttl = Some(ttl);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the dead-letter companion, when one is declared.
    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    /// Name of the retry companion, when one is declared.
    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}

/// How a subscription reads from its queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub(crate) tag: String,
    pub(crate) prefetch: u16,
    pub(crate) auto_ack: bool,
}

impl ConsumerSettings {
    pub fn new(tag: &str, prefetch: u16) -> Self {
        ConsumerSettings {
            tag: tag.to_owned(),
            prefetch,
            auto_ack: false,
        }
    }

    /// Lets the broker consider messages settled on delivery.
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn companion_queues_derive_from_the_work_queue() {
        let def = QueueDefinition::new("orders").with_dlq().with_retry(2000);

        assert_eq!(def.dlq_name(), Some("orders-dlq"));
        assert_eq!(def.retry_name(), Some("orders-retry"));
        assert_eq!(def.retry_ttl, Some(2000));
    }

    #[test]
    fn binding_builder_sets_all_fields() {
        let binding = QueueBinding::new("orders")
            .exchange("shop")
            .routing_key("shop.place_order");

        assert_eq!(binding.queue_name(), "orders");
        assert_eq!(binding.exchange_name(), "shop");
        assert_eq!(binding.key(), "shop.place_order");
    }
}
