// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Per-call and per-subscription topology overrides.

use crate::{exchange::ExchangeKind, transport::HeaderValue};
use std::collections::BTreeMap;

/// Overrides for the exchange side of a message's topology.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeConfiguration {
    pub name: Option<String>,
    pub kind: Option<ExchangeKind>,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    /// Routing key used both to publish and to bind
    pub routing_key: Option<String>,
    /// Queue the exchange binding targets
    pub queue_name: Option<String>,
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl ExchangeConfiguration {
    pub fn named(name: &str) -> Self {
        ExchangeConfiguration {
            name: Some(name.to_owned()),
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = Some(auto_delete);
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn queue_name(mut self, queue: &str) -> Self {
        self.queue_name = Some(queue.to_owned());
        self
    }

    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }
}

/// Overrides for the queue and consumer side of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueConfiguration {
    pub name: Option<String>,
    /// Appended to the resolved queue name as `{name}.{suffix}`
    pub suffix: Option<String>,
    pub prefetch: Option<u16>,
    pub consumer_tag: Option<String>,
    pub auto_ack: Option<bool>,
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl QueueConfiguration {
    pub fn named(name: &str) -> Self {
        QueueConfiguration {
            name: Some(name.to_owned()),
            ..Default::default()
        }
    }

    pub fn suffix(mut self, suffix: &str) -> Self {
        self.suffix = Some(suffix.to_owned());
        self
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = Some(auto_ack);
        self
    }

    pub fn argument(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }
}

/// Exchange and queue overrides supplied together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageConfiguration {
    pub exchange: Option<ExchangeConfiguration>,
    pub queue: Option<QueueConfiguration>,
}

impl MessageConfiguration {
    pub fn new() -> Self {
        MessageConfiguration::default()
    }

    pub fn exchange(mut self, exchange: ExchangeConfiguration) -> Self {
        self.exchange = Some(exchange);
        self
    }

    pub fn queue(mut self, queue: QueueConfiguration) -> Self {
        self.queue = Some(queue);
        self
    }
}
