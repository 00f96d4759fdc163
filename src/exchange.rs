// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing mechanism in RabbitMQ that determine how messages
//! are distributed to queues. The naming resolver produces an
//! `ExchangeDefinition` for every message type, and the AMQP transport turns it
//! into an `exchange.declare`.

use crate::{errors::AmqpError, transport::HeaderValue};
use std::collections::BTreeMap;

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
    XMessageDelayed,
}

impl TryInto<lapin::ExchangeKind> for ExchangeKind {
    type Error = AmqpError;

    /// Delayed exchanges map to the `x-delayed-message` plugin type.
    fn try_into(self) -> Result<lapin::ExchangeKind, AmqpError> {
        match self {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Headers => Ok(lapin::ExchangeKind::Headers),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::XMessageDelayed => {
                Ok(lapin::ExchangeKind::Custom("x-delayed-message".to_owned()))
            }
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<String, HeaderValue>,
}

impl ExchangeDefinition {
    /// Creates a topic exchange definition with default parameters.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Topic,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Turns the exchange into a delayed exchange routing like `routing`.
    ///
    /// Requires the x-delayed-message plugin on the broker.
    pub fn delayed(mut self, routing: &ExchangeKind) -> Self {
        let routing = match routing {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
            _ => "topic",
        };

        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            HeaderValue::LongString(routing.to_owned()),
        );
        self
    }

    pub fn params(mut self, params: BTreeMap<String, HeaderValue>) -> Self {
        self.params.extend(params);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    /// Makes the exchange survive broker restarts.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Checks for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_a_transient_topic_exchange() {
        let def = ExchangeDefinition::new("shop");

        assert_eq!(def.exchange_kind(), &ExchangeKind::Topic);
        assert!(!def.is_durable());
        assert!(!def.is_auto_delete());
    }

    #[test]
    fn delayed_exchange_records_routing_type() {
        let def = ExchangeDefinition::new("shop.delayed").delayed(&ExchangeKind::Direct);

        assert_eq!(def.exchange_kind(), &ExchangeKind::XMessageDelayed);
        assert_eq!(
            def.params.get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&HeaderValue::LongString("direct".into()))
        );

        let kind: lapin::ExchangeKind = def.kind.try_into().unwrap();
        assert!(matches!(kind, lapin::ExchangeKind::Custom(ref k) if k == "x-delayed-message"));
    }
}
