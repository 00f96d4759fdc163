// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the exchanges, queues and bindings a resolved message topology
//! needs. A work queue with a retry companion dead-letters into `{queue}-retry`,
//! which holds messages for the retry interval and dead-letters them back.
//! Without a retry companion the work queue dead-letters into `{queue}-dlq`.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::HeaderValue,
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    Channel,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Registers topology components and installs them on the broker.
#[async_trait]
pub trait Topology<'tp> {
    fn exchange(self, def: &'tp ExchangeDefinition) -> Self;

    fn queue(self, def: &'tp QueueDefinition) -> Self;

    fn queue_binding(self, binding: &'tp QueueBinding) -> Self;

    /// Declares exchanges, then queues, then bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

pub struct AmqpTopology<'tp> {
    channel: Arc<Channel>,
    pub(crate) queues: Vec<&'tp QueueDefinition>,
    pub(crate) queues_binding: Vec<&'tp QueueBinding>,
    pub(crate) exchanges: Vec<&'tp ExchangeDefinition>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl<'tp> Topology<'tp> for AmqpTopology<'tp> {
    fn exchange(mut self, def: &'tp ExchangeDefinition) -> Self {
        if !self.exchanges.iter().any(|e| e.name == def.name) {
            self.exchanges.push(def);
        }
        self
    }

    fn queue(mut self, def: &'tp QueueDefinition) -> Self {
        if !self.queues.iter().any(|q| q.name == def.name) {
            self.queues.push(def);
        }
        self
    }

    fn queue_binding(mut self, binding: &'tp QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            declare_exchange(&self.channel, exch).await?;
        }
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology<'_> {
    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!(queue = def.name, "creating queue");

            let mut queue_args = field_map(&def.arguments);

            if def.retry_name.is_some() {
                self.declare_retry(def, &mut queue_args).await?;
            }

            if def.dlq_name.is_some() {
                self.declare_dlq(def, &mut queue_args).await?;
            }

            if let Some(ttl) = def.ttl {
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                    AMQPValue::LongInt(LongInt::from(ttl)),
                );
            }

            if let Some(max) = def.max_length {
                queue_args.insert(
                    ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                    AMQPValue::LongInt(LongInt::from(max)),
                );
            }

            self.channel
                .queue_declare(&def.name, declare_options(def), FieldTable::from(queue_args))
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), queue = def.name, "error to declare the queue");
                    AmqpError::DeclareQueueError(def.name.clone())
                })?;

            debug!(queue = def.name, "queue was created");
        }

        Ok(())
    }

    /// Declares `{queue}-retry` and points the work queue's dead letters at it.
    async fn declare_retry(
        &self,
        def: &QueueDefinition,
        queue_args: &mut BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        let (Some(retry_name), Some(ttl)) = (def.retry_name.as_deref(), def.retry_ttl) else {
            return Ok(());
        };

        let mut args = dead_letter_to(&def.name);
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );

        self.channel
            .queue_declare(retry_name, declare_options(def), FieldTable::from(args))
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = retry_name, "failure to declare retry queue");
                AmqpError::DeclareQueueError(retry_name.to_owned())
            })?;

        queue_args.extend(dead_letter_to(retry_name));
        Ok(())
    }

    async fn declare_dlq(
        &self,
        def: &QueueDefinition,
        queue_args: &mut BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        let Some(dlq_name) = def.dlq_name.as_deref() else {
            return Ok(());
        };

        self.channel
            .queue_declare(dlq_name, declare_options(def), FieldTable::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = dlq_name, "failure to declare dlq");
                AmqpError::DeclareQueueError(dlq_name.to_owned())
            })?;

        if def.retry_name.is_none() {
            queue_args.extend(dead_letter_to(dlq_name));
        }
        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                queue = binding.queue_name,
                exchange = binding.exchange_name,
                key = binding.routing_key,
                "binding queue to exchange"
            );

            self.channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                })?;
        }

        Ok(())
    }
}

/// Declares one exchange.
pub(crate) async fn declare_exchange(
    channel: &Channel,
    exch: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!(exchange = exch.name, "creating exchange");

    channel
        .exchange_declare(
            &exch.name,
            exch.kind.clone().try_into()?,
            ExchangeDeclareOptions {
                passive: exch.passive,
                durable: exch.durable,
                auto_delete: exch.delete,
                internal: exch.internal,
                nowait: exch.no_wait,
            },
            FieldTable::from(field_map(&exch.params)),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), name = exch.name, "error to declare the exchange");
            AmqpError::DeclareExchangeError(exch.name.clone())
        })?;

    debug!(exchange = exch.name, "exchange was created");
    Ok(())
}

fn declare_options(def: &QueueDefinition) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: def.passive,
        durable: def.durable,
        exclusive: def.exclusive,
        auto_delete: def.delete,
        nowait: def.no_wait,
    }
}

/// Arguments routing dead letters to `queue` through the default exchange.
fn dead_letter_to(queue: &str) -> BTreeMap<ShortString, AMQPValue> {
    BTreeMap::from([
        (
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from("")),
        ),
        (
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(queue)),
        ),
    ])
}

pub(crate) fn amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v.clone())),
        HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(*v)),
        HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(*v)),
        HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
        HeaderValue::Uint(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
        HeaderValue::Timestamp(v) => AMQPValue::Timestamp(*v),
    }
}

pub(crate) fn field_map(values: &BTreeMap<String, HeaderValue>) -> BTreeMap<ShortString, AMQPValue> {
    values
        .iter()
        .map(|(key, value)| (ShortString::from(key.clone()), amqp_value(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_values_keep_their_wire_type() {
        assert_eq!(
            amqp_value(&HeaderValue::LongLongInt(7)),
            AMQPValue::LongLongInt(7)
        );
        assert_eq!(amqp_value(&HeaderValue::Bool(true)), AMQPValue::Boolean(true));
        assert_eq!(
            amqp_value(&HeaderValue::from("tenant-a")),
            AMQPValue::LongString(LongString::from("tenant-a"))
        );
    }

    #[test]
    fn dead_letters_use_the_default_exchange() {
        let args = dead_letter_to("orders-retry");

        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("")))
        );
        assert_eq!(
            args.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            Some(&AMQPValue::LongString(LongString::from("orders-retry")))
        );
    }

    #[test]
    fn queue_arguments_are_converted() {
        let mut arguments = BTreeMap::new();
        arguments.insert("x-queue-type".to_owned(), HeaderValue::from("quorum"));

        let map = field_map(&arguments);

        assert_eq!(map.len(), 1);
        assert!(map.contains_key("x-queue-type"));
    }
}
