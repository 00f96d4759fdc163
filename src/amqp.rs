// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Transport
//!
//! The lapin implementation of `Transport`. Publishing declares each exchange
//! once per transport, then sends the JSON payload with the context and trace
//! headers. Subscribing installs the queue topology, sets the prefetch and
//! spawns one task per delivery.

use crate::{
    consumer,
    context::{CONTEXT_CREATED_AT_HEADER, CONTEXT_ID_HEADER},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    naming::ResolvedTopology,
    otel,
    topology::{self, AmqpTopology, Topology},
    transport::{DeliveryHandler, OutboundMessage, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, BasicPublishOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::global;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};
use tracing::{debug, error};
use uuid::Uuid;

/// Delivery mode flagging a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// `Transport` backed by a lapin channel.
pub struct RabbitMQTransport {
    channel: Arc<Channel>,
    declared: Mutex<HashSet<String>>,
}

impl RabbitMQTransport {
    /// Creates a transport over an open channel.
    ///
    /// # Parameters
    /// * `channel` - Channel shared by publishing and every consumer
    ///
    /// # Returns
    /// A shared transport
    pub fn new(channel: Arc<Channel>) -> Arc<RabbitMQTransport> {
        Arc::new(RabbitMQTransport {
            channel,
            declared: Mutex::new(HashSet::new()),
        })
    }

    fn is_declared(&self, exchange: &str) -> bool {
        self.declared
            .lock()
            .map(|declared| declared.contains(exchange))
            .unwrap_or(false)
    }

    fn mark_declared(&self, exchange: &str) {
        if let Ok(mut declared) = self.declared.lock() {
            declared.insert(exchange.to_owned());
        }
    }

    async fn ensure_exchange(&self, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
        if self.is_declared(exchange.name()) {
            return Ok(());
        }

        topology::declare_exchange(&self.channel, exchange).await?;
        self.mark_declared(exchange.name());
        Ok(())
    }
}

/// AMQP properties of an outgoing message.
pub(crate) fn basic_properties(message: &OutboundMessage) -> BasicProperties {
    let context = &message.context;
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();

    otel::inject(&mut headers);
    headers.extend(topology::field_map(&message.properties.headers));
    headers.insert(
        ShortString::from(CONTEXT_ID_HEADER),
        AMQPValue::LongString(LongString::from(context.id().to_string())),
    );
    headers.insert(
        ShortString::from(CONTEXT_CREATED_AT_HEADER),
        AMQPValue::LongString(LongString::from(context.created_at().to_rfc3339())),
    );

    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(message.properties.content_type.clone()))
        .with_type(ShortString::from(message.message_type()))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_correlation_id(ShortString::from(context.id().to_string()))
        .with_timestamp(u64::try_from(context.created_at().timestamp()).unwrap_or_default())
        .with_headers(FieldTable::from(headers));

    if let Some(expiration) = message.properties.expiration {
        props = props.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }
    if let Some(priority) = message.properties.priority {
        props = props.with_priority(priority);
    }
    if message.properties.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    props
}

#[async_trait]
impl Transport for RabbitMQTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError> {
        self.ensure_exchange(&message.topology.exchange).await?;

        match self
            .channel
            .basic_publish(
                message.exchange(),
                message.routing_key(),
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                basic_properties(&message),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(message.exchange().to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn subscribe(
        &self,
        topology: ResolvedTopology,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), AmqpError> {
        AmqpTopology::new(self.channel.clone())
            .exchange(&topology.exchange)
            .queue(&topology.queue)
            .queue_binding(&topology.binding)
            .install()
            .await?;
        self.mark_declared(topology.exchange.name());

        let queue = topology.queue.name().to_owned();

        self.channel
            .basic_qos(topology.consumer.prefetch(), BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "failure to configure qos");
                AmqpError::QoSDeclarationError(queue.clone())
            })?;

        let mut consumer = self
            .channel
            .basic_consume(
                &queue,
                topology.consumer.tag(),
                BasicConsumeOptions {
                    no_ack: topology.consumer.is_auto_ack(),
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "failure to declare consumer");
                AmqpError::ConsumerDeclarationError(queue.clone())
            })?;

        debug!(queue, tag = topology.consumer.tag(), "consumer registered");

        let channel = self.channel.clone();
        let topology = Arc::new(topology);
        let tracer = Arc::new(global::tracer(otel::TRACER_NAME));

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                let delivery = match result {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        continue;
                    }
                };

                let channel = channel.clone();
                let topology = topology.clone();
                let handler = handler.clone();
                let tracer = tracer.clone();

                tokio::spawn(async move {
                    if let Err(err) = consumer::consume(
                        &tracer,
                        &delivery,
                        &topology,
                        handler.as_ref(),
                        &channel,
                    )
                    .await
                    {
                        error!(error = err.to_string(), "failure settling delivery");
                    }
                });
            }

            debug!(queue = topology.queue.name(), "consumer stream closed");
        });

        Ok(())
    }
}
