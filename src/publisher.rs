// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Sends commands (point-to-point) and events (broadcast) through the
//! transport, on the topology the naming resolver computes for their type.
//! The publisher never retries: only a consumer can tell a transient failure
//! from a malformed message.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    configuration::MessageConfiguration,
    context::DomainContext,
    errors::BusError,
    message::{Command, Event, Message, Rejection},
    naming::{NamingResolver, ResolvedTopology},
    transport::{MessageProperties, OutboundMessage, Transport},
};

/// Publishes messages on their resolved topology.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    resolver: Arc<NamingResolver>,
}

impl Publisher {
    /// Creates a publisher over `transport`.
    ///
    /// # Parameters
    /// * `transport` - Transport used for every publish
    /// * `resolver` - Naming rules shared with the subscribers
    ///
    /// # Returns
    /// A shared publisher
    pub fn new(transport: Arc<dyn Transport>, resolver: Arc<NamingResolver>) -> Arc<Publisher> {
        Arc::new(Publisher {
            transport,
            resolver,
        })
    }

    /// The naming rules this publisher resolves topology with.
    pub fn resolver(&self) -> &NamingResolver {
        &self.resolver
    }

    /// Sends a command to its exchange and routing key.
    ///
    /// # Parameters
    /// * `command` - Command to serialize and send
    /// * `context` - Context to propagate, a fresh one when `None`
    /// * `token` - Aborts the call when cancelled
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the message
    pub async fn send<C: Command>(
        &self,
        command: &C,
        context: Option<DomainContext>,
        token: &CancellationToken,
    ) -> Result<(), BusError> {
        let topology = self.resolver.resolve::<C>(None)?;
        self.dispatch(topology, command, context, |_| {}, token)
            .await
    }

    /// Sends a command with per-call topology and property overrides.
    pub async fn send_to<C, F>(
        &self,
        command: &C,
        context: Option<DomainContext>,
        configuration: &MessageConfiguration,
        properties: F,
        token: &CancellationToken,
    ) -> Result<(), BusError>
    where
        C: Command,
        F: FnOnce(&mut MessageProperties) + Send,
    {
        let topology = self.resolver.resolve::<C>(Some(configuration))?;
        self.dispatch(topology, command, context, properties, token)
            .await
    }

    /// Broadcasts an event. Abstract event types are refused.
    pub async fn publish<E: Event>(
        &self,
        event: &E,
        context: Option<DomainContext>,
        token: &CancellationToken,
    ) -> Result<(), BusError> {
        self.ensure_concrete::<E>()?;
        let topology = self.resolver.resolve::<E>(None)?;
        self.dispatch(topology, event, context, |_| {}, token).await
    }

    /// Broadcasts an event with per-call topology and property overrides.
    pub async fn publish_to<E, F>(
        &self,
        event: &E,
        context: Option<DomainContext>,
        configuration: &MessageConfiguration,
        properties: F,
        token: &CancellationToken,
    ) -> Result<(), BusError>
    where
        E: Event,
        F: FnOnce(&mut MessageProperties) + Send,
    {
        self.ensure_concrete::<E>()?;
        let topology = self.resolver.resolve::<E>(Some(configuration))?;
        self.dispatch(topology, event, context, properties, token)
            .await
    }

    /// Publishes a compensation event to the error exchange.
    ///
    /// # Parameters
    /// * `rejection` - Reject event registered with `MessageRegistry::reject`
    /// * `context` - Context of the failed message, kept as is
    /// * `token` - Aborts the call when cancelled
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the event
    pub async fn publish_rejection(
        &self,
        rejection: &dyn Rejection,
        context: &DomainContext,
        token: &CancellationToken,
    ) -> Result<(), BusError> {
        let topology = self.resolver.resolve_rejection(rejection)?;
        let payload = rejection
            .encode()
            .map_err(|_| BusError::Serialization(topology.message_type.clone()))?;

        self.send_raw(
            topology,
            payload,
            context.clone(),
            MessageProperties::default(),
            token,
        )
        .await
    }

    fn ensure_concrete<E: Event>(&self) -> Result<(), BusError> {
        if self.resolver.is_abstract::<E>()? {
            let name = self.resolver.registry().descriptor::<E>()?.full_name();
            error!(message_type = name, "refusing to publish an abstract event");
            return Err(BusError::AbstractEvent(name));
        }
        Ok(())
    }

    async fn dispatch<M, F>(
        &self,
        topology: ResolvedTopology,
        message: &M,
        context: Option<DomainContext>,
        properties: F,
        token: &CancellationToken,
    ) -> Result<(), BusError>
    where
        M: Message,
        F: FnOnce(&mut MessageProperties) + Send,
    {
        let payload = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize message");
            BusError::Serialization(topology.message_type.clone())
        })?;

        let mut props = MessageProperties {
            persistent: topology.exchange.is_durable(),
            ..Default::default()
        };
        properties(&mut props);

        self.send_raw(topology, payload, context.unwrap_or_default(), props, token)
            .await
    }

    async fn send_raw(
        &self,
        topology: ResolvedTopology,
        payload: Vec<u8>,
        context: DomainContext,
        properties: MessageProperties,
        token: &CancellationToken,
    ) -> Result<(), BusError> {
        if token.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let message_type = topology.message_type.clone();
        let context_id = context.id();
        let message = OutboundMessage {
            topology,
            payload,
            context,
            properties,
        };

        debug!(
            message_type,
            %context_id,
            exchange = message.exchange(),
            routing_key = message.routing_key(),
            "publishing message"
        );

        tokio::select! {
            _ = token.cancelled() => Err(BusError::Cancelled),
            result = self.transport.publish(message) => result.map_err(|err| {
                error!(error = err.to_string(), message_type, %context_id, "error publishing message");
                BusError::from(err)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configuration::ExchangeConfiguration,
        errors::AmqpError,
        message::{MessageDescriptor, MessageRegistry, RejectEvent},
        options::RabbitMqOptions,
        transport::MockTransport,
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct PlaceOrder {
        id: u32,
    }
    impl Command for PlaceOrder {}

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderPlaced {
        id: u32,
    }
    impl Event for OrderPlaced {}

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderEvent {
        id: u32,
    }
    impl Event for OrderEvent {}

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderRejected {
        id: u32,
    }
    impl Event for OrderRejected {}
    impl RejectEvent for OrderRejected {}

    fn publisher(transport: MockTransport) -> Arc<Publisher> {
        let registry = MessageRegistry::builder()
            .command::<PlaceOrder>(MessageDescriptor::new("Shop.Orders", "PlaceOrder"))
            .event::<OrderPlaced>(MessageDescriptor::new("Shop.Orders", "OrderPlaced").durable())
            .abstract_event::<OrderEvent>(MessageDescriptor::new("Shop.Orders", "OrderEvent"))
            .reject::<OrderRejected>(MessageDescriptor::new("Shop.Orders", "OrderRejected"))
            .build()
            .unwrap();
        let options = RabbitMqOptions {
            exchange_name: "shop".into(),
            ..Default::default()
        };

        Publisher::new(
            Arc::new(transport),
            Arc::new(NamingResolver::new(Arc::new(options), Arc::new(registry))),
        )
    }

    #[tokio::test]
    async fn send_uses_resolved_topology_and_context() {
        let context = DomainContext::new();
        let expected_id = context.id();

        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(move |msg| {
                msg.exchange() == "shop"
                    && msg.routing_key() == "shop.place_order"
                    && msg.message_type() == "Shop.Orders.PlaceOrder"
                    && msg.context.id() == expected_id
                    && msg.payload == br#"{"id":1}"#.to_vec()
            })
            .times(1)
            .returning(|_| Ok(()));

        publisher(transport)
            .send(&PlaceOrder { id: 1 }, Some(context), &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_to_applies_overrides_and_properties() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| {
                msg.exchange() == "partner"
                    && msg.routing_key() == "partner.orders"
                    && msg.properties.priority == Some(5)
            })
            .times(1)
            .returning(|_| Ok(()));

        let configuration = MessageConfiguration::new()
            .exchange(ExchangeConfiguration::named("partner").routing_key("partner.orders"));

        publisher(transport)
            .send_to(
                &PlaceOrder { id: 1 },
                None,
                &configuration,
                |props| props.priority = Some(5),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn durable_events_are_persistent() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| msg.properties.persistent && msg.routing_key() == "shop.order_placed")
            .times(1)
            .returning(|_| Ok(()));

        publisher(transport)
            .publish(&OrderPlaced { id: 1 }, None, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn abstract_events_never_reach_the_transport() {
        let mut transport = MockTransport::new();
        transport.expect_publish().times(0);
        let publisher = publisher(transport);
        let token = CancellationToken::new();

        let result = publisher.publish(&OrderEvent { id: 1 }, None, &token).await;
        assert!(matches!(result, Err(BusError::AbstractEvent(_))));

        let result = publisher
            .publish_to(
                &OrderEvent { id: 1 },
                None,
                &MessageConfiguration::new(),
                |_| {},
                &token,
            )
            .await;
        assert!(matches!(result, Err(BusError::AbstractEvent(_))));
    }

    #[tokio::test]
    async fn rejections_go_to_the_error_exchange() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| msg.exchange() == "shop.error")
            .times(1)
            .returning(|_| Ok(()));

        publisher(transport)
            .publish_rejection(
                &OrderRejected { id: 1 },
                &DomainContext::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_transport() {
        let mut transport = MockTransport::new();
        transport.expect_publish().times(0);
        let token = CancellationToken::new();
        token.cancel();

        let result = publisher(transport)
            .send(&PlaceOrder { id: 1 }, None, &token)
            .await;

        assert!(matches!(result, Err(BusError::Cancelled)));
    }

    #[tokio::test]
    async fn transport_failures_are_surfaced() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .returning(|_| Err(AmqpError::PublishingError("shop".into())));

        let result = publisher(transport)
            .send(&PlaceOrder { id: 1 }, None, &CancellationToken::new())
            .await;

        assert!(matches!(
            result,
            Err(BusError::Transport(AmqpError::PublishingError(_)))
        ));
    }
}
