// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Types and Registry
//!
//! Message types are plain serde structs tagged with the `Command`, `Event` or
//! `RejectEvent` marker traits. Their topology metadata is declared once at
//! startup in a `MessageRegistry`, keyed by `TypeId`, and read by the naming
//! resolver for every publish and subscription.

use serde::{de::DeserializeOwned, Serialize};
use std::{
    any::{type_name, TypeId},
    collections::HashMap,
};

use crate::{errors::BusError, exchange::ExchangeKind};

/// Any payload that can travel on the bus.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Marker: point-to-point command
pub trait Command: Message {}

/// Marker: broadcast event
pub trait Event: Message {}

/// Marker: compensation event published to the error exchange when a
/// command or event could not be completed.
pub trait RejectEvent: Event {}

/// Type-erased reject event, as returned by subscription error mappers.
pub trait Rejection: Send + Sync {
    fn message_type(&self) -> TypeId;

    fn type_name(&self) -> &'static str;

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error>;
}

impl<R> Rejection for R
where
    R: RejectEvent,
{
    fn message_type(&self) -> TypeId {
        TypeId::of::<R>()
    }

    fn type_name(&self) -> &'static str {
        type_name::<R>()
    }

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Role of a registered message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Command,
    Event,
    Reject,
}

/// Topology values declared for a type at registration time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyAttributes {
    pub exchange_name: Option<String>,
    pub exchange_kind: Option<ExchangeKind>,
    pub routing_key: Option<String>,
    pub queue_name: Option<String>,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
}

/// Registration entry describing one message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDescriptor {
    namespace: String,
    name: String,
    kind: MessageKind,
    is_abstract: bool,
    attributes: TopologyAttributes,
}

impl MessageDescriptor {
    /// Creates a descriptor for `namespace.name`.
    ///
    /// The kind is set by the registry method the descriptor is passed to.
    pub fn new(namespace: &str, name: &str) -> Self {
        MessageDescriptor {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            kind: MessageKind::Command,
            is_abstract: false,
            attributes: TopologyAttributes::default(),
        }
    }

    pub fn exchange_name(mut self, name: &str) -> Self {
        self.attributes.exchange_name = Some(name.to_owned());
        self
    }

    pub fn exchange_kind(mut self, kind: ExchangeKind) -> Self {
        self.attributes.exchange_kind = Some(kind);
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.attributes.routing_key = Some(key.to_owned());
        self
    }

    pub fn queue_name(mut self, name: &str) -> Self {
        self.attributes.queue_name = Some(name.to_owned());
        self
    }

    pub fn durable(mut self) -> Self {
        self.attributes.durable = Some(true);
        self
    }

    pub fn auto_delete(mut self) -> Self {
        self.attributes.auto_delete = Some(true);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `namespace.Name`, the key used by naming conventions and the AMQP type
    /// property.
    pub fn full_name(&self) -> String {
        if self.namespace.is_empty() {
            return self.name.clone();
        }
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn attributes(&self) -> &TopologyAttributes {
        &self.attributes
    }
}

/// Process-wide table of message types, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    by_type: HashMap<TypeId, MessageDescriptor>,
}

impl MessageRegistry {
    /// Starts a registry.
    pub fn builder() -> MessageRegistryBuilder {
        MessageRegistryBuilder::default()
    }

    /// Looks up the descriptor registered for `T`.
    ///
    /// # Returns
    /// The descriptor, or `BusError::UnregisteredMessage`
    pub fn descriptor<T: 'static>(&self) -> Result<&MessageDescriptor, BusError> {
        self.descriptor_of(TypeId::of::<T>(), type_name::<T>())
    }

    pub fn descriptor_of(
        &self,
        id: TypeId,
        type_name: &str,
    ) -> Result<&MessageDescriptor, BusError> {
        self.by_type
            .get(&id)
            .ok_or_else(|| BusError::UnregisteredMessage(type_name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

/// Collects registrations and validates them into a `MessageRegistry`.
#[derive(Debug, Default)]
pub struct MessageRegistryBuilder {
    entries: Vec<(TypeId, &'static str, MessageDescriptor)>,
}

impl MessageRegistryBuilder {
    /// Registers command `T`.
    ///
    /// # Parameters
    /// * `descriptor` - Namespace, name and topology attributes of `T`
    ///
    /// # Returns
    /// The updated builder
    pub fn command<T: Command>(self, descriptor: MessageDescriptor) -> Self {
        self.push::<T>(descriptor, MessageKind::Command, false)
    }

    /// Registers event `T`.
    pub fn event<T: Event>(self, descriptor: MessageDescriptor) -> Self {
        self.push::<T>(descriptor, MessageKind::Event, false)
    }

    /// Registers an event family that cannot be published on its own.
    pub fn abstract_event<T: Event>(self, descriptor: MessageDescriptor) -> Self {
        self.push::<T>(descriptor, MessageKind::Event, true)
    }

    /// Registers reject event `T`, routed to the error exchange.
    pub fn reject<T: RejectEvent>(self, descriptor: MessageDescriptor) -> Self {
        self.push::<T>(descriptor, MessageKind::Reject, false)
    }

    fn push<T: 'static>(
        mut self,
        mut descriptor: MessageDescriptor,
        kind: MessageKind,
        is_abstract: bool,
    ) -> Self {
        descriptor.kind = kind;
        descriptor.is_abstract = is_abstract;
        self.entries
            .push((TypeId::of::<T>(), type_name::<T>(), descriptor));
        self
    }

    /// Fails when a type or a full name is registered twice.
    pub fn build(self) -> Result<MessageRegistry, BusError> {
        let mut by_type = HashMap::with_capacity(self.entries.len());
        let mut names = HashMap::with_capacity(self.entries.len());

        for (id, rust_name, descriptor) in self.entries {
            if let Some(previous) = names.insert(descriptor.full_name(), rust_name) {
                return Err(BusError::Configuration(format!(
                    "`{}` is used by both `{}` and `{}`",
                    descriptor.full_name(),
                    previous,
                    rust_name
                )));
            }

            if by_type.insert(id, descriptor).is_some() {
                return Err(BusError::Configuration(format!(
                    "`{rust_name}` is registered twice"
                )));
            }
        }

        Ok(MessageRegistry { by_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

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
    struct OrderRejected {
        reason: String,
    }
    impl Event for OrderRejected {}
    impl RejectEvent for OrderRejected {}

    #[test]
    fn registry_records_kind_and_abstractness() {
        let registry = MessageRegistry::builder()
            .command::<PlaceOrder>(MessageDescriptor::new("Shop.Orders", "PlaceOrder").durable())
            .abstract_event::<OrderPlaced>(MessageDescriptor::new("Shop.Orders", "OrderPlaced"))
            .reject::<OrderRejected>(MessageDescriptor::new("Shop.Orders", "OrderRejected"))
            .build()
            .unwrap();

        let command = registry.descriptor::<PlaceOrder>().unwrap();
        assert_eq!(command.kind(), MessageKind::Command);
        assert_eq!(command.full_name(), "Shop.Orders.PlaceOrder");
        assert_eq!(command.attributes().durable, Some(true));

        assert!(registry.descriptor::<OrderPlaced>().unwrap().is_abstract());
        assert_eq!(
            registry.descriptor::<OrderRejected>().unwrap().kind(),
            MessageKind::Reject
        );
    }

    #[test]
    fn unregistered_types_are_reported() {
        let registry = MessageRegistry::default();

        assert!(matches!(
            registry.descriptor::<PlaceOrder>(),
            Err(BusError::UnregisteredMessage(_))
        ));
    }

    #[test]
    fn duplicated_full_names_are_rejected() {
        let result = MessageRegistry::builder()
            .command::<PlaceOrder>(MessageDescriptor::new("Shop", "Order"))
            .event::<OrderPlaced>(MessageDescriptor::new("Shop", "Order"))
            .build();

        assert!(matches!(result, Err(BusError::Configuration(_))));
    }

    #[test]
    fn rejections_encode_as_json() {
        let rejection: Box<dyn Rejection> = Box::new(OrderRejected {
            reason: "out of stock".into(),
        });

        assert_eq!(rejection.message_type(), TypeId::of::<OrderRejected>());
        assert_eq!(
            rejection.encode().unwrap(),
            br#"{"reason":"out of stock"}"#.to_vec()
        );
    }
}
