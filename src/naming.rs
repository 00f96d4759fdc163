// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Naming Resolution
//!
//! Computes the exchange, routing key and queue of a message type. Each value
//! is taken from the first source that provides it:
//!
//! 1. the per-call `MessageConfiguration`
//! 2. the type's `MessageDescriptor` registration
//! 3. the options' naming conventions (routing key and queue only)
//! 4. a default computed from the global exchange name or the type's namespace
//!
//! Reject events ignore all of the above for the exchange and always go to the
//! error exchange. Resolution is pure: the same inputs yield the same names.

use std::sync::Arc;

use crate::{
    configuration::MessageConfiguration,
    errors::BusError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{MessageDescriptor, MessageKind, MessageRegistry, Rejection},
    options::{NamingConventions, RabbitMqOptions},
    queue::{ConsumerSettings, QueueBinding, QueueDefinition},
};

/// Suffix appended to the default exchange to form the error exchange
pub const ERROR_EXCHANGE_SUFFIX: &str = ".error";

/// Everything the transport needs to publish or consume a message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTopology {
    /// Full name of the message type, sent as the AMQP type property
    pub message_type: String,
    pub exchange: ExchangeDefinition,
    pub routing_key: String,
    pub queue: QueueDefinition,
    pub binding: QueueBinding,
    pub consumer: ConsumerSettings,
}

/// Lower-cases `input` and joins its words with `_`.
///
/// Words are split on any non-alphanumeric character and on camel-case
/// boundaries, so `Shop.Orders` becomes `shop_orders` and `PlaceHTTPOrder`
/// becomes `place_http_order`.
pub fn slug(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 4);

    for (i, c) in chars.iter().enumerate() {
        if !c.is_alphanumeric() {
            if !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
            continue;
        }

        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let boundary = prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower);

            if boundary && !out.is_empty() && !out.ends_with('_') {
                out.push('_');
            }
        }

        out.extend(c.to_lowercase());
    }

    out.trim_end_matches('_').to_owned()
}

/// Resolves topology for registered message types.
#[derive(Debug, Clone)]
pub struct NamingResolver {
    options: Arc<RabbitMqOptions>,
    conventions: NamingConventions,
    registry: Arc<MessageRegistry>,
}

impl NamingResolver {
    /// Creates a resolver over the bus options and the message registry.
    ///
    /// # Parameters
    /// * `options` - Default exchange and naming conventions
    /// * `registry` - Descriptors of every registered message type
    ///
    /// # Returns
    /// A new resolver
    pub fn new(options: Arc<RabbitMqOptions>, registry: Arc<MessageRegistry>) -> Self {
        let conventions = options.naming_conventions();

        NamingResolver {
            options,
            conventions,
            registry,
        }
    }

    /// Options the resolver was built with.
    pub fn options(&self) -> &RabbitMqOptions {
        &self.options
    }

    /// Registry of message descriptors.
    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    /// Resolves the exchange, queue, routing key and consumer settings of `T`.
    ///
    /// # Parameters
    /// * `overrides` - Per-call configuration, applied before the
    ///   registration, the conventions and the defaults
    ///
    /// # Returns
    /// The resolved topology, or an error when `T` is not registered or its
    /// queue names conflict
    pub fn resolve<T: 'static>(
        &self,
        overrides: Option<&MessageConfiguration>,
    ) -> Result<ResolvedTopology, BusError> {
        let descriptor = self.registry.descriptor::<T>()?;
        self.resolve_descriptor(descriptor, overrides)
    }

    /// Resolves the error-exchange topology of a type-erased reject event.
    pub fn resolve_rejection(
        &self,
        rejection: &dyn Rejection,
    ) -> Result<ResolvedTopology, BusError> {
        let descriptor = self
            .registry
            .descriptor_of(rejection.message_type(), rejection.type_name())?;

        if descriptor.kind() != MessageKind::Reject {
            return Err(BusError::Configuration(format!(
                "`{}` is not registered as a reject event",
                descriptor.full_name()
            )));
        }

        self.resolve_descriptor(descriptor, None)
    }

    /// Resolves the topology of an already looked-up descriptor.
    pub fn resolve_descriptor(
        &self,
        descriptor: &MessageDescriptor,
        overrides: Option<&MessageConfiguration>,
    ) -> Result<ResolvedTopology, BusError> {
        let exchange_cfg = overrides.and_then(|o| o.exchange.as_ref());
        let queue_cfg = overrides.and_then(|o| o.queue.as_ref());
        let attributes = descriptor.attributes();
        let full_name = descriptor.full_name();

        let explicit_queue = self.explicit_queue_name(descriptor, overrides)?;
        let exchange_name = self.exchange_name(descriptor, overrides);
        let default_name = format!("{}.{}", exchange_name, slug(descriptor.name()));

        let routing_key = exchange_cfg
            .and_then(|e| e.routing_key.clone())
            .or_else(|| attributes.routing_key.clone())
            .or_else(|| self.conventions.routing_key(&full_name).map(str::to_owned))
            .unwrap_or_else(|| default_name.clone());

        let mut queue_name = explicit_queue
            .or_else(|| self.conventions.queue_name(&full_name).map(str::to_owned))
            .unwrap_or(default_name);
        if let Some(suffix) = queue_cfg.and_then(|q| q.suffix.as_deref()) {
            queue_name = format!("{queue_name}.{suffix}");
        }

        let kind = exchange_cfg
            .and_then(|e| e.kind.clone())
            .or_else(|| attributes.exchange_kind.clone())
            .unwrap_or_default();
        let durable = exchange_cfg
            .and_then(|e| e.durable)
            .or(attributes.durable)
            .unwrap_or(false);
        let auto_delete = exchange_cfg
            .and_then(|e| e.auto_delete)
            .or(attributes.auto_delete)
            .unwrap_or(false);

        let exchange = match kind {
            ExchangeKind::XMessageDelayed => {
                ExchangeDefinition::new(&exchange_name).delayed(&ExchangeKind::Topic)
            }
            kind => ExchangeDefinition::new(&exchange_name).kind(kind),
        };
        let mut exchange = exchange
            .durable(durable)
            .delete(auto_delete);
        if let Some(cfg) = exchange_cfg {
            exchange = exchange.params(cfg.arguments.clone());
        }

        let mut queue = QueueDefinition::new(&queue_name)
            .durable(durable)
            .delete(auto_delete);
        if let Some(cfg) = queue_cfg {
            queue = queue.arguments(cfg.arguments.clone());
        }

        let binding = QueueBinding::new(&queue_name)
            .exchange(&exchange_name)
            .routing_key(&routing_key);

        let consumer = ConsumerSettings::new(
            queue_cfg
                .and_then(|q| q.consumer_tag.as_deref())
                .unwrap_or(&queue_name),
            queue_cfg
                .and_then(|q| q.prefetch)
                .unwrap_or(self.options.prefetch),
        )
        .auto_ack(queue_cfg.and_then(|q| q.auto_ack).unwrap_or(false));

        Ok(ResolvedTopology {
            message_type: full_name,
            exchange,
            routing_key,
            queue,
            binding,
            consumer,
        })
    }

    /// Exchange a message type publishes to and binds on.
    pub fn exchange_name(
        &self,
        descriptor: &MessageDescriptor,
        overrides: Option<&MessageConfiguration>,
    ) -> String {
        if descriptor.kind() == MessageKind::Reject {
            return self.error_exchange_name(descriptor);
        }

        overrides
            .and_then(|o| o.exchange.as_ref())
            .and_then(|e| e.name.clone())
            .or_else(|| descriptor.attributes().exchange_name.clone())
            .or_else(|| {
                (!self.options.exchange_name.is_empty())
                    .then(|| self.options.exchange_name.clone())
            })
            .unwrap_or_else(|| slug(descriptor.namespace()))
    }

    /// The default exchange suffixed with `.error`.
    ///
    /// Falls back to the namespace slug when no default exchange is set.
    pub fn error_exchange_name(&self, descriptor: &MessageDescriptor) -> String {
        let base = if self.options.exchange_name.is_empty() {
            slug(descriptor.namespace())
        } else {
            self.options.exchange_name.clone()
        };

        format!("{base}{ERROR_EXCHANGE_SUFFIX}")
    }

    /// The single explicit queue name, if any source declares one.
    ///
    /// Fails when the registration, the exchange binding override and the
    /// queue override name different queues.
    fn explicit_queue_name(
        &self,
        descriptor: &MessageDescriptor,
        overrides: Option<&MessageConfiguration>,
    ) -> Result<Option<String>, BusError> {
        let candidates = [
            overrides
                .and_then(|o| o.queue.as_ref())
                .and_then(|q| q.name.as_deref()),
            overrides
                .and_then(|o| o.exchange.as_ref())
                .and_then(|e| e.queue_name.as_deref()),
            descriptor.attributes().queue_name.as_deref(),
        ];

        let mut chosen: Option<&str> = None;
        for candidate in candidates.into_iter().flatten() {
            match chosen {
                Some(first) if first != candidate => {
                    return Err(BusError::ConflictingQueueName {
                        message_type: descriptor.full_name(),
                        first: first.to_owned(),
                        second: candidate.to_owned(),
                    });
                }
                Some(_) => {}
                None => chosen = Some(candidate),
            }
        }

        Ok(chosen.map(str::to_owned))
    }

    /// `true` when `T` is registered as an abstract event.
    pub fn is_abstract<T: 'static>(&self) -> Result<bool, BusError> {
        Ok(self.registry.descriptor::<T>()?.is_abstract())
    }
}
