// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber
//!
//! Registers one consumer per message type. Every registration resolves its
//! topology first, so misconfigured types fail before the broker is touched,
//! then hands the transport a delivery handler that throttles dispatches to
//! one at a time and runs them through the retry coordinator.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{
    configuration::MessageConfiguration,
    dispatcher::{CommandRoute, Dispatcher, EventRoute, Route},
    errors::{BusError, HandlerError},
    message::{Command, Event, Message, Rejection},
    naming::NamingResolver,
    publisher::Publisher,
    retry::{RetryCoordinator, RetryStrategy},
    transport::{Acknowledgement, DeliveryHandler, InboundMessage, Transport},
};

/// Maps a failed message to the reject event compensating it.
pub type ErrorMapper<T> = Arc<dyn Fn(&T, &HandlerError) -> Box<dyn Rejection> + Send + Sync>;

/// Per-subscription behavior.
pub struct SubscribeOptions<T> {
    on_error: Option<ErrorMapper<T>>,
    rethrow: bool,
    token: CancellationToken,
}

impl<T> Default for SubscribeOptions<T> {
    fn default() -> Self {
        SubscribeOptions {
            on_error: None,
            rethrow: false,
            token: CancellationToken::new(),
        }
    }
}

impl<T> Clone for SubscribeOptions<T> {
    fn clone(&self) -> Self {
        SubscribeOptions {
            on_error: self.on_error.clone(),
            rethrow: self.rethrow,
            token: self.token.clone(),
        }
    }
}

impl<T> SubscribeOptions<T> {
    /// Options that ack unrecovered failures, without compensation and
    /// without cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes the mapped reject event when the message is rejected or
    /// runs out of retries.
    pub fn on_error<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&T, &HandlerError) -> Box<dyn Rejection> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(mapper));
        self
    }

    /// Propagates unrecovered failures to the transport instead of acking.
    pub fn rethrow(mut self) -> Self {
        self.rethrow = true;
        self
    }

    /// Stops the registration and every in-flight dispatch once `token` is
    /// cancelled.
    ///
    /// # Parameters
    /// * `token` - Token shared with the caller
    ///
    /// # Returns
    /// The updated options
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// The compensating mapper, if one was configured.
    pub fn error_mapper(&self) -> Option<&ErrorMapper<T>> {
        self.on_error.as_ref()
    }

    /// Whether unrecovered failures are propagated instead of acked.
    pub fn rethrows(&self) -> bool {
        self.rethrow
    }

    /// Token observed by the registration and its dispatches.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Registers consumers that forward deliveries to a `Dispatcher`.
pub struct Subscriber<D> {
    transport: Arc<dyn Transport>,
    resolver: Arc<NamingResolver>,
    dispatcher: Arc<D>,
    coordinator: Arc<RetryCoordinator>,
}

impl<D: Dispatcher + 'static> Subscriber<D> {
    /// Creates a subscriber sharing the naming rules of `publisher`.
    ///
    /// The retry strategy is fixed here from the publisher's options and
    /// applies to every registration.
    ///
    /// # Parameters
    /// * `transport` - Transport consumers are registered on
    /// * `publisher` - Publisher used for reject events
    /// * `dispatcher` - Domain dispatcher receiving decoded messages
    ///
    /// # Returns
    /// A new subscriber
    pub fn new(transport: Arc<dyn Transport>, publisher: Arc<Publisher>, dispatcher: Arc<D>) -> Self {
        let resolver = Arc::new(publisher.resolver().clone());
        let strategy = RetryStrategy::from_options(resolver.options());

        Subscriber {
            transport,
            resolver,
            dispatcher,
            coordinator: Arc::new(RetryCoordinator::new(strategy, publisher)),
        }
    }

    /// Registers the consumer of command `C` with the resolved topology.
    ///
    /// # Parameters
    /// * `options` - Compensation, rethrow and cancellation behavior
    ///
    /// # Returns
    /// `Ok(())` once the consumer is registered, or the resolution,
    /// configuration or transport error
    pub async fn subscribe_command<C: Command>(
        &self,
        options: SubscribeOptions<C>,
    ) -> Result<(), BusError> {
        let route = Arc::new(CommandRoute(self.dispatcher.clone()));
        self.register(None, route, options).await
    }

    /// Same as `subscribe_command`, with exchange and queue overrides.
    pub async fn subscribe_command_from<C: Command>(
        &self,
        configuration: &MessageConfiguration,
        options: SubscribeOptions<C>,
    ) -> Result<(), BusError> {
        let route = Arc::new(CommandRoute(self.dispatcher.clone()));
        self.register(Some(configuration), route, options).await
    }

    /// Registers the consumer of event `E` with the resolved topology.
    ///
    /// # Parameters
    /// * `options` - Compensation, rethrow and cancellation behavior
    ///
    /// # Returns
    /// `Ok(())` once the consumer is registered, or the resolution,
    /// configuration or transport error
    pub async fn subscribe_event<E: Event>(
        &self,
        options: SubscribeOptions<E>,
    ) -> Result<(), BusError> {
        let route = Arc::new(EventRoute(self.dispatcher.clone()));
        self.register(None, route, options).await
    }

    /// Same as `subscribe_event`, with exchange and queue overrides.
    pub async fn subscribe_event_from<E: Event>(
        &self,
        configuration: &MessageConfiguration,
        options: SubscribeOptions<E>,
    ) -> Result<(), BusError> {
        let route = Arc::new(EventRoute(self.dispatcher.clone()));
        self.register(Some(configuration), route, options).await
    }

    /// Starts a bulk registration.
    pub fn subscriptions(&self) -> Subscriptions<'_, D> {
        Subscriptions {
            subscriber: self,
            pending: vec![],
            defaults: Defaults::default(),
        }
    }

    async fn register<T: Message>(
        &self,
        configuration: Option<&MessageConfiguration>,
        route: Arc<dyn Route<T>>,
        options: SubscribeOptions<T>,
    ) -> Result<(), BusError> {
        let mut topology = self.resolver.resolve::<T>(configuration).map_err(|err| {
            error!(error = err.to_string(), "failure to resolve subscription topology");
            err
        })?;

        if topology.consumer.is_auto_ack()
            && matches!(self.coordinator.strategy(), RetryStrategy::Requeue { .. })
        {
            let err = BusError::Configuration(format!(
                "queue `{}` is auto-ack, broker requeuing needs manual acks",
                topology.queue.name()
            ));
            error!(error = err.to_string(), "failure to subscribe");
            return Err(err);
        }

        let mut queue = topology.queue.with_dlq();
        if let RetryStrategy::Requeue { interval, .. } = self.coordinator.strategy() {
            let ttl = i32::try_from(interval.as_millis()).unwrap_or(i32::MAX);
            queue = queue.with_retry(ttl);
        }
        topology.queue = queue;

        if options.token().is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let message_type = topology.message_type.clone();
        debug!(
            message_type,
            queue = topology.queue.name(),
            exchange = topology.exchange.name(),
            "subscribing"
        );

        let handler = MessageConsumer {
            route,
            options,
            coordinator: self.coordinator.clone(),
            throttle: Semaphore::new(1),
        };

        self.transport
            .subscribe(topology, Arc::new(handler))
            .await
            .map_err(|err| {
                error!(error = err.to_string(), message_type, "failure to subscribe");
                BusError::from(err)
            })
    }
}

/// Delivery handler of one registration.
struct MessageConsumer<T> {
    route: Arc<dyn Route<T>>,
    options: SubscribeOptions<T>,
    coordinator: Arc<RetryCoordinator>,
    throttle: Semaphore,
}

#[async_trait]
impl<T: Message> DeliveryHandler for MessageConsumer<T> {
    async fn handle(&self, message: InboundMessage) -> Result<Acknowledgement, BusError> {
        let _permit = tokio::select! {
            _ = self.options.token().cancelled() => return Err(BusError::Cancelled),
            permit = self.throttle.acquire() => permit.map_err(|_| BusError::Cancelled)?,
        };

        self.coordinator
            .process(&message, self.route.as_ref(), &self.options)
            .await
    }
}

type Registration<'s, D> =
    Box<dyn FnOnce(&'s Subscriber<D>, Defaults) -> BoxFuture<'s, Result<(), BusError>> + Send + 's>;

/// Options shared by every registration of a bulk subscription.
#[derive(Clone, Default)]
struct Defaults {
    rethrow: bool,
    token: CancellationToken,
}

impl Defaults {
    fn options<T>(&self) -> SubscribeOptions<T> {
        SubscribeOptions {
            on_error: None,
            rethrow: self.rethrow,
            token: self.token.clone(),
        }
    }
}

/// Fluent bulk registration, run in declaration order by `subscribe_all`.
pub struct Subscriptions<'s, D> {
    subscriber: &'s Subscriber<D>,
    pending: Vec<Registration<'s, D>>,
    defaults: Defaults,
}

impl<'s, D: Dispatcher + 'static> Subscriptions<'s, D> {
    /// Propagates unrecovered failures on every registration.
    pub fn rethrow(mut self) -> Self {
        self.defaults.rethrow = true;
        self
    }

    /// Shares `token` with every registration.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.defaults.token = token;
        self
    }

    /// Registers command `C` with the shared defaults.
    pub fn command<C: Command>(self) -> Self {
        self.push(|subscriber, defaults| {
            Box::pin(subscriber.subscribe_command::<C>(defaults.options()))
        })
    }

    /// Registers command `C` with exchange and queue overrides.
    pub fn command_from<C: Command>(self, configuration: MessageConfiguration) -> Self {
        self.push(move |subscriber, defaults| {
            Box::pin(async move {
                subscriber
                    .subscribe_command_from::<C>(&configuration, defaults.options())
                    .await
            })
        })
    }

    /// Registers command `C` with a compensating mapper.
    ///
    /// # Parameters
    /// * `mapper` - Builds the reject event of a failed command
    ///
    /// # Returns
    /// The updated bulk registration
    pub fn command_with<C, F>(self, mapper: F) -> Self
    where
        C: Command,
        F: Fn(&C, &HandlerError) -> Box<dyn Rejection> + Send + Sync + 'static,
    {
        self.push(move |subscriber, defaults| {
            Box::pin(subscriber.subscribe_command::<C>(defaults.options().on_error(mapper)))
        })
    }

    /// Registers event `E` with the shared defaults.
    pub fn event<E: Event>(self) -> Self {
        self.push(|subscriber, defaults| {
            Box::pin(subscriber.subscribe_event::<E>(defaults.options()))
        })
    }

    /// Registers event `E` with exchange and queue overrides.
    pub fn event_from<E: Event>(self, configuration: MessageConfiguration) -> Self {
        self.push(move |subscriber, defaults| {
            Box::pin(async move {
                subscriber
                    .subscribe_event_from::<E>(&configuration, defaults.options())
                    .await
            })
        })
    }

    /// Registers event `E` with a compensating mapper.
    pub fn event_with<E, F>(self, mapper: F) -> Self
    where
        E: Event,
        F: Fn(&E, &HandlerError) -> Box<dyn Rejection> + Send + Sync + 'static,
    {
        self.push(move |subscriber, defaults| {
            Box::pin(subscriber.subscribe_event::<E>(defaults.options().on_error(mapper)))
        })
    }

    /// Registers everything, stopping at the first failure.
    pub async fn subscribe_all(self) -> Result<(), BusError> {
        let total = self.pending.len();

        for registration in self.pending {
            registration(self.subscriber, self.defaults.clone()).await?;
        }

        debug!(total, "all subscriptions registered");
        Ok(())
    }

    fn push<F>(mut self, registration: F) -> Self
    where
        F: FnOnce(&'s Subscriber<D>, Defaults) -> BoxFuture<'s, Result<(), BusError>> + Send + 's,
    {
        self.pending.push(Box::new(registration));
        self
    }
}
