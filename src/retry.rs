// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Coordination
//!
//! Turns the outcome of a domain dispatch into an acknowledgement decision.
//!
//! For every delivery:
//! 1. Decode the payload. A message that cannot be decoded is rejected.
//! 2. Dispatch it. Success acknowledges; a `DomainError` is logged and
//!    acknowledged; a `MessageBusError` is compensated through the
//!    subscription's error mapper; anything else is a recoverable failure.
//! 3. Recoverable failures follow the process-wide strategy:
//!    - `InProcess`: re-dispatch up to `retries` more times, sleeping
//!      `interval` between attempts, without returning the message to the
//!      broker;
//!    - `Requeue`: ask the broker to redeliver after `interval` until the
//!      delivery count reaches `retries`, then compensate.
//!
//! An exhausted budget is logged as a `DomainError` and acknowledged unless
//! the subscription asked to rethrow.

use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    context::DomainContext,
    dispatcher::Route,
    errors::{BusError, DomainError, HandlerError, MessageBusError},
    handler::{self, Handling},
    message::Message,
    options::RabbitMqOptions,
    publisher::Publisher,
    subscriber::SubscribeOptions,
    transport::{Acknowledgement, InboundMessage},
};

/// How recoverable failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry inside the consumer callback
    InProcess { retries: u32, interval: Duration },
    /// Hand the message back to the broker for delayed redelivery
    Requeue { retries: u32, interval: Duration },
}

impl RetryStrategy {
    /// Picks the strategy selected by `with_requeuing`.
    pub fn from_options(options: &RabbitMqOptions) -> Self {
        if options.with_requeuing {
            RetryStrategy::Requeue {
                retries: options.retries,
                interval: options.retry_delay(),
            }
        } else {
            RetryStrategy::InProcess {
                retries: options.retries,
                interval: options.retry_delay(),
            }
        }
    }
}

/// Applies the retry strategy and the acknowledgement rules to deliveries.
pub struct RetryCoordinator {
    strategy: RetryStrategy,
    publisher: Arc<Publisher>,
}

impl RetryCoordinator {
    /// Creates a coordinator.
    ///
    /// # Parameters
    /// * `strategy` - Strategy applied to recoverable failures
    /// * `publisher` - Publisher of the compensating reject events
    ///
    /// # Returns
    /// A new coordinator
    pub fn new(strategy: RetryStrategy, publisher: Arc<Publisher>) -> Self {
        RetryCoordinator {
            strategy,
            publisher,
        }
    }

    /// The strategy this coordinator applies.
    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    /// Processes one delivery through `route` and decides its acknowledgement.
    pub async fn process<T: Message>(
        &self,
        message: &InboundMessage,
        route: &dyn Route<T>,
        options: &SubscribeOptions<T>,
    ) -> Result<Acknowledgement, BusError> {
        let message_type = message.message_type.as_str();
        let context = &message.context;
        let context_id = context.id();
        let token = options.token();

        let Some(first) = decode::<T>(message) else {
            return Ok(Acknowledgement::Reject);
        };

        let mut next = Some(first);
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                warn!(message_type, %context_id, attempt, "processing cancelled");
                return Err(BusError::Cancelled);
            }

            let payload = match next.take() {
                Some(payload) => payload,
                None => match decode::<T>(message) {
                    Some(payload) => payload,
                    None => return Ok(Acknowledgement::Reject),
                },
            };

            attempt += 1;
            let err = match route.dispatch(payload, context, token).await {
                Ok(()) => {
                    debug!(message_type, %context_id, attempt, "message successfully processed");
                    return Ok(Acknowledgement::Ack);
                }
                Err(err) => err,
            };

            match err {
                HandlerError::Domain(err) => {
                    warn!(
                        error = err.to_string(),
                        message_type,
                        %context_id,
                        "domain failure, removing message from queue"
                    );
                    return Ok(Acknowledgement::Ack);
                }
                HandlerError::Rejected(err) => {
                    return self.reject(message, options, err).await;
                }
                err @ HandlerError::Failed(_) => match self.strategy {
                    RetryStrategy::InProcess { retries, interval } => {
                        if attempt <= retries {
                            warn!(
                                error = err.to_string(),
                                message_type,
                                %context_id,
                                attempt,
                                "error whiling handling msg, retrying"
                            );
                            wait(interval, token).await?;
                            continue;
                        }

                        let exhausted = DomainError::retries_exhausted(message_type, attempt);
                        return self.exhausted(message, options, exhausted, &err);
                    }
                    RetryStrategy::Requeue { retries, interval } => {
                        if context.retries() < retries {
                            warn!(
                                error = err.to_string(),
                                message_type,
                                %context_id,
                                retries = context.retries(),
                                "error whiling handling msg, requeuing for latter"
                            );
                            return Ok(Acknowledgement::RetryAfter(interval));
                        }

                        self.compensate(message, options, &err).await?;
                        let exhausted =
                            DomainError::retries_exhausted(message_type, context.retries() + 1);
                        return self.exhausted(message, options, exhausted, &err);
                    }
                },
            }
        }
    }

    /// Business rejection: compensate when a mapper exists, otherwise drop
    /// or propagate.
    async fn reject<T: Message>(
        &self,
        message: &InboundMessage,
        options: &SubscribeOptions<T>,
        err: MessageBusError,
    ) -> Result<Acknowledgement, BusError> {
        let err = HandlerError::Rejected(err);

        if options.error_mapper().is_some() {
            self.compensate(message, options, &err).await?;
            return Ok(Acknowledgement::Ack);
        }

        if options.rethrows() {
            return Err(err.into());
        }

        warn!(
            error = err.to_string(),
            message_type = message.message_type,
            context_id = %message.context.id(),
            "message rejected without compensation"
        );
        Ok(Acknowledgement::Ack)
    }

    /// Publishes the mapped reject event, if the subscription has a mapper.
    async fn compensate<T: Message>(
        &self,
        message: &InboundMessage,
        options: &SubscribeOptions<T>,
        err: &HandlerError,
    ) -> Result<(), BusError> {
        let Some(mapper) = options.error_mapper() else {
            return Ok(());
        };
        let Some(payload) = decode::<T>(message) else {
            return Ok(());
        };

        let rejection = mapper(&payload, err);
        let message_type = message.message_type.as_str();
        let context_id = message.context.id();

        handler::execute(
            self.publisher
                .publish_rejection(rejection.as_ref(), &message.context, options.token()),
            Handling::<(), BusError>::new()
                .on_success(|_| {
                    debug!(message_type, %context_id, "compensation event published")
                })
                .on_error(
                    |err| {
                        error!(
                            error = err.to_string(),
                            message_type,
                            %context_id,
                            "failure to publish compensation event"
                        )
                    },
                    true,
                ),
        )
        .await
        .map(|_| ())
    }

    fn exhausted<T: Message>(
        &self,
        message: &InboundMessage,
        options: &SubscribeOptions<T>,
        exhausted: DomainError,
        last: &HandlerError,
    ) -> Result<Acknowledgement, BusError> {
        error!(
            error = exhausted.to_string(),
            cause = last.to_string(),
            message_type = message.message_type,
            context_id = %message.context.id(),
            "too many attempts, removing message from queue"
        );

        if options.rethrows() {
            return Err(BusError::Domain(exhausted));
        }
        Ok(Acknowledgement::Ack)
    }
}

fn decode<T: Message>(message: &InboundMessage) -> Option<T> {
    match serde_json::from_slice::<T>(&message.payload) {
        Ok(payload) => Some(payload),
        Err(err) => {
            error!(
                error = err.to_string(),
                message_type = message.message_type,
                context_id = %message.context.id(),
                "failure to parse payload, rejecting message"
            );
            None
        }
    }
}

async fn wait(interval: Duration, token: &CancellationToken) -> Result<(), BusError> {
    if interval.is_zero() {
        return Ok(());
    }

    tokio::select! {
        _ = token.cancelled() => Err(BusError::Cancelled),
        _ = tokio::time::sleep(interval) => Ok(()),
    }
}

/// Builds a delivery for tests and in-memory transports.
pub fn inbound<M: Message>(
    message_type: &str,
    payload: &M,
    context: DomainContext,
) -> Result<InboundMessage, BusError> {
    Ok(InboundMessage {
        message_type: message_type.to_owned(),
        payload: serde_json::to_vec(payload)
            .map_err(|_| BusError::Serialization(message_type.to_owned()))?,
        context,
        exchange: String::new(),
        routing_key: String::new(),
        redelivered: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{Command, Event, MessageDescriptor, MessageRegistry, RejectEvent, Rejection},
        naming::NamingResolver,
        transport::MockTransport,
    };
    use futures_util::future::BoxFuture;
    use serde::{Deserialize, Serialize};
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct ChargeCard {
        amount: u32,
    }
    impl Command for ChargeCard {}

    #[derive(Debug, Serialize, Deserialize)]
    struct ChargeRejected {
        amount: u32,
    }
    impl Event for ChargeRejected {}
    impl RejectEvent for ChargeRejected {}

    /// Fails with the scripted errors, then succeeds.
    struct Scripted {
        calls: AtomicU32,
        failures: Mutex<Vec<HandlerError>>,
        always_fail: bool,
    }

    impl Scripted {
        fn failing(failures: Vec<HandlerError>) -> Self {
            Scripted {
                calls: AtomicU32::new(0),
                failures: Mutex::new(failures.into_iter().rev().collect()),
                always_fail: false,
            }
        }

        fn always_failing() -> Self {
            Scripted {
                calls: AtomicU32::new(0),
                failures: Mutex::new(vec![]),
                always_fail: true,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Route<ChargeCard> for Scripted {
        fn dispatch<'a>(
            &'a self,
            _message: ChargeCard,
            _context: &'a DomainContext,
            _token: &'a CancellationToken,
        ) -> BoxFuture<'a, Result<(), HandlerError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let outcome = if self.always_fail {
                Err(HandlerError::failed("downstream timeout"))
            } else {
                match self.failures.lock().unwrap().pop() {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            };
            Box::pin(async move { outcome })
        }
    }

    fn coordinator(strategy: RetryStrategy, transport: MockTransport) -> RetryCoordinator {
        let registry = MessageRegistry::builder()
            .command::<ChargeCard>(MessageDescriptor::new("Billing", "ChargeCard"))
            .reject::<ChargeRejected>(MessageDescriptor::new("Billing", "ChargeRejected"))
            .build()
            .unwrap();
        let options = RabbitMqOptions {
            exchange_name: "billing".into(),
            ..Default::default()
        };
        let resolver = Arc::new(NamingResolver::new(Arc::new(options), Arc::new(registry)));

        RetryCoordinator::new(strategy, Publisher::new(Arc::new(transport), resolver))
    }

    fn in_process(retries: u32) -> RetryStrategy {
        RetryStrategy::InProcess {
            retries,
            interval: Duration::ZERO,
        }
    }

    fn requeue(retries: u32) -> RetryStrategy {
        RetryStrategy::Requeue {
            retries,
            interval: Duration::from_secs(2),
        }
    }

    fn delivery(retries: u32) -> InboundMessage {
        inbound(
            "Billing.ChargeCard",
            &ChargeCard { amount: 10 },
            DomainContext::new().record_delivery(retries),
        )
        .unwrap()
    }

    fn with_mapper() -> SubscribeOptions<ChargeCard> {
        SubscribeOptions::new().on_error(|msg: &ChargeCard, _err: &HandlerError| {
            Box::new(ChargeRejected { amount: msg.amount }) as Box<dyn Rejection>
        })
    }

    fn silent_transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_publish().times(0);
        transport
    }

    #[test]
    fn strategy_follows_the_requeuing_switch() {
        let mut options = RabbitMqOptions::default();
        assert_eq!(
            RetryStrategy::from_options(&options),
            RetryStrategy::InProcess {
                retries: 3,
                interval: Duration::from_secs(2)
            }
        );

        options.with_requeuing = true;
        assert!(matches!(
            RetryStrategy::from_options(&options),
            RetryStrategy::Requeue { retries: 3, .. }
        ));
    }

    #[tokio::test]
    async fn in_process_retry_recovers_after_two_failures() {
        let route = Scripted::failing(vec![
            HandlerError::failed("timeout"),
            HandlerError::failed("timeout"),
        ]);

        let ack = coordinator(in_process(3), silent_transport())
            .process(&delivery(0), &route, &SubscribeOptions::new())
            .await
            .unwrap();

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(route.calls(), 3);
    }

    #[tokio::test]
    async fn in_process_retry_exhaustion_acks_after_four_attempts() {
        let route = Scripted::always_failing();

        let ack = coordinator(in_process(3), silent_transport())
            .process(&delivery(0), &route, &with_mapper())
            .await
            .unwrap();

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(route.calls(), 4);
    }

    #[tokio::test]
    async fn in_process_exhaustion_rethrows_on_request() {
        let route = Scripted::always_failing();

        let result = coordinator(in_process(1), silent_transport())
            .process(&delivery(0), &route, &SubscribeOptions::new().rethrow())
            .await;

        assert!(matches!(result, Err(BusError::Domain(_))));
        assert_eq!(route.calls(), 2);
    }

    #[tokio::test]
    async fn requeue_retries_until_the_delivery_count_reaches_the_bound() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| msg.exchange() == "billing.error")
            .times(1)
            .returning(|_| Ok(()));
        let coordinator = coordinator(requeue(2), transport);
        let options = with_mapper();

        for retries in 0..2 {
            let route = Scripted::always_failing();
            let ack = coordinator
                .process(&delivery(retries), &route, &options)
                .await
                .unwrap();
            assert_eq!(ack, Acknowledgement::RetryAfter(Duration::from_secs(2)));
            assert_eq!(route.calls(), 1);
        }

        let route = Scripted::always_failing();
        let ack = coordinator
            .process(&delivery(2), &route, &options)
            .await
            .unwrap();
        assert_eq!(ack, Acknowledgement::Ack);
    }

    #[tokio::test]
    async fn domain_errors_ack_without_compensation() {
        for strategy in [in_process(3), requeue(3)] {
            let route = Scripted::failing(vec![DomainError::new("invalid card").into()]);

            let ack = coordinator(strategy, silent_transport())
                .process(&delivery(0), &route, &with_mapper())
                .await
                .unwrap();

            assert_eq!(ack, Acknowledgement::Ack);
            assert_eq!(route.calls(), 1);
        }
    }

    #[tokio::test]
    async fn business_rejection_publishes_compensation() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| {
                msg.message_type() == "Billing.ChargeRejected"
                    && msg.payload == br#"{"amount":10}"#.to_vec()
            })
            .times(1)
            .returning(|_| Ok(()));
        let route = Scripted::failing(vec![MessageBusError::new("card blocked").into()]);

        let ack = coordinator(in_process(3), transport)
            .process(&delivery(0), &route, &with_mapper())
            .await
            .unwrap();

        assert_eq!(ack, Acknowledgement::Ack);
        assert_eq!(route.calls(), 1);
    }

    #[tokio::test]
    async fn business_rejection_without_mapper_rethrows_on_request() {
        let route = Scripted::failing(vec![MessageBusError::new("card blocked").into()]);
        let coordinator = coordinator(in_process(3), silent_transport());

        let result = coordinator
            .process(&delivery(0), &route, &SubscribeOptions::new().rethrow())
            .await;
        assert!(matches!(result, Err(BusError::Rejected(_))));

        let route = Scripted::failing(vec![MessageBusError::new("card blocked").into()]);
        let ack = coordinator
            .process(&delivery(0), &route, &SubscribeOptions::new())
            .await
            .unwrap();
        assert_eq!(ack, Acknowledgement::Ack);
    }

    #[tokio::test]
    async fn compensation_failure_propagates() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .returning(|_| Err(crate::errors::AmqpError::PublishingError("x".into())));
        let route = Scripted::failing(vec![MessageBusError::new("card blocked").into()]);

        let result = coordinator(in_process(3), transport)
            .process(&delivery(0), &route, &with_mapper())
            .await;

        assert!(matches!(result, Err(BusError::Transport(_))));
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_without_dispatch() {
        let route = Scripted::failing(vec![]);
        let mut message = delivery(0);
        message.payload = b"not json".to_vec();

        let ack = coordinator(in_process(3), silent_transport())
            .process(&message, &route, &SubscribeOptions::new())
            .await
            .unwrap();

        assert_eq!(ack, Acknowledgement::Reject);
        assert_eq!(route.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_dispatch() {
        let route = Scripted::failing(vec![]);
        let token = CancellationToken::new();
        token.cancel();

        let result = coordinator(in_process(3), silent_transport())
            .process(
                &delivery(0),
                &route,
                &SubscribeOptions::new().cancellation(token),
            )
            .await;

        assert!(matches!(result, Err(BusError::Cancelled)));
        assert_eq!(route.calls(), 0);
    }
}
