// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Bus
//!
//! Two layers of errors live here. `AmqpError` covers broker round-trips
//! (connection, declaration, publish, ack). `BusError` is what the public API
//! returns, and `HandlerError` is the outcome a domain dispatcher reports back
//! to the retry coordinator.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error requeuing a message
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error creating a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),
}

/// Validation or business failure raised by a domain handler.
///
/// Never retried: a validation outcome does not change on redelivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DomainError {
    pub message: String,
}

impl DomainError {
    pub fn new(message: impl Into<String>) -> Self {
        DomainError {
            message: message.into(),
        }
    }

    /// Describes a retry budget that ran out for the given message type.
    pub fn retries_exhausted(message_type: &str, attempts: u32) -> Self {
        DomainError::new(format!(
            "message `{message_type}` could not be processed after {attempts} attempts"
        ))
    }
}

/// Explicit business-rule rejection.
///
/// Compensated through the subscription's error mapper instead of retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct MessageBusError {
    pub message: String,
    pub code: Option<String>,
}

impl MessageBusError {
    pub fn new(message: impl Into<String>) -> Self {
        MessageBusError {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Outcome of a failed domain dispatch.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Permanent failure, acknowledged after logging
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Business rejection, compensated with a reject event
    #[error(transparent)]
    Rejected(#[from] MessageBusError),

    /// Anything else, treated as transient and retried
    #[error("handler failure: {0}")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Wraps an arbitrary error as a recoverable failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        HandlerError::Failed(err.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }
}

/// Errors surfaced by the publisher, the subscriber and the retry coordinator.
#[derive(Error, Debug)]
pub enum BusError {
    /// Message type was never added to the registry
    #[error("message type `{0}` is not registered")]
    UnregisteredMessage(String),

    /// Two explicit queue-name overrides disagree
    #[error("conflicting queue names for `{message_type}`: `{first}` and `{second}`")]
    ConflictingQueueName {
        message_type: String,
        first: String,
        second: String,
    },

    /// Abstract event types have no stable topology
    #[error("cannot publish abstract event type `{0}`")]
    AbstractEvent(String),

    /// Any other setup-time misconfiguration
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failure to serialize `{0}`")]
    Serialization(String),

    #[error(transparent)]
    Transport(#[from] AmqpError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Rejected(#[from] MessageBusError),

    /// Unrecovered handler failure propagated on request
    #[error("unhandled failure: {0}")]
    Unhandled(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl BusError {
    /// Setup-time errors that must stop a subscription before any broker call.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BusError::UnregisteredMessage(_)
                | BusError::ConflictingQueueName { .. }
                | BusError::AbstractEvent(_)
                | BusError::Configuration(_)
        )
    }
}

impl From<HandlerError> for BusError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Domain(e) => BusError::Domain(e),
            HandlerError::Rejected(e) => BusError::Rejected(e),
            HandlerError::Failed(e) => BusError::Unhandled(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_handler_errors() {
        assert!(HandlerError::failed("timeout").is_recoverable());
        assert!(!HandlerError::from(DomainError::new("invalid")).is_recoverable());
        assert!(!HandlerError::from(MessageBusError::new("rejected")).is_recoverable());
    }

    #[test]
    fn exhaustion_message_names_type_and_attempts() {
        let err = DomainError::retries_exhausted("Orders.PlaceOrder", 4);
        assert_eq!(
            err.to_string(),
            "message `Orders.PlaceOrder` could not be processed after 4 attempts"
        );
    }

    #[test]
    fn configuration_errors_are_flagged() {
        assert!(BusError::AbstractEvent("x".into()).is_configuration());
        assert!(!BusError::Cancelled.is_configuration());
        assert!(!BusError::from(AmqpError::ConnectionError).is_configuration());
    }
}
