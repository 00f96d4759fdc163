// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod amqp;
pub mod channel;
pub mod configuration;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod naming;
pub mod options;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod subscriber;
pub mod topology;
pub mod transport;

pub use amqp::RabbitMQTransport;
pub use context::DomainContext;
pub use dispatcher::Dispatcher;
pub use errors::{BusError, DomainError, HandlerError, MessageBusError};
pub use message::{Command, Event, MessageDescriptor, MessageRegistry, RejectEvent};
pub use options::RabbitMqOptions;
pub use publisher::Publisher;
pub use subscriber::{SubscribeOptions, Subscriber};
pub use transport::{Acknowledgement, Transport};
