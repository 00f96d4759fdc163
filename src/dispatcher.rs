// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Domain Dispatcher
//!
//! The business side of a subscription. A `Dispatcher` receives decoded
//! commands and events with their context and reports the outcome as a
//! `HandlerError` classification; the retry coordinator decides what the
//! broker is told.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    context::DomainContext,
    errors::HandlerError,
    message::{Command, Event},
};

/// Routes decoded messages to their business handlers.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch_command<C: Command>(
        &self,
        command: C,
        context: &DomainContext,
        token: &CancellationToken,
    ) -> Result<(), HandlerError>;

    async fn dispatch_event<E: Event>(
        &self,
        event: E,
        context: &DomainContext,
        token: &CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// One dispatch entry point for a message type, fixed at subscription time.
pub trait Route<T>: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        message: T,
        context: &'a DomainContext,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Sends messages through `Dispatcher::dispatch_command`.
pub struct CommandRoute<D>(pub Arc<D>);

/// Sends messages through `Dispatcher::dispatch_event`.
pub struct EventRoute<D>(pub Arc<D>);

impl<D, C> Route<C> for CommandRoute<D>
where
    D: Dispatcher,
    C: Command,
{
    fn dispatch<'a>(
        &'a self,
        message: C,
        context: &'a DomainContext,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        self.0.dispatch_command(message, context, token)
    }
}

impl<D, E> Route<E> for EventRoute<D>
where
    D: Dispatcher,
    E: Event,
{
    fn dispatch<'a>(
        &'a self,
        message: E,
        context: &'a DomainContext,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        self.0.dispatch_event(message, context, token)
    }
}
