// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Turns a lapin delivery into an `InboundMessage`, asks the subscription's
//! handler for a decision and settles the delivery accordingly:
//!
//! | decision              | broker action                                   |
//! |-----------------------|-------------------------------------------------|
//! | `Ack`                 | ack                                             |
//! | `RetryAfter`          | nack without requeue, parked in `{queue}-retry` |
//! | `Reject` / error      | copy to `{queue}-dlq`, then ack                 |
//! | cancelled             | nack with requeue                               |

use crate::{
    context::{DomainContext, CONTEXT_CREATED_AT_HEADER, CONTEXT_ID_HEADER},
    errors::{AmqpError, BusError},
    naming::ResolvedTopology,
    otel,
    transport::{Acknowledgement, DeliveryHandler, InboundMessage},
};
use chrono::{DateTime, Utc};
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
    Channel,
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, time::Duration};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Consumes one delivery of the subscription described by `topology`.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    topology: &ResolvedTopology,
    handler: &dyn DeliveryHandler,
    channel: &Channel,
) -> Result<(), AmqpError> {
    let headers = extract_header_properties(&delivery.properties);
    let message_type = headers
        .message_type
        .clone()
        .unwrap_or_else(|| topology.message_type.clone());

    let (_ctx, mut span) =
        otel::new_span(&delivery.properties, tracer, &message_type, topology.queue.name());

    debug!(
        message_type,
        exchange = delivery.exchange.as_str(),
        count = headers.count,
        "received"
    );

    if message_type != topology.message_type {
        let msg = "removing message from queue - reason: unsupported msg type";
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });
        warn!(message_type, expected = topology.message_type, "{}", msg);

        return settle(delivery, topology, Acknowledgement::Ack, channel, &mut span).await;
    }

    let context = headers.context().record_delivery(headers.count);
    let context_id = context.id();
    let message = InboundMessage {
        message_type,
        payload: delivery.data.clone(),
        context,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
    };

    if topology.consumer.is_auto_ack() {
        match handler.handle(message).await {
            Ok(Acknowledgement::Ack) => span.set_status(Status::Ok),
            Ok(decision) => {
                warn!(?decision, %context_id, "auto-ack delivery cannot be settled, message dropped");
                span.set_status(Status::Error {
                    description: Cow::from("auto-ack message dropped"),
                });
            }
            Err(err) => {
                error!(error = err.to_string(), %context_id, "failure processing auto-ack message");
                span.record_error(&err);
            }
        }
        return Ok(());
    }

    match handler.handle(message).await {
        Ok(decision) => settle(delivery, topology, decision, channel, &mut span).await,
        Err(BusError::Cancelled) => {
            warn!(%context_id, "processing cancelled, requeuing message");
            nack(delivery, true, &mut span).await
        }
        Err(err) => {
            error!(error = err.to_string(), %context_id, "unrecovered failure");
            span.record_error(&err);
            settle(delivery, topology, Acknowledgement::Reject, channel, &mut span).await
        }
    }
}

async fn settle(
    delivery: &Delivery,
    topology: &ResolvedTopology,
    decision: Acknowledgement,
    channel: &Channel,
    span: &mut BoxedSpan,
) -> Result<(), AmqpError> {
    match decision {
        Acknowledgement::Ack => {
            ack(delivery, span).await?;
            span.set_status(Status::Ok);
            Ok(())
        }
        Acknowledgement::RetryAfter(delay) => {
            if topology.queue.retry_name().is_some() {
                debug!("requeuing for latter");
                return nack(delivery, false, span).await;
            }

            // no retry queue to park it in
            sleep(delay).await;
            nack(delivery, true, span).await
        }
        Acknowledgement::Reject => {
            let Some(dlq_name) = topology.queue.dlq_name() else {
                return nack(delivery, false, span).await;
            };

            error!(dlq = dlq_name, "sending to dlq");
            if let Err(e) = channel
                .basic_publish(
                    "",
                    dlq_name,
                    BasicPublishOptions::default(),
                    &delivery.data,
                    delivery.properties.clone(),
                )
                .await
            {
                error!(error = e.to_string(), "error whiling sending to dlq");
                span.record_error(&e);
                span.set_status(Status::Error {
                    description: Cow::from("msg was not sent to dlq"),
                });
                return Err(AmqpError::PublishingToDQLError);
            }

            ack(delivery, span).await
        }
    }
}

async fn ack(delivery: &Delivery, span: &mut BoxedSpan) -> Result<(), AmqpError> {
    delivery
        .ack(BasicAckOptions { multiple: false })
        .await
        .map_err(|e| {
            error!(error = e.to_string(), "error whiling ack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
            AmqpError::AckMessageError
        })
}

async fn nack(delivery: &Delivery, requeue: bool, span: &mut BoxedSpan) -> Result<(), AmqpError> {
    delivery
        .nack(BasicNackOptions {
            multiple: false,
            requeue,
        })
        .await
        .map_err(|e| {
            error!(error = e.to_string(), requeue, "error whiling nack msg");
            span.record_error(&e);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
            if requeue {
                AmqpError::RequeuingMessageError
            } else {
                AmqpError::NackMessageError
            }
        })
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// What the consumer reads from the AMQP properties of a delivery.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct DeliveryHeaders {
    pub(crate) message_type: Option<String>,
    pub(crate) count: u32,
    pub(crate) context_id: Option<Uuid>,
    pub(crate) created_at: Option<DateTime<Utc>>,
}

impl DeliveryHeaders {
    /// Rebuilds the publisher's context, or starts a new one when the
    /// publisher sent none.
    pub(crate) fn context(&self) -> DomainContext {
        match self.context_id {
            Some(id) => DomainContext::restore(id, self.created_at.unwrap_or_else(Utc::now)),
            None => DomainContext::new(),
        }
    }
}

/// Reads the message type, the `x-death` retry count and the context
/// headers.
pub(crate) fn extract_header_properties(props: &AMQPProperties) -> DeliveryHeaders {
    let headers = match props.headers() {
        Some(val) => val.to_owned(),
        None => FieldTable::default(),
    };
    let inner = headers.inner();

    let count = inner
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(AMQPValue::as_array)
        .and_then(|arr| arr.as_slice().first())
        .and_then(AMQPValue::as_field_table)
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(AMQPValue::as_long_long_int)
        .unwrap_or_default();

    let context_id = string_header(inner.get(CONTEXT_ID_HEADER))
        .or_else(|| props.correlation_id().as_ref().map(|id| id.to_string()))
        .and_then(|id| Uuid::parse_str(&id).ok());

    let created_at = string_header(inner.get(CONTEXT_CREATED_AT_HEADER))
        .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
        .map(|ts| ts.with_timezone(&Utc));

    DeliveryHeaders {
        message_type: props
            .kind()
            .as_ref()
            .map(|kind| kind.to_string())
            .filter(|kind| !kind.is_empty()),
        count: u32::try_from(count).unwrap_or_default(),
        context_id,
        created_at,
    }
}

fn string_header(value: Option<&AMQPValue>) -> Option<String> {
    match value? {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok().map(str::to_owned),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::{
        types::{FieldArray, LongString, ShortString},
        BasicProperties,
    };
    use std::collections::BTreeMap;

    fn x_death(count: i64) -> AMQPValue {
        let mut entry = BTreeMap::new();
        entry.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(count),
        );
        AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
            FieldTable::from(entry),
        )]))
    }

    #[test]
    fn reads_retry_count_and_context() {
        let id = Uuid::new_v4();
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from(AMQP_HEADERS_X_DEATH), x_death(2));
        headers.insert(
            ShortString::from(CONTEXT_ID_HEADER),
            AMQPValue::LongString(LongString::from(id.to_string())),
        );
        headers.insert(
            ShortString::from(CONTEXT_CREATED_AT_HEADER),
            AMQPValue::LongString(LongString::from("2025-01-02T03:04:05Z")),
        );
        let props = BasicProperties::default()
            .with_kind(ShortString::from("Shop.PlaceOrder"))
            .with_headers(FieldTable::from(headers));

        let parsed = extract_header_properties(&props);

        assert_eq!(parsed.message_type.as_deref(), Some("Shop.PlaceOrder"));
        assert_eq!(parsed.count, 2);
        assert_eq!(parsed.context_id, Some(id));

        let context = parsed.context().record_delivery(parsed.count);
        assert_eq!(context.id(), id);
        assert_eq!(context.retries(), 2);
        assert_eq!(context.created_at().to_rfc3339(), "2025-01-02T03:04:05+00:00");
    }

    #[test]
    fn first_delivery_has_no_retries() {
        let parsed = extract_header_properties(&BasicProperties::default());

        assert_eq!(parsed, DeliveryHeaders::default());
        assert_eq!(parsed.context().retries(), 0);
    }

    #[test]
    fn correlation_id_restores_the_context() {
        let id = Uuid::new_v4();
        let props = BasicProperties::default().with_correlation_id(ShortString::from(id.to_string()));

        assert_eq!(extract_header_properties(&props).context().id(), id);
    }
}
