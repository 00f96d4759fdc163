// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Opens the connection and the channel the RabbitMQ transport works on.

use crate::{errors::AmqpError, options::RabbitMqOptions};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Connection name used when the options leave it empty
pub const DEFAULT_CONNECTION_NAME: &str = "messagebus";

/// Connects to the broker described by `options` and opens a channel.
///
/// Both handles are returned: dropping the connection closes the channel.
pub async fn new_amqp_channel(
    options: &RabbitMqOptions,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!(host = options.host, port = options.port, "creating amqp connection...");

    let name = if options.connection_name.is_empty() {
        DEFAULT_CONNECTION_NAME.to_owned()
    } else {
        options.connection_name.clone()
    };
    let properties = ConnectionProperties::default().with_connection_name(LongString::from(name));

    let conn = Connection::connect(&options.amqp_uri(), properties)
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            AmqpError::ConnectionError
        })?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}
