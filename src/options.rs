// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bus Configuration
//!
//! `RabbitMqOptions` is bound once at startup from a named configuration
//! section (an optional `config/messagebus.*` file, then environment variables
//! such as `RABBITMQ__EXCHANGE_NAME` overriding it) and shared read-only
//! afterwards.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use crate::errors::BusError;

/// Default configuration section name
pub const DEFAULT_SECTION: &str = "rabbitmq";
/// Default location of the optional configuration file (without extension)
pub const DEFAULT_CONFIG_FILE: &str = "config/messagebus";

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_owned()
}

fn default_retries() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    2
}

fn default_prefetch() -> u16 {
    1
}

fn configuration_error(err: ConfigError) -> BusError {
    BusError::Configuration(err.to_string())
}

/// Per-type override of the queue name and routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MessageNamingConvention {
    /// Full name of the message type (`namespace.Name`)
    pub type_name: String,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub routing_key: Option<String>,
}

/// Process-wide options for the bus and its broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RabbitMqOptions {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub vhost: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_user")]
    pub password: String,
    #[serde(default)]
    pub connection_name: String,

    /// Exchange used when a message type does not name its own
    #[serde(default)]
    pub exchange_name: String,
    /// Retry budget shared by both retry strategies
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Wait between retries, in seconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
    /// Selects broker-level delayed requeue instead of in-process retry
    #[serde(default)]
    pub with_requeuing: bool,
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    #[serde(default)]
    pub message_naming_conventions: Vec<MessageNamingConvention>,
}

impl Default for RabbitMqOptions {
    fn default() -> Self {
        RabbitMqOptions {
            host: default_host(),
            port: default_port(),
            vhost: String::new(),
            user: default_user(),
            password: default_user(),
            connection_name: String::new(),
            exchange_name: String::new(),
            retries: default_retries(),
            retry_interval: default_retry_interval(),
            with_requeuing: false,
            prefetch: default_prefetch(),
            message_naming_conventions: vec![],
        }
    }
}

impl RabbitMqOptions {
    /// Loads the options from the default file and the environment.
    pub fn load(section: &str) -> Result<Self, BusError> {
        Self::load_from(DEFAULT_CONFIG_FILE, section)
    }

    /// Loads the options from `file` (optional) and environment variables
    /// prefixed with the upper-cased `section`.
    ///
    /// The `[section]` table of the file is the base layer and environment
    /// variables override it key by key. A missing file or section falls
    /// back to the defaults; a section that does not deserialize fails.
    ///
    /// # Parameters
    /// * `file` - Path of the configuration file, with or without extension
    /// * `section` - Name of the section holding the options
    ///
    /// # Returns
    /// The validated options, or `BusError::Configuration`
    pub fn load_from(file: &str, section: &str) -> Result<Self, BusError> {
        let from_file = Config::builder()
            .add_source(File::with_name(file).required(false))
            .build()
            .map_err(configuration_error)?;

        let mut builder = Config::builder();
        match from_file.get_table(section) {
            Ok(table) => {
                for (key, value) in table {
                    builder = builder
                        .set_default(key, value)
                        .map_err(configuration_error)?;
                }
            }
            Err(ConfigError::NotFound(_)) => {}
            Err(err) => return Err(configuration_error(err)),
        }

        let options = builder
            .add_source(
                Environment::with_prefix(&section.to_uppercase())
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(configuration_error)?
            .try_deserialize::<RabbitMqOptions>()
            .map_err(configuration_error)?;

        options.validate()?;
        Ok(options)
    }

    /// Rejects option combinations that cannot work at runtime.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.prefetch == 0 {
            return Err(BusError::Configuration(
                "prefetch must be greater than zero".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for convention in &self.message_naming_conventions {
            if !seen.insert(convention.type_name.as_str()) {
                return Err(BusError::Configuration(format!(
                    "duplicated naming convention for `{}`",
                    convention.type_name
                )));
            }
        }

        Ok(())
    }

    /// `retry_interval` as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_interval)
    }

    /// Connection URI built from the broker options.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// Builds the immutable lookup table for the naming conventions.
    pub fn naming_conventions(&self) -> NamingConventions {
        NamingConventions::new(&self.message_naming_conventions)
    }
}

/// Immutable map of naming conventions keyed by type full name.
#[derive(Debug, Clone, Default)]
pub struct NamingConventions {
    by_type: HashMap<String, MessageNamingConvention>,
}

impl NamingConventions {
    pub fn new(conventions: &[MessageNamingConvention]) -> Self {
        NamingConventions {
            by_type: conventions
                .iter()
                .map(|c| (c.type_name.clone(), c.clone()))
                .collect(),
        }
    }

    pub fn get(&self, type_name: &str) -> Option<&MessageNamingConvention> {
        self.by_type.get(type_name)
    }

    pub fn queue_name(&self, type_name: &str) -> Option<&str> {
        self.get(type_name).and_then(|c| c.queue_name.as_deref())
    }

    pub fn routing_key(&self, type_name: &str) -> Option<&str> {
        self.get(type_name).and_then(|c| c.routing_key.as_deref())
    }
}
