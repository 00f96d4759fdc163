// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Domain Context
//!
//! The correlation envelope threaded through publish and consume. It is created
//! by the caller at publish time and only the transport's retry-count stage
//! writes to it afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carrying the context identifier
pub const CONTEXT_ID_HEADER: &str = "x-context-id";
/// Header carrying the context creation timestamp (RFC 3339)
pub const CONTEXT_CREATED_AT_HEADER: &str = "x-context-created-at";

/// Identifies one message and its current processing attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainContext {
    id: Uuid,
    retries: u32,
    created_at: DateTime<Utc>,
    delivered_at: Option<DateTime<Utc>>,
}

impl Default for DomainContext {
    fn default() -> Self {
        DomainContext::new()
    }
}

impl DomainContext {
    pub fn new() -> Self {
        DomainContext {
            id: Uuid::new_v4(),
            retries: 0,
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    /// Rebuilds a context received from the broker.
    pub fn restore(id: Uuid, created_at: DateTime<Utc>) -> Self {
        DomainContext {
            id,
            retries: 0,
            created_at,
            delivered_at: None,
        }
    }

    /// Identifier kept across publish, retries and compensation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of broker redeliveries observed for this message.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    /// Stamps the delivery count reported by the broker.
    ///
    /// Called once per delivery by the transport, before the context reaches
    /// any subscriber. The count only moves forward.
    pub fn record_delivery(mut self, delivery_count: u32) -> Self {
        self.retries = self.retries.max(delivery_count);
        self.delivered_at = Some(Utc::now());
        self
    }
}
