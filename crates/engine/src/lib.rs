// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Embedded publish/subscribe broker layer.
//!
//! Producers publish messages to named topics; independent subscribers
//! receive them pushed through an injected delivery callback or by
//! polling. Two durability classes exist: GD (guaranteed-delivery)
//! messages are persisted through the [`store::GdStore`] seam before their
//! ids are returned, non-GD messages live only in memory for lower
//! latency. Semantics are at-least-once; idempotence is left to consumers.
//!
//! # Architecture
//!
//! - [`broker::PubSubBroker`] owns the topic and subscription registries
//!   and wires everything together.
//! - [`publisher::Publisher`] runs the publish pipeline: authorization,
//!   durability resolution, depth limits, persistence and fan-out.
//! - [`task::DeliveryTask`] is one concurrent worker per subscription,
//!   draining its [`queue::DeliveryQueue`] with retry and back-off.
//! - [`hook`] holds the publish- and delivery-side extension seams,
//!   [`store`] the durable store seam and its in-memory default.
//!
//! The wire transports that move bytes, the relational persistence layer,
//! admin CRUD and permission management are external collaborators behind
//! the [`publisher::PublishAuthorizer`], [`task::DeliveryCallback`],
//! [`task::ConfirmCallback`] and [`store::GdStore`] traits.

pub mod broker;
pub mod error;
pub mod hook;
pub mod message;
pub mod meta;
pub mod metrics;
pub mod publisher;
pub mod queue;
pub mod store;
pub mod task;

#[cfg(test)]
mod tests;

pub use broker::{BrokerOptions, PubSubBroker};
pub use error::{DeliveryError, PublishError, ReasonCode, StoreError, TaskError};
pub use message::Message;
pub use publisher::{PubRequest, Publisher, PublishResponse};
pub use task::{DeliveryBatch, DeliveryTask};
