// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Hook seams invoked synchronously during publish and delivery.
//!
//! Absence of a hook is the default; callers wire one in through
//! configuration rather than the algorithms null-checking everywhere.

use crate::message::Message;
use pubsub_config::topic::TopicConfig;
use pubsub_config::SubKey;
use std::sync::Arc;

/// Verdict of a before-publish hook for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishHookAction {
    /// Keep the message in the publish batch.
    Deliver,
    /// Drop the message silently; it is logged and excluded from further
    /// processing, with no error returned to the caller.
    Skip,
}

/// Per-topic extension point, run once per built message before
/// persistence or fan-out.
pub trait PublishHook: Send + Sync {
    /// Decides whether `msg` proceeds through the publish pipeline.
    fn before_publish(&self, topic: &TopicConfig, msg: &Message) -> PublishHookAction;
}

/// The three output buckets a before-delivery hook populates in place.
#[derive(Debug, Default)]
pub struct DeliveryBuckets {
    /// Messages to delete without ever delivering them.
    pub delete: Vec<Arc<Message>>,
    /// Messages to hand to the delivery callback.
    pub deliver: Vec<Arc<Message>>,
    /// Messages to leave queued, untouched, for a later attempt.
    pub skip: Vec<Arc<Message>>,
}

/// Per-subscription extension point, run once per delivery attempt with
/// the full candidate batch.
pub trait DeliveryHook: Send + Sync {
    /// Distributes `batch` over the buckets. Messages the hook leaves out
    /// of every bucket are treated as skipped.
    fn before_delivery(
        &self,
        topic_id: pubsub_config::TopicId,
        sub_key: &SubKey,
        batch: &[Arc<Message>],
        buckets: &mut DeliveryBuckets,
    );
}
