// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for the publish pipeline, the durable store and the
//! delivery tasks.
//!
//! Publisher-side errors are synchronous and surfaced directly to the
//! caller. Delivery-side errors never reach the publisher; they are
//! classified into a [`ReasonCode`] and absorbed by the task's
//! retry/back-off loop.

use pubsub_config::{SubKey, TopicName};

/// Errors surfaced to the caller of a publish operation.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    /// The named topic is not registered with the broker.
    #[error("topic `{topic}` not found")]
    TopicNotFound {
        /// The topic name that failed to resolve.
        topic: String,
    },

    /// The topic exists but does not accept publications.
    #[error("topic `{topic}` is inactive")]
    TopicInactive {
        /// The inactive topic.
        topic: TopicName,
    },

    /// Persisting the batch would exceed the topic's GD depth limit.
    #[error(
        "topic `{topic}` GD depth limit reached (depth {current_depth} + incoming {incoming} > max {max_depth_gd})"
    )]
    DepthExceeded {
        /// The topic whose depth limit was hit.
        topic: TopicName,
        /// Depth observed at check time.
        current_depth: usize,
        /// Number of GD messages in the rejected batch.
        incoming: usize,
        /// Configured depth limit.
        max_depth_gd: usize,
    },

    /// The caller could not be resolved to an authorized publish pattern.
    #[error("no publish pattern authorizes this caller for topic `{topic}`")]
    Forbidden {
        /// The topic the caller attempted to publish to.
        topic: String,
    },

    /// A malformed publish request, e.g. no payload at all.
    #[error("invalid publish request: {reason}")]
    InvalidRequest {
        /// Why the request was rejected.
        reason: String,
    },

    /// The durable store failed while persisting GD messages.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by a durable store implementation.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// The store could not complete a transactional write.
    #[error("store transaction failed: {reason}")]
    Transaction {
        /// Store-specific failure description.
        reason: String,
    },

    /// The store could not serve a read.
    #[error("store query failed: {reason}")]
    Query {
        /// Store-specific failure description.
        reason: String,
    },
}

/// Classification of a failed delivery attempt, driving the back-off
/// decision in the task's outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    /// Transport-level failure; retried after the socket-error back-off.
    Io,
    /// Unrecoverable invocation failure; the task stops itself and the
    /// owning connection must be re-established for delivery to resume.
    RuntimeInvoke,
    /// Anything else; retried after the longer back-off.
    Other,
    /// Nothing was eligible for delivery this iteration.
    NoMessages,
}

/// A failure inside one delivery attempt.
#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    /// The delivery callback reported a transport failure.
    #[error("delivery transport error: {0}")]
    Io(String),

    /// The delivery callback could not be invoked at all.
    #[error("delivery invocation error: {0}")]
    RuntimeInvoke(String),

    /// The confirmation callback or the store failed, or another
    /// unclassified error occurred.
    #[error("delivery error: {0}")]
    Other(String),
}

impl DeliveryError {
    /// Maps the error onto its outer-loop reason code.
    #[must_use]
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Io(_) => ReasonCode::Io,
            Self::RuntimeInvoke(_) => ReasonCode::RuntimeInvoke,
            Self::Other(_) => ReasonCode::Other,
        }
    }
}

impl From<StoreError> for DeliveryError {
    fn from(value: StoreError) -> Self {
        Self::Other(value.to_string())
    }
}

/// Errors raised by delivery task control operations.
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// The delivery loop did not exit within the stop deadline.
    #[error("delivery task for `{sub_key}` did not stop within {waited_ms} ms")]
    StopTimeout {
        /// The subscription whose task failed to stop.
        sub_key: SubKey,
        /// How long the stop call waited.
        waited_ms: u64,
    },

    /// The subscription is not registered with the broker.
    #[error("no subscription with key `{sub_key}`")]
    SubscriptionNotFound {
        /// The unknown key.
        sub_key: String,
    },

    /// A subscription with this key is already registered.
    #[error("subscription with key `{sub_key}` already exists")]
    SubscriptionExists {
        /// The duplicate key.
        sub_key: SubKey,
    },
}
