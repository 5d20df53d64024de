// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-subscription configuration.
//!
//! One subscription binds an endpoint to a topic and parameterizes the
//! delivery task that serves its queue: batch sizing, wake-up cadence and
//! the back-off applied after failed deliveries. The engine holds the
//! current value behind an `ArcSwap` so updates apply between delivery
//! iterations without restarting the task.

use crate::names::{EndpointId, SubKey, TopicId, TopicName};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How messages leave a subscription's delivery queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    /// The task pushes messages to the configured callback as they arrive.
    #[default]
    Notify,
    /// Like `notify`, but delivery failures are reported as transport errors
    /// rather than invocation errors.
    WebSocket,
    /// The task only accumulates; consumers drain the queue explicitly.
    Pull,
}

impl DeliveryMethod {
    /// True for methods where the task actively delivers messages itself.
    #[must_use]
    pub fn is_notify(self) -> bool {
        matches!(self, Self::Notify | Self::WebSocket)
    }
}

/// Configuration of one subscription and its delivery task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionConfig {
    /// Unique key addressing this subscription's queue and task.
    pub sub_key: SubKey,
    /// Topic the subscription receives messages from.
    pub topic_name: TopicName,
    /// Numeric id of that topic.
    pub topic_id: TopicId,
    /// Id of the subscribing endpoint.
    pub endpoint_id: EndpointId,
    /// Display name of the subscribing endpoint, used in logs.
    pub endpoint_name: String,
    /// Inactive subscriptions keep their queue but deliver nothing.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// How messages leave the queue.
    #[serde(default)]
    pub delivery_method: DeliveryMethod,
    /// Maximum number of messages taken from the queue per iteration.
    #[serde(default = "default_delivery_batch_size")]
    pub delivery_batch_size: usize,
    /// When the batch holds exactly one message, whether the callback still
    /// receives a list rather than the bare message.
    #[serde(default = "default_true")]
    pub wrap_one_msg_in_list: bool,
    /// A delivery iteration runs at least once per this interval even when
    /// no new message arrived.
    #[serde(default = "default_task_delivery_interval_ms")]
    pub task_delivery_interval_ms: u64,
    /// Back-off after a delivery failure classified as a transport error.
    #[serde(default = "default_wait_sock_err_s")]
    pub wait_sock_err_s: u64,
    /// Back-off after any other delivery failure.
    #[serde(default = "default_wait_non_sock_err_s")]
    pub wait_non_sock_err_s: u64,
    /// Messages whose delivery count reaches this value are deleted instead
    /// of retried. `None` retries forever.
    #[serde(default)]
    pub delivery_max_retry: Option<u32>,
    /// Upper bound on how long one delivery attempt may block; `Stop` waits
    /// twice this long for an in-flight iteration to finish.
    #[serde(default = "default_read_timeout_s")]
    pub read_timeout_s: u64,
}

impl SubscriptionConfig {
    /// Builds a subscription config with defaults for all tuning knobs.
    #[must_use]
    pub fn new(
        sub_key: SubKey,
        topic_name: TopicName,
        topic_id: TopicId,
        endpoint_id: EndpointId,
        endpoint_name: impl Into<String>,
    ) -> Self {
        Self {
            sub_key,
            topic_name,
            topic_id,
            endpoint_id,
            endpoint_name: endpoint_name.into(),
            is_active: true,
            delivery_method: DeliveryMethod::default(),
            delivery_batch_size: default_delivery_batch_size(),
            wrap_one_msg_in_list: true,
            task_delivery_interval_ms: default_task_delivery_interval_ms(),
            wait_sock_err_s: default_wait_sock_err_s(),
            wait_non_sock_err_s: default_wait_non_sock_err_s(),
            delivery_max_retry: None,
            read_timeout_s: default_read_timeout_s(),
        }
    }

    /// Returns validation errors for this subscription configuration.
    #[must_use]
    pub fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.endpoint_name.trim().is_empty() {
            errors.push(format!("{path_prefix}.endpoint_name must be non-empty"));
        }
        if self.delivery_batch_size == 0 {
            errors.push(format!(
                "{path_prefix}.delivery_batch_size must be greater than 0"
            ));
        }
        if self.task_delivery_interval_ms == 0 {
            errors.push(format!(
                "{path_prefix}.task_delivery_interval_ms must be greater than 0"
            ));
        }
        if self.read_timeout_s == 0 {
            errors.push(format!("{path_prefix}.read_timeout_s must be greater than 0"));
        }
        if self.delivery_max_retry == Some(0) {
            errors.push(format!(
                "{path_prefix}.delivery_max_retry must be greater than 0 when set"
            ));
        }
        errors
    }
}

const fn default_true() -> bool {
    true
}

const fn default_delivery_batch_size() -> usize {
    15_000
}

const fn default_task_delivery_interval_ms() -> u64 {
    2_000
}

const fn default_wait_sock_err_s() -> u64 {
    10
}

const fn default_wait_non_sock_err_s() -> u64 {
    30
}

const fn default_read_timeout_s() -> u64 {
    5
}
