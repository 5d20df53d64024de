// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Publish counters, kept on an explicitly shared collaborator rather than
//! in process-global state. Exporting them is left to the host server.

use parking_lot::Mutex;
use pubsub_config::{EndpointId, TopicName};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// GD/non-GD split of messages published to one topic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TopicCounters {
    /// Guaranteed-delivery messages.
    pub gd: u64,
    /// In-memory-only messages.
    pub non_gd: u64,
}

/// Shared publish counters.
#[derive(Debug, Default)]
pub struct PubSubMetrics {
    total_published: AtomicU64,
    by_endpoint: Mutex<HashMap<EndpointId, u64>>,
    by_topic: Mutex<HashMap<TopicName, TopicCounters>>,
}

impl PubSubMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one successful publish call.
    pub fn record_published(
        &self,
        endpoint_id: EndpointId,
        topic_name: &TopicName,
        gd_count: u64,
        non_gd_count: u64,
    ) {
        let total = gd_count + non_gd_count;
        let _ = self.total_published.fetch_add(total, Ordering::Relaxed);
        *self.by_endpoint.lock().entry(endpoint_id).or_default() += total;
        let mut by_topic = self.by_topic.lock();
        let counters = by_topic.entry(topic_name.clone()).or_default();
        counters.gd += gd_count;
        counters.non_gd += non_gd_count;
    }

    /// Total messages published through this broker.
    #[must_use]
    pub fn total_published(&self) -> u64 {
        self.total_published.load(Ordering::Relaxed)
    }

    /// Messages published by one endpoint.
    #[must_use]
    pub fn endpoint_total(&self, endpoint_id: EndpointId) -> u64 {
        self.by_endpoint.lock().get(&endpoint_id).copied().unwrap_or(0)
    }

    /// Per-topic counters, zeroed when the topic never saw a publish.
    #[must_use]
    pub fn topic_counters(&self, topic_name: &str) -> TopicCounters {
        self.by_topic
            .lock()
            .get(topic_name)
            .copied()
            .unwrap_or_default()
    }
}
