// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Best-effort publish metadata: the last publication seen per topic and a
//! bounded, recency-sorted publication history per endpoint.
//!
//! Updates run as spawned fire-and-forget units of work, throttled by the
//! frequency settings below. A failed or skipped update never fails the
//! publish call that triggered it.

use parking_lot::Mutex;
use pubsub_config::{EndpointId, TopicName};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Tracker configuration.
#[derive(Debug, Clone)]
pub struct MetaConfig {
    /// Track per-topic last-publication records.
    pub topic_enabled: bool,
    /// Track per-endpoint publication history.
    pub endpoint_enabled: bool,
    /// Maximum entries kept per endpoint, newest first.
    pub endpoint_history_max: usize,
    /// Minimum interval between updates for one endpoint, in milliseconds.
    pub endpoint_store_frequency_ms: i64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            topic_enabled: true,
            endpoint_enabled: true,
            endpoint_history_max: 100,
            endpoint_store_frequency_ms: 1_000,
        }
    }
}

/// Last publication seen on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastPublished {
    /// Publication time in epoch milliseconds.
    pub pub_time: i64,
    /// Id of the last message.
    pub pub_msg_id: String,
    /// Publishing endpoint.
    pub endpoint_id: EndpointId,
    /// Whether that message was guaranteed-delivery.
    pub has_gd: bool,
}

/// One entry of an endpoint's publication history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPublication {
    /// Topic published to.
    pub topic_name: TopicName,
    /// Publication time in epoch milliseconds.
    pub pub_time: i64,
    /// Id of the message.
    pub pub_msg_id: String,
}

/// One update, prepared synchronously inside the publish call and applied
/// later from a spawned task.
#[derive(Debug, Clone)]
pub struct PubMetaUpdate {
    /// Topic the publication went to.
    pub topic_name: TopicName,
    /// Publishing endpoint.
    pub endpoint_id: EndpointId,
    /// Last message of the publish call.
    pub last: LastPublished,
}

#[derive(Debug, Default)]
struct MetaState {
    topics: HashMap<TopicName, LastPublished>,
    endpoints: HashMap<EndpointId, Vec<EndpointPublication>>,
    last_topic_update_ms: HashMap<TopicName, i64>,
    last_endpoint_update_ms: HashMap<EndpointId, i64>,
}

/// In-RAM publish metadata tracker.
#[derive(Debug)]
pub struct PubMetaStore {
    config: MetaConfig,
    state: Mutex<MetaState>,
}

impl PubMetaStore {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(config: MetaConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MetaState::default()),
        }
    }

    /// True when either dimension of tracking is on.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.topic_enabled || self.config.endpoint_enabled
    }

    /// Whether an update for this topic/endpoint pair is due at `now_ms`,
    /// per the topic's own store frequency.
    #[must_use]
    pub fn is_due(&self, topic_name: &TopicName, topic_frequency_ms: i64, now_ms: i64) -> bool {
        let state = self.state.lock();
        match state.last_topic_update_ms.get(topic_name) {
            None => true,
            Some(last) => now_ms - last >= topic_frequency_ms,
        }
    }

    /// Applies one update in place.
    pub fn apply(&self, update: PubMetaUpdate, now_ms: i64) {
        let mut state = self.state.lock();
        if self.config.topic_enabled {
            let _ = state
                .topics
                .insert(update.topic_name.clone(), update.last.clone());
            let _ = state
                .last_topic_update_ms
                .insert(update.topic_name.clone(), now_ms);
        }
        if self.config.endpoint_enabled {
            let endpoint_due = match state.last_endpoint_update_ms.get(&update.endpoint_id) {
                None => true,
                Some(last) => now_ms - last >= self.config.endpoint_store_frequency_ms,
            };
            if endpoint_due {
                let history = state.endpoints.entry(update.endpoint_id).or_default();
                history.insert(
                    0,
                    EndpointPublication {
                        topic_name: update.topic_name.clone(),
                        pub_time: update.last.pub_time,
                        pub_msg_id: update.last.pub_msg_id.clone(),
                    },
                );
                history.truncate(self.config.endpoint_history_max);
                let _ = state
                    .last_endpoint_update_ms
                    .insert(update.endpoint_id, now_ms);
            }
        }
    }

    /// Schedules an update as an independent unit of work.
    pub fn spawn_update(self: &Arc<Self>, update: PubMetaUpdate) {
        let meta = Arc::clone(self);
        let _handle = tokio::spawn(async move {
            let topic = update.topic_name.clone();
            meta.apply(update, crate::message::now_ms());
            debug!(topic = %topic, "publish metadata updated");
        });
    }

    /// Last publication seen on a topic, if any.
    #[must_use]
    pub fn last_published(&self, topic_name: &str) -> Option<LastPublished> {
        self.state.lock().topics.get(topic_name).cloned()
    }

    /// Publication history of one endpoint, newest first.
    #[must_use]
    pub fn endpoint_history(&self, endpoint_id: EndpointId) -> Vec<EndpointPublication> {
        self.state
            .lock()
            .endpoints
            .get(&endpoint_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{LastPublished, MetaConfig, PubMetaStore, PubMetaUpdate};

    fn update(topic: &'static str, msg_id: &str, pub_time: i64) -> PubMetaUpdate {
        PubMetaUpdate {
            topic_name: topic.into(),
            endpoint_id: 10,
            last: LastPublished {
                pub_time,
                pub_msg_id: msg_id.to_owned(),
                endpoint_id: 10,
                has_gd: false,
            },
        }
    }

    #[test]
    fn topic_record_tracks_latest_publication() {
        let meta = PubMetaStore::new(MetaConfig::default());
        meta.apply(update("orders", "m1", 100), 100);
        meta.apply(update("orders", "m2", 200), 5_000);

        let last = meta.last_published("orders").expect("record");
        assert_eq!(last.pub_msg_id, "m2");
        assert!(meta.last_published("invoices").is_none());
    }

    #[test]
    fn topic_throttle_honors_frequency() {
        let meta = PubMetaStore::new(MetaConfig::default());
        assert!(meta.is_due(&"orders".into(), 1_000, 100));
        meta.apply(update("orders", "m1", 100), 100);
        assert!(!meta.is_due(&"orders".into(), 1_000, 600));
        assert!(meta.is_due(&"orders".into(), 1_000, 1_100));
    }

    #[test]
    fn endpoint_history_is_bounded_and_newest_first() {
        let config = MetaConfig {
            endpoint_history_max: 2,
            endpoint_store_frequency_ms: 0,
            ..MetaConfig::default()
        };
        let meta = PubMetaStore::new(config);
        meta.apply(update("orders", "m1", 100), 100);
        meta.apply(update("orders", "m2", 200), 200);
        meta.apply(update("invoices", "m3", 300), 300);

        let history = meta.endpoint_history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].pub_msg_id, "m3");
        assert_eq!(history[1].pub_msg_id, "m2");
    }
}
