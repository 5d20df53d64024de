// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The durable store seam for guaranteed-delivery messages, plus the
//! default in-memory implementation.
//!
//! The publisher persists GD messages through [`GdStore`] before the ids
//! are returned to the caller; delivery tasks mark deletions and confirm
//! deliveries through the same seam. [`MemoryStore`] is the default
//! backend, used by tests and by deployments that accept process-local
//! durability.

use crate::error::StoreError;
use crate::message::Message;
use async_trait::async_trait;
use parking_lot::Mutex;
use pubsub_config::subscription::SubscriptionConfig;
use pubsub_config::{SubKey, TopicId, TopicName};
use std::collections::HashMap;
use std::sync::Arc;

/// Durable operations the engine needs from a GD store.
#[async_trait]
pub trait GdStore: Send + Sync {
    /// Transactionally inserts a batch of GD messages together with one
    /// queue row per (message, subscription) pair. All or nothing.
    async fn insert_published(
        &self,
        messages: &[Arc<Message>],
        subscriptions: &[SubscriptionConfig],
    ) -> Result<(), StoreError>;

    /// Count of currently-undelivered GD messages for a topic.
    async fn current_depth(&self, topic_id: TopicId) -> Result<usize, StoreError>;

    /// Marks the given messages as deleted for one subscription.
    async fn mark_deleted(&self, sub_key: &SubKey, msg_ids: &[String]) -> Result<(), StoreError>;

    /// Durably records a successful delivery of the given messages.
    async fn confirm_delivered(
        &self,
        sub_key: &SubKey,
        msg_ids: &[String],
    ) -> Result<(), StoreError>;

    /// Previously-persisted messages not yet confirmed delivered for this
    /// subscription, for the initial enqueue at task startup.
    async fn initial_messages(
        &self,
        sub_key: &SubKey,
        topic_name: &TopicName,
        endpoint_name: &str,
    ) -> Result<Vec<Arc<Message>>, StoreError>;
}

// ---------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------

/// Delivery status of one (message, subscription) queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    /// Inserted, not yet delivered.
    Initialized,
    /// Confirmed delivered.
    Delivered,
    /// Marked for deletion before delivery.
    ToDelete,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// All persisted messages by id.
    messages: HashMap<String, Arc<Message>>,
    /// Queue rows: sub_key -> msg_id -> status.
    rows: HashMap<SubKey, HashMap<String, RowStatus>>,
}

impl MemoryState {
    fn is_settled(&self, msg_id: &str) -> bool {
        let mut has_rows = false;
        for per_sub in self.rows.values() {
            if let Some(status) = per_sub.get(msg_id) {
                has_rows = true;
                if *status == RowStatus::Initialized {
                    return false;
                }
            }
        }
        has_rows
    }
}

/// Process-local [`GdStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted messages, for admin inspection.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Looks up one persisted message.
    #[must_use]
    pub fn stored_message(&self, msg_id: &str) -> Option<Arc<Message>> {
        self.state.lock().messages.get(msg_id).cloned()
    }

    /// Status of one queue row, if it exists.
    #[must_use]
    pub fn row_status(&self, sub_key: &SubKey, msg_id: &str) -> Option<RowStatus> {
        self.state
            .lock()
            .rows
            .get(sub_key)
            .and_then(|per_sub| per_sub.get(msg_id))
            .copied()
    }
}

#[async_trait]
impl GdStore for MemoryStore {
    async fn insert_published(
        &self,
        messages: &[Arc<Message>],
        subscriptions: &[SubscriptionConfig],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        for msg in messages {
            let _ = state
                .messages
                .insert(msg.pub_msg_id.clone(), Arc::clone(msg));
            for sub in subscriptions {
                let _ = state
                    .rows
                    .entry(sub.sub_key.clone())
                    .or_default()
                    .insert(msg.pub_msg_id.clone(), RowStatus::Initialized);
            }
        }
        Ok(())
    }

    async fn current_depth(&self, topic_id: TopicId) -> Result<usize, StoreError> {
        let state = self.state.lock();
        // A message counts toward depth until every one of its queue rows
        // is delivered or deleted. Rows may not exist yet for messages
        // persisted before any subscription, those count too.
        let depth = state
            .messages
            .values()
            .filter(|msg| msg.topic_id == topic_id)
            .filter(|msg| !state.is_settled(&msg.pub_msg_id))
            .count();
        Ok(depth)
    }

    async fn mark_deleted(&self, sub_key: &SubKey, msg_ids: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let per_sub = state.rows.entry(sub_key.clone()).or_default();
        for msg_id in msg_ids {
            let _ = per_sub.insert(msg_id.clone(), RowStatus::ToDelete);
        }
        Ok(())
    }

    async fn confirm_delivered(
        &self,
        sub_key: &SubKey,
        msg_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let per_sub = state.rows.entry(sub_key.clone()).or_default();
        for msg_id in msg_ids {
            let _ = per_sub.insert(msg_id.clone(), RowStatus::Delivered);
        }
        Ok(())
    }

    async fn initial_messages(
        &self,
        sub_key: &SubKey,
        topic_name: &TopicName,
        _endpoint_name: &str,
    ) -> Result<Vec<Arc<Message>>, StoreError> {
        let state = self.state.lock();
        let Some(per_sub) = state.rows.get(sub_key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (msg_id, status) in per_sub {
            if *status != RowStatus::Initialized {
                continue;
            }
            if let Some(msg) = state.messages.get(msg_id) {
                if msg.topic_name == *topic_name {
                    out.push(Arc::clone(msg));
                }
            }
        }
        out.sort_by_key(|msg| msg.delivery_order_key());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{GdStore, MemoryStore, RowStatus};
    use crate::message::{new_msg_id, Message, MessageSeed};
    use pubsub_config::subscription::SubscriptionConfig;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn gd_msg(topic_id: u64) -> Arc<Message> {
        let seed = MessageSeed {
            pub_msg_id: new_msg_id(),
            correl_id: None,
            in_reply_to: None,
            data: "payload".to_owned(),
            mime_type: "text/plain".to_owned(),
            has_gd: true,
            priority: None,
            expiration: 60_000,
            pub_time: 1_000,
            ext_pub_time: None,
            ext_client_id: None,
            group_id: None,
            position_in_group: None,
            reply_to_sk: Vec::new(),
            deliver_to_sk: Vec::new(),
            user_ctx: None,
            ext_ctx: None,
        };
        Arc::new(seed.into_message(topic_id, "orders".into(), 10, HashMap::new()))
    }

    fn sub() -> SubscriptionConfig {
        SubscriptionConfig::new("sk-1".into(), "orders".into(), 1, 10, "crm")
    }

    #[tokio::test]
    async fn depth_counts_unsettled_messages_only() {
        let store = MemoryStore::new();
        let sub = sub();
        let msg = gd_msg(1);
        store
            .insert_published(&[Arc::clone(&msg)], std::slice::from_ref(&sub))
            .await
            .expect("insert");
        assert_eq!(store.current_depth(1).await.expect("depth"), 1);

        store
            .confirm_delivered(&sub.sub_key, &[msg.pub_msg_id.clone()])
            .await
            .expect("confirm");
        assert_eq!(store.current_depth(1).await.expect("depth"), 0);
        assert_eq!(
            store.row_status(&sub.sub_key, &msg.pub_msg_id),
            Some(RowStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn messages_without_rows_count_toward_depth() {
        let store = MemoryStore::new();
        store
            .insert_published(&[gd_msg(1)], &[])
            .await
            .expect("insert");
        assert_eq!(store.current_depth(1).await.expect("depth"), 1);
        assert_eq!(store.current_depth(2).await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn initial_messages_returns_undelivered_rows_in_order() {
        let store = MemoryStore::new();
        let sub = sub();
        let first = gd_msg(1);
        let second = gd_msg(1);
        store
            .insert_published(
                &[Arc::clone(&first), Arc::clone(&second)],
                std::slice::from_ref(&sub),
            )
            .await
            .expect("insert");
        store
            .mark_deleted(&sub.sub_key, &[second.pub_msg_id.clone()])
            .await
            .expect("mark deleted");

        let recovered = store
            .initial_messages(&sub.sub_key, &"orders".into(), "crm")
            .await
            .expect("initial");
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].pub_msg_id, first.pub_msg_id);
    }
}
