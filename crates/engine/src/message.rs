// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The message model.
//!
//! One [`Message`] instance exists per publication and recipient set. Once a
//! message is handed to a delivery queue it is immutable except for
//! `delivery_count` and its queue membership, both of which only the owning
//! delivery task touches. Non-GD fan-out to several subscriptions therefore
//! clones the message per queue, so retry accounting stays per-subscription.

use pubsub_config::limits::{
    DATA_PREFIX_LEN, DATA_PREFIX_SHORT_LEN, PRIORITY_DEFAULT,
};
use pubsub_config::{EndpointId, SubKey, TopicId, TopicName};
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Returns the current wall-clock time in milliseconds since the epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generates a new public message id.
#[must_use]
pub fn new_msg_id() -> String {
    format!("zpsm{}", uuid::Uuid::new_v4().simple())
}

/// A published message, as queued for delivery.
#[derive(Debug)]
pub struct Message {
    /// Public message id, generated when the request carries none.
    pub pub_msg_id: String,
    /// Caller-supplied correlation id.
    pub correl_id: Option<String>,
    /// Id of the message this one replies to.
    pub in_reply_to: Option<String>,

    /// Payload, as a string or pre-serialized JSON.
    pub data: String,
    /// MIME type of the payload.
    pub mime_type: String,
    /// Byte size of the payload.
    pub size: usize,

    /// Id of the topic the message was published to.
    pub topic_id: TopicId,
    /// Name of that topic.
    pub topic_name: TopicName,
    /// Id of the publishing endpoint.
    pub published_by_id: EndpointId,
    /// Per-subscription pattern that authorized delivery.
    pub sub_pattern_matched: HashMap<SubKey, String>,
    /// External client id, if the caller provided one.
    pub ext_client_id: Option<String>,

    /// Durability class.
    pub has_gd: bool,
    /// Priority 1-9; `None` means the default and is skipped on persistence.
    pub priority: Option<u8>,
    /// Relative expiration in milliseconds.
    pub expiration: i64,
    /// Absolute expiration time, `pub_time + expiration`.
    pub expiration_time: i64,
    /// Broker-assigned publication time in epoch milliseconds.
    pub pub_time: i64,
    /// Publication time reported by the external producer, if any.
    pub ext_pub_time: Option<i64>,

    /// Optional message-group id.
    pub group_id: Option<String>,
    /// Position within the group, meaningful only with `group_id`.
    pub position_in_group: Option<u32>,
    /// Subscriptions expected to reply to this message.
    pub reply_to_sk: Vec<SubKey>,
    /// Subscriptions this message is scoped to.
    pub deliver_to_sk: Vec<SubKey>,
    /// Free-form caller context.
    pub user_ctx: Option<Value>,
    /// Free-form server context.
    pub ext_ctx: Option<Value>,

    /// Bounded payload preview, populated for GD messages only.
    pub data_prefix: Option<String>,
    /// Short payload preview, populated for GD messages only.
    pub data_prefix_short: Option<String>,

    delivery_count: AtomicU32,
}

impl Message {
    /// Effective priority, with the default applied.
    #[must_use]
    pub fn effective_priority(&self) -> u8 {
        self.priority.unwrap_or(PRIORITY_DEFAULT)
    }

    /// Number of delivery attempts made so far.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count.load(Ordering::Acquire)
    }

    /// Records one delivery attempt and returns the new count.
    pub fn increment_delivery_count(&self) -> u32 {
        self.delivery_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// True once the message's absolute expiration time has passed.
    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expiration_time
    }

    /// Key used to order messages inside a delivery queue: priority first
    /// (higher wins), then external publication time, then broker time.
    #[must_use]
    pub fn delivery_order_key(&self) -> (Reverse<u8>, i64, i64) {
        (
            Reverse(self.effective_priority()),
            self.ext_pub_time.unwrap_or(self.pub_time),
            self.pub_time,
        )
    }

    /// Populates the GD payload previews, truncated on a char boundary.
    pub fn set_data_prefixes(&mut self) {
        self.data_prefix = Some(truncate_on_boundary(&self.data, DATA_PREFIX_LEN).to_owned());
        self.data_prefix_short =
            Some(truncate_on_boundary(&self.data, DATA_PREFIX_SHORT_LEN).to_owned());
    }

    /// Serializes the message into the shape consumers receive. Unset
    /// optional fields and a default priority are skipped.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut map = serde_json::Map::new();
        let _ = map.insert("msg_id".into(), json!(self.pub_msg_id));
        let _ = map.insert("data".into(), json!(self.data));
        let _ = map.insert("mime_type".into(), json!(self.mime_type));
        let _ = map.insert("size".into(), json!(self.size));
        let _ = map.insert("topic_name".into(), json!(self.topic_name.as_str()));
        let _ = map.insert("has_gd".into(), json!(self.has_gd));
        let _ = map.insert("expiration".into(), json!(self.expiration));
        let _ = map.insert("expiration_time".into(), json!(self.expiration_time));
        let _ = map.insert("pub_time".into(), json!(self.pub_time));
        let _ = map.insert("delivery_count".into(), json!(self.delivery_count()));
        if let Some(priority) = self.priority {
            let _ = map.insert("priority".into(), json!(priority));
        }
        if let Some(ref correl_id) = self.correl_id {
            let _ = map.insert("correl_id".into(), json!(correl_id));
        }
        if let Some(ref in_reply_to) = self.in_reply_to {
            let _ = map.insert("in_reply_to".into(), json!(in_reply_to));
        }
        if let Some(ref ext_client_id) = self.ext_client_id {
            let _ = map.insert("ext_client_id".into(), json!(ext_client_id));
        }
        if let Some(ext_pub_time) = self.ext_pub_time {
            let _ = map.insert("ext_pub_time".into(), json!(ext_pub_time));
        }
        if let Some(ref group_id) = self.group_id {
            let _ = map.insert("group_id".into(), json!(group_id));
            let _ = map.insert(
                "position_in_group".into(),
                json!(self
                    .position_in_group
                    .unwrap_or(pubsub_config::limits::POSITION_IN_GROUP_DEFAULT)),
            );
        }
        if let Some(ref user_ctx) = self.user_ctx {
            let _ = map.insert("user_ctx".into(), user_ctx.clone());
        }
        if let Some(ref ext_ctx) = self.ext_ctx {
            let _ = map.insert("ext_ctx".into(), ext_ctx.clone());
        }
        if !self.reply_to_sk.is_empty() {
            let _ = map.insert("reply_to_sk".into(), json!(self.reply_to_sk));
        }
        if !self.deliver_to_sk.is_empty() {
            let _ = map.insert("deliver_to_sk".into(), json!(self.deliver_to_sk));
        }
        Value::Object(map)
    }
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            pub_msg_id: self.pub_msg_id.clone(),
            correl_id: self.correl_id.clone(),
            in_reply_to: self.in_reply_to.clone(),
            data: self.data.clone(),
            mime_type: self.mime_type.clone(),
            size: self.size,
            topic_id: self.topic_id,
            topic_name: self.topic_name.clone(),
            published_by_id: self.published_by_id,
            sub_pattern_matched: self.sub_pattern_matched.clone(),
            ext_client_id: self.ext_client_id.clone(),
            has_gd: self.has_gd,
            priority: self.priority,
            expiration: self.expiration,
            expiration_time: self.expiration_time,
            pub_time: self.pub_time,
            ext_pub_time: self.ext_pub_time,
            group_id: self.group_id.clone(),
            position_in_group: self.position_in_group,
            reply_to_sk: self.reply_to_sk.clone(),
            deliver_to_sk: self.deliver_to_sk.clone(),
            user_ctx: self.user_ctx.clone(),
            ext_ctx: self.ext_ctx.clone(),
            data_prefix: self.data_prefix.clone(),
            data_prefix_short: self.data_prefix_short.clone(),
            delivery_count: AtomicU32::new(self.delivery_count.load(Ordering::Acquire)),
        }
    }
}

/// A builder covering the fields the publisher resolves per input item.
#[derive(Debug)]
pub(crate) struct MessageSeed {
    pub pub_msg_id: String,
    pub correl_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub data: String,
    pub mime_type: String,
    pub has_gd: bool,
    pub priority: Option<u8>,
    pub expiration: i64,
    pub pub_time: i64,
    pub ext_pub_time: Option<i64>,
    pub ext_client_id: Option<String>,
    pub group_id: Option<String>,
    pub position_in_group: Option<u32>,
    pub reply_to_sk: Vec<SubKey>,
    pub deliver_to_sk: Vec<SubKey>,
    pub user_ctx: Option<Value>,
    pub ext_ctx: Option<Value>,
}

impl MessageSeed {
    pub(crate) fn into_message(
        self,
        topic_id: TopicId,
        topic_name: TopicName,
        published_by_id: EndpointId,
        sub_pattern_matched: HashMap<SubKey, String>,
    ) -> Message {
        let size = self.data.len();
        let mut msg = Message {
            pub_msg_id: self.pub_msg_id,
            correl_id: self.correl_id,
            in_reply_to: self.in_reply_to,
            data: self.data,
            mime_type: self.mime_type,
            size,
            topic_id,
            topic_name,
            published_by_id,
            sub_pattern_matched,
            ext_client_id: self.ext_client_id,
            has_gd: self.has_gd,
            priority: self.priority,
            expiration: self.expiration,
            expiration_time: self.pub_time.saturating_add(self.expiration),
            pub_time: self.pub_time,
            ext_pub_time: self.ext_pub_time,
            group_id: self.group_id,
            position_in_group: self.position_in_group,
            reply_to_sk: self.reply_to_sk,
            deliver_to_sk: self.deliver_to_sk,
            user_ctx: self.user_ctx,
            ext_ctx: self.ext_ctx,
            data_prefix: None,
            data_prefix_short: None,
            delivery_count: AtomicU32::new(0),
        };
        if msg.has_gd {
            msg.set_data_prefixes();
        }
        msg
    }
}

/// Truncates `data` to at most `max_len` bytes without splitting a char.
fn truncate_on_boundary(data: &str, max_len: usize) -> &str {
    if data.len() <= max_len {
        return data;
    }
    let mut end = max_len;
    while end > 0 && !data.is_char_boundary(end) {
        end -= 1;
    }
    &data[..end]
}
