// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The publish pipeline.
//!
//! A publish call resolves the caller to an authorized endpoint, validates
//! the topic, builds one message per input item, decides durability per
//! message, enforces the topic's GD depth limit, persists GD messages and
//! fans non-GD messages into the matched delivery queues. Messages
//! published to a topic with no subscribers are either dropped (policy
//! `drop`) or kept; kept non-GD messages are converted to GD so they
//! survive until a subscriber appears.

use crate::broker::{BrokerInner, SubSnapshot, TopicState};
use crate::error::PublishError;
use crate::hook::PublishHookAction;
use crate::message::{new_msg_id, now_ms, Message, MessageSeed};
use crate::meta::{LastPublished, PubMetaUpdate};
use pubsub_config::limits::{
    EXPIRATION_DEFAULT_MS, MIME_TYPE_DEFAULT, PRIORITY_DEFAULT, PRIORITY_MAX, PRIORITY_MIN,
};
use pubsub_config::subscription::SubscriptionConfig;
use pubsub_config::topic::{OnNoSubsPublish, TopicConfig};
use pubsub_config::{EndpointId, SubKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

/// Target of the per-publish audit line.
const AUDIT_TARGET: &str = "pubsub.audit";

/// How a publish request identifies its caller, in resolution precedence
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerRef<'a> {
    /// By endpoint name.
    EndpointName(&'a str),
    /// By security definition name.
    SecurityName(&'a str),
    /// By endpoint id.
    EndpointId(EndpointId),
    /// By security definition id.
    SecurityId(u64),
    /// By WebSocket channel id.
    WsChannelId(u64),
}

/// The endpoint and publish pattern an authorizer resolved for a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubEndpoint {
    /// Resolved endpoint id.
    pub endpoint_id: EndpointId,
    /// Resolved endpoint name.
    pub endpoint_name: String,
    /// The pattern that authorizes publishing to the topic.
    pub pub_pattern: String,
}

/// Permission seam: resolves a caller reference to an endpoint authorized
/// to publish to the given topic. `None` means no pattern matches and the
/// publish fails closed.
pub trait PublishAuthorizer: Send + Sync {
    /// Resolves the caller, or denies it.
    fn resolve(&self, caller: CallerRef<'_>, topic_name: &str) -> Option<PubEndpoint>;
}

/// One payload item of a multi-message publish request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PubItem {
    /// The payload.
    pub data: String,
    /// Explicit message id; generated when absent.
    #[serde(default)]
    pub msg_id: Option<String>,
    /// Correlation id.
    #[serde(default)]
    pub correl_id: Option<String>,
    /// Id of the message this one replies to.
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// Explicit durability class.
    #[serde(default)]
    pub has_gd: Option<bool>,
    /// Priority 1-9.
    #[serde(default)]
    pub priority: Option<u8>,
    /// Relative expiration in milliseconds.
    #[serde(default)]
    pub expiration: Option<i64>,
    /// MIME type of the payload.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// External client id.
    #[serde(default)]
    pub ext_client_id: Option<String>,
    /// Publication time reported by the external producer.
    #[serde(default)]
    pub ext_pub_time: Option<i64>,
    /// Message-group id.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Position within the group.
    #[serde(default)]
    pub position_in_group: Option<u32>,
}

/// A publish request, as received from the host server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PubRequest {
    /// Topic to publish to.
    pub topic_name: String,
    /// Single payload; mutually exclusive with `data_list`.
    #[serde(default)]
    pub data: Option<String>,
    /// Multiple payload items, each with its own metadata.
    #[serde(default)]
    pub data_list: Option<Vec<PubItem>>,

    /// Explicit message id for a single-payload request.
    #[serde(default)]
    pub msg_id: Option<String>,
    /// Correlation id.
    #[serde(default)]
    pub correl_id: Option<String>,
    /// Id of the message this one replies to.
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// Explicit durability class.
    #[serde(default)]
    pub has_gd: Option<bool>,
    /// Priority 1-9.
    #[serde(default)]
    pub priority: Option<u8>,
    /// Relative expiration in milliseconds.
    #[serde(default)]
    pub expiration: Option<i64>,
    /// MIME type of the payload.
    #[serde(default)]
    pub mime_type: Option<String>,
    /// External client id.
    #[serde(default)]
    pub ext_client_id: Option<String>,
    /// Publication time reported by the external producer.
    #[serde(default)]
    pub ext_pub_time: Option<i64>,

    /// Caller reference by security definition id.
    #[serde(default)]
    pub security_id: Option<u64>,
    /// Caller reference by security definition name.
    #[serde(default)]
    pub security_name: Option<String>,
    /// Caller reference by endpoint id.
    #[serde(default)]
    pub endpoint_id: Option<EndpointId>,
    /// Caller reference by endpoint name.
    #[serde(default)]
    pub endpoint_name: Option<String>,
    /// Caller reference by WebSocket channel id.
    #[serde(default)]
    pub ws_channel_id: Option<u64>,

    /// Message-group id.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Position within the group.
    #[serde(default)]
    pub position_in_group: Option<u32>,
    /// Subscriptions expected to reply.
    #[serde(default)]
    pub reply_to_sk: Vec<SubKey>,
    /// Restricts delivery to these subscriptions only.
    #[serde(default)]
    pub deliver_to_sk: Vec<SubKey>,
    /// Free-form caller context.
    #[serde(default)]
    pub user_ctx: Option<Value>,
    /// Free-form server context.
    #[serde(default)]
    pub ext_ctx: Option<Value>,
}

impl PubRequest {
    /// First caller reference set on the request, in precedence order:
    /// the explicit endpoint overrides a security definition, which
    /// overrides a WebSocket channel.
    #[must_use]
    pub fn caller(&self) -> Option<CallerRef<'_>> {
        if let Some(ref name) = self.endpoint_name {
            return Some(CallerRef::EndpointName(name));
        }
        if let Some(ref name) = self.security_name {
            return Some(CallerRef::SecurityName(name));
        }
        if let Some(id) = self.endpoint_id {
            return Some(CallerRef::EndpointId(id));
        }
        if let Some(id) = self.security_id {
            return Some(CallerRef::SecurityId(id));
        }
        self.ws_channel_id.map(CallerRef::WsChannelId)
    }

    /// The payload items of the request.
    fn items(&self) -> Result<Vec<PubItem>, PublishError> {
        if let Some(ref list) = self.data_list {
            if list.is_empty() {
                return Err(PublishError::InvalidRequest {
                    reason: "data_list must not be empty".to_owned(),
                });
            }
            return Ok(list.clone());
        }
        match self.data {
            Some(ref data) => Ok(vec![PubItem {
                data: data.clone(),
                msg_id: self.msg_id.clone(),
                correl_id: self.correl_id.clone(),
                in_reply_to: self.in_reply_to.clone(),
                has_gd: self.has_gd,
                priority: self.priority,
                expiration: self.expiration,
                mime_type: self.mime_type.clone(),
                ext_client_id: self.ext_client_id.clone(),
                ext_pub_time: self.ext_pub_time,
                group_id: self.group_id.clone(),
                position_in_group: self.position_in_group,
            }]),
            None => Err(PublishError::InvalidRequest {
                reason: "either data or data_list is required".to_owned(),
            }),
        }
    }
}

/// Successful publish result: the id of the one message produced, or the
/// ordered list of ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PublishResponse {
    /// Exactly one message was produced.
    Single(String),
    /// Several messages were produced, in request order.
    Multiple(Vec<String>),
}

/// Publisher bound to one broker.
pub struct Publisher {
    inner: Arc<BrokerInner>,
}

impl Publisher {
    pub(crate) fn new(inner: Arc<BrokerInner>) -> Self {
        Self { inner }
    }

    /// Publishes a request. Returns `None` when nothing was produced:
    /// the no-subscribers `drop` policy applied, or a hook vetoed every
    /// message.
    pub async fn publish(
        &self,
        req: PubRequest,
    ) -> Result<Option<PublishResponse>, PublishError> {
        let caller = req.caller().ok_or_else(|| PublishError::Forbidden {
            topic: req.topic_name.clone(),
        })?;
        let endpoint = self
            .inner
            .authorizer
            .resolve(caller, &req.topic_name)
            .ok_or_else(|| PublishError::Forbidden {
                topic: req.topic_name.clone(),
            })?;

        let topic_state = self.inner.topic_state(&req.topic_name).ok_or_else(|| {
            PublishError::TopicNotFound {
                topic: req.topic_name.clone(),
            }
        })?;
        let topic = topic_state.config.load_full();
        if !topic.is_active {
            return Err(PublishError::TopicInactive {
                topic: topic.name.clone(),
            });
        }

        let restrict_to = (!req.deliver_to_sk.is_empty()).then_some(req.deliver_to_sk.as_slice());
        let subs = self.inner.matched_subscriptions(&topic.name, restrict_to);
        let has_no_sk_server = self.inner.has_no_sk_server(&subs);

        let items = req.items()?;
        let (msg_ids, gd, non_gd, last_meta) =
            self.build_messages(&req, items, &topic, &topic_state, &endpoint, &subs, has_no_sk_server)?;

        if subs.is_empty() && topic.on_no_subs_pub == OnNoSubsPublish::Drop {
            debug!(
                topic = %topic.name,
                count = msg_ids.len(),
                "no subscribers, drop policy applied"
            );
            return Ok(None);
        }

        let (gd_count, non_gd_count) = self
            .persist_and_fan_out(&topic, &topic_state, &subs, gd, non_gd)
            .await?;

        if !msg_ids.is_empty() {
            self.inner.metrics.record_published(
                endpoint.endpoint_id,
                &topic.name,
                gd_count as u64,
                non_gd_count as u64,
            );
            if self.inner.audit_enabled {
                info!(
                    target: AUDIT_TARGET,
                    topic = %topic.name,
                    endpoint = %endpoint.endpoint_name,
                    gd = gd_count,
                    non_gd = non_gd_count,
                    "published"
                );
            }
            if let Some(last) = last_meta {
                self.update_pub_metadata(&topic, endpoint.endpoint_id, last);
            }
        }

        Ok(match msg_ids.len() {
            0 => None,
            1 => msg_ids.into_iter().next().map(PublishResponse::Single),
            _ => Some(PublishResponse::Multiple(msg_ids)),
        })
    }

    /// Builds one message per item, applying policy defaults, the
    /// durability precedence and the topic's before-publish hook.
    #[allow(clippy::too_many_arguments)]
    fn build_messages(
        &self,
        req: &PubRequest,
        items: Vec<PubItem>,
        topic: &TopicConfig,
        topic_state: &TopicState,
        endpoint: &PubEndpoint,
        subs: &[SubSnapshot],
        has_no_sk_server: bool,
    ) -> Result<(Vec<String>, Vec<Arc<Message>>, Vec<Message>, Option<LastPublished>), PublishError>
    {
        let sub_pattern_matched: HashMap<SubKey, String> = subs
            .iter()
            .map(|snapshot| {
                (
                    snapshot.config.sub_key.clone(),
                    endpoint.pub_pattern.clone(),
                )
            })
            .collect();

        let mut msg_ids = Vec::with_capacity(items.len());
        let mut gd: Vec<Arc<Message>> = Vec::new();
        let mut non_gd: Vec<Message> = Vec::new();
        let mut last_meta = None;

        for item in items {
            let pub_time = now_ms();
            // Durability precedence: forced by a missing delivery-owning
            // server, then the explicit request value, then the topic
            // default.
            let has_gd = if has_no_sk_server {
                true
            } else {
                item.has_gd.unwrap_or(topic.has_gd)
            };
            let seed = MessageSeed {
                pub_msg_id: item.msg_id.unwrap_or_else(new_msg_id),
                correl_id: item.correl_id,
                in_reply_to: item.in_reply_to,
                data: item.data,
                mime_type: item.mime_type.unwrap_or_else(|| MIME_TYPE_DEFAULT.to_owned()),
                has_gd,
                priority: resolve_priority(item.priority)?,
                expiration: resolve_expiration(item.expiration, topic),
                pub_time,
                ext_pub_time: item.ext_pub_time,
                ext_client_id: item.ext_client_id,
                group_id: item.group_id,
                position_in_group: item.position_in_group,
                reply_to_sk: req.reply_to_sk.clone(),
                deliver_to_sk: req.deliver_to_sk.clone(),
                user_ctx: req.user_ctx.clone(),
                ext_ctx: req.ext_ctx.clone(),
            };
            let msg = seed.into_message(
                topic.id,
                topic.name.clone(),
                endpoint.endpoint_id,
                sub_pattern_matched.clone(),
            );

            if let Some(hook) = &topic_state.publish_hook {
                if hook.before_publish(topic, &msg) == PublishHookAction::Skip {
                    info!(
                        topic = %topic.name,
                        msg_id = %msg.pub_msg_id,
                        "message skipped by before-publish hook"
                    );
                    continue;
                }
            }

            msg_ids.push(msg.pub_msg_id.clone());
            last_meta = Some(LastPublished {
                pub_time: msg.pub_time,
                pub_msg_id: msg.pub_msg_id.clone(),
                endpoint_id: endpoint.endpoint_id,
                has_gd: msg.has_gd,
            });
            if msg.has_gd {
                gd.push(Arc::new(msg));
            } else {
                non_gd.push(msg);
            }
        }

        Ok((msg_ids, gd, non_gd, last_meta))
    }

    /// Persists GD messages and fans non-GD messages into the matched
    /// queues. Without subscribers, non-GD messages are converted to GD
    /// and persisted in a single bounded re-run.
    async fn persist_and_fan_out(
        &self,
        topic: &TopicConfig,
        topic_state: &TopicState,
        subs: &[SubSnapshot],
        mut gd: Vec<Arc<Message>>,
        mut non_gd: Vec<Message>,
    ) -> Result<(usize, usize), PublishError> {
        let sub_configs: Vec<SubscriptionConfig> = subs
            .iter()
            .map(|snapshot| (*snapshot.config).clone())
            .collect();

        let mut gd_count = 0usize;
        let mut non_gd_count = 0usize;
        let mut is_first_run = true;

        loop {
            if !gd.is_empty() {
                self.check_gd_depth(topic, topic_state, gd.len()).await?;
                self.inner.store.insert_published(&gd, &sub_configs).await?;
                topic_state.has_gd_msg.store(true, Ordering::Release);
                gd_count += gd.len();
                debug!(topic = %topic.name, count = gd.len(), "GD messages persisted");
                gd.clear();
            }

            if !subs.is_empty() {
                // Fan-out happens on the first pass only; it is the sole
                // handoff path into delivery.
                if is_first_run && !non_gd.is_empty() {
                    non_gd_count = non_gd.len();
                    for snapshot in subs {
                        let clones: Vec<Arc<Message>> =
                            non_gd.iter().map(|msg| Arc::new(msg.clone())).collect();
                        snapshot.queue.push(clones);
                    }
                }
                break;
            }

            if is_first_run && !non_gd.is_empty() {
                // No subscribers yet: persist instead of silently losing
                // the messages. A single bounded re-run, never recursion.
                debug!(
                    topic = %topic.name,
                    count = non_gd.len(),
                    "no subscribers, converting non-GD messages to GD"
                );
                gd = non_gd
                    .drain(..)
                    .map(|mut msg| {
                        msg.has_gd = true;
                        msg.set_data_prefixes();
                        Arc::new(msg)
                    })
                    .collect();
                is_first_run = false;
                continue;
            }

            break;
        }

        Ok((gd_count, non_gd_count))
    }

    /// Throttled depth check: runs on the topic's first publish and then
    /// once every `depth_check_freq` publishes. The check-then-insert
    /// contract is as observed externally; a store wanting a strict
    /// guarantee must serialize it internally.
    async fn check_gd_depth(
        &self,
        topic: &TopicConfig,
        topic_state: &TopicState,
        incoming: usize,
    ) -> Result<(), PublishError> {
        let count = topic_state.pub_counter.fetch_add(1, Ordering::AcqRel) + 1;
        if count != 1 && count % topic.depth_check_freq != 0 {
            return Ok(());
        }
        let current_depth = self.inner.store.current_depth(topic.id).await?;
        if current_depth + incoming > topic.max_depth_gd {
            return Err(PublishError::DepthExceeded {
                topic: topic.name.clone(),
                current_depth,
                incoming,
                max_depth_gd: topic.max_depth_gd,
            });
        }
        Ok(())
    }

    /// Best-effort, fire-and-forget metadata update.
    fn update_pub_metadata(
        &self,
        topic: &TopicConfig,
        endpoint_id: EndpointId,
        last: LastPublished,
    ) {
        let meta = &self.inner.meta;
        if !meta.is_enabled() {
            return;
        }
        if !meta.is_due(&topic.name, topic.meta_store_frequency_ms, now_ms()) {
            return;
        }
        meta.spawn_update(PubMetaUpdate {
            topic_name: topic.name.clone(),
            endpoint_id,
            last,
        });
    }
}

/// Validates a requested priority; the default value is stored as unset.
fn resolve_priority(priority: Option<u8>) -> Result<Option<u8>, PublishError> {
    match priority {
        None => Ok(None),
        Some(value) if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&value) => {
            Err(PublishError::InvalidRequest {
                reason: format!(
                    "priority {value} out of range {PRIORITY_MIN}-{PRIORITY_MAX}"
                ),
            })
        }
        Some(value) if value == PRIORITY_DEFAULT => Ok(None),
        Some(value) => Ok(Some(value)),
    }
}

/// Resolves a requested expiration against the defaults and the topic's
/// upper bound. Non-positive requests fall back to the default.
fn resolve_expiration(expiration: Option<i64>, topic: &TopicConfig) -> i64 {
    let requested = expiration
        .filter(|value| *value > 0)
        .unwrap_or(EXPIRATION_DEFAULT_MS);
    requested.min(topic.limit_message_expiry_ms)
}
