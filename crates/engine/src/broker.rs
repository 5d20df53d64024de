// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The central broker: topic and subscription registries, the sub-key
//! server presence set, and the wiring between publisher and delivery
//! tasks.
//!
//! Registering a subscription creates its delivery queue and starts its
//! task; unsubscribing stops the task and clears the queue. The broker
//! itself never delivers anything, the only handoff into delivery is the
//! publisher appending to a queue.

use crate::error::TaskError;
use crate::hook::{DeliveryHook, PublishHook};
use crate::meta::{MetaConfig, PubMetaStore};
use crate::metrics::PubSubMetrics;
use crate::publisher::{Publisher, PublishAuthorizer};
use crate::queue::DeliveryQueue;
use crate::store::GdStore;
use crate::task::{ConfirmCallback, DeliveryCallback, DeliveryTask};
use arc_swap::ArcSwap;
use parking_lot::RwLock;
use pubsub_config::subscription::{DeliveryMethod, SubscriptionConfig};
use pubsub_config::topic::TopicConfig;
use pubsub_config::{SubKey, TopicName};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Broker-wide options.
#[derive(Debug, Clone, Default)]
pub struct BrokerOptions {
    /// Emit one structured audit line per successful publish.
    pub audit_log_enabled: bool,
    /// Publish metadata tracker configuration.
    pub meta: MetaConfig,
}

/// Runtime state of one registered topic.
pub(crate) struct TopicState {
    pub(crate) config: ArcSwap<TopicConfig>,
    /// Publish calls seen, drives the throttled depth check.
    pub(crate) pub_counter: AtomicU64,
    /// Set when new GD data was persisted, cleared by `take_gd_msg_flag`.
    pub(crate) has_gd_msg: AtomicBool,
    pub(crate) publish_hook: Option<Arc<dyn PublishHook>>,
}

/// One registered subscription: its hot-swappable config, queue and task.
pub(crate) struct SubEntry {
    pub(crate) config: Arc<ArcSwap<SubscriptionConfig>>,
    pub(crate) queue: Arc<DeliveryQueue>,
    pub(crate) task: DeliveryTask,
}

/// Snapshot of one matched subscription, taken per publish call.
pub(crate) struct SubSnapshot {
    pub(crate) config: Arc<SubscriptionConfig>,
    pub(crate) queue: Arc<DeliveryQueue>,
}

pub(crate) struct BrokerInner {
    pub(crate) topics: RwLock<HashMap<TopicName, Arc<TopicState>>>,
    pub(crate) subs: RwLock<HashMap<SubKey, SubEntry>>,
    /// Subscriptions that currently have a reachable delivery-owning
    /// process. A matched subscription absent from this set forces GD.
    pub(crate) sk_servers: RwLock<HashSet<SubKey>>,
    pub(crate) store: Arc<dyn GdStore>,
    pub(crate) authorizer: Arc<dyn PublishAuthorizer>,
    pub(crate) metrics: Arc<PubSubMetrics>,
    pub(crate) meta: Arc<PubMetaStore>,
    pub(crate) audit_enabled: bool,
}

impl BrokerInner {
    pub(crate) fn topic_state(&self, topic_name: &str) -> Option<Arc<TopicState>> {
        self.topics.read().get(topic_name).cloned()
    }

    /// Current subscriptions of a topic, optionally restricted to
    /// specific keys.
    pub(crate) fn matched_subscriptions(
        &self,
        topic_name: &TopicName,
        restrict_to: Option<&[SubKey]>,
    ) -> Vec<SubSnapshot> {
        let subs = self.subs.read();
        subs.iter()
            .filter(|(sub_key, entry)| {
                let config = entry.config.load();
                config.topic_name == *topic_name
                    && restrict_to.map_or(true, |keys| keys.contains(sub_key))
            })
            .map(|(_, entry)| SubSnapshot {
                config: entry.config.load_full(),
                queue: Arc::clone(&entry.queue),
            })
            .collect()
    }

    /// True when any of the given subscriptions lacks a delivery-owning
    /// process.
    pub(crate) fn has_no_sk_server(&self, subs: &[SubSnapshot]) -> bool {
        let sk_servers = self.sk_servers.read();
        subs.iter()
            .any(|snapshot| !sk_servers.contains(&snapshot.config.sub_key))
    }
}

/// The embedded publish/subscribe broker.
pub struct PubSubBroker {
    inner: Arc<BrokerInner>,
}

impl PubSubBroker {
    /// Creates a broker over the given store and publish authorizer.
    #[must_use]
    pub fn new(
        store: Arc<dyn GdStore>,
        authorizer: Arc<dyn PublishAuthorizer>,
        options: BrokerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: RwLock::new(HashMap::new()),
                subs: RwLock::new(HashMap::new()),
                sk_servers: RwLock::new(HashSet::new()),
                store,
                authorizer,
                metrics: Arc::new(PubSubMetrics::new()),
                meta: Arc::new(PubMetaStore::new(options.meta)),
                audit_enabled: options.audit_log_enabled,
            }),
        }
    }

    /// A publisher bound to this broker. Cheap, may be created per call.
    #[must_use]
    pub fn publisher(&self) -> Publisher {
        Publisher::new(Arc::clone(&self.inner))
    }

    /// Shared publish counters.
    #[must_use]
    pub fn metrics(&self) -> Arc<PubSubMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// The publish metadata tracker.
    #[must_use]
    pub fn meta(&self) -> Arc<PubMetaStore> {
        Arc::clone(&self.inner.meta)
    }

    // -----------------------------------------------------------------
    // Topics
    // -----------------------------------------------------------------

    /// Registers a topic, replacing any previous registration of the
    /// same name.
    pub fn register_topic(&self, config: TopicConfig, hook: Option<Arc<dyn PublishHook>>) {
        let name = config.name.clone();
        let state = Arc::new(TopicState {
            config: ArcSwap::from_pointee(config),
            pub_counter: AtomicU64::new(0),
            has_gd_msg: AtomicBool::new(false),
            publish_hook: hook,
        });
        let _ = self.inner.topics.write().insert(name.clone(), state);
        info!(topic = %name, "topic registered");
    }

    /// Replaces a registered topic's configuration, keeping its runtime
    /// counters and hook.
    pub fn update_topic_config(&self, config: TopicConfig) -> bool {
        let topics = self.inner.topics.read();
        match topics.get(config.name.as_str()) {
            Some(state) => {
                state.config.store(Arc::new(config));
                true
            }
            None => false,
        }
    }

    /// The configuration of a registered topic.
    #[must_use]
    pub fn get_topic(&self, topic_name: &str) -> Option<Arc<TopicConfig>> {
        self.inner
            .topics
            .read()
            .get(topic_name)
            .map(|state| state.config.load_full())
    }

    /// Whether new GD data was persisted for the topic since the flag
    /// was last taken.
    #[must_use]
    pub fn has_new_gd_msg(&self, topic_name: &str) -> bool {
        self.inner
            .topics
            .read()
            .get(topic_name)
            .is_some_and(|state| state.has_gd_msg.load(Ordering::Acquire))
    }

    /// Reads and clears the new-GD-data flag.
    pub fn take_gd_msg_flag(&self, topic_name: &str) -> bool {
        self.inner
            .topics
            .read()
            .get(topic_name)
            .is_some_and(|state| state.has_gd_msg.swap(false, Ordering::AcqRel))
    }

    // -----------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------

    /// Registers a subscription: creates its queue, starts its delivery
    /// task and records server presence for push-capable methods.
    pub fn subscribe(
        &self,
        config: SubscriptionConfig,
        deliver_cb: Arc<dyn DeliveryCallback>,
        confirm_cb: Arc<dyn ConfirmCallback>,
        hook: Option<Arc<dyn DeliveryHook>>,
    ) -> Result<DeliveryTask, TaskError> {
        let sub_key = config.sub_key.clone();
        let mut subs = self.inner.subs.write();
        if subs.contains_key(&sub_key) {
            return Err(TaskError::SubscriptionExists { sub_key });
        }

        // WebSocket subscribers have no delivery-owning process until
        // their connection registers one.
        if config.delivery_method != DeliveryMethod::WebSocket {
            let _ = self.inner.sk_servers.write().insert(sub_key.clone());
        }

        let shared_config = Arc::new(ArcSwap::from_pointee(config));
        let queue = Arc::new(DeliveryQueue::new());
        let task = DeliveryTask::start(
            Arc::clone(&shared_config),
            Arc::clone(&queue),
            Arc::clone(&self.inner.store),
            deliver_cb,
            confirm_cb,
            hook,
        );
        let _ = subs.insert(
            sub_key.clone(),
            SubEntry {
                config: shared_config,
                queue,
                task: task.clone(),
            },
        );
        info!(sub_key = %sub_key, "subscription registered");
        Ok(task)
    }

    /// Stops and removes a subscription, clearing its queue.
    pub async fn unsubscribe(&self, sub_key: &SubKey) -> Result<(), TaskError> {
        let entry = self.inner.subs.write().remove(sub_key).ok_or_else(|| {
            TaskError::SubscriptionNotFound {
                sub_key: sub_key.to_string(),
            }
        })?;
        let _ = self.inner.sk_servers.write().remove(sub_key);
        entry.task.stop().await?;
        entry.task.clear();
        info!(sub_key = %sub_key, "subscription removed");
        Ok(())
    }

    /// The delivery task of a registered subscription.
    #[must_use]
    pub fn task(&self, sub_key: &str) -> Option<DeliveryTask> {
        self.inner
            .subs
            .read()
            .get(sub_key)
            .map(|entry| entry.task.clone())
    }

    /// Replaces a subscription's configuration; its task re-reads it on
    /// the next loop iteration.
    pub fn update_sub_config(&self, config: SubscriptionConfig) -> Result<(), TaskError> {
        let subs = self.inner.subs.read();
        let entry =
            subs.get(&config.sub_key)
                .ok_or_else(|| TaskError::SubscriptionNotFound {
                    sub_key: config.sub_key.to_string(),
                })?;
        entry.config.store(Arc::new(config));
        Ok(())
    }

    /// Records that a delivery-owning process serves this subscription.
    pub fn sk_server_up(&self, sub_key: &SubKey) {
        let _ = self.inner.sk_servers.write().insert(sub_key.clone());
    }

    /// Records that the subscription lost its delivery-owning process;
    /// publications matched to it are forced to GD until it returns.
    pub fn sk_server_down(&self, sub_key: &SubKey) {
        let _ = self.inner.sk_servers.write().remove(sub_key);
    }
}

impl std::fmt::Debug for PubSubBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubBroker")
            .field("topics", &self.inner.topics.read().len())
            .field("subscriptions", &self.inner.subs.read().len())
            .finish_non_exhaustive()
    }
}
