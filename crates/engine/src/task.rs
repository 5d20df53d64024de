// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The per-subscription delivery task.
//!
//! One task runs per subscription as an independent tokio task, started by
//! the broker when the subscription is registered. It recovers any durable
//! messages not yet confirmed delivered, then loops: wake when the queue is
//! non-empty or the delivery interval elapsed, run one delivery attempt
//! under the per-subscription lock, and react to the outcome — back off on
//! transport errors, stop itself on unrecoverable invocation errors.
//!
//! # Locking
//!
//! Two locks, never held together for long. The delivery lock is an async
//! mutex held for the whole of one delivery attempt; `PullMessages` takes
//! the same lock so pull consumers and the loop never interleave. The
//! interrupt lock guards only the small list of explicitly requested
//! deletions, so a deletion request never waits behind an in-flight
//! delivery.

use crate::error::{DeliveryError, ReasonCode, TaskError};
use crate::hook::{DeliveryBuckets, DeliveryHook};
use crate::message::{now_ms, Message};
use crate::queue::DeliveryQueue;
use crate::store::GdStore;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use pubsub_config::subscription::SubscriptionConfig;
use pubsub_config::SubKey;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Sleep quantum between wake-condition checks.
const DEFAULT_SLEEP: Duration = Duration::from_millis(100);

/// Sleep quantum for tasks whose delivery method is not push-style.
const NON_NOTIFY_SLEEP: Duration = Duration::from_secs(5);

/// Margin added to the stop deadline on top of twice the read timeout.
const STOP_MARGIN: Duration = Duration::from_millis(200);

/// What the delivery callback receives: a bare message when the batch has
/// exactly one element and the subscription opts out of wrapping,
/// otherwise the full list.
#[derive(Debug, Clone)]
pub enum DeliveryBatch {
    /// A single unwrapped message.
    Single(Arc<Message>),
    /// An ordered batch.
    List(Vec<Arc<Message>>),
}

impl DeliveryBatch {
    /// The messages of the batch, in delivery order.
    #[must_use]
    pub fn messages(&self) -> Vec<Arc<Message>> {
        match self {
            Self::Single(msg) => vec![Arc::clone(msg)],
            Self::List(msgs) => msgs.clone(),
        }
    }

    /// Number of messages in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::List(msgs) => msgs.len(),
        }
    }

    /// True when the batch carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a batch actually reaches a subscriber. Expected to return an error
/// on transport failure; no other return value is consulted.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    /// Delivers one batch to the subscriber.
    async fn deliver(&self, sub_key: &SubKey, batch: DeliveryBatch) -> Result<(), DeliveryError>;
}

/// How a successful delivery is durably recorded. Must be durable before
/// returning; failure aborts the attempt and the messages stay queued.
#[async_trait]
pub trait ConfirmCallback: Send + Sync {
    /// Records the given messages as delivered.
    async fn confirm_delivered(
        &self,
        sub_key: &SubKey,
        msg_ids: &[String],
    ) -> Result<(), DeliveryError>;
}

/// Confirmation callback backed directly by the GD store.
pub struct StoreConfirm {
    store: Arc<dyn GdStore>,
}

impl StoreConfirm {
    /// Wraps a store as a confirmation callback.
    #[must_use]
    pub fn new(store: Arc<dyn GdStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConfirmCallback for StoreConfirm {
    async fn confirm_delivered(
        &self,
        sub_key: &SubKey,
        msg_ids: &[String],
    ) -> Result<(), DeliveryError> {
        self.store
            .confirm_delivered(sub_key, msg_ids)
            .await
            .map_err(DeliveryError::from)
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// This many messages were delivered and confirmed.
    Delivered(usize),
    /// Nothing was eligible for delivery.
    NoMessages,
}

/// Point-in-time view of a task's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounters {
    /// Delivery attempts run, successful or not.
    pub delivery_iters: u64,
    /// Batches delivered and confirmed.
    pub batches_delivered: u64,
    /// Messages delivered and confirmed.
    pub messages_delivered: u64,
}

#[derive(Debug, Default)]
struct CounterCells {
    delivery_iters: AtomicU64,
    batches_delivered: AtomicU64,
    messages_delivered: AtomicU64,
}

struct TaskInner {
    sub_config: Arc<ArcSwap<SubscriptionConfig>>,
    queue: Arc<DeliveryQueue>,
    store: Arc<dyn GdStore>,
    deliver_cb: Arc<dyn DeliveryCallback>,
    confirm_cb: Arc<dyn ConfirmCallback>,
    hook: Option<Arc<dyn DeliveryHook>>,

    /// Held for the whole of one delivery attempt.
    delivery_lock: tokio::sync::Mutex<()>,
    /// Deletion requests collected between attempts.
    delete_requested: Mutex<Vec<String>>,

    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    counters: CounterCells,
}

/// Handle to one running delivery task. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryTask {
    inner: Arc<TaskInner>,
}

impl DeliveryTask {
    /// Creates the task and starts its loop immediately.
    #[must_use]
    pub fn start(
        sub_config: Arc<ArcSwap<SubscriptionConfig>>,
        queue: Arc<DeliveryQueue>,
        store: Arc<dyn GdStore>,
        deliver_cb: Arc<dyn DeliveryCallback>,
        confirm_cb: Arc<dyn ConfirmCallback>,
        hook: Option<Arc<dyn DeliveryHook>>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        let task = Self {
            inner: Arc::new(TaskInner {
                sub_config,
                queue,
                store,
                deliver_cb,
                confirm_cb,
                hook,
                delivery_lock: tokio::sync::Mutex::new(()),
                delete_requested: Mutex::new(Vec::new()),
                stop_tx,
                done_tx,
                counters: CounterCells::default(),
            }),
        };
        let runner = task.clone();
        let _handle = tokio::spawn(async move {
            runner.run().await;
        });
        task
    }

    /// The subscription key this task serves.
    #[must_use]
    pub fn sub_key(&self) -> SubKey {
        self.inner.sub_config.load().sub_key.clone()
    }

    /// Current counter values.
    #[must_use]
    pub fn counters(&self) -> TaskCounters {
        TaskCounters {
            delivery_iters: self.inner.counters.delivery_iters.load(Ordering::Relaxed),
            batches_delivered: self.inner.counters.batches_delivered.load(Ordering::Relaxed),
            messages_delivered: self
                .inner
                .counters
                .messages_delivered
                .load(Ordering::Relaxed),
        }
    }

    /// Replaces the subscription configuration; the loop re-reads it on
    /// its next iteration.
    pub fn update_sub_config(&self, config: SubscriptionConfig) {
        self.inner.sub_config.store(Arc::new(config));
    }

    // -----------------------------------------------------------------
    // Queue inspection
    // -----------------------------------------------------------------

    /// Non-destructive snapshot of the queue, optionally filtered by
    /// durability class.
    #[must_use]
    pub fn get_messages(&self, has_gd: Option<bool>) -> Vec<Arc<Message>> {
        self.inner.queue.snapshot(has_gd)
    }

    /// Looks up one queued message by id.
    #[must_use]
    pub fn get_message(&self, msg_id: &str) -> Option<Arc<Message>> {
        self.inner.queue.get(msg_id)
    }

    /// Queue depth as (GD, non-GD) counts.
    #[must_use]
    pub fn get_queue_depth(&self) -> (usize, usize) {
        self.inner.queue.depth()
    }

    /// Empties the queue, logging what it held.
    pub fn clear(&self) {
        let (gd, non_gd) = self.inner.queue.clear();
        info!(
            sub_key = %self.sub_key(),
            gd,
            non_gd,
            "delivery queue cleared"
        );
    }

    // -----------------------------------------------------------------
    // Deletion and pulling
    // -----------------------------------------------------------------

    /// Deletes queued messages. Push-style subscriptions defer the
    /// deletion to the next delivery attempt; pull-style subscriptions
    /// delete immediately.
    pub async fn delete_messages(&self, msg_ids: Vec<String>) -> Result<(), DeliveryError> {
        let cfg = self.inner.sub_config.load_full();
        if cfg.delivery_method.is_notify() {
            self.inner.delete_requested.lock().extend(msg_ids);
            return Ok(());
        }
        let msgs: Vec<Arc<Message>> = msg_ids
            .iter()
            .filter_map(|id| self.inner.queue.get(id))
            .collect();
        self.delete_now(&cfg.sub_key, &msgs).await
    }

    /// Runs one delivery attempt with a collecting callback in place of
    /// the configured one and returns the payloads it gathered. The
    /// normal confirmation and removal semantics apply.
    pub async fn pull_messages(&self) -> Result<Vec<Value>, DeliveryError> {
        let cfg = self.inner.sub_config.load_full();
        let collector = CollectingCallback::default();
        let _guard = self.inner.delivery_lock.lock().await;
        let _outcome = self.run_delivery(&collector, &cfg).await?;
        Ok(collector.take())
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Requests the loop to stop and waits for it to exit. Cooperative:
    /// an in-flight delivery attempt always completes first. Fails with
    /// [`TaskError::StopTimeout`] when the loop does not exit within
    /// twice the subscription's read timeout plus a small margin.
    pub async fn stop(&self) -> Result<(), TaskError> {
        let cfg = self.inner.sub_config.load_full();
        let _ = self.inner.stop_tx.send_replace(true);

        let mut done_rx = self.inner.done_tx.subscribe();
        if *done_rx.borrow() {
            return Ok(());
        }
        let deadline = Duration::from_secs(cfg.read_timeout_s * 2) + STOP_MARGIN;
        match tokio::time::timeout(deadline, done_rx.changed()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(TaskError::StopTimeout {
                sub_key: cfg.sub_key.clone(),
                waited_ms: deadline.as_millis() as u64,
            }),
        }
    }

    fn stop_requested(&self) -> bool {
        *self.inner.stop_tx.subscribe().borrow()
    }

    /// Sleeps up to `dur`, returning early when a stop is requested.
    async fn idle(&self, dur: Duration) {
        let mut stop_rx = self.inner.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return;
        }
        tokio::select! {
            () = tokio::time::sleep(dur) => {}
            _ = stop_rx.changed() => {}
        }
    }

    // -----------------------------------------------------------------
    // The loop
    // -----------------------------------------------------------------

    async fn run(&self) {
        self.enqueue_initial_messages().await;

        let mut last_method = self.inner.sub_config.load().delivery_method;
        let mut last_run_ms = now_ms();

        while !self.stop_requested() {
            let cfg = self.inner.sub_config.load_full();

            if cfg.delivery_method != last_method {
                info!(
                    sub_key = %cfg.sub_key,
                    from = ?last_method,
                    to = ?cfg.delivery_method,
                    "delivery method changed"
                );
                last_method = cfg.delivery_method;
            }

            // Pull-style consumers drain the queue themselves.
            if !cfg.delivery_method.is_notify() {
                self.idle(NON_NOTIFY_SLEEP).await;
                continue;
            }

            if !cfg.is_active {
                self.idle(DEFAULT_SLEEP).await;
                continue;
            }

            let interval_elapsed =
                now_ms() - last_run_ms >= cfg.task_delivery_interval_ms as i64;
            if self.inner.queue.is_empty() && !interval_elapsed {
                self.idle(DEFAULT_SLEEP).await;
                continue;
            }
            last_run_ms = now_ms();

            let outcome = {
                let _guard = self.inner.delivery_lock.lock().await;
                self.run_delivery(self.inner.deliver_cb.as_ref(), &cfg).await
            };

            match outcome {
                Ok(AttemptOutcome::Delivered(count)) => {
                    debug!(sub_key = %cfg.sub_key, count, "batch delivered");
                }
                Ok(AttemptOutcome::NoMessages) => {
                    self.idle(DEFAULT_SLEEP).await;
                }
                Err(err) => match err.reason_code() {
                    ReasonCode::RuntimeInvoke => {
                        warn!(
                            sub_key = %cfg.sub_key,
                            error = %err,
                            "unrecoverable delivery error, stopping task"
                        );
                        let _ = self.inner.stop_tx.send_replace(true);
                    }
                    ReasonCode::Io => {
                        warn!(
                            sub_key = %cfg.sub_key,
                            error = %err,
                            backoff_s = cfg.wait_sock_err_s,
                            "transport error during delivery"
                        );
                        self.idle(Duration::from_secs(cfg.wait_sock_err_s)).await;
                    }
                    _ => {
                        warn!(
                            sub_key = %cfg.sub_key,
                            error = %err,
                            backoff_s = cfg.wait_non_sock_err_s,
                            "delivery error"
                        );
                        self.idle(Duration::from_secs(cfg.wait_non_sock_err_s)).await;
                    }
                },
            }
        }

        let _ = self.inner.done_tx.send_replace(true);
        info!(sub_key = %self.sub_key(), "delivery task stopped");
    }

    /// Recovers durable messages not yet confirmed delivered, once, at
    /// startup.
    async fn enqueue_initial_messages(&self) {
        let cfg = self.inner.sub_config.load_full();
        match self
            .inner
            .store
            .initial_messages(&cfg.sub_key, &cfg.topic_name, &cfg.endpoint_name)
            .await
        {
            Ok(msgs) if !msgs.is_empty() => {
                info!(
                    sub_key = %cfg.sub_key,
                    count = msgs.len(),
                    "recovered undelivered messages"
                );
                self.inner.queue.push(msgs);
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    sub_key = %cfg.sub_key,
                    error = %err,
                    "could not recover undelivered messages"
                );
            }
        }
    }

    // -----------------------------------------------------------------
    // One delivery attempt
    // -----------------------------------------------------------------

    async fn run_delivery(
        &self,
        cb: &dyn DeliveryCallback,
        cfg: &SubscriptionConfig,
    ) -> Result<AttemptOutcome, DeliveryError> {
        let _ = self
            .inner
            .counters
            .delivery_iters
            .fetch_add(1, Ordering::Relaxed);

        let batch = self.inner.queue.peek_batch(cfg.delivery_batch_size);

        // Explicit deletion requests, collected without blocking behind
        // this attempt, plus messages whose retries are exhausted or
        // whose expiration time has passed.
        let requested: Vec<String> = std::mem::take(&mut *self.inner.delete_requested.lock());
        let mut to_delete: Vec<Arc<Message>> = requested
            .iter()
            .filter_map(|id| self.inner.queue.get(id))
            .collect();
        let now = now_ms();
        for msg in &batch {
            if to_delete.iter().any(|m| m.pub_msg_id == msg.pub_msg_id) {
                continue;
            }
            if let Some(max_retry) = cfg.delivery_max_retry {
                if msg.delivery_count() >= max_retry {
                    debug!(
                        sub_key = %cfg.sub_key,
                        msg_id = %msg.pub_msg_id,
                        max_retry,
                        "max delivery retries reached"
                    );
                    to_delete.push(Arc::clone(msg));
                    continue;
                }
            }
            if msg.is_expired(now) {
                debug!(
                    sub_key = %cfg.sub_key,
                    msg_id = %msg.pub_msg_id,
                    expiration_time = msg.expiration_time,
                    "message expired"
                );
                to_delete.push(Arc::clone(msg));
            }
        }
        let deleted_ids: HashSet<&str> = to_delete
            .iter()
            .map(|msg| msg.pub_msg_id.as_str())
            .collect();

        let to_deliver: Vec<Arc<Message>> = if let Some(hook) = &self.inner.hook {
            let candidates: Vec<Arc<Message>> = batch
                .iter()
                .filter(|msg| !deleted_ids.contains(msg.pub_msg_id.as_str()))
                .cloned()
                .collect();
            let mut buckets = DeliveryBuckets::default();
            hook.before_delivery(cfg.topic_id, &cfg.sub_key, &candidates, &mut buckets);
            if !buckets.skip.is_empty() {
                debug!(
                    sub_key = %cfg.sub_key,
                    count = buckets.skip.len(),
                    "hook skipped messages"
                );
            }
            to_delete.extend(buckets.delete);
            buckets.deliver
        } else {
            batch
                .iter()
                .filter(|msg| !deleted_ids.contains(msg.pub_msg_id.as_str()))
                .cloned()
                .collect()
        };

        // Deletions happen before any delivery is attempted.
        if !to_delete.is_empty() {
            self.delete_now(&cfg.sub_key, &to_delete).await?;
        }

        if to_deliver.is_empty() {
            return Ok(AttemptOutcome::NoMessages);
        }

        for msg in &to_deliver {
            let _ = msg.increment_delivery_count();
        }
        let ids: Vec<String> = to_deliver
            .iter()
            .map(|msg| msg.pub_msg_id.clone())
            .collect();

        let payload = if to_deliver.len() == 1 && !cfg.wrap_one_msg_in_list {
            DeliveryBatch::Single(Arc::clone(&to_deliver[0]))
        } else {
            DeliveryBatch::List(to_deliver)
        };
        let count = payload.len();

        cb.deliver(&cfg.sub_key, payload).await?;
        self.inner
            .confirm_cb
            .confirm_delivered(&cfg.sub_key, &ids)
            .await?;

        // Removal failure after a durable confirmation is a recoverable
        // inconsistency, not a rollback.
        let missing = self.inner.queue.remove_by_id(ids.iter().map(String::as_str));
        if !missing.is_empty() {
            warn!(
                sub_key = %cfg.sub_key,
                missing = ?missing,
                "confirmed messages were already absent from the queue"
            );
        }

        let _ = self
            .inner
            .counters
            .batches_delivered
            .fetch_add(1, Ordering::Relaxed);
        let _ = self
            .inner
            .counters
            .messages_delivered
            .fetch_add(count as u64, Ordering::Relaxed);

        Ok(AttemptOutcome::Delivered(count))
    }

    /// Deletes messages from the durable store and the queue.
    async fn delete_now(
        &self,
        sub_key: &SubKey,
        msgs: &[Arc<Message>],
    ) -> Result<(), DeliveryError> {
        let gd_ids: Vec<String> = msgs
            .iter()
            .filter(|msg| msg.has_gd)
            .map(|msg| msg.pub_msg_id.clone())
            .collect();
        if !gd_ids.is_empty() {
            self.inner.store.mark_deleted(sub_key, &gd_ids).await?;
        }
        let _ = self
            .inner
            .queue
            .remove_by_id(msgs.iter().map(|msg| msg.pub_msg_id.as_str()));
        info!(sub_key = %sub_key, count = msgs.len(), "messages deleted");
        Ok(())
    }
}

impl std::fmt::Debug for DeliveryTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTask")
            .field("sub_key", &self.sub_key())
            .finish_non_exhaustive()
    }
}

/// Delivery callback that appends payloads to a buffer, used by
/// [`DeliveryTask::pull_messages`].
#[derive(Default)]
struct CollectingCallback {
    out: Mutex<Vec<Value>>,
}

impl CollectingCallback {
    fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.out.lock())
    }
}

#[async_trait]
impl DeliveryCallback for CollectingCallback {
    async fn deliver(&self, _sub_key: &SubKey, batch: DeliveryBatch) -> Result<(), DeliveryError> {
        let mut out = self.out.lock();
        for msg in batch.messages() {
            out.push(msg.to_payload());
        }
        Ok(())
    }
}
