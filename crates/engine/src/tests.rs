// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests of the publish pipeline and the delivery tasks,
//! running against the in-memory store.

use crate::broker::{BrokerOptions, PubSubBroker};
use crate::error::{DeliveryError, PublishError, TaskError};
use crate::publisher::{CallerRef, PubEndpoint, PubItem, PubRequest, PublishAuthorizer, PublishResponse};
use crate::store::{GdStore, MemoryStore, RowStatus};
use crate::task::{DeliveryBatch, DeliveryCallback, DeliveryTask, StoreConfirm};
use async_trait::async_trait;
use pubsub_config::subscription::{DeliveryMethod, SubscriptionConfig};
use pubsub_config::topic::{OnNoSubsPublish, TopicConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

// ---------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------

struct AllowAll;

impl PublishAuthorizer for AllowAll {
    fn resolve(&self, _caller: CallerRef<'_>, _topic_name: &str) -> Option<PubEndpoint> {
        Some(PubEndpoint {
            endpoint_id: 10,
            endpoint_name: "test-endpoint".to_owned(),
            pub_pattern: "pub=/*".to_owned(),
        })
    }
}

struct DenyAll;

impl PublishAuthorizer for DenyAll {
    fn resolve(&self, _caller: CallerRef<'_>, _topic_name: &str) -> Option<PubEndpoint> {
        None
    }
}

/// What a [`RecordingCallback`] does after recording a batch.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CallbackMode {
    Ok,
    FailIo,
    FailRuntime,
}

/// Records every delivered batch; optionally blocks on a semaphore or
/// fails with a chosen error class.
struct RecordingCallback {
    batches: parking_lot::Mutex<Vec<Vec<String>>>,
    mode: parking_lot::Mutex<CallbackMode>,
    hold: parking_lot::Mutex<Option<Arc<Semaphore>>>,
}

impl Default for RecordingCallback {
    fn default() -> Self {
        Self {
            batches: parking_lot::Mutex::new(Vec::new()),
            mode: parking_lot::Mutex::new(CallbackMode::Ok),
            hold: parking_lot::Mutex::new(None),
        }
    }
}

impl RecordingCallback {
    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().clone()
    }

    fn delivered_ids(&self) -> Vec<String> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    fn set_mode(&self, mode: CallbackMode) {
        *self.mode.lock() = mode;
    }

    fn hold_on(&self, sem: Arc<Semaphore>) {
        *self.hold.lock() = Some(sem);
    }
}

#[async_trait]
impl DeliveryCallback for RecordingCallback {
    async fn deliver(
        &self,
        _sub_key: &pubsub_config::SubKey,
        batch: DeliveryBatch,
    ) -> Result<(), DeliveryError> {
        let ids: Vec<String> = batch
            .messages()
            .iter()
            .map(|msg| msg.pub_msg_id.clone())
            .collect();
        self.batches.lock().push(ids);

        let hold = self.hold.lock().clone();
        if let Some(sem) = hold {
            let _permit = sem.acquire().await;
        }
        match *self.mode.lock() {
            CallbackMode::Ok => Ok(()),
            CallbackMode::FailIo => Err(DeliveryError::Io("connection reset".to_owned())),
            CallbackMode::FailRuntime => {
                Err(DeliveryError::RuntimeInvoke("callable is gone".to_owned()))
            }
        }
    }
}

// ---------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------

fn test_broker(store: &Arc<MemoryStore>) -> PubSubBroker {
    PubSubBroker::new(
        Arc::clone(store) as Arc<dyn GdStore>,
        Arc::new(AllowAll),
        BrokerOptions::default(),
    )
}

fn topic(name: &'static str, has_gd: bool) -> TopicConfig {
    let mut cfg = TopicConfig::new(1, name.into());
    cfg.has_gd = has_gd;
    cfg
}

fn fast_sub(
    sub_key: &'static str,
    topic_name: &'static str,
    method: DeliveryMethod,
) -> SubscriptionConfig {
    let mut cfg = SubscriptionConfig::new(sub_key.into(), topic_name.into(), 1, 10, "test-endpoint");
    cfg.delivery_method = method;
    cfg.wait_sock_err_s = 0;
    cfg.wait_non_sock_err_s = 0;
    cfg.read_timeout_s = 1;
    cfg
}

fn subscribe(
    broker: &PubSubBroker,
    store: &Arc<MemoryStore>,
    cfg: SubscriptionConfig,
) -> (DeliveryTask, Arc<RecordingCallback>) {
    let callback = Arc::new(RecordingCallback::default());
    let task = broker
        .subscribe(
            cfg,
            Arc::clone(&callback) as Arc<dyn DeliveryCallback>,
            Arc::new(StoreConfirm::new(Arc::clone(store) as Arc<dyn GdStore>)),
            None,
        )
        .expect("subscribe");
    (task, callback)
}

fn request(topic_name: &str, data: &str) -> PubRequest {
    PubRequest {
        topic_name: topic_name.to_owned(),
        data: Some(data.to_owned()),
        endpoint_id: Some(10),
        ..PubRequest::default()
    }
}

fn single_id(response: Option<PublishResponse>) -> String {
    match response {
        Some(PublishResponse::Single(id)) => id,
        other => panic!("expected a single message id, got {other:?}"),
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------
// Publisher errors
// ---------------------------------------------------------------------

#[tokio::test]
async fn publish_unknown_topic_fails() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);

    let err = broker
        .publisher()
        .publish(request("nowhere", "x"))
        .await
        .expect_err("unknown topic");
    assert!(matches!(err, PublishError::TopicNotFound { .. }));
}

#[tokio::test]
async fn publish_inactive_topic_fails() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    let mut cfg = topic("orders", false);
    cfg.is_active = false;
    broker.register_topic(cfg, None);

    let err = broker
        .publisher()
        .publish(request("orders", "x"))
        .await
        .expect_err("inactive topic");
    assert!(matches!(err, PublishError::TopicInactive { .. }));
}

#[tokio::test]
async fn publish_without_authorization_fails_closed() {
    let store = Arc::new(MemoryStore::new());
    let broker = PubSubBroker::new(
        Arc::clone(&store) as Arc<dyn GdStore>,
        Arc::new(DenyAll),
        BrokerOptions::default(),
    );
    broker.register_topic(topic("orders", false), None);

    let err = broker
        .publisher()
        .publish(request("orders", "x"))
        .await
        .expect_err("denied");
    assert!(matches!(err, PublishError::Forbidden { .. }));

    // A request naming no caller at all is equally forbidden.
    let anonymous = PubRequest {
        topic_name: "orders".to_owned(),
        data: Some("x".to_owned()),
        ..PubRequest::default()
    };
    let err = broker
        .publisher()
        .publish(anonymous)
        .await
        .expect_err("anonymous");
    assert!(matches!(err, PublishError::Forbidden { .. }));
}

#[tokio::test]
async fn publish_without_payload_is_invalid() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);

    let empty = PubRequest {
        topic_name: "orders".to_owned(),
        endpoint_id: Some(10),
        ..PubRequest::default()
    };
    let err = broker
        .publisher()
        .publish(empty)
        .await
        .expect_err("no payload");
    assert!(matches!(err, PublishError::InvalidRequest { .. }));
}

// ---------------------------------------------------------------------
// Depth limit
// ---------------------------------------------------------------------

#[tokio::test]
async fn depth_limit_rejects_batch_without_persisting() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    let mut cfg = topic("orders", true);
    cfg.max_depth_gd = 2;
    cfg.depth_check_freq = 1;
    broker.register_topic(cfg, None);
    let publisher = broker.publisher();

    let _ = single_id(publisher.publish(request("orders", "a")).await.expect("1st"));
    let _ = single_id(publisher.publish(request("orders", "b")).await.expect("2nd"));
    assert_eq!(store.message_count(), 2);

    let err = publisher
        .publish(request("orders", "c"))
        .await
        .expect_err("over the limit");
    assert!(matches!(
        err,
        PublishError::DepthExceeded {
            current_depth: 2,
            incoming: 1,
            max_depth_gd: 2,
            ..
        }
    ));
    // Nothing from the rejected batch was persisted.
    assert_eq!(store.message_count(), 2);
}

#[tokio::test]
async fn depth_check_is_throttled() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    let mut cfg = topic("orders", true);
    cfg.max_depth_gd = 1;
    cfg.depth_check_freq = 100;
    broker.register_topic(cfg, None);
    let publisher = broker.publisher();

    // First publish runs the check, the following ones skip it even
    // though the depth is already past the limit.
    let _ = publisher.publish(request("orders", "a")).await.expect("1st");
    let _ = publisher.publish(request("orders", "b")).await.expect("2nd");
    let _ = publisher.publish(request("orders", "c")).await.expect("3rd");
    assert_eq!(store.message_count(), 3);
}

// ---------------------------------------------------------------------
// Durability resolution
// ---------------------------------------------------------------------

#[tokio::test]
async fn missing_delivery_server_forces_gd() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    // WebSocket subscriptions have no delivery-owning process until one
    // registers.
    let (task, _callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-ws", "orders", DeliveryMethod::WebSocket),
    );

    let mut req = request("orders", "x");
    req.has_gd = Some(false);
    let id = single_id(broker.publisher().publish(req).await.expect("publish"));

    let stored = store.stored_message(&id).expect("persisted");
    assert!(stored.has_gd);
    assert_eq!(task.get_queue_depth(), (0, 0));

    // Once the server registers, the explicit value applies again.
    broker.sk_server_up(&"sk-ws".into());
    let mut req = request("orders", "y");
    req.has_gd = Some(false);
    let id = single_id(broker.publisher().publish(req).await.expect("publish"));
    assert!(store.stored_message(&id).is_none());
}

#[tokio::test]
async fn explicit_request_value_overrides_topic_default() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", true), None);
    let (task, _callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-pull", "orders", DeliveryMethod::Pull),
    );

    let mut req = request("orders", "x");
    req.has_gd = Some(false);
    let id = single_id(broker.publisher().publish(req).await.expect("publish"));

    assert!(store.stored_message(&id).is_none());
    wait_until("non-GD message queued", || task.get_queue_depth() == (0, 1)).await;
}

#[tokio::test]
async fn topic_default_applies_when_request_is_silent() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", true), None);
    let (_task, _callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-pull", "orders", DeliveryMethod::Pull),
    );

    let id = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );
    assert!(store.stored_message(&id).expect("persisted").has_gd);
    assert_eq!(
        store.row_status(&"sk-pull".into(), &id),
        Some(RowStatus::Initialized)
    );
}

// ---------------------------------------------------------------------
// No-subscriber policies
// ---------------------------------------------------------------------

#[tokio::test]
async fn drop_policy_returns_none_and_writes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    let mut cfg = topic("orders", true);
    cfg.on_no_subs_pub = OnNoSubsPublish::Drop;
    broker.register_topic(cfg, None);

    let response = broker
        .publisher()
        .publish(request("orders", "x"))
        .await
        .expect("publish");
    assert!(response.is_none());
    assert_eq!(store.message_count(), 0);
}

#[tokio::test]
async fn keep_policy_converts_non_gd_to_exactly_one_gd_row() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);

    let id = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );
    assert_eq!(store.message_count(), 1);
    let stored = store.stored_message(&id).expect("persisted");
    assert!(stored.has_gd);
    assert!(stored.data_prefix.is_some());
}

// ---------------------------------------------------------------------
// Multi-message requests and hooks
// ---------------------------------------------------------------------

#[tokio::test]
async fn data_list_returns_ordered_ids() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", true), None);

    let req = PubRequest {
        topic_name: "orders".to_owned(),
        data_list: Some(vec![
            PubItem {
                data: "a".to_owned(),
                msg_id: Some("zpsm-a".to_owned()),
                ..PubItem::default()
            },
            PubItem {
                data: "b".to_owned(),
                msg_id: Some("zpsm-b".to_owned()),
                ..PubItem::default()
            },
        ]),
        endpoint_id: Some(10),
        ..PubRequest::default()
    };
    let response = broker.publisher().publish(req).await.expect("publish");
    assert_eq!(
        response,
        Some(PublishResponse::Multiple(vec![
            "zpsm-a".to_owned(),
            "zpsm-b".to_owned()
        ]))
    );
    assert_eq!(store.message_count(), 2);
}

#[tokio::test]
async fn before_publish_hook_can_veto_messages() {
    use crate::hook::{PublishHook, PublishHookAction};

    struct VetoMarked;
    impl PublishHook for VetoMarked {
        fn before_publish(
            &self,
            _topic: &TopicConfig,
            msg: &crate::message::Message,
        ) -> PublishHookAction {
            if msg.data.contains("veto") {
                PublishHookAction::Skip
            } else {
                PublishHookAction::Deliver
            }
        }
    }

    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", true), Some(Arc::new(VetoMarked)));

    let req = PubRequest {
        topic_name: "orders".to_owned(),
        data_list: Some(vec![
            PubItem {
                data: "keep-1".to_owned(),
                ..PubItem::default()
            },
            PubItem {
                data: "veto-me".to_owned(),
                ..PubItem::default()
            },
            PubItem {
                data: "keep-2".to_owned(),
                ..PubItem::default()
            },
        ]),
        endpoint_id: Some(10),
        ..PubRequest::default()
    };
    let response = broker.publisher().publish(req).await.expect("publish");
    let ids = match response {
        Some(PublishResponse::Multiple(ids)) => ids,
        other => panic!("expected two ids, got {other:?}"),
    };
    assert_eq!(ids.len(), 2);
    assert_eq!(store.message_count(), 2);
}

#[tokio::test]
async fn deliver_to_sk_restricts_fan_out() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (wanted, _) = subscribe(
        &broker,
        &store,
        fast_sub("sk-wanted", "orders", DeliveryMethod::Pull),
    );
    let (other, _) = subscribe(
        &broker,
        &store,
        fast_sub("sk-other", "orders", DeliveryMethod::Pull),
    );

    let mut req = request("orders", "x");
    req.deliver_to_sk = vec!["sk-wanted".into()];
    let _ = single_id(broker.publisher().publish(req).await.expect("publish"));

    wait_until("restricted fan-out", || wanted.get_queue_depth() == (0, 1)).await;
    assert_eq!(other.get_queue_depth(), (0, 0));
}

// ---------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------

#[tokio::test]
async fn batches_never_exceed_the_configured_size() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let mut sub = fast_sub("sk-1", "orders", DeliveryMethod::Notify);
    sub.delivery_batch_size = 2;
    let (_task, callback) = subscribe(&broker, &store, sub);

    let req = PubRequest {
        topic_name: "orders".to_owned(),
        data_list: Some(
            (0..5)
                .map(|i| PubItem {
                    data: format!("m-{i}"),
                    ..PubItem::default()
                })
                .collect(),
        ),
        endpoint_id: Some(10),
        ..PubRequest::default()
    };
    let _ = broker.publisher().publish(req).await.expect("publish");

    wait_until("all five delivered", || callback.delivered_ids().len() == 5).await;
    for batch in callback.batches() {
        assert!(batch.len() <= 2, "batch too large: {batch:?}");
    }
}

#[tokio::test]
async fn single_message_is_unwrapped_when_configured() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let mut sub = fast_sub("sk-1", "orders", DeliveryMethod::Notify);
    sub.wrap_one_msg_in_list = false;

    // Observe the batch shape directly.
    struct ShapeCheck {
        saw_single: parking_lot::Mutex<bool>,
    }
    #[async_trait]
    impl DeliveryCallback for ShapeCheck {
        async fn deliver(
            &self,
            _sub_key: &pubsub_config::SubKey,
            batch: DeliveryBatch,
        ) -> Result<(), DeliveryError> {
            if matches!(batch, DeliveryBatch::Single(_)) {
                *self.saw_single.lock() = true;
            }
            Ok(())
        }
    }
    let callback = Arc::new(ShapeCheck {
        saw_single: parking_lot::Mutex::new(false),
    });
    let _task = broker
        .subscribe(
            sub,
            Arc::clone(&callback) as Arc<dyn DeliveryCallback>,
            Arc::new(StoreConfirm::new(Arc::clone(&store) as Arc<dyn GdStore>)),
            None,
        )
        .expect("subscribe");

    let _ = broker
        .publisher()
        .publish(request("orders", "x"))
        .await
        .expect("publish");
    wait_until("single delivery", || *callback.saw_single.lock()).await;
}

#[tokio::test]
async fn max_retry_deletes_instead_of_redelivering() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let mut sub = fast_sub("sk-1", "orders", DeliveryMethod::Notify);
    sub.delivery_max_retry = Some(1);
    let (task, callback) = subscribe(&broker, &store, sub);
    callback.set_mode(CallbackMode::FailIo);

    let id = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );

    wait_until("message deleted after exhausted retries", || {
        task.get_queue_depth() == (0, 0)
    })
    .await;
    // Exactly one delivery attempt was made for it.
    let attempts = callback
        .delivered_ids()
        .iter()
        .filter(|delivered| **delivered == id)
        .count();
    assert_eq!(attempts, 1);
}

#[tokio::test]
async fn unrecoverable_invocation_error_stops_the_task() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (task, callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-1", "orders", DeliveryMethod::Notify),
    );
    callback.set_mode(CallbackMode::FailRuntime);

    let _ = broker
        .publisher()
        .publish(request("orders", "x"))
        .await
        .expect("publish");

    wait_until("one failed attempt", || !callback.batches().is_empty()).await;
    // The task stopped itself; stop() returns promptly instead of
    // timing out.
    task.stop().await.expect("already stopped");
    // The failed message stays queued for the task's next incarnation.
    assert_eq!(task.get_queue_depth(), (0, 1));
}

#[tokio::test]
async fn transport_errors_back_off_and_retry() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (_task, callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-1", "orders", DeliveryMethod::Notify),
    );
    callback.set_mode(CallbackMode::FailIo);

    let id = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );

    // At least two attempts for the same message.
    wait_until("retried", || {
        callback
            .delivered_ids()
            .iter()
            .filter(|delivered| **delivered == id)
            .count()
            >= 2
    })
    .await;

    // Once the transport recovers, the message is confirmed and removed.
    callback.set_mode(CallbackMode::Ok);
    wait_until("confirmed", || {
        store.row_status(&"sk-1".into(), &id) == Some(RowStatus::Delivered)
    })
    .await;
}

#[tokio::test]
async fn deletion_requests_defer_until_the_attempt_finishes() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (task, callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-1", "orders", DeliveryMethod::Notify),
    );
    let gate = Arc::new(Semaphore::new(0));
    callback.hold_on(Arc::clone(&gate));

    let first = single_id(
        broker
            .publisher()
            .publish(request("orders", "a"))
            .await
            .expect("publish"),
    );
    wait_until("first delivery in flight", || !callback.batches().is_empty()).await;

    // Published and deletion-requested while the attempt is in flight.
    let second = single_id(
        broker
            .publisher()
            .publish(request("orders", "b"))
            .await
            .expect("publish"),
    );
    task.delete_messages(vec![second.clone()])
        .await
        .expect("request deletion");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(task.get_message(&second).is_some(), "deleted too early");

    // Let the in-flight attempt finish; the next one applies the deletion.
    gate.add_permits(1);
    wait_until("deferred deletion applied", || {
        task.get_message(&second).is_none()
    })
    .await;
    assert!(!callback.delivered_ids().contains(&second));
    assert!(callback.delivered_ids().contains(&first));
}

#[tokio::test]
async fn stop_times_out_when_an_attempt_never_finishes() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (task, callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-1", "orders", DeliveryMethod::Notify),
    );
    // Never released: the delivery attempt blocks forever.
    callback.hold_on(Arc::new(Semaphore::new(0)));

    let _ = broker
        .publisher()
        .publish(request("orders", "x"))
        .await
        .expect("publish");
    wait_until("delivery in flight", || !callback.batches().is_empty()).await;

    let err = task.stop().await.expect_err("must time out");
    assert!(matches!(err, TaskError::StopTimeout { .. }));
}

#[tokio::test]
async fn expired_messages_are_dropped_without_delivery() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (task, _callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-pull", "orders", DeliveryMethod::Pull),
    );

    let mut req = request("orders", "stale");
    req.expiration = Some(1);
    let id = single_id(broker.publisher().publish(req).await.expect("publish"));
    wait_until("queued", || task.get_queue_depth() == (0, 1)).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    let pulled = task.pull_messages().await.expect("pull");
    assert!(pulled.is_empty(), "expired message was delivered: {pulled:?}");
    assert!(task.get_message(&id).is_none());
}

// ---------------------------------------------------------------------
// Pull subscriptions
// ---------------------------------------------------------------------

#[tokio::test]
async fn pulled_messages_are_confirmed_and_gone() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (task, callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-pull", "orders", DeliveryMethod::Pull),
    );

    let id = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );
    wait_until("queued", || task.get_queue_depth() == (0, 1)).await;

    let pulled = task.pull_messages().await.expect("pull");
    assert_eq!(pulled.len(), 1);
    assert_eq!(pulled[0]["msg_id"], id.as_str());
    assert_eq!(pulled[0]["data"], "x");

    // Confirmed and removed; the loop's callback was never involved.
    assert!(task.get_messages(None).is_empty());
    assert!(callback.batches().is_empty());

    // Nothing left to pull.
    let again = task.pull_messages().await.expect("pull");
    assert!(again.is_empty());
}

#[tokio::test]
async fn pull_subscriptions_delete_immediately() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (task, _callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-pull", "orders", DeliveryMethod::Pull),
    );

    let id = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );
    wait_until("queued", || task.get_queue_depth() == (0, 1)).await;

    task.delete_messages(vec![id.clone()]).await.expect("delete");
    assert!(task.get_message(&id).is_none());
}

// ---------------------------------------------------------------------
// Recovery and lifecycle
// ---------------------------------------------------------------------

#[tokio::test]
async fn startup_recovers_undelivered_gd_messages() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", true), None);

    // Persisted before any subscriber existed (keep policy).
    let id = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );
    // Simulate the admin layer having created the queue row for the
    // late subscriber.
    let sub = fast_sub("sk-late", "orders", DeliveryMethod::Pull);
    let stored = store.stored_message(&id).expect("persisted");
    store
        .insert_published(&[stored], std::slice::from_ref(&sub))
        .await
        .expect("row");

    let (task, _callback) = subscribe(&broker, &store, sub);
    wait_until("recovered at startup", || task.get_queue_depth() == (1, 0)).await;
    assert!(task.get_message(&id).is_some());
}

#[tokio::test]
async fn unsubscribe_stops_the_task_and_clears_state() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (_task, _callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-1", "orders", DeliveryMethod::Pull),
    );
    assert!(broker.task("sk-1").is_some());

    broker.unsubscribe(&"sk-1".into()).await.expect("unsubscribe");
    assert!(broker.task("sk-1").is_none());

    let err = broker
        .unsubscribe(&"sk-1".into())
        .await
        .expect_err("already gone");
    assert!(matches!(err, TaskError::SubscriptionNotFound { .. }));
}

#[tokio::test]
async fn duplicate_subscription_keys_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (_task, _callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-1", "orders", DeliveryMethod::Pull),
    );

    let callback = Arc::new(RecordingCallback::default());
    let err = broker
        .subscribe(
            fast_sub("sk-1", "orders", DeliveryMethod::Pull),
            callback as Arc<dyn DeliveryCallback>,
            Arc::new(StoreConfirm::new(Arc::clone(&store) as Arc<dyn GdStore>)),
            None,
        )
        .expect_err("duplicate");
    assert!(matches!(err, TaskError::SubscriptionExists { .. }));
}

#[tokio::test]
async fn sub_config_updates_apply_between_iterations() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", false), None);
    let (task, callback) = subscribe(
        &broker,
        &store,
        fast_sub("sk-1", "orders", DeliveryMethod::Pull),
    );

    // While pull-style, the loop leaves the queue alone.
    let _ = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );
    wait_until("queued", || task.get_queue_depth() == (0, 1)).await;
    assert!(callback.batches().is_empty());

    // Switching to notify makes the loop drain it.
    let updated = fast_sub("sk-1", "orders", DeliveryMethod::Notify);
    broker.update_sub_config(updated).expect("update");
    wait_until("delivered after method change", || {
        callback.delivered_ids().len() == 1
    })
    .await;

    let unknown = fast_sub("sk-missing", "orders", DeliveryMethod::Notify);
    assert!(matches!(
        broker.update_sub_config(unknown),
        Err(TaskError::SubscriptionNotFound { .. })
    ));
}

// ---------------------------------------------------------------------
// Metrics, metadata and flags
// ---------------------------------------------------------------------

#[tokio::test]
async fn publish_counters_and_metadata_are_updated() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", true), None);

    let _ = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );

    let metrics = broker.metrics();
    assert_eq!(metrics.total_published(), 1);
    assert_eq!(metrics.endpoint_total(10), 1);
    assert_eq!(metrics.topic_counters("orders").gd, 1);

    // The metadata update is fire-and-forget.
    let meta = broker.meta();
    wait_until("metadata recorded", || {
        meta.last_published("orders").is_some()
    })
    .await;
    assert_eq!(meta.last_published("orders").expect("record").endpoint_id, 10);
}

#[tokio::test]
async fn gd_flag_is_set_on_persist_and_cleared_on_take() {
    let store = Arc::new(MemoryStore::new());
    let broker = test_broker(&store);
    broker.register_topic(topic("orders", true), None);
    assert!(!broker.has_new_gd_msg("orders"));

    let _ = single_id(
        broker
            .publisher()
            .publish(request("orders", "x"))
            .await
            .expect("publish"),
    );
    assert!(broker.has_new_gd_msg("orders"));
    assert!(broker.take_gd_msg_flag("orders"));
    assert!(!broker.has_new_gd_msg("orders"));
}
