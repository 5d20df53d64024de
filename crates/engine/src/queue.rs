// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! The per-subscription delivery queue.
//!
//! Exactly two actors mutate a queue: the publisher appends and the owning
//! delivery task removes. Messages stay ordered by priority and publication
//! time; a batch read never removes anything, removal happens only after a
//! confirmed delivery or an explicit deletion.

use crate::message::Message;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Ordered, shared-mutable queue of messages awaiting delivery.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    messages: Mutex<Vec<Arc<Message>>>,
}

impl DeliveryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends messages, keeping the queue ordered.
    pub fn push(&self, incoming: impl IntoIterator<Item = Arc<Message>>) {
        let mut messages = self.messages.lock();
        messages.extend(incoming);
        messages.sort_by_key(|msg| msg.delivery_order_key());
    }

    /// Returns up to `max` messages from the head without removing them.
    #[must_use]
    pub fn peek_batch(&self, max: usize) -> Vec<Arc<Message>> {
        let messages = self.messages.lock();
        messages.iter().take(max).cloned().collect()
    }

    /// Removes the messages with the given ids. Returns the ids that were
    /// not present, for the caller to log.
    pub fn remove_by_id<'a>(
        &self,
        msg_ids: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        let mut wanted: HashSet<&str> = msg_ids.into_iter().collect();
        let mut messages = self.messages.lock();
        messages.retain(|msg| !wanted.remove(msg.pub_msg_id.as_str()));
        wanted.into_iter().map(str::to_owned).collect()
    }

    /// Finds one queued message by id.
    #[must_use]
    pub fn get(&self, msg_id: &str) -> Option<Arc<Message>> {
        let messages = self.messages.lock();
        messages
            .iter()
            .find(|msg| msg.pub_msg_id == msg_id)
            .cloned()
    }

    /// Non-destructive snapshot, optionally filtered by durability class.
    #[must_use]
    pub fn snapshot(&self, has_gd: Option<bool>) -> Vec<Arc<Message>> {
        let messages = self.messages.lock();
        match has_gd {
            None => messages.clone(),
            Some(wanted) => messages
                .iter()
                .filter(|msg| msg.has_gd == wanted)
                .cloned()
                .collect(),
        }
    }

    /// Number of queued messages, split into (GD, non-GD).
    #[must_use]
    pub fn depth(&self) -> (usize, usize) {
        let messages = self.messages.lock();
        let gd = messages.iter().filter(|msg| msg.has_gd).count();
        (gd, messages.len() - gd)
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Empties the queue, returning the (GD, non-GD) counts it held.
    pub fn clear(&self) -> (usize, usize) {
        let mut messages = self.messages.lock();
        let gd = messages.iter().filter(|msg| msg.has_gd).count();
        let non_gd = messages.len() - gd;
        messages.clear();
        (gd, non_gd)
    }
}
