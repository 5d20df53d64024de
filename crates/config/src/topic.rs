// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Topic configuration as administered externally and consumed read-mostly
//! by the publisher.

use crate::names::{TopicId, TopicName};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// What the publisher does when a topic has no matching subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnNoSubsPublish {
    /// Keep going: persist/queue the messages as if subscribers existed, so
    /// they remain available for future subscribers where the store allows.
    #[default]
    Accept,
    /// Drop every message of the publish call and return nothing.
    Drop,
}

/// A named topic specification.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TopicConfig {
    /// Numeric topic identifier assigned by the admin layer.
    pub id: TopicId,
    /// Topic name.
    pub name: TopicName,
    /// Inactive topics reject publications outright.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Default durability class for messages that do not specify one.
    #[serde(default)]
    pub has_gd: bool,
    /// Maximum number of undelivered guaranteed-delivery messages.
    #[serde(default = "default_max_depth_gd")]
    pub max_depth_gd: usize,
    /// The GD depth check runs on the first publish and then once every this
    /// many publishes, not on every call.
    #[serde(default = "default_depth_check_freq")]
    pub depth_check_freq: u64,
    /// Behavior when no subscriber matches a publish call.
    #[serde(default)]
    pub on_no_subs_pub: OnNoSubsPublish,
    /// Upper bound, in milliseconds, applied to requested expirations.
    #[serde(default = "default_limit_message_expiry_ms")]
    pub limit_message_expiry_ms: i64,
    /// Minimum interval, in milliseconds, between publish-metadata updates
    /// for this topic.
    #[serde(default = "default_meta_store_frequency_ms")]
    pub meta_store_frequency_ms: i64,
}

impl TopicConfig {
    /// Builds a topic config with defaults for everything but id and name.
    #[must_use]
    pub fn new(id: TopicId, name: TopicName) -> Self {
        Self {
            id,
            name,
            is_active: true,
            has_gd: false,
            max_depth_gd: default_max_depth_gd(),
            depth_check_freq: default_depth_check_freq(),
            on_no_subs_pub: OnNoSubsPublish::default(),
            limit_message_expiry_ms: default_limit_message_expiry_ms(),
            meta_store_frequency_ms: default_meta_store_frequency_ms(),
        }
    }

    /// Returns validation errors for this topic configuration.
    #[must_use]
    pub fn validation_errors(&self, path_prefix: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_depth_gd == 0 {
            errors.push(format!("{path_prefix}.max_depth_gd must be greater than 0"));
        }
        if self.depth_check_freq == 0 {
            errors.push(format!(
                "{path_prefix}.depth_check_freq must be greater than 0"
            ));
        }
        if self.limit_message_expiry_ms <= 0 {
            errors.push(format!(
                "{path_prefix}.limit_message_expiry_ms must be greater than 0"
            ));
        }
        errors
    }
}

const fn default_true() -> bool {
    true
}

const fn default_max_depth_gd() -> usize {
    10_000
}

const fn default_depth_check_freq() -> u64 {
    100
}

const fn default_limit_message_expiry_ms() -> i64 {
    crate::limits::EXPIRATION_DEFAULT_MS
}

const fn default_meta_store_frequency_ms() -> i64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::{OnNoSubsPublish, TopicConfig};

    #[test]
    fn defaults_match_expected_values() {
        let topic = TopicConfig::new(1, "orders".into());
        assert!(topic.is_active);
        assert!(!topic.has_gd);
        assert_eq!(topic.max_depth_gd, 10_000);
        assert_eq!(topic.depth_check_freq, 100);
        assert_eq!(topic.on_no_subs_pub, OnNoSubsPublish::Accept);
    }

    #[test]
    fn validates_non_zero_depth_limits() {
        let mut topic = TopicConfig::new(1, "orders".into());
        topic.max_depth_gd = 0;
        topic.depth_check_freq = 0;

        let errors = topic.validation_errors("topics.orders");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|error| error.contains(".max_depth_gd")));
        assert!(errors
            .iter()
            .any(|error| error.contains(".depth_check_freq")));
    }

    #[test]
    fn deserializes_policy_values() {
        let yaml = r#"
id: 7
name: invoices
has_gd: true
max_depth_gd: 50
on_no_subs_pub: drop
"#;

        let topic: TopicConfig = serde_yaml::from_str(yaml).expect("topic should parse");
        assert_eq!(topic.id, 7);
        assert!(topic.has_gd);
        assert_eq!(topic.max_depth_gd, 50);
        assert_eq!(topic.on_no_subs_pub, OnNoSubsPublish::Drop);
        assert!(topic.is_active);
    }
}
