// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Identifier types shared across the workspace.
//!
//! Topic names and subscription keys arrive from the admin layer and from
//! wire requests, so both are checked once at the boundary and carried as
//! owned newtypes afterwards. Topic names may be slash-separated paths
//! such as `/sample/orders`; subscription keys generated by the server
//! side carry a `zpsk` prefix, while externally administered keys only
//! need to satisfy the general rules below.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Numeric identifier of a topic, assigned by the external admin layer.
pub type TopicId = u64;

/// Numeric identifier of a publishing endpoint.
pub type EndpointId = u64;

/// Longest accepted topic name, matching the admin layer's column width.
const TOPIC_NAME_MAX_LEN: usize = 200;

/// Longest accepted subscription key.
const SUB_KEY_MAX_LEN: usize = 100;

/// Shared rules for both identifier kinds: non-empty, bounded, and free
/// of whitespace and control characters.
fn check_identifier(kind: &str, raw: &str, max_len: usize) -> Result<(), String> {
    if raw.is_empty() {
        return Err(format!("{kind} must not be empty"));
    }
    if raw.len() > max_len {
        return Err(format!("{kind} is longer than {max_len} bytes"));
    }
    if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!(
            "{kind} `{raw}` contains whitespace or control characters"
        ));
    }
    Ok(())
}

/// Name of a topic, as used in publish requests and subscriptions.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
#[schemars(with = "String")]
pub struct TopicName(String);

impl TopicName {
    /// Checks `raw` against the topic-name rules and wraps it.
    pub fn parse(raw: &str) -> Result<Self, String> {
        check_identifier("topic name", raw, TOPIC_NAME_MAX_LEN)?;
        Ok(Self(raw.to_owned()))
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the newtype, returning the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

/// Key addressing one subscription, its delivery queue and its task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
#[schemars(with = "String")]
pub struct SubKey(String);

impl SubKey {
    /// Checks `raw` against the sub-key rules and wraps it.
    pub fn parse(raw: &str) -> Result<Self, String> {
        check_identifier("sub key", raw, SUB_KEY_MAX_LEN)?;
        Ok(Self(raw.to_owned()))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the newtype, returning the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

macro_rules! string_newtype_impls {
    ($ty:ident, $what:literal) => {
        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::borrow::Borrow<str> for $ty {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl TryFrom<String> for $ty {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value.as_str())
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl From<&'static str> for $ty {
            fn from(value: &'static str) -> Self {
                match Self::parse(value) {
                    Ok(parsed) => parsed,
                    Err(err) => panic!("invalid {} literal: {err}", $what),
                }
            }
        }
    };
}

string_newtype_impls!(TopicName, "topic name");
string_newtype_impls!(SubKey, "sub key");

#[cfg(test)]
mod tests {
    use super::{SubKey, TopicName};

    #[test]
    fn topic_name_accepts_path_style_names() {
        let name = TopicName::parse("/sample/orders.v2").expect("valid");
        assert_eq!(name.as_str(), "/sample/orders.v2");
    }

    #[test]
    fn topic_name_rejects_empty_and_whitespace() {
        assert!(TopicName::parse("").is_err());
        assert!(TopicName::parse("orders v2").is_err());
        assert!(TopicName::parse("orders\n").is_err());
    }

    #[test]
    fn topic_name_rejects_overlong_values() {
        let long = "t".repeat(201);
        let err = TopicName::parse(&long).expect_err("too long");
        assert!(err.contains("longer than"));
    }

    #[test]
    fn sub_key_accepts_generated_form() {
        let key = SubKey::parse("zpsk0123456789abcdef0123456789abcdef").expect("valid");
        assert_eq!(key.as_str(), "zpsk0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn sub_key_rejects_empty_and_whitespace() {
        assert!(SubKey::parse("").is_err());
        assert!(SubKey::parse("sk 1").is_err());
        assert!(SubKey::parse(&"k".repeat(101)).is_err());
    }

    #[test]
    fn topic_name_supports_str_lookup() {
        use std::collections::HashMap;

        let mut map: HashMap<TopicName, u32> = HashMap::new();
        let _ = map.insert("orders".into(), 1);
        assert!(map.contains_key("orders"));
    }
}
