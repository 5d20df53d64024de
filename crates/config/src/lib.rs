// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Typed configuration for the embedded pub/sub broker layer.
//!
//! Everything here is pure data: validated name newtypes, topic and
//! subscription configuration structs, and the message-policy constants the
//! engine applies when a publish request leaves a field unset. No behavior
//! beyond parsing and validation lives in this crate.

pub mod limits;
mod names;
pub mod subscription;
pub mod topic;

pub use names::{EndpointId, SubKey, TopicId, TopicName};
