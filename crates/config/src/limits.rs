// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Message-policy constants applied when a publish request leaves a field
//! unset. Kept as plain constants so both the engine and external admin
//! tooling agree on the same numbers.

/// Lowest accepted message priority.
pub const PRIORITY_MIN: u8 = 1;

/// Highest accepted message priority.
pub const PRIORITY_MAX: u8 = 9;

/// Priority used when a request does not carry one.
pub const PRIORITY_DEFAULT: u8 = 5;

/// Default message expiration in milliseconds — effectively "never".
pub const EXPIRATION_DEFAULT_MS: i64 = (i32::MAX as i64) * 1000;

/// Length of the long data preview stored alongside persisted messages.
pub const DATA_PREFIX_LEN: usize = 2048;

/// Length of the short data preview used in admin listings.
pub const DATA_PREFIX_SHORT_LEN: usize = 64;

/// MIME type assumed when a request does not carry one.
pub const MIME_TYPE_DEFAULT: &str = "text/plain";

/// Position-in-group assumed when a request carries a group id but no position.
pub const POSITION_IN_GROUP_DEFAULT: u32 = 0;
