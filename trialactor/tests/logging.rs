/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Global subscriber installation. Kept in its own test binary since
//! the subscriber is process-wide.

use trialactor::logging::initialize_logging;

#[test]
fn test_initialize_logging_is_idempotent() {
    assert!(!tracing::dispatcher::has_been_set());
    initialize_logging();
    assert!(tracing::dispatcher::has_been_set());

    // A second call finds a subscriber in place and leaves it alone.
    initialize_logging();
    tracing::info!("logging initialized");
}
