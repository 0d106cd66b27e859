// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::event::Event;

/// The side of an input plugin the engine calls back into.
///
/// Inputs push records with [`crate::pipeline::Pipeline::submit`]. Once the
/// batch holding a record was delivered (or given up on), `commit` is called
/// with the event, in per-stream order, exactly once per submitted record.
/// Inputs typically persist `event.offset` to resume from it later.
pub trait Input: Send + Sync {
    fn commit(&self, event: &Event);
}
