// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The record emitter interface the Server Session writes to (§4.4, §6).
//!
//! The on-disk log format itself is an external collaborator's concern;
//! this module only fixes the boundary the core depends on: a
//! non-blocking `try_emit` and a `flush` the I/O loop calls on shutdown.

mod jsonl;

pub use jsonl::JsonlSink;

use thiserror::Error;

use crate::record::Record;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("log sink io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("log sink serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A time-ordered, append-only record emitter (§6).
///
/// `try_emit` MUST NOT block the receive path (§4.4): on a full internal
/// queue it drops the record and counts the overflow rather than waiting.
pub trait RecordSink: Send + Sync {
    /// Attempt to enqueue `record`. Returns it back on overflow so the
    /// caller can count the drop without the sink owning that counter.
    fn try_emit(&self, record: Record) -> Result<(), Record>;

    /// Drain and persist whatever is currently queued. Implementations
    /// MAY sort on write or sort on read; the contract does not mandate
    /// either (§9).
    fn flush(&self) -> Result<(), SinkError>;

    /// Count of records dropped so far due to a full queue.
    fn overflow_count(&self) -> u64;
}
