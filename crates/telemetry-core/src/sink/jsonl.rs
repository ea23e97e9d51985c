// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reference [`RecordSink`] implementation: newline-delimited JSON on disk.
//!
//! This is one possible collaborator, not a format specification (§1, §9):
//! the core only depends on the `RecordSink` trait.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::{RecordSink, SinkError};
use crate::record::Record;

const DEFAULT_QUEUE_CAPACITY: usize = 4096;

#[derive(Serialize)]
struct RecordLine<'a> {
    message_kind: &'a str,
    device_id: u16,
    sequence: u16,
    device_timestamp: String,
    arrival_time: String,
    value: Option<i16>,
    duplicate_flag: bool,
    gap_flag: bool,
    delayed_flag: bool,
    protocol_violation: bool,
    pre_sync_flag: bool,
    cpu_time_ms: f64,
}

impl<'a> From<&'a Record> for RecordLine<'a> {
    fn from(record: &'a Record) -> Self {
        const FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";
        RecordLine {
            message_kind: record.message_kind.as_str(),
            device_id: record.device_id,
            sequence: record.sequence,
            device_timestamp: record.device_timestamp.format(FORMAT).to_string(),
            arrival_time: record.arrival_time.format(FORMAT).to_string(),
            value: record.value,
            duplicate_flag: record.duplicate_flag,
            gap_flag: record.gap_flag,
            delayed_flag: record.delayed_flag,
            protocol_violation: record.protocol_violation,
            pre_sync_flag: record.pre_sync_flag,
            cpu_time_ms: record.cpu_time_ms,
        }
    }
}

/// Queues records in memory and appends them as JSON lines to a file on
/// [`flush`](RecordSink::flush). Tolerant of unsorted arrival: the queue
/// is sorted by `arrival_time` at flush time, not at enqueue time.
pub struct JsonlSink {
    path: PathBuf,
    queue: Mutex<VecDeque<Record>>,
    capacity: usize,
    overflow: AtomicU64,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_capacity(path, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            overflow: AtomicU64::new(0),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }
}

impl RecordSink for JsonlSink {
    fn try_emit(&self, record: Record) -> Result<(), Record> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            return Err(record);
        }
        queue.push_back(record);
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        let mut drained: Vec<Record> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }
        drained.sort_by_key(|r| r.arrival_time);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        for record in &drained {
            let line = RecordLine::from(record);
            let json = serde_json::to_string(&line)?;
            writeln!(file, "{}", json)?;
        }
        Ok(())
    }

    fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordKind;
    use chrono::Local;
    use tempfile::tempdir;

    fn sample_record(sequence: u16) -> Record {
        let now = Local::now();
        Record::new(
            RecordKind::Wire(crate::protocol::MessageKind::Keyframe),
            1,
            sequence,
            now,
            now,
            Some(100),
        )
    }

    #[test]
    fn flush_writes_one_line_per_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let sink = JsonlSink::new(&path);

        for seq in 0..3u16 {
            sink.try_emit(sample_record(seq)).unwrap();
        }
        sink.flush().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[test]
    fn overflow_beyond_capacity_is_counted_and_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let sink = JsonlSink::with_capacity(&path, 2);

        assert!(sink.try_emit(sample_record(0)).is_ok());
        assert!(sink.try_emit(sample_record(1)).is_ok());
        assert!(sink.try_emit(sample_record(2)).is_err());
        assert_eq!(sink.overflow_count(), 1);
    }
}
