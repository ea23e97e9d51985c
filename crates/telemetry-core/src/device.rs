// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-device state owned by the device table (§3, §4.4).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::tracker::SequenceTracker;

/// Lifecycle state of a registered device (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Pending,
    Active,
    Timeout,
    Down,
}

/// Bounded ring of recent inter-arrival samples used to derive the
/// liveness timeout ceiling (§4.4).
const INTERVAL_RING_CAPACITY: usize = 16;

/// Minimum sample count before a liveness ceiling can be computed (§4.4,
/// §5): `timeout_ceiling = 10 * mean(recent_interval_samples)`.
const MIN_SAMPLES_FOR_TIMEOUT: usize = 10;

#[derive(Debug, Clone)]
pub struct Device {
    pub mac: [u8; 6],
    pub device_id: u16,
    pub batch_size: u8,
    pub status: DeviceStatus,
    pub base_time: Option<u32>,
    pub last_value: Option<i16>,
    pub tracker: SequenceTracker,
    recent_interval_samples: VecDeque<Duration>,
    pub last_arrival: Option<Instant>,
}

impl Device {
    pub fn new(mac: [u8; 6], device_id: u16, batch_size: u8) -> Self {
        Self {
            mac,
            device_id,
            batch_size,
            status: DeviceStatus::Pending,
            base_time: None,
            last_value: None,
            tracker: SequenceTracker::default(),
            recent_interval_samples: VecDeque::with_capacity(INTERVAL_RING_CAPACITY),
            last_arrival: None,
        }
    }

    /// Record an arrival at `now`, updating the inter-arrival ring (§4.4
    /// step 5).
    pub fn note_arrival(&mut self, now: Instant) {
        if let Some(prev) = self.last_arrival {
            let interval = now.saturating_duration_since(prev);
            if self.recent_interval_samples.len() == INTERVAL_RING_CAPACITY {
                self.recent_interval_samples.pop_front();
            }
            self.recent_interval_samples.push_back(interval);
        }
        self.last_arrival = Some(now);
    }

    /// `10 * mean(recent_interval_samples)` once at least 10 samples
    /// exist; `None` otherwise (§4.4, §5).
    pub fn timeout_ceiling(&self) -> Option<Duration> {
        if self.recent_interval_samples.len() < MIN_SAMPLES_FOR_TIMEOUT {
            return None;
        }
        let total: Duration = self.recent_interval_samples.iter().sum();
        Some((total / self.recent_interval_samples.len() as u32) * 10)
    }

    pub fn is_silent_as_of(&self, now: Instant) -> bool {
        match (self.timeout_ceiling(), self.last_arrival) {
            (Some(ceiling), Some(last)) => now.saturating_duration_since(last) > ceiling,
            _ => false,
        }
    }
}
