// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MAC -> device identity registry and per-device state storage (§4.3).

use std::collections::BTreeSet;

use dashmap::DashMap;
use dashmap::mapref::one::{Ref, RefMut};
use parking_lot::Mutex;

use crate::device::Device;

/// Identifier 0 is reserved; clients use it in the STARTUP header before
/// registration and it MUST never be allocated (§4.3, I1).
const RESERVED_DEVICE_ID: u16 = 0;

/// Outcome of a `register` call (§4.3).
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub device_id: u16,
    pub is_reconnection: bool,
    pub last_known_sequence: Option<u16>,
}

/// Owns all [`Device`]s, keyed by MAC and by device identifier.
///
/// Per-device state lives behind a per-entry `Mutex` so that sessions for
/// distinct devices never contend; a coarse `Mutex<BTreeSet<u16>>` is held
/// only across the smallest-unused-id scan during allocation (§5).
pub struct DeviceTable {
    by_mac: DashMap<[u8; 6], u16>,
    by_id: DashMap<u16, Mutex<Device>>,
    allocated_ids: Mutex<BTreeSet<u16>>,
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            by_mac: DashMap::new(),
            by_id: DashMap::new(),
            allocated_ids: Mutex::new(BTreeSet::new()),
        }
    }

    /// Translate a MAC into a device identity, allocating a new one if the
    /// MAC has never been seen (§4.3).
    pub fn register(&self, mac: [u8; 6], batch_size: u8) -> Registration {
        if let Some(existing) = self.by_mac.get(&mac) {
            let device_id = *existing;
            drop(existing);
            let last_known_sequence = self
                .by_id
                .get(&device_id)
                .map(|entry| entry.lock().tracker.head());
            return Registration {
                device_id,
                is_reconnection: true,
                last_known_sequence: last_known_sequence.flatten(),
            };
        }

        let device_id = self.allocate_id();
        self.by_mac.insert(mac, device_id);
        self.by_id
            .insert(device_id, Mutex::new(Device::new(mac, device_id, batch_size)));

        Registration {
            device_id,
            is_reconnection: false,
            last_known_sequence: None,
        }
    }

    /// Smallest unused positive u16 (§4.3, P5).
    fn allocate_id(&self) -> u16 {
        let mut allocated = self.allocated_ids.lock();
        let mut candidate = RESERVED_DEVICE_ID + 1;
        while allocated.contains(&candidate) {
            candidate = candidate
                .checked_add(1)
                .expect("device identifier space exhausted");
        }
        allocated.insert(candidate);
        candidate
    }

    pub fn lookup_by_id(&self, device_id: u16) -> Option<Ref<'_, u16, Mutex<Device>>> {
        self.by_id.get(&device_id)
    }

    pub fn lookup_by_id_mut(&self, device_id: u16) -> Option<RefMut<'_, u16, Mutex<Device>>> {
        self.by_id.get_mut(&device_id)
    }

    pub fn contains(&self, device_id: u16) -> bool {
        self.by_id.contains_key(&device_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Iterate over every registered device id; used by the liveness sweep
    /// (§4.4, §4.5).
    pub fn device_ids(&self) -> Vec<u16> {
        self.by_id.iter().map(|entry| *entry.key()).collect()
    }
}
