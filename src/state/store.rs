// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device state store with synchronous subscribers.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::modbus::RegisterFrame;

use super::DeviceState;

/// Callback invoked after a state update commits.
pub type StateSubscriber = Box<dyn Fn(&str, &DeviceState) + Send + Sync>;

/// Owner of every device's state, keyed by MAC.
///
/// States are created lazily on first update. Subscribers run
/// synchronously after the update commits, observing a consistent
/// snapshot.
#[derive(Default)]
pub struct StateStore {
    states: RwLock<HashMap<String, DeviceState>>,
    subscribers: RwLock<Vec<StateSubscriber>>,
}

impl StateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a frame into the state for `mac` and returns the updated
    /// snapshot.
    ///
    /// `last_full_update` never moves backwards, even when the wall
    /// clock does.
    pub fn update_from_frame(
        &self,
        mac: &str,
        frame: &RegisterFrame,
        source_topic: &str,
        was_command_triggered: bool,
    ) -> DeviceState {
        let snapshot = {
            let mut states = self.states.write();
            let state = states.entry(mac.to_string()).or_default();
            state.apply_frame(frame);

            let now = Utc::now();
            state.last_full_update = Some(match state.last_full_update {
                Some(previous) if previous > now => previous,
                _ => now,
            });
            state.last_update_source = Some(source_topic.to_string());
            state.last_update_was_command_triggered = was_command_triggered;
            state.last_register_kind = Some(frame.kind());
            state.clone()
        };

        for subscriber in self.subscribers.read().iter() {
            subscriber(mac, &snapshot);
        }
        snapshot
    }

    /// Snapshot of one device's state.
    #[must_use]
    pub fn get(&self, mac: &str) -> Option<DeviceState> {
        self.states.read().get(mac).cloned()
    }

    /// MACs with known state.
    #[must_use]
    pub fn macs(&self) -> Vec<String> {
        self.states.read().keys().cloned().collect()
    }

    /// Number of tracked devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether no device has reported yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }

    /// Registers a callback fired after every committed update.
    pub fn subscribe(&self, subscriber: impl Fn(&str, &DeviceState) + Send + Sync + 'static) {
        self.subscribers.write().push(Box::new(subscriber));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn frame(pairs: &[(u16, u16)]) -> RegisterFrame {
        RegisterFrame {
            slave_id: 0x11,
            function_code: 0x03,
            start_register: Some(0),
            registers: pairs.iter().copied().collect::<BTreeMap<_, _>>(),
        }
    }

    const MAC: &str = "7C2C67AB5F0E";

    #[test]
    fn state_created_lazily_on_first_update() {
        let store = StateStore::new();
        assert!(store.get(MAC).is_none());
        store.update_from_frame(MAC, &frame(&[(56, 500)]), "t", false);
        assert_eq!(store.get(MAC).unwrap().soc, Some(50.0));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn metadata_follows_each_update() {
        let store = StateStore::new();
        let snapshot = store.update_from_frame(MAC, &frame(&[(56, 500)]), "a/topic", true);
        assert_eq!(snapshot.last_update_source.as_deref(), Some("a/topic"));
        assert!(snapshot.last_update_was_command_triggered);
        assert!(snapshot.last_full_update.is_some());
    }

    #[test]
    fn last_full_update_is_monotone() {
        let store = StateStore::new();
        let first = store
            .update_from_frame(MAC, &frame(&[(56, 500)]), "t", false)
            .last_full_update
            .unwrap();
        let second = store
            .update_from_frame(MAC, &frame(&[(56, 501)]), "t", false)
            .last_full_update
            .unwrap();
        assert!(second >= first);
    }

    #[test]
    fn subscribers_fire_synchronously_after_commit() {
        let store = StateStore::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        store.subscribe(move |mac, state| {
            assert_eq!(mac, MAC);
            // The snapshot is already consistent when the callback runs.
            assert_eq!(state.soc, Some(50.0));
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.update_from_frame(MAC, &frame(&[(56, 500)]), "t", false);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn devices_are_tracked_independently() {
        let store = StateStore::new();
        store.update_from_frame("AAAAAAAAAAAA", &frame(&[(56, 100)]), "t", false);
        store.update_from_frame("BBBBBBBBBBBB", &frame(&[(56, 900)]), "t", false);
        assert_eq!(store.get("AAAAAAAAAAAA").unwrap().soc, Some(10.0));
        assert_eq!(store.get("BBBBBBBBBBBB").unwrap().soc, Some(90.0));
        assert_eq!(store.macs().len(), 2);
    }
}
