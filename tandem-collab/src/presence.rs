//! Ephemeral per-client presence for one document session.
//!
//! Each client owns one JSON state (display name, colour, cursor...) and a
//! clock it bumps on every local change. Merging keeps the entry with the
//! higher clock; on equal clocks a removal beats a present state. Nothing
//! here is ever persisted.
//!
//! Wire payload (bincode):
//! ```text
//! PresenceUpdate { entries: [ { client: Uuid, clock: u64, state: Option<json string> } ] }
//! ```
//! `state: None` announces a removal.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tandem_core::{ListenerSet, Subscription};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOrigin {
    /// Change to the local client's own state.
    Local,
    /// Merged from a peer's update.
    Remote,
    /// Remote entries dropped by timeout or disconnect.
    Expired,
}

/// Ids touched by one registry operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub added: Vec<Uuid>,
    pub updated: Vec<Uuid>,
    pub removed: Vec<Uuid>,
    pub origin: PresenceOrigin,
}

impl PresenceChange {
    fn new(origin: PresenceOrigin) -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
            origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every id in the change, in added/updated/removed order.
    pub fn ids(&self) -> Vec<Uuid> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence update could not be encoded: {0}")]
    Encode(String),
    #[error("presence update could not be decoded: {0}")]
    Decode(String),
    #[error("presence state of {client} is not valid JSON: {source}")]
    MalformedState {
        client: Uuid,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEntry {
    client: Uuid,
    clock: u64,
    state: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PresenceUpdate {
    entries: Vec<WireEntry>,
}

#[derive(Debug, Clone)]
struct Entry {
    clock: u64,
    state: Option<Value>,
    last_updated: Instant,
}

struct Inner {
    entries: HashMap<Uuid, Entry>,
}

/// Presence registry owned by a single document session.
pub struct PresenceRegistry {
    local_id: Uuid,
    inner: Mutex<Inner>,
    listeners: ListenerSet<PresenceChange>,
    destroyed: AtomicBool,
}

impl PresenceRegistry {
    pub fn new(local_id: Uuid) -> Self {
        Self {
            local_id,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
            }),
            listeners: ListenerSet::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PresenceChange) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    fn emit(&self, change: PresenceChange) {
        if !change.is_empty() {
            self.listeners.emit(&change);
        }
    }

    /// Set the local client's state. Always bumps the local clock.
    pub fn set_local(&self, state: Value) {
        if self.is_destroyed() {
            return;
        }
        let mut change = PresenceChange::new(PresenceOrigin::Local);
        {
            let mut inner = self.lock();
            let now = Instant::now();
            let entry = inner.entries.entry(self.local_id).or_insert(Entry {
                clock: 0,
                state: None,
                last_updated: now,
            });
            if entry.state.is_some() {
                change.updated.push(self.local_id);
            } else {
                change.added.push(self.local_id);
            }
            entry.clock += 1;
            entry.state = Some(state);
            entry.last_updated = now;
        }
        self.emit(change);
    }

    /// Re-announce the local state with a fresh clock so peers do not
    /// expire it. No-op without a local state.
    pub fn renew_local(&self) {
        if let Some(state) = self.local_state() {
            self.set_local(state);
        }
    }

    /// Remove the local client's state.
    pub fn clear_local(&self) {
        let mut change = PresenceChange::new(PresenceOrigin::Local);
        {
            let mut inner = self.lock();
            if let Some(entry) = inner.entries.get_mut(&self.local_id) {
                if entry.state.take().is_some() {
                    entry.clock += 1;
                    entry.last_updated = Instant::now();
                    change.removed.push(self.local_id);
                }
            }
        }
        self.emit(change);
    }

    pub fn local_state(&self) -> Option<Value> {
        self.state(&self.local_id)
    }

    pub fn state(&self, client: &Uuid) -> Option<Value> {
        self.lock().entries.get(client).and_then(|e| e.state.clone())
    }

    pub fn clock(&self, client: &Uuid) -> Option<u64> {
        self.lock().entries.get(client).map(|e| e.clock)
    }

    /// Every client with a present state, the local one included.
    pub fn states(&self) -> HashMap<Uuid, Value> {
        self.lock()
            .entries
            .iter()
            .filter_map(|(id, e)| e.state.clone().map(|s| (*id, s)))
            .collect()
    }

    /// Remote clients with a present state.
    pub fn remote_count(&self) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|(id, e)| **id != self.local_id && e.state.is_some())
            .count()
    }

    /// Encode the current entries of `ids`. Unknown ids are skipped; a
    /// known id without state is encoded as a removal.
    pub fn encode_partial(&self, ids: &[Uuid]) -> Result<Vec<u8>, PresenceError> {
        let entries = {
            let inner = self.lock();
            ids.iter()
                .filter_map(|id| {
                    inner.entries.get(id).map(|e| (*id, e.clock, e.state.clone()))
                })
                .collect::<Vec<_>>()
        };

        let mut wire = Vec::with_capacity(entries.len());
        for (client, clock, state) in entries {
            let state = match state {
                Some(value) => Some(
                    serde_json::to_string(&value).map_err(|e| PresenceError::Encode(e.to_string()))?,
                ),
                None => None,
            };
            wire.push(WireEntry {
                client,
                clock,
                state,
            });
        }

        bincode::serde::encode_to_vec(&PresenceUpdate { entries: wire }, bincode::config::standard())
            .map_err(|e| PresenceError::Encode(e.to_string()))
    }

    /// Merge a peer's update. Malformed payloads are rejected whole and
    /// leave the registry untouched. Entries about the local client are
    /// ignored.
    pub fn apply_partial(&self, bytes: &[u8]) -> Result<PresenceChange, PresenceError> {
        let (update, _): (PresenceUpdate, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| PresenceError::Decode(e.to_string()))?;

        let mut parsed = Vec::with_capacity(update.entries.len());
        for entry in update.entries {
            let state = match entry.state {
                Some(raw) => Some(serde_json::from_str::<Value>(&raw).map_err(|source| {
                    PresenceError::MalformedState {
                        client: entry.client,
                        source,
                    }
                })?),
                None => None,
            };
            parsed.push((entry.client, entry.clock, state));
        }

        let mut change = PresenceChange::new(PresenceOrigin::Remote);
        if self.is_destroyed() {
            return Ok(change);
        }
        {
            let mut inner = self.lock();
            let now = Instant::now();
            for (client, clock, state) in parsed {
                if client == self.local_id {
                    continue;
                }
                match inner.entries.get_mut(&client) {
                    Some(current) => {
                        let newer = clock > current.clock
                            || (clock == current.clock && state.is_none() && current.state.is_some());
                        if !newer {
                            continue;
                        }
                        match (&current.state, &state) {
                            (Some(_), None) => change.removed.push(client),
                            (None, Some(_)) => change.added.push(client),
                            (Some(old), Some(new)) if old != new => change.updated.push(client),
                            _ => {}
                        }
                        current.clock = clock;
                        current.state = state;
                        current.last_updated = now;
                    }
                    None => {
                        if state.is_some() {
                            change.added.push(client);
                        }
                        inner.entries.insert(
                            client,
                            Entry {
                                clock,
                                state,
                                last_updated: now,
                            },
                        );
                    }
                }
            }
        }

        if !change.is_empty() {
            debug!(
                "presence merge: +{} ~{} -{}",
                change.added.len(),
                change.updated.len(),
                change.removed.len()
            );
        }
        self.emit(change.clone());
        Ok(change)
    }

    /// Drop remote states not renewed within `timeout`. An expired state
    /// leaves a tombstone carrying its clock so late, older updates stay
    /// rejected; tombstones are forgotten once they are `timeout` old too.
    pub fn remove_stale(&self, timeout: Duration) -> Vec<Uuid> {
        let mut change = PresenceChange::new(PresenceOrigin::Expired);
        {
            let mut inner = self.lock();
            let now = Instant::now();
            let local_id = self.local_id;
            inner.entries.retain(|id, entry| {
                if *id == local_id || now.duration_since(entry.last_updated) < timeout {
                    return true;
                }
                if entry.state.is_none() {
                    return false;
                }
                entry.state = None;
                entry.last_updated = now;
                change.removed.push(*id);
                true
            });
        }
        let removed = change.removed.clone();
        self.emit(change);
        removed
    }

    /// Number of entries held, tombstones included.
    pub fn entry_count(&self) -> usize {
        self.lock().entries.len()
    }

    /// Forget every remote client, as after a disconnect.
    pub fn clear_remote(&self) -> Vec<Uuid> {
        let mut change = PresenceChange::new(PresenceOrigin::Expired);
        {
            let mut inner = self.lock();
            let local_id = self.local_id;
            inner.entries.retain(|id, entry| {
                if *id == local_id {
                    return true;
                }
                if entry.state.is_some() {
                    change.removed.push(*id);
                }
                false
            });
        }
        let removed = change.removed.clone();
        self.emit(change);
        removed
    }

    /// Clear the local state, notify listeners one last time and drop them.
    /// Returns `false` if the registry was already destroyed.
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.clear_local();
        self.listeners.clear();
        self.lock().entries.retain(|id, _| *id == self.local_id);
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PresenceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceRegistry")
            .field("local_id", &self.local_id)
            .field("remote", &self.remote_count())
            .finish()
    }
}

/// Stable, vivid colour for a client, as `#rrggbb`.
///
/// The hue comes from the id so every peer renders a client the same way.
pub fn color_for(id: Uuid) -> String {
    let hue = ((id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn pair() -> (PresenceRegistry, PresenceRegistry) {
        (
            PresenceRegistry::new(Uuid::new_v4()),
            PresenceRegistry::new(Uuid::new_v4()),
        )
    }

    fn sync(from: &PresenceRegistry, to: &PresenceRegistry, ids: &[Uuid]) -> PresenceChange {
        to.apply_partial(&from.encode_partial(ids).unwrap()).unwrap()
    }

    #[test]
    fn test_set_local_bumps_clock_and_notifies() {
        let registry = PresenceRegistry::new(Uuid::new_v4());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = registry.on_change(move |c| sink.lock().unwrap().push(c.clone()));

        registry.set_local(json!({ "name": "ana" }));
        registry.set_local(json!({ "name": "ana", "cursor": 3 }));

        assert_eq!(registry.clock(&registry.local_id()), Some(2));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].added, [registry.local_id()]);
        assert_eq!(seen[1].updated, [registry.local_id()]);
        assert!(seen.iter().all(|c| c.origin == PresenceOrigin::Local));
    }

    #[test]
    fn test_partial_update_merges_remote_state() {
        let (a, b) = pair();
        a.set_local(json!({ "color": "red" }));

        let change = sync(&a, &b, &[a.local_id()]);

        assert_eq!(change.added, [a.local_id()]);
        assert_eq!(change.origin, PresenceOrigin::Remote);
        assert_eq!(b.state(&a.local_id()), Some(json!({ "color": "red" })));
        assert_eq!(b.remote_count(), 1);
    }

    #[test]
    fn test_older_clock_is_ignored() {
        let (a, b) = pair();
        a.set_local(json!({ "v": 1 }));
        let old = a.encode_partial(&[a.local_id()]).unwrap();
        a.set_local(json!({ "v": 2 }));
        sync(&a, &b, &[a.local_id()]);

        let change = b.apply_partial(&old).unwrap();
        assert!(change.is_empty());
        assert_eq!(b.state(&a.local_id()), Some(json!({ "v": 2 })));
    }

    #[test]
    fn test_removal_wins_on_equal_clock() {
        let client = Uuid::new_v4();
        let b = PresenceRegistry::new(Uuid::new_v4());

        let present = bincode::serde::encode_to_vec(
            &PresenceUpdate {
                entries: vec![WireEntry {
                    client,
                    clock: 4,
                    state: Some("{\"x\":1}".into()),
                }],
            },
            bincode::config::standard(),
        )
        .unwrap();
        let removal = bincode::serde::encode_to_vec(
            &PresenceUpdate {
                entries: vec![WireEntry {
                    client,
                    clock: 4,
                    state: None,
                }],
            },
            bincode::config::standard(),
        )
        .unwrap();

        b.apply_partial(&present).unwrap();
        let change = b.apply_partial(&removal).unwrap();
        assert_eq!(change.removed, [client]);
        assert!(b.state(&client).is_none());

        // A present state with the same clock does not resurrect it.
        assert!(b.apply_partial(&present).unwrap().is_empty());
        assert!(b.state(&client).is_none());
    }

    #[test]
    fn test_clear_local_propagates_as_removal() {
        let (a, b) = pair();
        a.set_local(json!({ "name": "x" }));
        sync(&a, &b, &[a.local_id()]);

        a.clear_local();
        let change = sync(&a, &b, &[a.local_id()]);
        assert_eq!(change.removed, [a.local_id()]);
        assert_eq!(b.remote_count(), 0);
    }

    #[test]
    fn test_entries_about_self_are_ignored() {
        let (a, b) = pair();
        a.set_local(json!({ "name": "a" }));
        sync(&a, &b, &[a.local_id()]);

        // b echoes a's own entry back.
        let change = sync(&b, &a, &[a.local_id()]);
        assert!(change.is_empty());
    }

    #[test]
    fn test_malformed_payload_leaves_state_untouched() {
        let b = PresenceRegistry::new(Uuid::new_v4());
        assert!(matches!(
            b.apply_partial(&[0xde, 0xad]),
            Err(PresenceError::Decode(_))
        ));

        let bad_json = bincode::serde::encode_to_vec(
            &PresenceUpdate {
                entries: vec![
                    WireEntry {
                        client: Uuid::new_v4(),
                        clock: 1,
                        state: Some("{}".into()),
                    },
                    WireEntry {
                        client: Uuid::new_v4(),
                        clock: 1,
                        state: Some("{not json".into()),
                    },
                ],
            },
            bincode::config::standard(),
        )
        .unwrap();
        assert!(matches!(
            b.apply_partial(&bad_json),
            Err(PresenceError::MalformedState { .. })
        ));
        assert_eq!(b.remote_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stale_keeps_fresh_entries() {
        let (a, b) = pair();
        let c = PresenceRegistry::new(Uuid::new_v4());
        a.set_local(json!({ "n": "a" }));
        c.set_local(json!({ "n": "c" }));

        sync(&a, &b, &[a.local_id()]);
        tokio::time::advance(Duration::from_secs(20)).await;
        sync(&c, &b, &[c.local_id()]);
        tokio::time::advance(Duration::from_secs(15)).await;

        let removed = b.remove_stale(Duration::from_secs(30));
        assert_eq!(removed, [a.local_id()]);
        assert!(b.state(&c.local_id()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stale_forgets_old_tombstones() {
        let (a, b) = pair();
        let c = PresenceRegistry::new(Uuid::new_v4());
        a.set_local(json!({ "n": "a" }));
        c.set_local(json!({ "n": "c" }));
        sync(&a, &b, &[a.local_id()]);
        sync(&c, &b, &[c.local_id()]);
        c.clear_local();
        sync(&c, &b, &[c.local_id()]);
        assert_eq!(b.entry_count(), 2);

        // c's removal is a tombstone; a's state expires into one.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.remove_stale(Duration::from_secs(30)), [a.local_id()]);
        assert_eq!(b.entry_count(), 1);
        assert_eq!(b.clock(&a.local_id()), Some(1));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(b.remove_stale(Duration::from_secs(30)).is_empty());
        assert_eq!(b.entry_count(), 0);
    }

    #[test]
    fn test_clear_remote_forgets_peers() {
        let (a, b) = pair();
        b.set_local(json!({ "n": "b" }));
        a.set_local(json!({ "n": "a" }));
        sync(&a, &b, &[a.local_id()]);

        assert_eq!(b.clear_remote(), [a.local_id()]);
        assert_eq!(b.remote_count(), 0);
        assert!(b.local_state().is_some());
    }

    #[test]
    fn test_destroy_is_idempotent_and_clears_local() {
        let registry = PresenceRegistry::new(Uuid::new_v4());
        registry.set_local(json!({ "n": 1 }));
        let removals = Arc::new(Mutex::new(0));
        let sink = removals.clone();
        let _sub = registry.on_change(move |c| {
            if !c.removed.is_empty() {
                *sink.lock().unwrap() += 1;
            }
        });

        assert!(registry.destroy());
        assert!(!registry.destroy());
        assert!(registry.local_state().is_none());
        assert_eq!(*removals.lock().unwrap(), 1);

        registry.set_local(json!({ "n": 2 }));
        assert!(registry.local_state().is_none());
    }

    #[test]
    fn test_color_is_stable_hex() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let color = color_for(id);
        assert_eq!(color, color_for(id));
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}
