// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process [`ConfigStore`].
//!
//! All keys share one mutex, which makes every operation linearizable. Blocked
//! readers park on a condition variable; watch callbacks run on the mutating
//! thread after the lock is released.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use super::{ConfigStore, StoreError, WatchCallback, WatchId};

#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    changed: Condvar,
    next_watch: AtomicU64,
    latency: Duration,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

#[derive(Default)]
struct State {
    values: BTreeMap<String, Bytes>,
    watches: HashMap<WatchId, PendingWatch>,
}

struct PendingWatch {
    key: String,
    notify: WatchCallback,
}

impl State {
    /// Detach every watch on `key` that the new value satisfies.
    fn take_ready(&mut self, key: &str) -> Vec<(WatchCallback, Bytes)> {
        let value = match self.values.get(key) {
            Some(value) if !value.is_empty() => value.clone(),
            _ => return Vec::new(),
        };
        let ready: Vec<WatchId> = self
            .watches
            .iter()
            .filter(|(_, w)| w.key == key)
            .map(|(id, _)| *id)
            .collect();
        ready
            .into_iter()
            .filter_map(|id| self.watches.remove(&id))
            .map(|w| (w.notify, value.clone()))
            .collect()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that sleeps `latency` before serving each request.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                latency,
                ..Default::default()
            }),
        }
    }

    /// Simulate an outage: while set, every request fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Shut the store down, failing pending watches and waking blocked readers.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let pending: Vec<PendingWatch> = {
            let mut state = self.inner.state.lock();
            state.watches.drain().map(|(_, w)| w).collect()
        };
        self.inner.changed.notify_all();
        for watch in pending {
            (watch.notify)(Err(StoreError::Closed));
        }
    }

    /// Snapshot of the keys currently present, in lexical order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().values.keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.state.lock().values.contains_key(key)
    }

    pub fn pending_watches(&self) -> usize {
        self.inner.state.lock().watches.len()
    }

    fn admit(&self, key: &str) -> Result<(), StoreError> {
        if !self.inner.latency.is_zero() {
            std::thread::sleep(self.inner.latency);
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Apply `mutate` under the lock, then wake readers and fire satisfied watches.
    fn mutate<T>(
        &self,
        key: &str,
        mutate: impl FnOnce(&mut State) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let (result, ready) = {
            let mut state = self.inner.state.lock();
            let result = mutate(&mut state)?;
            (result, state.take_ready(key))
        };
        self.inner.changed.notify_all();
        for (notify, value) in ready {
            notify(Ok(value));
        }
        Ok(result)
    }
}

impl ConfigStore for InMemoryStore {
    fn get(&self, key: &str, timeout: Duration) -> Result<Bytes, StoreError> {
        self.admit(key)?;
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(value) = state.values.get(key) {
                return Ok(value.clone());
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(StoreError::Closed);
            }
            if timeout.is_zero() {
                return Err(StoreError::NotFound(key.to_string()));
            }
            if self
                .inner
                .changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state
                    .values
                    .get(key)
                    .cloned()
                    .ok_or_else(|| StoreError::Timeout(key.to_string()));
            }
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.admit(key)?;
        self.mutate(key, |state| {
            state
                .values
                .insert(key.to_string(), Bytes::copy_from_slice(value));
            Ok(())
        })
    }

    fn add(&self, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.admit(key)?;
        self.mutate(key, |state| {
            let current = match state.values.get(key) {
                Some(raw) => super::parse_integer(key, raw)?,
                None => 0,
            };
            let next = current.wrapping_add(delta);
            state
                .values
                .insert(key.to_string(), Bytes::from(next.to_string()));
            Ok(next)
        })
    }

    fn append(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        self.admit(key)?;
        self.mutate(key, |state| {
            let mut joined = BytesMut::new();
            if let Some(existing) = state.values.get(key) {
                joined.extend_from_slice(existing);
            }
            joined.extend_from_slice(value);
            let len = joined.len() as u64;
            state.values.insert(key.to_string(), joined.freeze());
            Ok(len)
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.admit(key)?;
        self.inner.state.lock().values.remove(key);
        Ok(())
    }

    fn cas(&self, key: &str, expected: &[u8], value: &[u8]) -> Result<Bytes, StoreError> {
        self.admit(key)?;
        self.mutate(key, |state| {
            let prior = state.values.get(key).cloned().unwrap_or_default();
            if prior[..] == *expected {
                state
                    .values
                    .insert(key.to_string(), Bytes::copy_from_slice(value));
            }
            Ok(prior)
        })
    }

    fn watch(&self, key: &str, notify: WatchCallback) -> Result<WatchId, StoreError> {
        self.admit(key)?;
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed) + 1;
        self.mutate(key, |state| {
            state.watches.insert(
                id,
                PendingWatch {
                    key: key.to_string(),
                    notify,
                },
            );
            Ok(id)
        })
    }

    fn unwatch(&self, id: WatchId) -> Result<(), StoreError> {
        match self.inner.state.lock().watches.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::UnknownWatch(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn recorder() -> (WatchCallback, mpsc::Receiver<Result<Bytes, StoreError>>) {
        let (tx, rx) = mpsc::channel();
        let notify: WatchCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (notify, rx)
    }

    #[test]
    fn test_get_blocks_until_key_is_set() {
        let store = InMemoryStore::new();
        let writer = store.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            writer.set("BW", b"ok").unwrap();
        });

        let value = store.get("BW", Duration::from_secs(5)).unwrap();
        assert_eq!(value, Bytes::from_static(b"ok"));
        handle.join().unwrap();
    }

    #[test]
    fn test_get_times_out() {
        let store = InMemoryStore::new();
        let start = Instant::now();
        let err = store.get("missing", Duration::from_millis(50)).unwrap_err();
        assert_eq!(err, StoreError::Timeout("missing".into()));
        assert!(start.elapsed() >= Duration::from_millis(50));

        let err = store.get("missing", Duration::ZERO).unwrap_err();
        assert_eq!(err, StoreError::NotFound("missing".into()));
    }

    #[test]
    fn test_add_is_an_atomic_counter() {
        let store = InMemoryStore::new();
        assert_eq!(store.add("n", 0).unwrap(), 0);
        assert_eq!(store.add("n", 3).unwrap(), 3);
        assert_eq!(store.add("n", -1).unwrap(), 2);
        assert_eq!(store.get("n", Duration::ZERO).unwrap(), Bytes::from("2"));

        store.set("text", b"ok").unwrap();
        assert_eq!(
            store.add("text", 1).unwrap_err(),
            StoreError::NotAnInteger("text".into())
        );
    }

    #[test]
    fn test_append_returns_total_length() {
        let store = InMemoryStore::new();
        assert_eq!(store.append("ga", b"abc").unwrap(), 3);
        assert_eq!(store.append("ga", b"de").unwrap(), 5);
        assert_eq!(
            store.get("ga", Duration::ZERO).unwrap(),
            Bytes::from_static(b"abcde")
        );
    }

    #[test]
    fn test_cas_reports_prior_value() {
        let store = InMemoryStore::new();

        // absent key compares equal to an empty expectation
        let prior = store.cas("EVENT", b"", b"J0").unwrap();
        assert!(prior.is_empty());

        let prior = store.cas("EVENT", b"", b"J1").unwrap();
        assert_eq!(prior, Bytes::from_static(b"J0"));
        assert_eq!(
            store.get("EVENT", Duration::ZERO).unwrap(),
            Bytes::from_static(b"J0")
        );

        store.remove("EVENT").unwrap();
        store.remove("EVENT").unwrap();
        assert!(store.cas("EVENT", b"", b"J1").unwrap().is_empty());
    }

    #[test]
    fn test_watch_fires_once_on_first_value() {
        let store = InMemoryStore::new();
        let (notify, rx) = recorder();
        store.watch("EXIT", notify).unwrap();
        assert_eq!(store.pending_watches(), 1);

        store.set("EXIT", b"").unwrap();
        assert!(rx.try_recv().is_err());

        store.set("EXIT", b"3").unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), Bytes::from_static(b"3"));

        store.set("EXIT", b"4").unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(store.pending_watches(), 0);
    }

    #[test]
    fn test_watch_on_present_key_fires_immediately() {
        let store = InMemoryStore::new();
        store.set("EVENT", b"J2").unwrap();
        let (notify, rx) = recorder();
        store.watch("EVENT", notify).unwrap();
        assert_eq!(rx.try_recv().unwrap().unwrap(), Bytes::from_static(b"J2"));
    }

    #[test]
    fn test_unwatch_cancels() {
        let store = InMemoryStore::new();
        let (notify, rx) = recorder();
        let id = store.watch("EVENT", notify).unwrap();
        store.unwatch(id).unwrap();
        store.set("EVENT", b"J0").unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(store.unwatch(id).unwrap_err(), StoreError::UnknownWatch(id));
    }

    #[test]
    fn test_outage_and_close() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.set("k", b"v"),
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(false);
        store.set("k", b"v").unwrap();

        let (notify, rx) = recorder();
        store.watch("other", notify).unwrap();
        store.close();
        assert_eq!(rx.recv().unwrap().unwrap_err(), StoreError::Closed);
        assert_eq!(store.get("k", Duration::ZERO).unwrap_err(), StoreError::Closed);
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let store = InMemoryStore::new();
        assert!(matches!(store.set("", b"v"), Err(StoreError::InvalidKey(_))));
    }
}
