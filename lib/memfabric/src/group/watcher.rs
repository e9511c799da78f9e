// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Background observer of membership events and exit broadcasts.
//!
//! One thread per group. It arms a fire-once watch on the event key, and on each
//! new event reads the packed size, moves the local generation forward and runs
//! the membership callback for the rank that joined or left. Once the publisher
//! frees the event key, the committed size is read back, which moves the group
//! past a round the publisher aborted. Exit broadcasts are delivered on this
//! thread as well. Errors are logged; nothing here can reach a caller.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::RecvTimeoutError;

use super::{
    ArmedWatch, GroupCore, MembershipEvent, MembershipOp, PackedGeneration, EVENT_KEY,
    POLL_INTERVAL, SIZE_KEY, WATCH_RETRY_BACKOFF,
};
use crate::error::{MemFabricError, Result};
use crate::store::StoreError;

/// Pause before re-arming after a watch reported an event that was already handled.
/// Also the poll period while waiting for a publisher to free the event key.
const DUPLICATE_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) enum WatcherSignal {
    Fired {
        token: u64,
        result: Result<Bytes, StoreError>,
    },
    Exit(Result<Bytes, StoreError>),
    Stop,
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Applied,
    Duplicate,
    Ignored,
}

pub(super) fn run(core: Arc<GroupCore>, signals: flume::Receiver<WatcherSignal>) {
    tracing::debug!(rank = core.rank, "membership watcher started");
    // owned by this thread only
    let mut last_event: Option<Bytes> = None;

    while !core.is_stopped() {
        if !core.is_joined() {
            if !idle(&core, &signals, POLL_INTERVAL) {
                break;
            }
            continue;
        }

        if core.event_watch.lock().is_none() {
            if let Err(err) = core.arm_event_watch() {
                tracing::warn!(rank = core.rank, error = %err, "failed to watch membership events");
                if !idle(&core, &signals, WATCH_RETRY_BACKOFF) {
                    break;
                }
                continue;
            }
        }

        match signals.recv_timeout(POLL_INTERVAL) {
            Ok(WatcherSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(WatcherSignal::Exit(result)) => core.on_exit(result),
            Ok(WatcherSignal::Fired { token, result }) => {
                if !core.disarm_event_watch(token) || core.is_stopped() {
                    continue;
                }
                match result {
                    Ok(value) => {
                        let running = match handle_event(&core, value.clone(), &mut last_event) {
                            Outcome::Applied => settle(&core, &signals, &value, &mut last_event),
                            Outcome::Duplicate => idle(&core, &signals, DUPLICATE_BACKOFF),
                            Outcome::Ignored => true,
                        };
                        if !running {
                            break;
                        }
                    }
                    Err(StoreError::Closed) => {
                        tracing::debug!(rank = core.rank, "store closed under membership watch");
                        if !idle(&core, &signals, WATCH_RETRY_BACKOFF) {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(rank = core.rank, error = %err, "membership watch failed");
                    }
                }
            }
        }
    }

    tracing::debug!(rank = core.rank, "membership watcher stopped");
}

/// Wait up to `period` for a stop request. Returns `false` when the watcher must exit.
fn idle(core: &GroupCore, signals: &flume::Receiver<WatcherSignal>, period: Duration) -> bool {
    match signals.recv_timeout(period) {
        Ok(WatcherSignal::Stop) | Err(RecvTimeoutError::Disconnected) => false,
        Ok(WatcherSignal::Fired { token, .. }) => {
            // the watch is spent either way; clear it so it gets re-armed
            core.disarm_event_watch(token);
            !core.is_stopped()
        }
        Ok(WatcherSignal::Exit(result)) => {
            core.on_exit(result);
            !core.is_stopped()
        }
        Err(RecvTimeoutError::Timeout) => !core.is_stopped(),
    }
}

/// Wait for the publisher of `event` to free the event key, then take the
/// committed size. Returns `false` when the watcher must exit.
///
/// Once the key is free the same text may legitimately come back, from a rank
/// retrying a failed join, so it stops counting as a duplicate.
fn settle(
    core: &GroupCore,
    signals: &flume::Receiver<WatcherSignal>,
    event: &Bytes,
    last_event: &mut Option<Bytes>,
) -> bool {
    let deadline = Instant::now() + core.timeout;
    loop {
        match core.event_holder() {
            Ok(None) => {
                *last_event = None;
                if let Err(err) = core.adopt_committed() {
                    tracing::warn!(rank = core.rank, error = %err, "failed to read committed group size");
                }
                return true;
            }
            Ok(Some(holder)) if holder != *event => {
                tracing::debug!(
                    rank = core.rank,
                    holder = %String::from_utf8_lossy(&holder),
                    "next publisher took the event key before the size settled"
                );
                return true;
            }
            Ok(Some(_)) => {}
            Err(err) => {
                tracing::warn!(rank = core.rank, error = %err, "failed to read the event key");
                return true;
            }
        }
        if Instant::now() >= deadline {
            tracing::warn!(
                rank = core.rank,
                event = %String::from_utf8_lossy(event),
                "publisher never freed the event key"
            );
            return true;
        }
        if !idle(core, signals, DUPLICATE_BACKOFF) {
            return false;
        }
    }
}

fn handle_event(core: &GroupCore, value: Bytes, last_event: &mut Option<Bytes>) -> Outcome {
    if last_event.as_ref() == Some(&value) {
        return Outcome::Duplicate;
    }
    *last_event = Some(value.clone());

    let text = String::from_utf8_lossy(&value);
    let event = match text.parse::<MembershipEvent>() {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(rank = core.rank, event = %text, error = %err, "dropping malformed membership event");
            return Outcome::Ignored;
        }
    };

    if event.rank == core.rank {
        tracing::trace!(rank = core.rank, event = %event, "ignoring own membership event");
        return Outcome::Ignored;
    }

    core.observe_membership_change(event)
}

impl GroupCore {
    pub(super) fn arm_event_watch(&self) -> Result<(), StoreError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let signals = self.signals.clone();
        let id = self.store.watch(
            EVENT_KEY,
            Box::new(move |result| {
                let _ = signals.send(WatcherSignal::Fired { token, result });
            }),
        )?;
        *self.event_watch.lock() = Some(ArmedWatch { token, id });
        Ok(())
    }

    /// Clear the armed watch if `token` identifies it. Stale tokens are ignored.
    pub(super) fn disarm_event_watch(&self, token: u64) -> bool {
        let mut armed = self.event_watch.lock();
        match *armed {
            Some(watch) if watch.token == token => {
                *armed = None;
                true
            }
            _ => false,
        }
    }

    /// Current value of the event key, `None` when no publisher holds it.
    fn event_holder(&self) -> Result<Option<Bytes>, StoreError> {
        match self.store.get(EVENT_KEY, Duration::ZERO) {
            Ok(value) if value.is_empty() => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Move to the committed generation and size if they differ from the local ones.
    ///
    /// Only called while the event key is free, so `DSIZE` belongs to no round in
    /// flight. The key is checked again after the read; a publisher that got in
    /// between is left to the next event.
    fn adopt_committed(&self) -> Result<()> {
        let committed = self.read_size()?;
        if self
            .event_holder()
            .map_err(|e| MemFabricError::from_store("get", EVENT_KEY, e))?
            .is_some()
        {
            return Ok(());
        }

        let mut sequence = self.sequence.lock();
        if sequence.generation == committed.generation() && sequence.rank_size == committed.size()
        {
            return Ok(());
        }
        let local = PackedGeneration::new(sequence.generation, sequence.rank_size);
        sequence.reset(committed.generation(), committed.size());
        drop(sequence);

        tracing::warn!(
            rank = self.rank,
            local = %local,
            committed = %committed,
            "settled on the committed group size"
        );
        Ok(())
    }

    fn observe_membership_change(&self, event: MembershipEvent) -> Outcome {
        let observed = match self
            .store
            .get(SIZE_KEY, self.timeout)
            .and_then(|raw| PackedGeneration::parse(SIZE_KEY, &raw))
        {
            Ok(observed) => observed,
            Err(err) => {
                tracing::warn!(rank = self.rank, event = %event, error = %err, "failed to read group size");
                return Outcome::Ignored;
            }
        };

        let next = {
            let mut sequence = self.sequence.lock();
            let known = sequence.generation;
            let next = if observed.generation() > known {
                // the publisher already committed
                observed
            } else {
                if observed.generation() < known {
                    // an aborted round this rank never settled
                    tracing::warn!(
                        rank = self.rank,
                        event = %event,
                        known,
                        observed = observed.generation(),
                        "rolling back to the committed group size"
                    );
                }
                match event.op {
                    MembershipOp::Join => observed.apply(PackedGeneration::JOIN_DELTA),
                    MembershipOp::Leave if observed.size() == 0 => {
                        tracing::warn!(rank = self.rank, event = %event, "leave observed on an empty group");
                        return Outcome::Ignored;
                    }
                    MembershipOp::Leave => observed.apply(PackedGeneration::LEAVE_DELTA),
                }
            };
            sequence.reset(next.generation(), next.size());
            next
        };

        tracing::info!(
            rank = self.rank,
            peer = event.rank,
            op = ?event.op,
            generation = next.generation(),
            rank_size = next.size(),
            "membership changed"
        );

        let callback = match event.op {
            MembershipOp::Join => self.join_callback.as_ref(),
            MembershipOp::Leave => self.leave_callback.as_ref(),
        };
        if let Some(callback) = callback {
            if let Err(err) = callback(self, event.rank) {
                tracing::error!(
                    rank = self.rank,
                    peer = event.rank,
                    op = ?event.op,
                    error = %err,
                    "membership callback failed"
                );
            }
        }
        Outcome::Applied
    }
}
