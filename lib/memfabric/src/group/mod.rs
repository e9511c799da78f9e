// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Rendezvous group built on a bare key-value store.
//!
//! A [`RendezvousGroup`] turns a [`ConfigStore`] namespace into collective
//! primitives for a set of ranks:
//!
//! - **Barrier**: every rank increments `{gen}_{seq}_BA`; the rank that brings it to
//!   the group size publishes `{gen}_{seq}_BW = "ok"`, which everyone waits on.
//! - **AllGather**: every rank appends `rank || payload` to `{gen}_{seq}_GA`; the rank
//!   whose append completes the buffer publishes `{gen}_{seq}_GW`. Chunks are
//!   reordered by rank after the fetch since appends land in arrival order.
//! - **Join/Leave** (dynamic groups): a rank takes the `EVENT` key with a CAS, runs the
//!   membership callback together with the existing members, commits the new
//!   generation/size into `DSIZE` and releases `EVENT`.
//!
//! Existing members learn about a join or leave through a background watcher
//! thread that replays the same callback on their side. A round that fails before
//! its commit bumps `DSIZE` past the generation it used, and members settle on the
//! committed value once `EVENT` is free again.
//!
//! Keys are only deleted once every rank has provably moved past them. Tearing a
//! group down deletes nothing; a static namespace that is used again moves to a
//! fresh generation in [`RendezvousGroup::rendezvous`].
//!
//! Every method blocks the calling thread for at most the configured timeout.

pub mod event;
pub mod generation;
mod watcher;


pub use event::{EventParseError, MembershipEvent, MembershipOp};
pub use generation::PackedGeneration;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use derive_builder::Builder;
use parking_lot::Mutex;

use crate::error::{MemFabricError, Result};
use crate::store::{ConfigStore, PrefixStore, StoreError, WatchId};

use watcher::WatcherSignal;

/// Value published under barrier and gather wait keys.
pub const SUCCESS_VALUE: &[u8] = b"ok";
pub const EVENT_KEY: &str = "EVENT";
pub const SIZE_KEY: &str = "DSIZE";
pub const EXIT_KEY: &str = "EXIT";
/// Arrival counter of a static group's rendezvous, kept across every use of the namespace.
pub const ARRIVALS_KEY: &str = "ARRIVALS";

/// Number of sequences kept behind the current one before they are deleted.
pub const REMOVE_INTERVAL: u32 = 2;

/// Largest payload accepted by [`CollectiveOps::all_gather`].
pub const MAX_GATHER_PAYLOAD: usize = 64 * 1024;

const RANK_PREFIX_LEN: usize = std::mem::size_of::<u32>();

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const WATCH_RETRY_BACKOFF: Duration = Duration::from_secs(5);

const DYNAMIC_PREFIX: &str = "D_";
const STATIC_PREFIX: &str = "S_";

/// Control-plane collectives over the current membership.
pub trait CollectiveOps: Send + Sync {
    /// Block until every rank of the current generation has arrived.
    fn barrier(&self) -> Result<()>;

    /// Gather an equal-sized payload from every rank, ordered by ascending rank.
    fn all_gather(&self, send: &[u8]) -> Result<Vec<u8>>;

    fn rank(&self) -> u32;

    fn rank_size(&self) -> u32;
}

/// Invoked with the rank that joined or left.
///
/// The callback runs on the joining rank inside [`RendezvousGroup::join`] and on
/// every existing member from the membership watcher, so all sides can run the
/// same collectives.
pub type MembershipCallback = Arc<dyn Fn(&dyn CollectiveOps, u32) -> Result<()> + Send + Sync>;

type ExitHandler = Box<dyn FnOnce(i32) + Send>;

#[derive(Builder, Clone)]
#[builder(pattern = "owned", build_fn(validate = "Self::validate"))]
pub struct GroupOptions {
    pub rank: u32,

    /// Fixed size of a static group. Dynamic groups start at 1 and follow the store.
    #[builder(default = "1")]
    pub rank_size: u32,

    #[builder(default = "Duration::from_secs(120)")]
    pub timeout: Duration,

    #[builder(default)]
    pub dynamic: bool,

    #[builder(default, setter(custom))]
    pub join_callback: Option<MembershipCallback>,

    #[builder(default, setter(custom))]
    pub leave_callback: Option<MembershipCallback>,
}

impl GroupOptions {
    pub fn builder() -> GroupOptionsBuilder {
        GroupOptionsBuilder::default()
    }
}

impl GroupOptionsBuilder {
    pub fn join_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&dyn CollectiveOps, u32) -> Result<()> + Send + Sync + 'static,
    {
        self.join_callback = Some(Some(Arc::new(callback)));
        self
    }

    pub fn leave_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&dyn CollectiveOps, u32) -> Result<()> + Send + Sync + 'static,
    {
        self.leave_callback = Some(Some(Arc::new(callback)));
        self
    }

    fn validate(&self) -> Result<(), String> {
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err("timeout must be non-zero".to_string());
        }
        let dynamic = self.dynamic.unwrap_or(false);
        let rank_size = self.rank_size.unwrap_or(1);
        if !dynamic {
            if rank_size == 0 {
                return Err("rank_size must be at least 1".to_string());
            }
            if let Some(rank) = self.rank {
                if rank >= rank_size {
                    return Err(format!("rank {rank} is out of range for size {rank_size}"));
                }
            }
        }
        Ok(())
    }
}

impl From<GroupOptionsBuilderError> for MemFabricError {
    fn from(err: GroupOptionsBuilderError) -> Self {
        MemFabricError::InvalidParam(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
struct SequenceState {
    generation: u64,
    rank_size: u32,
    barrier_seq: u32,
    gather_seq: u32,
}

impl SequenceState {
    fn reset(&mut self, generation: u64, rank_size: u32) {
        self.generation = generation;
        self.rank_size = rank_size;
        self.barrier_seq = 0;
        self.gather_seq = 0;
    }
}

/// A sequence slot claimed by one collective call.
struct Slot {
    generation: u64,
    seq: u32,
    rank_size: u32,
}

impl Slot {
    fn key(&self, suffix: &str) -> String {
        sequence_key(self.generation, self.seq, suffix)
    }
}

fn sequence_key(generation: u64, seq: u32, suffix: &str) -> String {
    format!("{generation}_{seq}_{suffix}")
}

#[derive(Debug, Clone, Copy)]
struct ArmedWatch {
    token: u64,
    id: WatchId,
}

#[derive(Default)]
struct ExitState {
    registered: bool,
    handler: Option<ExitHandler>,
    watch: Option<WatchId>,
}

pub(crate) struct GroupCore {
    store: Arc<dyn ConfigStore>,
    rank: u32,
    timeout: Duration,
    dynamic: bool,
    join_callback: Option<MembershipCallback>,
    leave_callback: Option<MembershipCallback>,
    sequence: Mutex<SequenceState>,
    membership: Mutex<()>,
    joined: AtomicBool,
    stopped: AtomicBool,
    event_watch: Mutex<Option<ArmedWatch>>,
    next_token: AtomicU64,
    exit: Mutex<ExitState>,
    signals: flume::Sender<WatcherSignal>,
}

/// A group of ranks coordinating through one store namespace.
pub struct RendezvousGroup {
    core: Arc<GroupCore>,
    receiver: flume::Receiver<WatcherSignal>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl RendezvousGroup {
    /// Bind a group to `store`, which must already be unique to this group's owner.
    ///
    /// # Arguments
    /// * `store` - namespace shared by every rank of the group
    /// * `options` - rank, size, timeout and membership callbacks
    ///
    /// # Errors
    /// [`MemFabricError::InvalidParam`] when a static group's rank is out of range.
    pub fn create(store: Arc<dyn ConfigStore>, options: GroupOptions) -> Result<Self> {
        let GroupOptions {
            rank,
            rank_size,
            timeout,
            dynamic,
            join_callback,
            leave_callback,
        } = options;

        if timeout.is_zero() {
            return Err(MemFabricError::InvalidParam(
                "timeout must be non-zero".to_string(),
            ));
        }
        let rank_size = if dynamic { 1 } else { rank_size };
        if !dynamic && (rank_size == 0 || rank >= rank_size) {
            return Err(MemFabricError::InvalidParam(format!(
                "rank {rank} is out of range for size {rank_size}"
            )));
        }

        let prefix = if dynamic { DYNAMIC_PREFIX } else { STATIC_PREFIX };
        let store: Arc<dyn ConfigStore> = Arc::new(PrefixStore::new(store, prefix));
        let (signals, receiver) = flume::unbounded();

        tracing::debug!(
            rank,
            rank_size,
            dynamic,
            namespace = %store.full_key(""),
            "rendezvous group created"
        );

        let core = GroupCore {
            store,
            rank,
            timeout,
            dynamic,
            join_callback,
            leave_callback,
            sequence: Mutex::new(SequenceState {
                generation: 0,
                rank_size,
                barrier_seq: 0,
                gather_seq: 0,
            }),
            membership: Mutex::new(()),
            joined: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            event_watch: Mutex::new(None),
            next_token: AtomicU64::new(0),
            exit: Mutex::new(ExitState::default()),
            signals,
        };

        Ok(Self {
            core: Arc::new(core),
            receiver,
            watcher: Mutex::new(None),
        })
    }

    pub fn is_dynamic(&self) -> bool {
        self.core.dynamic
    }

    pub fn is_joined(&self) -> bool {
        self.core.joined.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.core.sequence.lock().generation
    }

    pub fn timeout(&self) -> Duration {
        self.core.timeout
    }

    /// Join a dynamic group, running the join callback with the existing members.
    ///
    /// A round that fails after the event is published commits
    /// [`PackedGeneration::ABORT_DELTA`] before the event key is released.
    ///
    /// # Errors
    /// * [`MemFabricError::InvalidParam`] for a static group
    /// * [`MemFabricError::Contention`] when the event key never frees up
    /// * any error raised by the join callback or the store
    pub fn join(&self) -> Result<()> {
        if !self.core.dynamic {
            return Err(MemFabricError::InvalidParam(
                "join requires a dynamic group".to_string(),
            ));
        }
        let _membership = self.core.membership.lock();
        if self.is_joined() {
            tracing::debug!(rank = self.core.rank, "rank already joined");
            return Ok(());
        }
        self.ensure_watcher()?;

        let start = Instant::now();
        let event = MembershipEvent::join(self.core.rank);
        self.core.publish_event(&event)?;

        let applied = self.core.apply_join();
        let released = self.core.release_event();
        applied?;
        released?;

        self.core.joined.store(true, Ordering::SeqCst);
        tracing::info!(
            rank = self.core.rank,
            generation = self.generation(),
            rank_size = self.rank_size(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "joined group"
        );
        Ok(())
    }

    /// Leave a dynamic group, running the leave callback first.
    ///
    /// A leave that fails before `DSIZE` is updated leaves the rank joined, so it
    /// keeps taking part in later membership rounds and may try again.
    ///
    /// # Errors
    /// * [`MemFabricError::NotJoined`] without a prior successful join
    /// * [`MemFabricError::InvalidState`] when the committed size is already zero
    pub fn leave(&self) -> Result<()> {
        if !self.core.dynamic {
            return Err(MemFabricError::InvalidParam(
                "leave requires a dynamic group".to_string(),
            ));
        }
        let _membership = self.core.membership.lock();
        if !self.is_joined() {
            return Err(MemFabricError::NotJoined);
        }

        let event = MembershipEvent::leave(self.core.rank);
        self.core.publish_event(&event)?;

        let applied = self.core.apply_leave();
        let released = self.core.release_event();
        // a leave that never committed is still counted in DSIZE
        let counted = matches!(&applied, Err(err) if !matches!(err, MemFabricError::InvalidState(_)));
        if !counted {
            self.core.joined.store(false, Ordering::SeqCst);
        }
        applied?;
        released?;

        tracing::info!(
            rank = self.core.rank,
            generation = self.generation(),
            "left group"
        );
        Ok(())
    }

    /// First meeting of a static group's ranks.
    ///
    /// Every rank bumps [`ARRIVALS_KEY`]; arrivals are counted in blocks of the
    /// group size, and the block number becomes the group's generation. A
    /// namespace used again, after a teardown or a failed bootstrap, therefore
    /// runs its barriers and gathers on keys the earlier use never touched, as
    /// long as every rank makes the same number of attempts.
    ///
    /// # Errors
    /// * [`MemFabricError::InvalidParam`] for a dynamic group
    /// * [`MemFabricError::Timeout`] when the other ranks do not arrive in time
    pub fn rendezvous(&self) -> Result<()> {
        if self.core.dynamic {
            return Err(MemFabricError::InvalidParam(
                "rendezvous requires a static group".to_string(),
            ));
        }
        self.core.rendezvous()
    }

    /// Register the handler run once when any rank broadcasts an exit status.
    ///
    /// The handler runs on this group's watcher thread.
    ///
    /// # Errors
    /// [`MemFabricError::InvalidParam`] if a handler is already registered.
    pub fn register_exit<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(i32) + Send + 'static,
    {
        {
            let mut exit = self.core.exit.lock();
            if exit.registered {
                return Err(MemFabricError::InvalidParam(
                    "exit handler already registered".to_string(),
                ));
            }
            exit.registered = true;
            exit.handler = Some(Box::new(handler));
        }

        let watched = self.ensure_watcher().and_then(|()| {
            let signals = self.core.signals.clone();
            self.core
                .store
                .watch(
                    EXIT_KEY,
                    Box::new(move |result| {
                        let _ = signals.send(WatcherSignal::Exit(result));
                    }),
                )
                .map_err(|e| MemFabricError::from_store("watch", EXIT_KEY, e))
        });

        let mut exit = self.core.exit.lock();
        match watched {
            Ok(id) => {
                exit.watch = Some(id);
                Ok(())
            }
            Err(err) => {
                exit.registered = false;
                exit.handler = None;
                Err(err)
            }
        }
    }

    /// Publish an exit status to every rank that registered an exit handler.
    pub fn broadcast_exit(&self, status: i32) -> Result<()> {
        tracing::info!(rank = self.core.rank, status, "broadcasting exit");
        self.core
            .store
            .set(EXIT_KEY, status.to_string().as_bytes())
            .map_err(|e| MemFabricError::from_store("set", EXIT_KEY, e))
    }

    /// Delete the barrier and gather keys still retained for the current generation.
    ///
    /// Only safe once no rank can still be waiting on the current sequence, so
    /// nothing in this crate calls it on teardown.
    pub fn clean_sequences(&self) {
        self.core.clean_sequences();
    }

    fn ensure_watcher(&self) -> Result<()> {
        let mut watcher = self.watcher.lock();
        if watcher.is_some() {
            return Ok(());
        }
        let core = self.core.clone();
        let signals = self.receiver.clone();
        let handle = std::thread::Builder::new()
            .name(format!("memfabric-watch-{}", self.core.rank))
            .spawn(move || watcher::run(core, signals))
            .map_err(MemFabricError::WatcherSpawn)?;
        *watcher = Some(handle);
        Ok(())
    }
}

impl CollectiveOps for RendezvousGroup {
    fn barrier(&self) -> Result<()> {
        self.core.barrier()
    }

    fn all_gather(&self, send: &[u8]) -> Result<Vec<u8>> {
        self.core.all_gather(send)
    }

    fn rank(&self) -> u32 {
        self.core.rank
    }

    fn rank_size(&self) -> u32 {
        self.core.rank_size()
    }
}

impl std::fmt::Debug for RendezvousGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sequence = *self.core.sequence.lock();
        f.debug_struct("RendezvousGroup")
            .field("rank", &self.core.rank)
            .field("rank_size", &sequence.rank_size)
            .field("generation", &sequence.generation)
            .field("dynamic", &self.core.dynamic)
            .field("joined", &self.is_joined())
            .finish()
    }
}

impl Drop for RendezvousGroup {
    fn drop(&mut self) {
        self.core.stopped.store(true, Ordering::SeqCst);
        let _ = self.core.signals.send(WatcherSignal::Stop);

        if let Some(handle) = self.watcher.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                tracing::warn!(rank = self.core.rank, "group dropped from its own watcher");
            } else if handle.join().is_err() {
                tracing::error!(rank = self.core.rank, "membership watcher panicked");
            }
        }

        if let Some(armed) = self.core.event_watch.lock().take() {
            let _ = self.core.store.unwatch(armed.id);
        }
        let exit_watch = self.core.exit.lock().watch.take();
        if let Some(id) = exit_watch {
            let _ = self.core.store.unwatch(id);
        }
        tracing::debug!(rank = self.core.rank, "rendezvous group stopped");
    }
}

impl GroupCore {
    fn rank_size(&self) -> u32 {
        self.sequence.lock().rank_size
    }

    fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn next_barrier(&self) -> Slot {
        let mut sequence = self.sequence.lock();
        sequence.barrier_seq += 1;
        Slot {
            generation: sequence.generation,
            seq: sequence.barrier_seq,
            rank_size: sequence.rank_size,
        }
    }

    fn next_gather(&self) -> Slot {
        let mut sequence = self.sequence.lock();
        sequence.gather_seq += 1;
        Slot {
            generation: sequence.generation,
            seq: sequence.gather_seq,
            rank_size: sequence.rank_size,
        }
    }

    fn barrier(&self) -> Result<()> {
        let slot = self.next_barrier();
        let add_key = slot.key("BA");
        let wait_key = slot.key("BW");

        let arrived = self
            .store
            .add(&add_key, 1)
            .map_err(|e| MemFabricError::from_store("add", &add_key, e))?;
        if arrived == slot.rank_size as i64 {
            self.store
                .set(&wait_key, SUCCESS_VALUE)
                .map_err(|e| MemFabricError::from_store("set", &wait_key, e))?;
            if slot.seq > REMOVE_INTERVAL {
                self.remove_sequence(slot.generation, slot.seq - REMOVE_INTERVAL, &["BA", "BW"]);
            }
        }

        self.wait_for_success(&wait_key)?;
        tracing::trace!(
            rank = self.rank,
            generation = slot.generation,
            seq = slot.seq,
            rank_size = slot.rank_size,
            "barrier complete"
        );
        Ok(())
    }

    fn all_gather(&self, send: &[u8]) -> Result<Vec<u8>> {
        if send.is_empty() || send.len() > MAX_GATHER_PAYLOAD {
            return Err(MemFabricError::InvalidParam(format!(
                "all-gather payload of {} bytes is outside 1..={MAX_GATHER_PAYLOAD}",
                send.len()
            )));
        }

        let slot = self.next_gather();
        let append_key = slot.key("GA");
        let wait_key = slot.key("GW");
        let chunk = send.len() + RANK_PREFIX_LEN;
        let expected = chunk * slot.rank_size as usize;

        let mut framed = Vec::with_capacity(chunk);
        framed.extend_from_slice(&self.rank.to_le_bytes());
        framed.extend_from_slice(send);

        let total = self
            .store
            .append(&append_key, &framed)
            .map_err(|e| MemFabricError::from_store("append", &append_key, e))?;
        if total as usize == expected {
            self.store
                .set(&wait_key, SUCCESS_VALUE)
                .map_err(|e| MemFabricError::from_store("set", &wait_key, e))?;
            if slot.seq > REMOVE_INTERVAL {
                self.remove_sequence(slot.generation, slot.seq - REMOVE_INTERVAL, &["GA", "GW"]);
            }
        }

        self.wait_for_success(&wait_key)?;
        let gathered = self
            .store
            .get(&append_key, self.timeout)
            .map_err(|e| MemFabricError::from_store("get", &append_key, e))?;
        if gathered.len() != expected {
            return Err(MemFabricError::GatherMismatch {
                expected,
                actual: gathered.len(),
            });
        }

        let mut chunks: Vec<(u32, &[u8])> = gathered
            .chunks_exact(chunk)
            .map(|c| {
                let rank = u32::from_le_bytes([c[0], c[1], c[2], c[3]]);
                (rank, &c[RANK_PREFIX_LEN..])
            })
            .collect();
        chunks.sort_by_key(|(rank, _)| *rank);

        let mut output = Vec::with_capacity(send.len() * chunks.len());
        for (_, payload) in chunks {
            output.extend_from_slice(payload);
        }
        tracing::trace!(
            rank = self.rank,
            generation = slot.generation,
            seq = slot.seq,
            bytes = output.len(),
            "all-gather complete"
        );
        Ok(output)
    }

    fn wait_for_success(&self, wait_key: &str) -> Result<()> {
        let value = self
            .store
            .get(wait_key, self.timeout)
            .map_err(|e| MemFabricError::from_store("get", wait_key, e))?;
        if value.as_ref() != SUCCESS_VALUE {
            return Err(MemFabricError::InvalidState(format!(
                "wait key {wait_key} holds {:?} instead of the success marker",
                String::from_utf8_lossy(&value)
            )));
        }
        Ok(())
    }

    fn rendezvous(&self) -> Result<()> {
        let rank_size = i64::from(self.rank_size());
        let arrived = self
            .store
            .add(ARRIVALS_KEY, 1)
            .map_err(|e| MemFabricError::from_store("add", ARRIVALS_KEY, e))?;
        if arrived < 1 {
            return Err(MemFabricError::InvalidState(format!(
                "arrival counter {} holds {arrived}",
                self.store.full_key(ARRIVALS_KEY)
            )));
        }
        let generation = ((arrived - 1) / rank_size) as u64;
        // barrier sequences start at 1, so sequence 0 is free for the rendezvous
        let wait_key = sequence_key(generation, 0, "BW");
        if arrived % rank_size == 0 {
            self.store
                .set(&wait_key, SUCCESS_VALUE)
                .map_err(|e| MemFabricError::from_store("set", &wait_key, e))?;
            if generation > 0 {
                self.remove_sequence(generation - 1, 0, &["BW"]);
            }
        }

        self.wait_for_success(&wait_key)?;
        self.sequence.lock().reset(generation, rank_size as u32);
        tracing::debug!(rank = self.rank, generation, rank_size, "rendezvous complete");
        Ok(())
    }

    fn remove_sequence(&self, generation: u64, seq: u32, suffixes: &[&str]) {
        for suffix in suffixes {
            let key = sequence_key(generation, seq, suffix);
            if let Err(err) = self.store.remove(&key) {
                tracing::warn!(rank = self.rank, key = %key, error = %err, "failed to remove stale key");
            }
        }
    }

    fn clean_sequences(&self) {
        let sequence = *self.sequence.lock();
        let generation = sequence.generation;
        if self.dynamic && generation == 0 {
            // creation barrier keys, shared with members that may still be starting up
            return;
        }
        for (seq, suffixes) in [
            (sequence.barrier_seq, ["BA", "BW"]),
            (sequence.gather_seq, ["GA", "GW"]),
        ] {
            // older sequences were collected by whoever completed seq - REMOVE_INTERVAL
            let oldest = seq.saturating_sub(REMOVE_INTERVAL - 1).max(1);
            for old in oldest..=seq {
                self.remove_sequence(generation, old, &suffixes);
            }
        }
    }

    /// Take the event key with a bounded CAS loop.
    ///
    /// The retry budget restarts whenever the holder changes; only a key stuck on
    /// one value for the whole budget is reported as contention.
    fn publish_event(&self, event: &MembershipEvent) -> Result<()> {
        let value = event.to_string();
        let budget = (self.timeout.as_millis() / POLL_INTERVAL.as_millis()).max(1);
        let mut attempts = 0u128;
        let mut holder: Option<bytes::Bytes> = None;

        loop {
            let prior = self
                .store
                .cas(EVENT_KEY, b"", value.as_bytes())
                .map_err(|e| MemFabricError::from_store("cas", EVENT_KEY, e))?;
            if prior.is_empty() {
                tracing::debug!(rank = self.rank, event = %value, "membership event published");
                return Ok(());
            }

            if holder.as_ref() != Some(&prior) {
                tracing::debug!(
                    rank = self.rank,
                    holder = %String::from_utf8_lossy(&prior),
                    "event key busy"
                );
                holder = Some(prior);
                attempts = 0;
            }
            attempts += 1;
            if attempts >= budget {
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let holder = holder
            .map(|h| String::from_utf8_lossy(&h).into_owned())
            .unwrap_or_default();
        tracing::warn!(rank = self.rank, %holder, "gave up publishing membership event");
        Err(MemFabricError::Contention {
            key: self.store.full_key(EVENT_KEY),
            holder,
        })
    }

    fn release_event(&self) -> Result<()> {
        self.store
            .remove(EVENT_KEY)
            .map_err(|e| MemFabricError::from_store("remove", EVENT_KEY, e))
    }

    fn read_size(&self) -> Result<PackedGeneration> {
        self.store
            .add(SIZE_KEY, 0)
            .map(PackedGeneration::from_raw)
            .map_err(|e| MemFabricError::from_store("add", SIZE_KEY, e))
    }

    fn commit_size(&self, delta: i64) -> Result<PackedGeneration> {
        self.store
            .add(SIZE_KEY, delta)
            .map(PackedGeneration::from_raw)
            .map_err(|e| MemFabricError::from_store("add", SIZE_KEY, e))
    }

    fn apply_join(&self) -> Result<()> {
        let joined = self.join_round();
        if let Err(err) = &joined {
            self.abort_round(err);
        }
        joined
    }

    fn join_round(&self) -> Result<()> {
        let current = self.read_size()?;
        self.clean_sequences();
        let next = current.apply(PackedGeneration::JOIN_DELTA);
        self.sequence.lock().reset(next.generation(), next.size());
        tracing::debug!(rank = self.rank, from = %current, to = %next, "switching generation");

        if let Some(callback) = &self.join_callback {
            callback(self, self.rank)?;
        }
        self.commit_size(PackedGeneration::JOIN_DELTA)?;
        Ok(())
    }

    fn apply_leave(&self) -> Result<()> {
        let left = self.leave_round();
        match &left {
            // members ignore a leave from an empty group, so there is no round to retire
            Err(MemFabricError::InvalidState(_)) | Ok(()) => {}
            Err(err) => self.abort_round(err),
        }
        left
    }

    fn leave_round(&self) -> Result<()> {
        if let Some(callback) = &self.leave_callback {
            callback(self, self.rank)?;
        }

        // the event key is held, so nobody else can move DSIZE between these two calls
        let current = self.read_size()?;
        if current.size() == 0 {
            return Err(MemFabricError::InvalidState(format!(
                "cannot leave an empty group ({current})"
            )));
        }
        let committed = self.commit_size(PackedGeneration::LEAVE_DELTA)?;
        self.sequence
            .lock()
            .reset(committed.generation(), committed.size());
        Ok(())
    }

    /// Retire the generation a failed round used. Runs while the event key is held.
    fn abort_round(&self, cause: &MemFabricError) {
        match self.commit_size(PackedGeneration::ABORT_DELTA) {
            Ok(committed) => {
                self.sequence
                    .lock()
                    .reset(committed.generation(), committed.size());
                tracing::warn!(
                    rank = self.rank,
                    error = %cause,
                    committed = %committed,
                    "membership round aborted"
                );
            }
            Err(err) => {
                tracing::error!(
                    rank = self.rank,
                    error = %err,
                    cause = %cause,
                    "failed to retire the generation of an aborted round"
                );
            }
        }
    }

    fn on_exit(&self, result: std::result::Result<bytes::Bytes, StoreError>) {
        let raw = match result {
            Ok(raw) => raw,
            Err(StoreError::Closed) => {
                tracing::debug!(rank = self.rank, "store closed while waiting for exit");
                return;
            }
            Err(err) => {
                tracing::warn!(rank = self.rank, error = %err, "exit watch failed");
                return;
            }
        };
        let status = match event::parse_exit_status(&raw) {
            Ok(status) => status,
            Err(err) => {
                tracing::warn!(rank = self.rank, error = %err, "dropping malformed exit status");
                return;
            }
        };
        let handler = self.exit.lock().handler.take();
        if let Some(handler) = handler {
            tracing::info!(rank = self.rank, status, "exit broadcast received");
            handler(status);
        }
    }
}

impl CollectiveOps for GroupCore {
    fn barrier(&self) -> Result<()> {
        GroupCore::barrier(self)
    }

    fn all_gather(&self, send: &[u8]) -> Result<Vec<u8>> {
        GroupCore::all_gather(self, send)
    }

    fn rank(&self) -> u32 {
        self.rank
    }

    fn rank_size(&self) -> u32 {
        GroupCore::rank_size(self)
    }
}
