//! Per-pipe state, the pipe table, and the scoped lookup guard that is the
//! only legal way to touch a `PipeState` from outside the packet-handling
//! thread.
//!
//! The source's `LockedPipe` briefly locks the table, looks up the pipe,
//! acquires the pipe's own mutex, and releases the table lock, so the table
//! is never held across a condition wait. The same discipline holds here:
//! `LockedPipe::find` does the lookup and hands back a guard that owns a
//! `MutexGuard` over the pipe's state. Because that guard borrows out of
//! data kept alive by an `Arc` stored in the same struct, its lifetime is
//! widened with `transmute` the way a self-referential owning guard is built
//! elsewhere in this codebase's surrounding ecosystem (the guard can never
//! outlive the `Arc` it was built from, since both live and die together as
//! fields of `LockedPipe`).

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::packet::PacketList;
use crate::stream_pos::StreamPos;

#[derive(Debug)]
pub struct PipeStateInner {
    pub stream_pos: StreamPos,
    pub packets: PacketList,
    pub packet_loss_mode: bool,

    // Master-only flow control.
    pub head_stream_pos: StreamPos,
    pub slave_stream_pos_offsets: Vec<u32>,
    pub num_head_slaves: u32,

    // Barrier / gather.
    pub barrier_id: u32,
    pub slave_barrier_ids: Vec<u32>,
    pub min_slave_barrier_id: u32,
    pub slave_gather_values: Vec<u32>,
    pub master_gather_value: u32,

    /// Slave only: round-robin counter that wraps at `num_slaves`, seeded
    /// from `node_index - 1` so slaves sharing a pipe don't all land on the
    /// ack boundary for the same delivered packet.
    pub ack_counter: u32,
}

impl PipeStateInner {
    fn new_slave(node_index: u32) -> Self {
        PipeStateInner {
            stream_pos: StreamPos::ZERO,
            packets: PacketList::new(),
            packet_loss_mode: false,
            head_stream_pos: StreamPos::ZERO,
            slave_stream_pos_offsets: Vec::new(),
            num_head_slaves: 0,
            barrier_id: 0,
            slave_barrier_ids: Vec::new(),
            min_slave_barrier_id: 0,
            slave_gather_values: Vec::new(),
            master_gather_value: 0,
            ack_counter: node_index.wrapping_sub(1),
        }
    }

    fn new_master(num_slaves: u32) -> Self {
        PipeStateInner {
            stream_pos: StreamPos::ZERO,
            packets: PacketList::new(),
            packet_loss_mode: false,
            head_stream_pos: StreamPos::ZERO,
            slave_stream_pos_offsets: vec![0; num_slaves as usize],
            num_head_slaves: num_slaves,
            barrier_id: 0,
            slave_barrier_ids: vec![0; num_slaves as usize],
            min_slave_barrier_id: 0,
            slave_gather_values: vec![0; num_slaves as usize],
            master_gather_value: 0,
            ack_counter: 0,
        }
    }

    /// Recomputes `min_slave_barrier_id` from `slave_barrier_ids`. Called
    /// after any single slave's entry changes.
    pub fn recompute_min_slave_barrier_id(&mut self) {
        self.min_slave_barrier_id = self
            .slave_barrier_ids
            .iter()
            .copied()
            .min()
            .unwrap_or(0);
    }
}

#[derive(Debug)]
pub struct PipeState {
    inner: Mutex<PipeStateInner>,
    pub receive_cond: Condvar,
    pub barrier_cond: Condvar,
}

impl PipeState {
    pub fn new_master(num_slaves: u32) -> Arc<Self> {
        Arc::new(PipeState {
            inner: Mutex::new(PipeStateInner::new_master(num_slaves)),
            receive_cond: Condvar::new(),
            barrier_cond: Condvar::new(),
        })
    }

    pub fn new_slave(node_index: u32) -> Arc<Self> {
        Arc::new(PipeState {
            inner: Mutex::new(PipeStateInner::new_slave(node_index)),
            receive_cond: Condvar::new(),
            barrier_cond: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, PipeStateInner> {
        self.inner.lock().unwrap()
    }
}

/// `pipe_id -> PipeState` map, protected by one table-wide mutex that is
/// held only long enough to look up, insert, or remove an entry.
#[derive(Debug, Default)]
pub struct PipeTable {
    table: Mutex<HashMap<u32, Arc<PipeState>>>,
}

impl PipeTable {
    pub fn new() -> Self {
        PipeTable {
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, pipe_id: u32, state: Arc<PipeState>) {
        self.table.lock().unwrap().insert(pipe_id, state);
    }

    pub fn lookup(&self, pipe_id: u32) -> Option<Arc<PipeState>> {
        self.table.lock().unwrap().get(&pipe_id).cloned()
    }

    pub fn remove(&self, pipe_id: u32) -> Option<Arc<PipeState>> {
        self.table.lock().unwrap().remove(&pipe_id)
    }

    /// Wakes every thread blocked on any pipe's receive or barrier condvar.
    /// Used when the packet-handling thread stops so callers parked in an
    /// unbounded wait notice the `running` flag has gone false instead of
    /// hanging forever.
    pub fn notify_all(&self) {
        for state in self.table.lock().unwrap().values() {
            state.receive_cond.notify_all();
            state.barrier_cond.notify_all();
        }
    }
}

/// Owning guard over one pipe's locked state, acquired via `PipeTable`
/// lookup. Dropping it releases the pipe's mutex; it never holds the table
/// lock.
pub struct LockedPipe {
    guard: Option<MutexGuard<'static, PipeStateInner>>,
    pipe: Arc<PipeState>,
}

impl LockedPipe {
    /// Looks up `pipe_id` in `table` and locks its state, releasing the
    /// table lock first. Returns `None` if the pipe does not exist (closed
    /// or never opened) — callers turn that into `Error::ClosedPipe`.
    pub fn find(table: &PipeTable, pipe_id: u32) -> Option<LockedPipe> {
        let pipe = table.lookup(pipe_id)?;
        let guard = pipe.inner.lock().unwrap();
        // Safety: `guard` borrows `pipe.inner`, and `pipe` (the `Arc` that
        // keeps that allocation alive) is stored alongside it in the same
        // struct, so the borrow can never outlive its target.
        let guard: MutexGuard<'static, PipeStateInner> = unsafe { std::mem::transmute(guard) };
        Some(LockedPipe {
            guard: Some(guard),
            pipe,
        })
    }

    pub fn pipe(&self) -> &Arc<PipeState> {
        &self.pipe
    }

    /// Waits on the receive condvar until woken, with no deadline.
    pub fn wait_receive(&mut self) {
        let guard = self.guard.take().expect("guard present while locked");
        let guard = self.pipe.receive_cond.wait(guard).unwrap();
        let guard: MutexGuard<'static, PipeStateInner> = unsafe { std::mem::transmute(guard) };
        self.guard = Some(guard);
    }

    /// Waits on the receive condvar until `deadline`. Returns `false` if the
    /// deadline elapsed without being woken.
    pub fn wait_receive_until(&mut self, deadline: Instant) -> bool {
        self.wait_cond_until(deadline, |pipe| &pipe.receive_cond)
    }

    /// Waits on the barrier condvar until `deadline`. Returns `false` if the
    /// deadline elapsed without being woken.
    pub fn wait_barrier_until(&mut self, deadline: Instant) -> bool {
        self.wait_cond_until(deadline, |pipe| &pipe.barrier_cond)
    }

    fn wait_cond_until<F: Fn(&PipeState) -> &Condvar>(
        &mut self,
        deadline: Instant,
        cond: F,
    ) -> bool {
        let guard = self.guard.take().expect("guard present while locked");
        let timeout = deadline.saturating_duration_since(Instant::now());
        let (guard, result) = cond(&self.pipe).wait_timeout(guard, timeout).unwrap();
        let guard: MutexGuard<'static, PipeStateInner> = unsafe { std::mem::transmute(guard) };
        self.guard = Some(guard);
        !result.timed_out()
    }

    /// Waits on the barrier condvar until woken, with no deadline.
    pub fn wait_barrier(&mut self) {
        let guard = self.guard.take().expect("guard present while locked");
        let guard = self.pipe.barrier_cond.wait(guard).unwrap();
        let guard: MutexGuard<'static, PipeStateInner> = unsafe { std::mem::transmute(guard) };
        self.guard = Some(guard);
    }

    /// Wakes every thread waiting in `wait_receive`/`wait_receive_until` on
    /// this pipe. Called with the pipe's state already locked.
    pub fn notify_receive(&self) {
        self.pipe.receive_cond.notify_all();
    }

    /// Wakes every thread waiting in `wait_barrier`/`wait_barrier_until` on
    /// this pipe.
    pub fn notify_barrier(&self) {
        self.pipe.barrier_cond.notify_all();
    }
}

impl Deref for LockedPipe {
    type Target = PipeStateInner;
    fn deref(&self) -> &PipeStateInner {
        self.guard.as_ref().expect("guard present while locked")
    }
}

impl DerefMut for LockedPipe {
    fn deref_mut(&mut self) -> &mut PipeStateInner {
        self.guard.as_mut().expect("guard present while locked")
    }
}

/// Absolute deadline helper: the source recomputes `now + timeout` on every
/// retry loop iteration, which drifts under scheduling delay. Here the
/// deadline is computed once per wait chain and never rebased.
pub fn deadline_after(timeout: Duration) -> Instant {
    Instant::now() + timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_returns_none_for_unknown_pipe() {
        let table = PipeTable::new();
        assert!(LockedPipe::find(&table, 1).is_none());
    }

    #[test]
    fn find_locks_and_exposes_state() {
        let table = PipeTable::new();
        table.insert(1, PipeState::new_master(2));

        let mut locked = LockedPipe::find(&table, 1).expect("pipe exists");
        locked.stream_pos += 10;
        assert_eq!(locked.stream_pos.get(), 10);
        assert_eq!(locked.slave_stream_pos_offsets.len(), 2);
        assert_eq!(locked.num_head_slaves, 2);
    }

    #[test]
    fn recompute_min_tracks_the_minimum() {
        let mut inner = PipeStateInner::new_master(3);
        inner.slave_barrier_ids = vec![5, 2, 9];
        inner.recompute_min_slave_barrier_id();
        assert_eq!(inner.min_slave_barrier_id, 2);
    }
}
