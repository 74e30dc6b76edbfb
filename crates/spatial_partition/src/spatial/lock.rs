//! Tree access gate
//!
//! A reader/writer lock that knows which threads hold it for reading. That
//! lets a thread that is inside a traversal (holding read access) mutate the
//! same tree from its visitor: the write guard gives up the thread's read
//! holds, waits for exclusive access, and puts the same number of holds back
//! when it is dropped. [`TreeLock::suspend_reads`] does the first and last
//! of those steps on its own, for callers that write to more than one gate.
//!
//! The gate carries no data. Each tree keeps its state in a separate
//! `RwLock` that is only held for short, visitor-free sections.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct GateState {
    /// Read holds per thread; a thread may nest reads
    readers: Vec<(ThreadId, u32)>,
    writer: Option<ThreadId>,
    waiting_writers: usize,
}

impl GateState {
    fn read_depth(&self, thread: ThreadId) -> u32 {
        self.readers
            .iter()
            .find(|(id, _)| *id == thread)
            .map_or(0, |&(_, depth)| depth)
    }

    fn take_reads(&mut self, thread: ThreadId) -> u32 {
        match self.readers.iter().position(|(id, _)| *id == thread) {
            Some(index) => self.readers.swap_remove(index).1,
            None => 0,
        }
    }
}

/// Reader/writer gate with same-thread read-to-write escalation
#[derive(Debug, Default)]
pub struct TreeLock {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl TreeLock {
    /// Create an unlocked gate
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, state: MutexGuard<'a, GateState>) -> MutexGuard<'a, GateState> {
        self.changed.wait(state).unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire shared access.
    ///
    /// A thread that already reads is let through immediately, even with
    /// writers queued, so nested queries cannot deadlock.
    pub fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.lock_state();
        debug_assert!(state.writer != Some(me), "read requested while holding the write lock");

        loop {
            if let Some(entry) = state.readers.iter_mut().find(|(id, _)| *id == me) {
                entry.1 += 1;
                break;
            }
            if state.writer.is_none() && state.waiting_writers == 0 {
                state.readers.push((me, 1));
                break;
            }
            state = self.wait(state);
        }

        ReadGuard { lock: self }
    }

    /// Acquire exclusive access, escalating any read holds of this thread
    pub fn write(&self) -> WriteGuard<'_> {
        let suspended = self.suspend_reads();
        let me = thread::current().id();
        let mut state = self.lock_state();
        debug_assert!(state.writer != Some(me), "tree write lock is not re-entrant");

        state.waiting_writers += 1;
        while state.writer.is_some() || !state.readers.is_empty() {
            state = self.wait(state);
        }
        state.waiting_writers -= 1;
        state.writer = Some(me);

        WriteGuard { lock: self, suspended }
    }

    /// Give up every read hold of the calling thread until the guard drops.
    ///
    /// A thread that is about to take writes on several gates suspends its
    /// reads on all of them first, so it never waits for one gate while
    /// holding another.
    pub fn suspend_reads(&self) -> SuspendedReads<'_> {
        let mut state = self.lock_state();
        let depth = state.take_reads(thread::current().id());
        if depth > 0 {
            log::trace!("Suspending {depth} read hold(s)");
            self.changed.notify_all();
        }
        SuspendedReads { lock: self, depth }
    }

    /// Read holds the calling thread has on this gate
    pub fn held_reads(&self) -> u32 {
        self.lock_state().read_depth(thread::current().id())
    }

    /// True if any thread holds the write lock
    pub fn is_write_locked(&self) -> bool {
        self.lock_state().writer.is_some()
    }
}

/// Shared access to a tree; released on drop
#[derive(Debug)]
#[must_use = "the read hold is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a TreeLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let me = thread::current().id();
        let mut state = self.lock.lock_state();
        match state.readers.iter().position(|(id, _)| *id == me) {
            Some(index) => {
                state.readers[index].1 -= 1;
                if state.readers[index].1 == 0 {
                    state.readers.swap_remove(index);
                    self.lock.changed.notify_all();
                }
            }
            None => log::error!("Read guard dropped on a thread holding no read lock"),
        }
    }
}

/// Read holds taken from a thread, put back on drop
#[derive(Debug)]
#[must_use = "the read holds come back as soon as the guard is dropped"]
pub struct SuspendedReads<'a> {
    lock: &'a TreeLock,
    depth: u32,
}

impl SuspendedReads<'_> {
    /// Read holds that will be restored
    pub const fn depth(&self) -> u32 {
        self.depth
    }
}

impl Drop for SuspendedReads<'_> {
    fn drop(&mut self) {
        if self.depth == 0 {
            return;
        }
        let me = thread::current().id();
        let mut state = self.lock.lock_state();
        // Only an active writer blocks us here; queued writers would
        // otherwise wait on a traversal that cannot finish.
        while state.writer.is_some() {
            state = self.lock.wait(state);
        }
        match state.readers.iter_mut().find(|(id, _)| *id == me) {
            Some(entry) => entry.1 += self.depth,
            None => state.readers.push((me, self.depth)),
        }
    }
}

/// Exclusive access to a tree.
///
/// On drop the write lock is released and any read holds the thread gave up
/// to get here are restored.
#[derive(Debug)]
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a TreeLock,
    // Dropped after the writer slot is cleared.
    suspended: SuspendedReads<'a>,
}

impl WriteGuard<'_> {
    /// Read holds the thread gave up to take this lock
    pub const fn escalated_reads(&self) -> u32 {
        self.suspended.depth()
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.lock.lock_state();
        state.writer = None;
        self.lock.changed.notify_all();
    }
}
