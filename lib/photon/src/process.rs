use crate::mailbox::Mailbox;
use crate::runtime::Ctx;
use crate::value::Reader;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Instant;

/// Process identifier. Monotonically assigned; the low bits index the slot
/// table, so a pid resolves to its slot without a lookup structure.
pub type Pid = i64;

/// Pseudo-pid addressing the embedding host.
pub const HOST_PID: Pid = -1;

/// Default process table capacity.
pub const MAX_PROCESS: usize = 1024;

/// Names longer than this are truncated.
pub const MAX_NAME_LEN: usize = 32;

/// Lifecycle states. See the worker/scheduler-loop transition rules in
/// `sched`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// Slot free for allocation.
    None,
    /// Allocated, not yet scheduled.
    Created,
    /// Parked until a message, fd readiness or timer.
    Waiting,
    /// Eligible for pickup by a worker.
    Runnable,
    /// Executing on exactly one worker.
    Running,
    /// Exited with live children; awaits their teardown.
    Done,
    /// Suspended until the child list empties.
    Pending,
    /// Ready for reclamation by the scheduler loop.
    Shutdown,
}

/// What a process body asks for when it returns from a step.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Step {
    /// Park until a message arrives, the fd is readable or the timer fires.
    Idle,
    /// Suspend until all children have been torn down.
    Wait,
    /// Terminate.
    Exit,
}

/// A process body: the continuation advanced one step at a time by worker
/// threads. A step runs to completion without yielding; the runtime never
/// preempts it, so body state needs no internal locking.
pub trait Body: Send {
    fn step(&mut self, ctx: &mut Ctx) -> Step;
}

#[derive(Debug)]
pub enum SpawnError {
    /// All slots are occupied. Existing processes are unaffected.
    NoFreeSlot,
    /// The parent pid does not resolve to a live process.
    NoParent,
    /// The initial message does not fit a fresh mailbox.
    InitialMessage,
    /// The runtime is quitting.
    ShuttingDown,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SpawnError::NoFreeSlot => write!(f, "process table exhausted"),
            SpawnError::NoParent => write!(f, "parent process does not exist"),
            SpawnError::InitialMessage => write!(f, "initial message exceeds mailbox capacity"),
            SpawnError::ShuttingDown => write!(f, "runtime is shutting down"),
        }
    }
}

/// Snapshot of one process for `list-processes` style introspection.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: String,
    pub state: State,
    pub parent: Option<Pid>,
}

/// One slot of the process table. All fields are guarded by the table lock;
/// the body and decoder are taken out by the worker for the duration of a
/// step.
pub(crate) struct Slot {
    pub state: State,
    pub pid: Pid,
    pub name: String,
    pub parent: Option<Pid>,
    /// Child pids, newest first.
    pub children: Vec<Pid>,
    pub mailbox: Option<Arc<Mailbox>>,
    /// Mailbox high-water mark at the start of the last step. Mail counts
    /// as a wakeup only once, when it arrives; a process that parks without
    /// draining old mail is not spun awake for it again.
    pub mail_seen: u64,
    pub fd: Option<RawFd>,
    pub wake_at: Option<Instant>,
    /// Set by the scheduler loop when `wake_at` fired; consumed by the body.
    pub timer_fired: bool,
    pub privileged: bool,
    pub logging_level: u8,
    pub body: Option<Box<dyn Body>>,
    pub reader: Reader,
}

impl Slot {
    fn vacant() -> Slot {
        Slot {
            state: State::None,
            pid: 0,
            name: String::new(),
            parent: None,
            children: Vec::new(),
            mailbox: None,
            mail_seen: 0,
            fd: None,
            wake_at: None,
            timer_fired: false,
            privileged: false,
            logging_level: 0,
            body: None,
            reader: Reader::new(),
        }
    }

    /// Returns the slot to the allocatable state. The caller is responsible
    /// for fd deregistration and parent unlinking.
    pub fn release(&mut self) {
        debug_assert!(self.children.is_empty());

        self.state = State::None;
        self.pid = 0;
        self.name.clear();
        self.parent = None;
        self.mailbox = None;
        self.mail_seen = 0;
        self.fd = None;
        self.wake_at = None;
        self.timer_fired = false;
        self.privileged = false;
        self.logging_level = 0;
        self.body = None;
        self.reader.clear();
    }
}

/// The process table plus the scheduler bookkeeping guarded together with it:
/// pid assignment, the allocation cursor and the worker fairness cursor.
pub(crate) struct Table {
    pub slots: Vec<Slot>,
    pub quit: bool,
    next_serial: i64,
    alloc_cursor: usize,
    run_cursor: usize,
    slot_bits: u32,
}

impl Table {
    pub fn new(capacity: usize) -> Table {
        let capacity = capacity.max(2).next_power_of_two();

        Table {
            slots: (0..capacity).map(|_| Slot::vacant()).collect(),
            quit: false,
            next_serial: 1,
            alloc_cursor: 0,
            run_cursor: 0,
            slot_bits: capacity.trailing_zeros(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Resolves a pid to its slot index, checking that the slot is still
    /// occupied by that pid. Stale pids of torn-down processes resolve to
    /// nothing.
    pub fn index_of(&self, pid: Pid) -> Option<usize> {
        if pid < 0 {
            return None;
        }

        let idx = (pid as usize) & (self.capacity() - 1);
        let slot = &self.slots[idx];

        if slot.state != State::None && slot.pid == pid {
            Some(idx)
        } else {
            None
        }
    }

    #[inline]
    pub fn slot_of(&mut self, pid: Pid) -> Option<&mut Slot> {
        let idx = self.index_of(pid)?;
        Some(&mut self.slots[idx])
    }

    /// Reserves the first free slot starting at the rolling allocation
    /// cursor, assigning a fresh pid whose low bits are the slot index.
    pub fn allocate(&mut self) -> Option<usize> {
        let capacity = self.capacity();

        for offset in 0..capacity {
            let idx = (self.alloc_cursor + offset) % capacity;

            if self.slots[idx].state == State::None {
                let pid = (self.next_serial << self.slot_bits) | idx as i64;
                self.next_serial += 1;
                self.alloc_cursor = (idx + 1) % capacity;

                let slot = &mut self.slots[idx];
                slot.state = State::Created;
                slot.pid = pid;

                return Some(idx);
            }
        }

        None
    }

    /// Finds the next runnable slot from the rolling fairness cursor.
    pub fn next_runnable(&mut self) -> Option<usize> {
        let capacity = self.capacity();

        for offset in 0..capacity {
            let idx = (self.run_cursor + offset) % capacity;

            if self.slots[idx].state == State::Runnable {
                self.run_cursor = (idx + 1) % capacity;
                return Some(idx);
            }
        }

        None
    }

    /// True when every slot is free.
    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|slot| slot.state == State::None)
    }

    pub fn snapshot(&self) -> Vec<ProcessInfo> {
        self.slots
            .iter()
            .filter(|slot| slot.state != State::None)
            .map(|slot| ProcessInfo {
                pid: slot.pid,
                name: slot.name.clone(),
                state: slot.state,
                parent: slot.parent,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_assigns_unique_monotonic_pids() {
        let mut table = Table::new(8);

        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();

        let pid_a = table.slots[a].pid;
        let pid_b = table.slots[b].pid;

        assert_ne!(a, b);
        assert!(pid_b > pid_a);
        assert_eq!(table.index_of(pid_a), Some(a));
        assert_eq!(table.index_of(pid_b), Some(b));
    }

    #[test]
    fn test_slot_reuse_issues_fresh_pid() {
        let mut table = Table::new(2);

        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        let old_pid = table.slots[a].pid;

        table.slots[a].release();
        assert_eq!(table.index_of(old_pid), None);

        let c = table.allocate().unwrap();
        assert_eq!(c, a);
        assert_ne!(table.slots[c].pid, old_pid);
        // The stale pid still resolves to nothing even though the slot is
        // occupied again.
        assert_eq!(table.index_of(old_pid), None);

        let _ = b;
    }

    #[test]
    fn test_allocate_exhaustion() {
        let mut table = Table::new(2);

        assert!(table.allocate().is_some());
        assert!(table.allocate().is_some());
        assert!(table.allocate().is_none());
    }

    #[test]
    fn test_next_runnable_rolls_cursor() {
        let mut table = Table::new(4);

        for _ in 0..3 {
            let idx = table.allocate().unwrap();
            table.slots[idx].state = State::Runnable;
        }

        for expected in 0..3 {
            let idx = table.next_runnable().unwrap();
            assert_eq!(idx, expected);
            table.slots[idx].state = State::Running;
        }

        assert!(table.next_runnable().is_none());
    }

    #[test]
    fn test_release_resets_slot() {
        let mut table = Table::new(2);
        let idx = table.allocate().unwrap();

        {
            let slot = &mut table.slots[idx];
            slot.name.push_str("worker");
            slot.privileged = true;
            slot.mailbox = Some(Arc::new(Mailbox::new(64)));
            slot.state = State::Shutdown;
        }

        table.slots[idx].release();

        let slot = &table.slots[idx];
        assert_eq!(slot.state, State::None);
        assert!(slot.mailbox.is_none());
        assert!(!slot.privileged);
        assert!(slot.name.is_empty());
        assert!(table.is_idle());
    }
}
