use crate::config::Config;
use crate::mailbox::{Mailbox, MBOX_INITIAL_SIZE};
use crate::process::{Body, Pid, ProcessInfo, SpawnError, State, Table, MAX_NAME_LEN};
use crate::value::{Reader, Value};
use glint::logging::{self, Logger};
use mio::unix::EventedFd;
use mio::{PollOpt, Ready, Registration, SetReadiness, Token};
use std::fmt::Write as _;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Callback invoked for messages addressed to [`HOST_PID`](crate::process::HOST_PID).
pub type HostCallback = Box<dyn FnMut(&Value) + Send>;

/// The process-wide runtime value: process table, worker signalling, the
/// central selector and the host boundary, constructed once at startup and
/// shared by every thread.
pub struct Runtime {
    pub(crate) core: Mutex<Table>,
    pub(crate) runnable: Condvar,
    pub(crate) poll: mio::Poll,
    wake: SetReadiness,
    // Keeps the wakeup readiness registered on the poll for the lifetime of
    // the runtime.
    _wake_registration: Registration,
    capacity: usize,
    host: Mutex<Option<HostCallback>>,
    config: Config,
    pub(crate) log: Logger,
}

impl Runtime {
    /// Builds a runtime. No threads run until [`run`](Runtime::run) is
    /// called; processes may be spawned and messages posted before that.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(config: Config, log: L) -> io::Result<Arc<Runtime>> {
        let log = logging::branch(log);
        let poll = mio::Poll::new()?;
        let (registration, wake) = Registration::new2();

        let table = Table::new(config.max_process);
        let capacity = table.capacity();

        poll.register(&registration, Token(capacity), Ready::readable(), PollOpt::level())?;

        logging::debug!(log, "runtime created";
                        "slots" => capacity,
                        "workers" => config.worker_threads());

        Ok(Arc::new(Runtime {
            core: Mutex::new(table),
            runnable: Condvar::new(),
            poll,
            wake,
            _wake_registration: registration,
            capacity,
            host: Mutex::new(None),
            config,
            log,
        }))
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// The poll token carrying scheduler wakeups, one past the last slot.
    #[inline]
    pub(crate) fn wake_token(&self) -> Token {
        Token(self.capacity)
    }

    #[inline]
    pub(crate) fn lock_core(&self) -> MutexGuard<Table> {
        self.core.lock().expect("Process table lock poisoned")
    }

    /// Signals the scheduler loop to abandon its selector wait and rescan
    /// the table. Safe to call from any thread.
    #[inline]
    pub(crate) fn wake_loop(&self) {
        let _ = self.wake.set_readiness(Ready::readable());
    }

    /// Clears the wakeup readiness; called by the scheduler loop when it
    /// observes the signal.
    #[inline]
    pub(crate) fn drain_wake(&self) {
        let _ = self.wake.set_readiness(Ready::empty());
    }

    /// Creates a process in state `Created`. The arglist becomes the first
    /// message in the child's fresh mailbox. Children inherit the parent's
    /// privilege flag and logging level; parentless processes are privileged.
    pub fn spawn(
        &self,
        parent: Option<Pid>,
        name: &str,
        body: Box<dyn Body>,
        args: Value,
    ) -> Result<Pid, SpawnError> {
        let mut core = self.lock_core();

        if core.quit {
            return Err(SpawnError::ShuttingDown);
        }

        let (privileged, logging_level) = match parent {
            Some(ppid) => {
                let pslot = core.slot_of(ppid).ok_or(SpawnError::NoParent)?;
                (pslot.privileged, pslot.logging_level)
            }
            None => (true, 0),
        };

        let idx = core.allocate().ok_or(SpawnError::NoFreeSlot)?;
        let pid = core.slots[idx].pid;

        let mailbox = Arc::new(Mailbox::new(MBOX_INITIAL_SIZE));
        {
            let mut tx = mailbox.begin_append();
            let _ = write!(tx, "{}", args);
            if !tx.commit() {
                core.slots[idx].release();
                return Err(SpawnError::InitialMessage);
            }
        }

        {
            let slot = &mut core.slots[idx];
            slot.name.push_str(truncate_name(name));
            slot.parent = parent;
            slot.privileged = privileged;
            slot.logging_level = logging_level;
            slot.mailbox = Some(mailbox);
            slot.body = Some(body);
        }

        // Newest children sit at the head of the sibling list.
        if let Some(ppid) = parent {
            if let Some(pslot) = core.slot_of(ppid) {
                pslot.children.insert(0, pid);
            }
        }

        logging::debug!(self.log, "process spawned";
                        "pid" => pid,
                        "name" => name,
                        "parent" => parent);

        Ok(pid)
    }

    /// Spawns a parentless privileged process and schedules it immediately.
    pub fn spawn_root(&self, name: &str, body: Box<dyn Body>, args: Value) -> Result<Pid, SpawnError> {
        let pid = self.spawn(None, name, body, args)?;
        self.schedule(pid, true);
        Ok(pid)
    }

    /// Makes a `Created` or `Waiting` process eligible to run. With
    /// `immediate` the process goes straight to `Runnable` and workers are
    /// signalled; otherwise it parks as `Waiting`, eligible for the
    /// scheduler loop's wakeup scan. Any other state is left untouched.
    pub fn schedule(&self, pid: Pid, immediate: bool) {
        let mut core = self.lock_core();

        if let Some(slot) = core.slot_of(pid) {
            match slot.state {
                State::Created | State::Waiting => {
                    if immediate {
                        slot.state = State::Runnable;
                    } else {
                        slot.state = State::Waiting;
                    }
                }
                _ => return,
            }
        } else {
            return;
        }

        drop(core);

        if immediate {
            self.runnable.notify_all();
        } else {
            self.wake_loop();
        }
    }

    /// Attaches an OS file descriptor to a process for selector polling.
    /// Readiness of the fd makes a `Waiting` owner `Runnable`. The process
    /// body retains ownership of the underlying object; teardown only
    /// deregisters.
    pub fn set_process_socket(&self, pid: Pid, fd: RawFd) -> io::Result<()> {
        let mut core = self.lock_core();

        let idx = core
            .index_of(pid)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such process"))?;

        if let Some(old) = core.slots[idx].fd.take() {
            let _ = self.poll.deregister(&EventedFd(&old));
        }

        self.poll
            .register(&EventedFd(&fd), Token(idx), Ready::readable(), PollOpt::level())?;
        core.slots[idx].fd = Some(fd);

        drop(core);
        self.wake_loop();

        Ok(())
    }

    /// Sets or clears a process's wall-clock wakeup.
    pub fn set_process_timeout(&self, pid: Pid, deadline: Option<Instant>) {
        let mut core = self.lock_core();

        if let Some(slot) = core.slot_of(pid) {
            slot.wake_at = deadline;
            slot.timer_fired = false;
        }

        drop(core);
        self.wake_loop();
    }

    /// Installs the callback that receives messages addressed to the host.
    pub fn set_host_callback(&self, callback: HostCallback) {
        *self.host.lock().expect("Host callback lock poisoned") = Some(callback);
    }

    /// Hands a message to the embedding host. Returns false when no callback
    /// is installed.
    pub(crate) fn deliver_host(&self, message: &Value) -> bool {
        let mut host = self.host.lock().expect("Host callback lock poisoned");

        match host.as_mut() {
            Some(callback) => {
                callback(message);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn exists(&self, pid: Pid) -> bool {
        self.lock_core().index_of(pid).is_some()
    }

    /// Snapshot of all live processes.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.lock_core().snapshot()
    }

    /// Requests an orderly stop: the scheduler loop exits after its current
    /// iteration and workers drain at their next condvar check.
    pub fn shutdown(&self) {
        {
            let mut core = self.lock_core();
            if core.quit {
                return;
            }
            core.quit = true;
        }

        logging::debug!(self.log, "runtime shutdown requested");
        self.runnable.notify_all();
        self.wake_loop();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock_core().quit
    }
}

/// Clips a process name to the length limit on a character boundary.
fn truncate_name(name: &str) -> &str {
    let mut cut = name.len().min(MAX_NAME_LEN);
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    &name[..cut]
}

/// The in-process API surface handed to a body for the duration of one step.
/// All host primitives - spawn, send, timers, sockets, introspection - go
/// through here.
pub struct Ctx<'a> {
    rt: &'a Runtime,
    pid: Pid,
    idx: usize,
    reader: &'a mut Reader,
    timer_fired: bool,
}

impl<'a> Ctx<'a> {
    pub(crate) fn new(rt: &'a Runtime, pid: Pid, idx: usize, reader: &'a mut Reader, timer_fired: bool) -> Ctx<'a> {
        Ctx {
            rt,
            pid,
            idx,
            reader,
            timer_fired,
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent_pid(&self) -> Option<Pid> {
        self.rt.lock_core().slots[self.idx].parent
    }

    /// True once per fired timer: the scheduler loop made this process
    /// runnable because its deadline passed.
    pub fn take_timeout(&mut self) -> bool {
        let fired = self.timer_fired;
        self.timer_fired = false;
        fired
    }

    /// Spawns a child of this process. The child runs after the current
    /// step completes.
    pub fn spawn(&self, name: &str, body: Box<dyn Body>, args: Value) -> Result<Pid, SpawnError> {
        self.rt.spawn(Some(self.pid), name, body, args)
    }

    /// Sends a message; see [`Runtime::send_message`].
    pub fn send(&self, pid: Pid, message: &Value) -> bool {
        self.rt.send_message(pid, message)
    }

    /// Drains this process's mailbox through its decoder and yields the next
    /// complete message, if any.
    pub fn recv(&mut self) -> Option<Value> {
        let mailbox = self.rt.lock_core().slots[self.idx].mailbox.clone();
        let mailbox = mailbox?;

        let mut chunk = [0u8; 512];
        loop {
            let count = mailbox.drain(&mut chunk);
            if count == 0 {
                break;
            }
            self.reader.push(&chunk[..count]);
        }

        match self.reader.next() {
            Ok(value) => value,
            Err(err) => {
                // Local senders only deliver printed values, so this is a
                // bug or a corrupted writer; drop the buffered bytes.
                logging::warn!(self.rt.log, "discarding undecodable mailbox bytes";
                               "pid" => self.pid,
                               "error" => %err);
                self.reader.clear();
                None
            }
        }
    }

    /// Arms the process timer `delay` from now; `None` clears it.
    pub fn set_timeout(&self, delay: Option<Duration>) {
        let deadline = delay.map(|delay| Instant::now() + delay);
        self.rt.set_process_timeout(self.pid, deadline);
    }

    /// Remaining time until the armed deadline, if any.
    pub fn get_timeout(&self) -> Option<Duration> {
        let core = self.rt.lock_core();
        let now = Instant::now();

        core.slots[self.idx]
            .wake_at
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn set_name(&self, name: &str) {
        let mut core = self.rt.lock_core();
        let slot = &mut core.slots[self.idx];

        slot.name.clear();
        slot.name.push_str(truncate_name(name));
    }

    /// Registers an fd owned by this process's body on the central selector.
    pub fn set_socket(&self, fd: RawFd) -> io::Result<()> {
        self.rt.set_process_socket(self.pid, fd)
    }

    #[inline]
    pub fn exists(&self, pid: Pid) -> bool {
        self.rt.exists(pid)
    }

    #[inline]
    pub fn processes(&self) -> Vec<ProcessInfo> {
        self.rt.processes()
    }

    #[inline]
    pub fn privileged(&self) -> bool {
        self.rt.lock_core().slots[self.idx].privileged
    }

    pub fn set_logging_level(&self, level: u8) {
        self.rt.lock_core().slots[self.idx].logging_level = level;
    }

    pub fn logging_level(&self) -> u8 {
        self.rt.lock_core().slots[self.idx].logging_level
    }

    /// Per-process diagnostic output, gated by the process logging level.
    pub fn verbose(&self, text: &str) {
        if self.logging_level() >= 1 {
            logging::info!(self.rt.log, "{}", text; "pid" => self.pid);
        }
    }

    pub fn vverbose(&self, text: &str) {
        if self.logging_level() >= 2 {
            logging::debug!(self.rt.log, "{}", text; "pid" => self.pid);
        }
    }

    /// Stops the whole runtime. Restricted to privileged processes; returns
    /// false otherwise.
    pub fn shutdown(&self) -> bool {
        if !self.privileged() {
            return false;
        }

        self.rt.shutdown();
        true
    }
}
