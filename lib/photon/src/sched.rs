use crate::process::{State, Step, Table};
use crate::router::post_locked;
use crate::runtime::{Ctx, Runtime};
use crate::value::{self, Value};
use glint::logging;
use mio::unix::EventedFd;
use std::any::Any;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Upper bound on one selector wait. A `wake_at` recorded while the loop is
/// blocked is honored within this bound even if the wakeup signal is lost.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

impl Runtime {
    /// Starts the worker pool and the scheduler loop, then blocks until
    /// [`shutdown`](Runtime::shutdown) drains them.
    pub fn run(self: &Arc<Runtime>) {
        let mut workers = Vec::new();

        for index in 0..self.config().worker_threads() {
            let rt = self.clone();
            let handle = thread::Builder::new()
                .name(format!("photon-worker-{}", index))
                .spawn(move || worker_loop(&rt, index))
                .expect("Failed spawning worker thread");
            workers.push(handle);
        }

        let rt = self.clone();
        let selector = thread::Builder::new()
            .name("photon-sched".to_string())
            .spawn(move || scheduler_loop(&rt))
            .expect("Failed spawning scheduler thread");

        for worker in workers {
            let _ = worker.join();
        }
        let _ = selector.join();

        logging::debug!(self.log, "runtime stopped");
    }
}

/// Worker thread: picks runnable processes off the table, advances them one
/// step and parks them according to what the step asked for.
pub(crate) fn worker_loop(rt: &Arc<Runtime>, index: usize) {
    logging::trace!(rt.log, "worker started"; "worker" => index);

    let mut core = rt.lock_core();

    loop {
        if core.quit {
            break;
        }

        let idx = match core.next_runnable() {
            Some(idx) => idx,
            None => {
                core = rt
                    .runnable
                    .wait(core)
                    .expect("Process table lock poisoned");
                continue;
            }
        };

        core.slots[idx].state = State::Running;
        let pid = core.slots[idx].pid;
        let timer_fired = mem::replace(&mut core.slots[idx].timer_fired, false);
        core.slots[idx].mail_seen = core.slots[idx]
            .mailbox
            .as_ref()
            .map_or(0, |mbox| mbox.total_written());
        let mut body = core.slots[idx]
            .body
            .take()
            .expect("Runnable process has no body");
        let mut reader = mem::take(&mut core.slots[idx].reader);
        drop(core);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut ctx = Ctx::new(rt, pid, idx, &mut reader, timer_fired);
            body.step(&mut ctx)
        }));

        core = rt.lock_core();

        let (step, fault) = match outcome {
            Ok(step) => (step, None),
            Err(payload) => (Step::Exit, Some(panic_message(payload))),
        };

        // A fault is reported to the parent as a message; the child then
        // proceeds exactly as if it had exited.
        if let Some(error) = &fault {
            logging::error!(rt.log, "process fault";
                            "worker" => index,
                            "pid" => pid,
                            "error" => error.as_str());

            if let Some(ppid) = core.slots[idx].parent {
                let abort = value::message(
                    "on-child-abort",
                    vec![Value::int(pid), Value::str(error)],
                );
                let (_, woke) = post_locked(&mut core, ppid, &abort);
                if woke {
                    rt.runnable.notify_all();
                }
            }
        }

        // Freshly spawned children become runnable, newest first.
        let children = core.slots[idx].children.clone();
        let mut promoted = false;
        for cpid in children {
            if let Some(slot) = core.slot_of(cpid) {
                if slot.state == State::Created {
                    slot.state = State::Runnable;
                    promoted = true;
                }
            }
        }

        let slot = &mut core.slots[idx];
        slot.body = Some(body);
        slot.reader = reader;

        let has_children = !slot.children.is_empty();
        slot.state = match step {
            Step::Idle => State::Waiting,
            Step::Wait => {
                if has_children {
                    State::Pending
                } else {
                    State::Waiting
                }
            }
            Step::Exit => {
                if has_children {
                    State::Done
                } else {
                    State::Shutdown
                }
            }
        };

        // Mail that arrived during the step would otherwise sit until the
        // next table scan.
        if slot.state == State::Waiting {
            let arrived = slot
                .mailbox
                .as_ref()
                .map_or(false, |mbox| mbox.total_written() > slot.mail_seen);
            if arrived {
                slot.state = State::Runnable;
                promoted = true;
            }
        }

        let wake_selector =
            slot.fd.is_some() || slot.wake_at.is_some() || slot.state == State::Shutdown;

        if promoted {
            rt.runnable.notify_all();
        }
        if wake_selector {
            rt.wake_loop();
        }
    }

    logging::trace!(rt.log, "worker stopped"; "worker" => index);
}

/// The scheduler loop: reclaims dead slots, wakes timed-out and mailed
/// processes, and blocks in the central selector over all process fds.
pub(crate) fn scheduler_loop(rt: &Arc<Runtime>) {
    let mut events = mio::Events::with_capacity(256);

    loop {
        let mut timeout = MAX_POLL_INTERVAL;

        {
            let mut core = rt.lock_core();

            if core.quit {
                break;
            }

            // Reclaim until the cascade settles; a parent may reach
            // Shutdown only because its last child was just torn down.
            while reclaim_pass(rt, &mut core) > 0 {}

            let now = Instant::now();
            let mut woke = false;

            for idx in 0..core.slots.len() {
                let slot = &mut core.slots[idx];

                if slot.state != State::Waiting {
                    continue;
                }

                let arrived = slot
                    .mailbox
                    .as_ref()
                    .map_or(false, |mbox| mbox.total_written() > slot.mail_seen);

                if arrived {
                    slot.state = State::Runnable;
                    woke = true;
                } else if let Some(at) = slot.wake_at {
                    if at <= now {
                        slot.wake_at = None;
                        slot.timer_fired = true;
                        slot.state = State::Runnable;
                        woke = true;
                    } else {
                        timeout = timeout.min(at.duration_since(now));
                    }
                }
            }

            if woke {
                rt.runnable.notify_all();
            }
        }

        match rt.poll.poll(&mut events, Some(timeout)) {
            Ok(_) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => panic!("Scheduler poll failed: {:?}", err),
        }

        let mut woke = false;
        {
            let mut core = rt.lock_core();

            for event in &events {
                let token = event.token();

                if token == rt.wake_token() {
                    rt.drain_wake();
                    continue;
                }

                let idx = token.0;
                if idx < core.slots.len() && core.slots[idx].state == State::Waiting {
                    core.slots[idx].state = State::Runnable;
                    woke = true;
                }
            }
        }

        if woke {
            rt.runnable.notify_all();
        }
    }

    // Quitting: release the workers parked on the condvar.
    rt.runnable.notify_all();
    logging::trace!(rt.log, "scheduler loop stopped");
}

/// Tears down every `Shutdown` slot once. Returns the number reclaimed so
/// the caller can drive parent cascades to quiescence.
fn reclaim_pass(rt: &Arc<Runtime>, core: &mut Table) -> usize {
    let mut reclaimed = 0;

    for idx in 0..core.slots.len() {
        if core.slots[idx].state != State::Shutdown {
            continue;
        }

        let pid = core.slots[idx].pid;
        let parent = core.slots[idx].parent;

        // The body owns its I/O objects; dropping it closes them. Only the
        // selector registration has to go first.
        if let Some(fd) = core.slots[idx].fd.take() {
            let _ = rt.poll.deregister(&EventedFd(&fd));
        }

        core.slots[idx].release();
        reclaimed += 1;

        logging::debug!(rt.log, "process reclaimed"; "pid" => pid);

        // Unlink from the parent and cascade when this was the last child.
        if let Some(ppid) = parent {
            if let Some(pslot) = core.slot_of(ppid) {
                pslot.children.retain(|&child| child != pid);

                if pslot.children.is_empty() {
                    match pslot.state {
                        State::Done => pslot.state = State::Shutdown,
                        State::Pending => {
                            pslot.state = State::Waiting;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    reclaimed
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "process panicked".to_string()
    }
}
