use crate::process::{Body, Pid, State, Step, Table, HOST_PID};
use crate::runtime::{Ctx, Runtime};
use crate::value::{self, Value};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// How long an unanswered request entry survives.
pub const REQUEST_RETENTION: Duration = Duration::from_secs(10);

impl Runtime {
    /// Serializes a message into the destination mailbox. A `Waiting`
    /// receiver is `Runnable` before this returns. `HOST_PID` hands the
    /// message to the embedding host instead. Returns false when the mailbox
    /// lacks room or the pid does not resolve; nothing is written in either
    /// case.
    pub fn send_message(&self, pid: Pid, message: &Value) -> bool {
        if pid == HOST_PID {
            return self.deliver_host(message);
        }

        let mut core = self.lock_core();
        let (posted, woke) = post_locked(&mut core, pid, message);
        drop(core);

        if woke {
            self.runnable.notify_all();
        }

        posted
    }
}

/// Appends a message to a process mailbox with the table lock already held,
/// promoting a `Waiting` owner. Returns `(posted, needs_worker_signal)`.
pub(crate) fn post_locked(core: &mut Table, pid: Pid, message: &Value) -> (bool, bool) {
    let slot = match core.slot_of(pid) {
        Some(slot) => slot,
        None => return (false, false),
    };

    let mailbox = match slot.mailbox.as_ref() {
        Some(mailbox) => mailbox.clone(),
        None => return (false, false),
    };

    let mut tx = mailbox.begin_append();
    let _ = write!(tx, "{}", message);
    if !tx.commit() {
        return (false, false);
    }

    if slot.state == State::Waiting {
        slot.state = State::Runnable;
        return (true, true);
    }

    (true, false)
}

/// Callback invoked when a matching `did-request` arrives.
pub type RequestCallback = Box<dyn FnMut(&mut Ctx, &Value) + Send>;

struct PendingRequest {
    id: i64,
    issued_at: Instant,
    callback: RequestCallback,
}

/// Correlates outgoing requests with their future `did-request` replies.
/// Entries older than the retention window are pruned at every insertion and
/// never fire, even if a stale reply shows up later.
pub struct RequestQueue {
    entries: Vec<PendingRequest>,
    retention: Duration,
}

impl RequestQueue {
    #[inline]
    pub fn new() -> RequestQueue {
        RequestQueue::with_retention(REQUEST_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> RequestQueue {
        RequestQueue {
            entries: Vec::new(),
            retention,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Allocates a fresh random id, posts `(request <self> <id> <payload>)`
    /// to the target and records the callback. Returns false (recording
    /// nothing) when the post fails.
    pub fn send_request(
        &mut self,
        ctx: &mut Ctx,
        target: Pid,
        payload: Value,
        callback: RequestCallback,
    ) -> bool {
        let now = Instant::now();
        self.prune(now);

        let id = rand::random::<i64>();
        let message = value::message(
            "request",
            vec![Value::int(ctx.pid()), Value::int(id), payload],
        );

        if !ctx.send(target, &message) {
            return false;
        }

        self.entries.push(PendingRequest {
            id,
            issued_at: now,
            callback,
        });

        true
    }

    /// Locates the entry for `id` and fires its callback. Expired entries
    /// are dropped silently even when they are still in the list.
    pub fn resolve(&mut self, ctx: &mut Ctx, id: i64, response: &Value) -> bool {
        let position = match self.entries.iter().position(|entry| entry.id == id) {
            Some(position) => position,
            None => return false,
        };

        let mut entry = self.entries.remove(position);

        if entry.issued_at.elapsed() >= self.retention {
            return false;
        }

        (entry.callback)(ctx, response);
        true
    }

    fn prune(&mut self, now: Instant) {
        let retention = self.retention;
        self.entries
            .retain(|entry| now.duration_since(entry.issued_at) < retention);
    }

    #[cfg(test)]
    fn push_aged(&mut self, id: i64, age: Duration, callback: RequestCallback) {
        self.entries.push(PendingRequest {
            id,
            issued_at: Instant::now() - age,
            callback,
        });
    }
}

/// A message handler: a first-class object whose named methods receive
/// messages by leading symbol. The dispatcher recognizes `request`,
/// `did-request`, `quit` and `timeout` itself.
pub trait Handler: Send {
    /// Handles `(method args...)`. For requests, the returned value becomes
    /// the response payload.
    fn dispatch(&mut self, ex: &mut Exchange, method: &str, args: &[Value]) -> Option<Value>;

    /// Receives the spawn arglist, the first message every process gets.
    fn on_init(&mut self, _ex: &mut Exchange, _args: &Value) {}

    /// The process received `(quit)` and will exit after this returns.
    fn on_quit(&mut self, _ex: &mut Exchange) {}

    /// The process timer fired, or `(timeout)` arrived by mail.
    fn on_timeout(&mut self, _ex: &mut Exchange) {}
}

impl Handler for Box<dyn Handler> {
    fn dispatch(&mut self, ex: &mut Exchange, method: &str, args: &[Value]) -> Option<Value> {
        (**self).dispatch(ex, method, args)
    }

    fn on_init(&mut self, ex: &mut Exchange, args: &Value) {
        (**self).on_init(ex, args)
    }

    fn on_quit(&mut self, ex: &mut Exchange) {
        (**self).on_quit(ex)
    }

    fn on_timeout(&mut self, ex: &mut Exchange) {
        (**self).on_timeout(ex)
    }
}

/// What a handler gets to work with: the step context plus the process's
/// request queue.
pub struct Exchange<'e, 'a> {
    pub ctx: &'e mut Ctx<'a>,
    pub requests: &'e mut RequestQueue,
}

impl<'e, 'a> Exchange<'e, 'a> {
    #[inline]
    pub fn pid(&self) -> Pid {
        self.ctx.pid()
    }

    #[inline]
    pub fn send(&self, pid: Pid, message: &Value) -> bool {
        self.ctx.send(pid, message)
    }

    #[inline]
    pub fn send_request(&mut self, target: Pid, payload: Value, callback: RequestCallback) -> bool {
        self.requests.send_request(&mut *self.ctx, target, payload, callback)
    }
}

/// The standard process body: drains the mailbox, decodes messages and
/// dispatches them into a [`Handler`].
pub struct Dispatcher<H: Handler> {
    handler: H,
    requests: RequestQueue,
    started: bool,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: H) -> Dispatcher<H> {
        Dispatcher {
            handler,
            requests: RequestQueue::new(),
            started: false,
        }
    }

    fn handle_request(&mut self, ctx: &mut Ctx, msg: &Value) {
        let from = msg.nth(1).and_then(Value::as_int);
        let id = msg.nth(2).and_then(Value::as_int);

        let (from, id) = match (from, id) {
            (Some(from), Some(id)) => (from, id),
            _ => return,
        };

        let reply = match msg.nth(3) {
            Some(payload) => match payload.head() {
                Some(method) => {
                    let method = method.to_string();
                    let args = payload.tail().to_vec();
                    let mut ex = Exchange {
                        ctx: &mut *ctx,
                        requests: &mut self.requests,
                    };
                    self.handler.dispatch(&mut ex, &method, &args)
                }
                None => None,
            },
            None => None,
        };

        // Every request is answered; a handler with nothing to say produces
        // a structured error rather than silence.
        let reply = reply.unwrap_or_else(|| value::message("error", vec![Value::sym("unhandled")]));
        let response = value::message("did-request", vec![Value::int(id), reply]);
        ctx.send(from, &response);
    }
}

impl<H: Handler> Body for Dispatcher<H> {
    fn step(&mut self, ctx: &mut Ctx) -> Step {
        if ctx.take_timeout() {
            let mut ex = Exchange {
                ctx: &mut *ctx,
                requests: &mut self.requests,
            };
            self.handler.on_timeout(&mut ex);
        }

        while let Some(msg) = ctx.recv() {
            if !self.started {
                self.started = true;
                let mut ex = Exchange {
                    ctx: &mut *ctx,
                    requests: &mut self.requests,
                };
                self.handler.on_init(&mut ex, &msg);
                continue;
            }

            match msg.head() {
                Some("quit") => {
                    let mut ex = Exchange {
                        ctx: &mut *ctx,
                        requests: &mut self.requests,
                    };
                    self.handler.on_quit(&mut ex);
                    return Step::Exit;
                }
                Some("timeout") => {
                    let mut ex = Exchange {
                        ctx: &mut *ctx,
                        requests: &mut self.requests,
                    };
                    self.handler.on_timeout(&mut ex);
                }
                Some("request") => self.handle_request(ctx, &msg),
                Some("did-request") => {
                    if let Some(id) = msg.nth(1).and_then(Value::as_int) {
                        let response = msg.nth(2).cloned().unwrap_or_else(Value::nil);
                        self.requests.resolve(ctx, id, &response);
                    }
                }
                Some(method) => {
                    let method = method.to_string();
                    let args = msg.tail().to_vec();
                    let mut ex = Exchange {
                        ctx: &mut *ctx,
                        requests: &mut self.requests,
                    };
                    let _ = self.handler.dispatch(&mut ex, &method, &args);
                }
                None => ctx.vverbose("ignoring message without a dispatch symbol"),
            }
        }

        Step::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::value::Reader;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Inert;

    impl Body for Inert {
        fn step(&mut self, _ctx: &mut Ctx) -> Step {
            Step::Idle
        }
    }

    fn test_runtime() -> Arc<Runtime> {
        let mut config = Config::default();
        config.max_process = 8;
        Runtime::new(config, None).unwrap()
    }

    #[test]
    fn test_send_message_posts_and_wakes() {
        let rt = test_runtime();
        let pid = rt.spawn(None, "sink", Box::new(Inert), Value::nil()).unwrap();

        // Park the process as Waiting so the post has something to wake.
        {
            let mut core = rt.lock_core();
            core.slot_of(pid).unwrap().state = State::Waiting;
        }

        assert!(rt.send_message(pid, &value::message("hello", vec![])));

        let mut core = rt.lock_core();
        assert_eq!(core.slot_of(pid).unwrap().state, State::Runnable);
    }

    #[test]
    fn test_send_message_unknown_pid() {
        let rt = test_runtime();
        assert!(!rt.send_message(4096 + 7, &Value::nil()));
    }

    #[test]
    fn test_send_message_host_without_callback() {
        let rt = test_runtime();
        assert!(!rt.send_message(HOST_PID, &Value::nil()));
    }

    #[test]
    fn test_send_message_host_callback() {
        let rt = test_runtime();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();

        rt.set_host_callback(Box::new(move |_msg| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(rt.send_message(HOST_PID, &value::message("ping", vec![])));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_queue_prunes_stale_entries_on_insert() {
        let rt = test_runtime();
        let pid = rt.spawn(None, "a", Box::new(Inert), Value::nil()).unwrap();
        let target = rt.spawn(None, "b", Box::new(Inert), Value::nil()).unwrap();

        let idx = rt.lock_core().index_of(pid).unwrap();
        let mut reader = Reader::new();
        let mut ctx = Ctx::new(&rt, pid, idx, &mut reader, false);

        let mut queue = RequestQueue::with_retention(Duration::from_millis(50));
        queue.push_aged(7, Duration::from_millis(200), Box::new(|_, _| {}));
        assert_eq!(queue.len(), 1);

        assert!(queue.send_request(&mut ctx, target, Value::nil(), Box::new(|_, _| {})));

        // The stale entry went away; only the fresh one remains.
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_request_queue_resolve_invokes_once() {
        let rt = test_runtime();
        let pid = rt.spawn(None, "a", Box::new(Inert), Value::nil()).unwrap();

        let idx = rt.lock_core().index_of(pid).unwrap();
        let mut reader = Reader::new();
        let mut ctx = Ctx::new(&rt, pid, idx, &mut reader, false);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();

        let mut queue = RequestQueue::new();
        queue.push_aged(
            42,
            Duration::from_millis(0),
            Box::new(move |_, _| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(queue.resolve(&mut ctx, 42, &Value::nil()));
        assert!(!queue.resolve(&mut ctx, 42, &Value::nil()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_request_queue_expired_entry_never_fires() {
        let rt = test_runtime();
        let pid = rt.spawn(None, "a", Box::new(Inert), Value::nil()).unwrap();

        let idx = rt.lock_core().index_of(pid).unwrap();
        let mut reader = Reader::new();
        let mut ctx = Ctx::new(&rt, pid, idx, &mut reader, false);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = fired.clone();

        let mut queue = RequestQueue::with_retention(Duration::from_millis(10));
        queue.push_aged(
            9,
            Duration::from_millis(100),
            Box::new(move |_, _| {
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(!queue.resolve(&mut ctx, 9, &Value::nil()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
