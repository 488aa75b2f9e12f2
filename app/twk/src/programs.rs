use crate::opts;
use glint::logging::{self, Logger};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use photon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:9001";

type ProgramFactory = fn(&Logger) -> Box<dyn Handler>;

lazy_static! {
    static ref PROGRAMS: HashMap<&'static str, ProgramFactory> = {
        let mut programs: HashMap<&'static str, ProgramFactory> = HashMap::new();
        programs.insert("ping", |log| Box::new(PingProgram::new(log)));
        programs.insert("echo", |log| Box::new(EchoProgram::new(log)));
        programs
    };
}

/// Instantiates a named program's handler.
pub fn create(name: &str, log: &Logger) -> Option<Box<dyn Handler>> {
    PROGRAMS.get(name).map(|factory| factory(log))
}

pub fn names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = PROGRAMS.keys().copied().collect();
    names.sort_unstable();
    names
}

/// The stock server program: answers `ping` requests locally and serves the
/// built-in peer protocols on a listener child.
///
/// Options: `--address <ip:port>` (default 127.0.0.1:9001), `--keypair
/// <file>` (fresh identity when absent).
pub struct PingProgram {
    log: Logger,
}

impl PingProgram {
    pub fn new(log: &Logger) -> PingProgram {
        PingProgram { log: log.new(logging::o!()) }
    }
}

impl Handler for PingProgram {
    fn on_init(&mut self, ex: &mut Exchange, args: &Value) {
        let address =
            opts::lookup_str(args, "address").unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string());

        let key = match opts::lookup_str(args, "keypair") {
            Some(path) => match LongTermKey::load(&path) {
                Ok(key) => key,
                Err(err) => {
                    logging::error!(self.log, "cannot load keypair"; "error" => %err);
                    ex.ctx.shutdown();
                    return;
                }
            },
            None => LongTermKey::generate(),
        };

        logging::info!(self.log, "server identity"; "identity" => key.identity());

        let listener = match Listener::bind(
            &address,
            Arc::new(key),
            Arc::new(builtin_registry()),
            Duration::from_secs(60),
            Some(&self.log),
        ) {
            Ok(listener) => listener,
            Err(err) => {
                logging::error!(self.log, "cannot bind listener";
                                "address" => %address,
                                "error" => ?err);
                ex.ctx.shutdown();
                return;
            }
        };

        if let Err(err) = ex.ctx.spawn("listener", Box::new(listener), Value::nil()) {
            logging::error!(self.log, "cannot spawn listener"; "error" => %err);
            ex.ctx.shutdown();
        }
    }

    fn dispatch(&mut self, ex: &mut Exchange, method: &str, _args: &[Value]) -> Option<Value> {
        match method {
            "ping" => Some(value::message(
                "pong",
                vec![Value::int(glint::time::timestamp_millis() as i64)],
            )),
            "status" => Some(value::message(
                "status",
                vec![Value::int(ex.ctx.processes().len() as i64)],
            )),
            _ => None,
        }
    }

    fn on_quit(&mut self, ex: &mut Exchange) {
        ex.ctx.shutdown();
    }
}

/// Echoes any method call back as a list; the smallest useful `exec` target.
pub struct EchoProgram {
    log: Logger,
}

impl EchoProgram {
    pub fn new(log: &Logger) -> EchoProgram {
        EchoProgram { log: log.new(logging::o!()) }
    }
}

impl Handler for EchoProgram {
    fn dispatch(&mut self, _ex: &mut Exchange, method: &str, args: &[Value]) -> Option<Value> {
        logging::debug!(self.log, "echoing"; "method" => method);
        Some(value::message(method, args.to_vec()))
    }

    fn on_quit(&mut self, ex: &mut Exchange) {
        ex.ctx.shutdown();
    }
}

/// Client half of the `ping` protocol used by `twk test ping`: counts a
/// fixed number of exchanges, says `(bye)` and stops its runtime.
pub struct PingClient {
    remaining: u32,
    done: mpsc::Sender<()>,
}

impl PingClient {
    pub fn new(exchanges: u32, done: mpsc::Sender<()>) -> PingClient {
        PingClient {
            remaining: exchanges,
            done,
        }
    }

    fn ping() -> Value {
        value::message("ping", vec![Value::int(glint::time::timestamp_millis() as i64)])
    }
}

impl Protocol for PingClient {
    fn on_open(&mut self, wire: &mut Wire, _ctx: &mut Ctx) {
        wire.send(&Self::ping());
    }

    fn on_message(&mut self, wire: &mut Wire, ctx: &mut Ctx, msg: &Value) -> NetworkResult<()> {
        if msg.head() == Some("pong") {
            self.remaining -= 1;

            if self.remaining == 0 {
                let _ = self.done.send(());
                wire.bye("done");
                ctx.shutdown();
            } else {
                wire.send(&Self::ping());
            }
        }

        Ok(())
    }

    fn on_close(&mut self, ctx: &mut Ctx) {
        ctx.shutdown();
    }
}

/// Protocol handler behind `twk rexec`: sends one method call after
/// negotiation, prints the first reply and ends the session.
pub struct RexecClient {
    request: Value,
    done: Arc<AtomicBool>,
}

impl RexecClient {
    pub fn new(request: Value, done: Arc<AtomicBool>) -> RexecClient {
        RexecClient { request, done }
    }
}

impl Protocol for RexecClient {
    fn on_open(&mut self, wire: &mut Wire, _ctx: &mut Ctx) {
        wire.send(&self.request);
    }

    fn on_message(&mut self, wire: &mut Wire, ctx: &mut Ctx, msg: &Value) -> NetworkResult<()> {
        println!("{}", msg);
        self.done.store(true, Ordering::SeqCst);

        wire.bye("done");
        ctx.shutdown();
        Ok(())
    }

    fn on_close(&mut self, ctx: &mut Ctx) {
        ctx.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_programs() {
        let log = logging::discard();

        assert!(create("ping", &log).is_some());
        assert!(create("echo", &log).is_some());
        assert!(create("warp", &log).is_none());
        assert_eq!(names(), vec!["echo", "ping"]);
    }
}
