use crate::net::link::Link;
use crate::net::support::{NetworkError, NetworkResult};
use crate::runtime::Ctx;
use crate::value::{self, Value};
use glint::time::timestamp_millis;
use indexmap::IndexMap;

/// The sending half handed to protocol handlers; a thin veneer over the
/// link that keeps cipher and buffer state out of reach.
pub struct Wire<'w> {
    pub(crate) link: &'w mut Link,
}

impl<'w> Wire<'w> {
    /// Queues a message for the remote side. False means the write buffer
    /// is full and the message was dropped, mirroring mailbox overflow.
    pub fn send(&mut self, message: &Value) -> bool {
        match self.link.send(message) {
            Ok(()) => true,
            Err(NetworkError::Wait) => false,
            Err(_) => false,
        }
    }

    /// The authenticated identity of the remote side.
    #[inline]
    pub fn peer_identity(&self) -> Option<String> {
        self.link.peer_identity()
    }

    /// Ends the session with `(bye <reason>)`.
    #[inline]
    pub fn bye(&mut self, reason: &str) {
        self.link.bye(reason);
    }
}

/// A protocol handler drives the exchange stage of one peer session.
/// Handlers run inside the peer process; they may talk to the wire, to
/// local processes through the step context, or both.
pub trait Protocol: Send {
    /// Called once when negotiation completes.
    fn on_open(&mut self, _wire: &mut Wire, _ctx: &mut Ctx) {}

    /// Handles one decoded message. Returning a fatal error closes the
    /// session with `(bye ...)` where the error class warrants it.
    fn on_message(&mut self, wire: &mut Wire, ctx: &mut Ctx, message: &Value) -> NetworkResult<()>;

    /// The session is going away (error, EOF or timeout).
    fn on_close(&mut self, _ctx: &mut Ctx) {}
}

pub type ProtocolFactory = Box<dyn Fn() -> Box<dyn Protocol> + Send + Sync>;

/// Named protocol handlers available to inbound sessions. Registration
/// order is preserved for predictable listings.
pub struct ProtocolRegistry {
    handlers: IndexMap<String, ProtocolFactory>,
}

impl ProtocolRegistry {
    #[inline]
    pub fn new() -> ProtocolRegistry {
        ProtocolRegistry {
            handlers: IndexMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, factory: ProtocolFactory) {
        self.handlers.insert(name.to_string(), factory);
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Instantiates a fresh handler for the named protocol.
    pub fn create(&self, name: &str) -> Option<Box<dyn Protocol>> {
        self.handlers.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

/// Server half of the built-in `ping` protocol: answers `(ping t0)` with
/// `(pong t0 t1)`.
pub struct PingServer;

impl Protocol for PingServer {
    fn on_message(&mut self, wire: &mut Wire, _ctx: &mut Ctx, message: &Value) -> NetworkResult<()> {
        if let Some("ping") = message.head() {
            let t0 = message.nth(1).cloned().unwrap_or_else(Value::nil);
            let reply = value::message("pong", vec![t0, Value::int(timestamp_millis() as i64)]);
            wire.send(&reply);
        }

        Ok(())
    }
}

/// The registry every stock listener starts from.
pub fn builtin_registry() -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();
    registry.register("ping", Box::new(|| Box::new(PingServer)));
    registry
}
