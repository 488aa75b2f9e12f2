use crate::net::identity::{identity_of, LongTermKey};
use crate::net::link::{Link, Role, REPLAY_WINDOW_SECS};
use crate::net::proto::{Protocol, ProtocolRegistry, Wire};
use crate::net::sock;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::process::{Body, Step};
use crate::runtime::Ctx;
use crate::value::{self, Value};
use glint::encoding;
use glint::logging::{self, Logger};
use glint::time::timestamp_secs;
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maps a fatal error to the `(bye ...)` reason it deserves, or to a silent
/// close. Authentication failures and timeouts say nothing; decode and
/// protocol errors explain themselves.
fn bye_reason(kind: &ErrorType) -> Option<&'static str> {
    match kind {
        ErrorType::Syntax(_) => Some("malformed-message"),
        ErrorType::ProtocolViolation => Some("protocol-violation"),
        ErrorType::Overrun => Some("overrun"),
        _ => None,
    }
}

/// The outbound half of a secure session: connects, verifies the server's
/// identity, presents credentials for the requested protocol and then runs
/// the handler. The process mailbox carries outbound traffic: messages sent
/// to this pid go out on the wire once the exchange is open.
pub struct Peer {
    link: Link,
    protocol: String,
    server_identity: String,
    handler: Box<dyn Protocol>,
    pending: Vec<Value>,
    use_sent: bool,
    negotiated: bool,
    registered: bool,
}

impl Peer {
    /// Starts a non-blocking connect toward `address` (`<ip>:<port>`),
    /// expecting the responder to hold the long-term key behind
    /// `server_identity`.
    pub fn connect<'a, L: Into<Option<&'a Logger>>>(
        address: &str,
        server_identity: &str,
        key: Arc<LongTermKey>,
        protocol: &str,
        handler: Box<dyn Protocol>,
        idle_timeout: Duration,
        log: L,
    ) -> NetworkResult<Peer> {
        let log = logging::branch(log);
        let stream = sock::connect_tcp(address)?;

        Ok(Peer {
            link: Link::new(stream, Role::Client, key, idle_timeout, Some(&log)),
            protocol: protocol.to_string(),
            server_identity: server_identity.to_string(),
            handler,
            pending: Vec::new(),
            use_sent: false,
            negotiated: false,
            registered: false,
        })
    }

    fn drive(&mut self, ctx: &mut Ctx, now: Instant) -> NetworkResult<()> {
        self.link.pump(now)?;

        // Secured but not yet introduced: check the responder really is who
        // we were told to dial, then present our credentials.
        if self.link.secured() && !self.use_sent {
            let server_static = *self.link.peer_static().expect("secured link has a peer key");

            if identity_of(&server_static) != self.server_identity {
                return Err(NetworkError::Fatal(ErrorType::IdentityMismatch));
            }

            let proof = self
                .link
                .local_key()
                .agree(&server_static)
                .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

            let hello = value::message(
                "use",
                vec![
                    Value::sym(&self.protocol),
                    Value::Str(self.link.local_key().identity()),
                    Value::Str(encoding::to_hex(&self.link.local_key().public_bytes())),
                    Value::Str(encoding::to_hex(&proof)),
                    Value::int(timestamp_secs() as i64),
                ],
            );

            self.link.send(&hello)?;
            self.use_sent = true;
        }

        while let Some(msg) = self.link.next_message()? {
            if !self.negotiated {
                let accepted = msg.head() == Some("use")
                    && msg.nth(1).and_then(Value::as_symbol) == Some(self.protocol.as_str());

                if !accepted {
                    return Err(NetworkError::Fatal(ErrorType::ProtocolViolation));
                }

                self.negotiated = true;
                self.link.begin_exchange(now);

                let mut wire = Wire { link: &mut self.link };
                self.handler.on_open(&mut wire, ctx);
                continue;
            }

            match msg.head() {
                Some("keep-alive") => continue,
                Some("bye") => return Err(NetworkError::Fatal(ErrorType::ByeReceived)),
                _ => {
                    let mut wire = Wire { link: &mut self.link };
                    self.handler.on_message(&mut wire, ctx, &msg)?;
                }
            }
        }

        if self.negotiated {
            for queued in self.pending.drain(..) {
                let _ = self.link.send(&queued);
            }
        }

        self.link.flush(now)?;
        Ok(())
    }

    fn finish(&mut self, ctx: &mut Ctx, kind: &ErrorType) {
        self.handler.on_close(ctx);

        match bye_reason(kind) {
            Some(reason) => self.link.bye(reason),
            None => self.link.close(),
        }
    }
}

impl Body for Peer {
    fn step(&mut self, ctx: &mut Ctx) -> Step {
        if !self.registered {
            self.registered = true;
            // The spawn arglist is not wire traffic.
            let _ = ctx.recv();
            if ctx.set_socket(self.link.raw_fd()).is_err() {
                self.link.close();
                return Step::Exit;
            }
        }

        while let Some(msg) = ctx.recv() {
            match msg.head() {
                Some("quit") => {
                    self.handler.on_close(ctx);
                    self.link.bye("quit");
                    return Step::Exit;
                }
                _ => self.pending.push(msg),
            }
        }

        let now = Instant::now();
        match self.drive(ctx, now) {
            Ok(()) | Err(NetworkError::Wait) => {
                ctx.set_timeout(Some(self.link.next_wake(Instant::now())));
                Step::Idle
            }
            Err(NetworkError::Fatal(kind)) => {
                self.finish(ctx, &kind);
                Step::Exit
            }
        }
    }
}

/// The inbound half: accepts one connection, authenticates the client's
/// `(use ...)` credentials against the replay window, identity hash and
/// possession proof, then serves the selected protocol.
pub struct Peerx {
    link: Link,
    protocols: Arc<ProtocolRegistry>,
    handler: Option<Box<dyn Protocol>>,
    pending: Vec<Value>,
    registered: bool,
}

impl Peerx {
    pub fn accept<'a, L: Into<Option<&'a Logger>>>(
        stream: TcpStream,
        key: Arc<LongTermKey>,
        protocols: Arc<ProtocolRegistry>,
        idle_timeout: Duration,
        log: L,
    ) -> Peerx {
        Peerx {
            link: Link::new(stream, Role::Server, key, idle_timeout, log),
            protocols,
            handler: None,
            pending: Vec::new(),
            registered: false,
        }
    }

    fn drive(&mut self, ctx: &mut Ctx, now: Instant) -> NetworkResult<()> {
        self.link.pump(now)?;

        while let Some(msg) = self.link.next_message()? {
            if self.handler.is_none() {
                self.negotiate(ctx, &msg, now)?;
                continue;
            }

            match msg.head() {
                Some("keep-alive") => continue,
                Some("bye") => return Err(NetworkError::Fatal(ErrorType::ByeReceived)),
                _ => {
                    let handler = self.handler.as_mut().expect("exchange stage has a handler");
                    let mut wire = Wire { link: &mut self.link };
                    handler.on_message(&mut wire, ctx, &msg)?;
                }
            }
        }

        if self.handler.is_some() {
            for queued in self.pending.drain(..) {
                let _ = self.link.send(&queued);
            }
        }

        self.link.flush(now)?;
        Ok(())
    }

    /// Validates `(use <protocol> <identity> <pubkey> <proof> <timestamp>)`.
    /// Replay, identity and proof failures close silently; an unknown
    /// protocol is told so before the close.
    fn negotiate(&mut self, ctx: &mut Ctx, msg: &Value, now: Instant) -> NetworkResult<()> {
        if msg.head() != Some("use") {
            return Err(NetworkError::Fatal(ErrorType::ProtocolViolation));
        }

        let violation = || NetworkError::Fatal(ErrorType::ProtocolViolation);

        let protocol = msg.nth(1).and_then(Value::as_symbol).ok_or_else(violation)?;
        let identity = msg.nth(2).and_then(Value::as_str).ok_or_else(violation)?;
        let public_hex = msg.nth(3).and_then(Value::as_str).ok_or_else(violation)?;
        let proof_hex = msg.nth(4).and_then(Value::as_str).ok_or_else(violation)?;
        let timestamp = msg.nth(5).and_then(Value::as_int).ok_or_else(violation)?;

        let now_secs = timestamp_secs() as i64;
        if (now_secs - timestamp).abs() > REPLAY_WINDOW_SECS as i64 {
            return Err(NetworkError::Fatal(ErrorType::Expired));
        }

        let public = encoding::from_hex(public_hex).map_err(|_| violation())?;
        if identity_of(&public) != identity {
            return Err(NetworkError::Fatal(ErrorType::IdentityMismatch));
        }

        let expected = self
            .link
            .local_key()
            .agree(&public)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;
        let proof = encoding::from_hex(proof_hex).map_err(|_| violation())?;

        if proof[..] != expected[..] {
            return Err(NetworkError::Fatal(ErrorType::ProofMismatch));
        }

        let handler = match self.protocols.create(protocol) {
            Some(handler) => handler,
            None => {
                self.link.bye("unsupported-protocol");
                return Err(NetworkError::Fatal(ErrorType::UnsupportedProtocol));
            }
        };

        self.link
            .send(&value::message("use", vec![Value::sym(protocol), Value::int(now_secs)]))?;
        self.link.begin_exchange(now);
        self.handler = Some(handler);

        let handler = self.handler.as_mut().expect("handler installed above");
        let mut wire = Wire { link: &mut self.link };
        handler.on_open(&mut wire, ctx);

        Ok(())
    }

    fn finish(&mut self, ctx: &mut Ctx, kind: &ErrorType) {
        if let Some(handler) = self.handler.as_mut() {
            handler.on_close(ctx);
        }

        match bye_reason(kind) {
            Some(reason) => self.link.bye(reason),
            None => self.link.close(),
        }
    }
}

impl Body for Peerx {
    fn step(&mut self, ctx: &mut Ctx) -> Step {
        if !self.registered {
            self.registered = true;
            // The spawn arglist is not wire traffic.
            let _ = ctx.recv();
            if ctx.set_socket(self.link.raw_fd()).is_err() {
                self.link.close();
                return Step::Exit;
            }
        }

        while let Some(msg) = ctx.recv() {
            match msg.head() {
                Some("quit") => {
                    if let Some(handler) = self.handler.as_mut() {
                        handler.on_close(ctx);
                    }
                    self.link.bye("quit");
                    return Step::Exit;
                }
                _ => self.pending.push(msg),
            }
        }

        let now = Instant::now();
        match self.drive(ctx, now) {
            Ok(()) | Err(NetworkError::Wait) => {
                ctx.set_timeout(Some(self.link.next_wake(Instant::now())));
                Step::Idle
            }
            Err(NetworkError::Fatal(kind)) => {
                self.finish(ctx, &kind);
                Step::Exit
            }
        }
    }
}

/// Accepts connections and spawns a `Peerx` child per client. Slot
/// exhaustion drops the connection; everyone else keeps running.
pub struct Listener {
    listener: mio::net::TcpListener,
    key: Arc<LongTermKey>,
    protocols: Arc<ProtocolRegistry>,
    idle_timeout: Duration,
    registered: bool,
    log: Logger,
}

impl Listener {
    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        address: &str,
        key: Arc<LongTermKey>,
        protocols: Arc<ProtocolRegistry>,
        idle_timeout: Duration,
        log: L,
    ) -> NetworkResult<Listener> {
        let listener = sock::bind_tcp(address)?;

        Ok(Listener {
            listener,
            key,
            protocols,
            idle_timeout,
            registered: false,
            log: logging::branch(log),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Body for Listener {
    fn step(&mut self, ctx: &mut Ctx) -> Step {
        if !self.registered {
            self.registered = true;
            if ctx.set_socket(self.listener.as_raw_fd()).is_err() {
                return Step::Exit;
            }

            logging::info!(self.log, "listener serving";
                           "address" => ?self.listener.local_addr().ok(),
                           "protocols" => ?self.protocols.names());
        }

        while let Some(msg) = ctx.recv() {
            if msg.head() == Some("quit") {
                return Step::Exit;
            }
        }

        loop {
            match self.listener.accept() {
                Ok((stream, address)) => {
                    let peer = Peerx::accept(
                        stream,
                        self.key.clone(),
                        self.protocols.clone(),
                        self.idle_timeout,
                        Some(&self.log),
                    );

                    match ctx.spawn("peerx", Box::new(peer), Value::nil()) {
                        Ok(pid) => {
                            logging::debug!(self.log, "peer accepted";
                                            "address" => %address,
                                            "pid" => pid);
                        }
                        Err(err) => {
                            logging::warn!(self.log, "dropping connection";
                                           "address" => %address,
                                           "error" => %err);
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::error!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }

        Step::Idle
    }
}
