use crate::net::buffer::{Buffer, READ_BUF_SIZE, WRITE_BUF_SIZE};
use crate::net::identity::{identity_of, LongTermKey};
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::value::{self, Reader, Value};
use glint::crypto::{self, StreamDecryptor, StreamEncryptor};
use glint::logging::{self, Logger};
use mio::net::TcpStream;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Size of the fixed handshake blob each side sends first.
pub const HELLO_SIZE: usize = 256;
/// Offset of the ephemeral public key (uncompressed SEC1 point) in the blob.
pub const HELLO_KEY_OFFSET: usize = 32;
/// Offset of the 16-byte session salt.
pub const HELLO_SALT_OFFSET: usize = 128;
/// Offset of the sender's long-term public key. The blob padding is free by
/// contract; carrying the static key here lets the connecting side verify
/// the responder's asserted identity before negotiating.
pub const HELLO_STATIC_OFFSET: usize = 160;
pub const SALT_SIZE: usize = 16;

/// Handshake and negotiation must each complete within this window.
pub const STAGE_TIMEOUT: Duration = Duration::from_secs(10);
/// Maximum clock skew tolerated on negotiation timestamps.
pub const REPLAY_WINDOW_SECS: u64 = 60;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// Outbound half (connects out); `Peer` in the process model.
    Client,
    /// Inbound half (accepted connection); `Peerx` in the process model.
    Server,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    /// Exchanging the fixed-size hello blobs.
    Hello,
    /// Ciphered; authenticating identities and selecting a protocol.
    Negotiate,
    /// Ciphered; handler messages flow both ways.
    Exchange,
    Closed,
}

/// One secure stream: socket, elastic buffers, the session cipher pair and
/// the stage machine. The link owns framing and crypto; negotiation
/// semantics live with the peer process bodies.
pub struct Link {
    stream: TcpStream,
    role: Role,
    local: Arc<LongTermKey>,

    ephemeral: Option<crypto::Ephemeral>,
    salt: [u8; SALT_SIZE],
    peer_static: Option<[u8; crypto::POINT_SIZE]>,

    enc: Option<StreamEncryptor>,
    dec: Option<StreamDecryptor>,

    read_buffer: Buffer,
    write_buffer: Buffer,
    decoder: Reader,

    stage: Stage,
    stage_started: Instant,
    last_ingress: Instant,
    last_egress: Instant,
    idle_timeout: Duration,

    log: Logger,
}

impl Link {
    /// Wraps a connected (or connecting) stream. The local hello is queued
    /// immediately; it reaches the wire on the first pump.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        stream: TcpStream,
        role: Role,
        local: Arc<LongTermKey>,
        idle_timeout: Duration,
        log: L,
    ) -> Link {
        let now = Instant::now();

        let mut salt = [0u8; SALT_SIZE];
        crypto::random_bytes(&mut salt);

        let mut link = Link {
            stream,
            role,
            local,
            ephemeral: Some(crypto::Ephemeral::generate()),
            salt,
            peer_static: None,
            enc: None,
            dec: None,
            read_buffer: Buffer::new(READ_BUF_SIZE),
            write_buffer: Buffer::new(WRITE_BUF_SIZE),
            decoder: Reader::new(),
            stage: Stage::Hello,
            stage_started: now,
            last_ingress: now,
            last_egress: now,
            idle_timeout,
            log: logging::branch(log),
        };

        let hello = link.build_hello();
        link.write_buffer.extend(&hello);

        link
    }

    /// Assembles the 256-byte hello: random padding with the ephemeral key,
    /// session salt and long-term key embedded at their fixed offsets.
    fn build_hello(&self) -> [u8; HELLO_SIZE] {
        let mut hello = [0u8; HELLO_SIZE];
        crypto::random_bytes(&mut hello);

        let ephemeral = self
            .ephemeral
            .as_ref()
            .expect("hello is built before the handshake consumes the ephemeral");

        hello[HELLO_KEY_OFFSET..HELLO_KEY_OFFSET + crypto::POINT_SIZE]
            .copy_from_slice(&ephemeral.public_bytes());
        hello[HELLO_SALT_OFFSET..HELLO_SALT_OFFSET + SALT_SIZE].copy_from_slice(&self.salt);
        hello[HELLO_STATIC_OFFSET..HELLO_STATIC_OFFSET + crypto::POINT_SIZE]
            .copy_from_slice(&self.local.public_bytes());

        hello
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// True once the session cipher is installed.
    #[inline]
    pub fn secured(&self) -> bool {
        self.stage == Stage::Negotiate || self.stage == Stage::Exchange
    }

    #[inline]
    pub fn peer_static(&self) -> Option<&[u8; crypto::POINT_SIZE]> {
        self.peer_static.as_ref()
    }

    /// Identity asserted by the peer's hello blob.
    pub fn peer_identity(&self) -> Option<String> {
        self.peer_static.as_ref().map(|key| identity_of(&key[..]))
    }

    #[inline]
    pub fn local_key(&self) -> &LongTermKey {
        &self.local
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    #[inline]
    fn keepalive_interval(&self) -> Duration {
        self.idle_timeout / 3
    }

    /// Drives the link: reads everything available (deciphering once keyed),
    /// advances the handshake, enforces deadlines and flushes output.
    /// Inbound is always drained before output could block.
    pub fn pump(&mut self, now: Instant) -> NetworkResult<()> {
        if self.stage == Stage::Closed {
            return Err(NetworkError::Fatal(ErrorType::Closed));
        }

        self.read_socket(now)?;
        self.advance_handshake(now)?;
        self.housekeeping(now)?;
        self.flush(now)?;

        Ok(())
    }

    fn read_socket(&mut self, now: Instant) -> NetworkResult<()> {
        let mut chunk = [0u8; 4096];

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(NetworkError::Fatal(ErrorType::Closed)),
                Ok(count) => {
                    if let Some(dec) = self.dec.as_mut() {
                        dec.apply(&mut chunk[..count]);
                    }
                    if !self.read_buffer.extend(&chunk[..count]) {
                        return Err(NetworkError::Fatal(ErrorType::Overrun));
                    }
                    self.last_ingress = now;
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected => return Ok(()),
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                },
            }
        }
    }

    /// Once the peer's full hello has arrived: derive the session key from
    /// ephemeral ECDH, the IV from the salt mix, and rekey both directions.
    /// Ciphertext that rode in behind the hello is deciphered in place.
    fn advance_handshake(&mut self, now: Instant) -> NetworkResult<()> {
        if self.stage != Stage::Hello || self.read_buffer.len() < HELLO_SIZE {
            return Ok(());
        }

        let mut their_ephemeral = [0u8; crypto::POINT_SIZE];
        let mut their_salt = [0u8; SALT_SIZE];
        let mut their_static = [0u8; crypto::POINT_SIZE];
        {
            let hello = self.read_buffer.read_slice();
            their_ephemeral
                .copy_from_slice(&hello[HELLO_KEY_OFFSET..HELLO_KEY_OFFSET + crypto::POINT_SIZE]);
            their_salt.copy_from_slice(&hello[HELLO_SALT_OFFSET..HELLO_SALT_OFFSET + SALT_SIZE]);
            their_static
                .copy_from_slice(&hello[HELLO_STATIC_OFFSET..HELLO_STATIC_OFFSET + crypto::POINT_SIZE]);
        }

        let ephemeral = self
            .ephemeral
            .take()
            .expect("handshake consumes the ephemeral exactly once");
        let key = ephemeral
            .agree(&their_ephemeral)
            .map_err(|_| NetworkError::Fatal(ErrorType::Crypto))?;

        let mut mixed = [0u8; SALT_SIZE];
        for (index, byte) in mixed.iter_mut().enumerate() {
            *byte = self.salt[index] ^ their_salt[index];
        }
        let digest = crypto::sha256(&mixed);
        let mut iv = [0u8; crypto::IV_SIZE];
        iv.copy_from_slice(&digest[..crypto::IV_SIZE]);

        self.enc = Some(StreamEncryptor::new(&key, &iv));
        let mut dec = StreamDecryptor::new(&key, &iv);

        self.read_buffer.consume(HELLO_SIZE);
        dec.apply(self.read_buffer.read_slice_mut());
        self.dec = Some(dec);

        self.peer_static = Some(their_static);
        self.stage = Stage::Negotiate;
        self.stage_started = now;

        logging::debug!(self.log, "session keys established";
                        "role" => ?self.role,
                        "peer" => self.peer_identity());

        Ok(())
    }

    fn housekeeping(&mut self, now: Instant) -> NetworkResult<()> {
        match self.stage {
            Stage::Hello | Stage::Negotiate => {
                if now.duration_since(self.stage_started) >= STAGE_TIMEOUT {
                    return Err(NetworkError::Fatal(ErrorType::TimedOut));
                }
            }
            Stage::Exchange => {
                if now.duration_since(self.last_ingress) >= self.idle_timeout {
                    return Err(NetworkError::Fatal(ErrorType::TimedOut));
                }

                if self.write_buffer.is_empty()
                    && now.duration_since(self.last_egress) >= self.keepalive_interval()
                {
                    let _ = self.send(&value::message("keep-alive", vec![]));
                }
            }
            Stage::Closed => {}
        }

        Ok(())
    }

    /// Pushes buffered output toward the socket; `WouldBlock` leaves the
    /// remainder queued.
    pub fn flush(&mut self, now: Instant) -> NetworkResult<()> {
        if self.write_buffer.is_empty() {
            return Ok(());
        }

        match self.write_buffer.egress(&mut self.stream) {
            Ok(sent) => {
                if sent > 0 {
                    self.last_egress = now;
                }
                Ok(())
            }
            Err(err) => match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected => Ok(()),
                _ => Err(err.into()),
            },
        }
    }

    /// Yields the next balanced message off the deciphered stream, if one
    /// is complete. Only meaningful once secured.
    pub fn next_message(&mut self) -> NetworkResult<Option<Value>> {
        if !self.secured() {
            return Ok(None);
        }

        if self.read_buffer.len() > 0 {
            self.decoder.push(self.read_buffer.read_slice());
            let buffered = self.read_buffer.len();
            self.read_buffer.consume(buffered);
        }

        Ok(self.decoder.next()?)
    }

    /// Ciphers and queues one message. `Wait` when the write buffer lacks
    /// room; the cipher state is untouched in that case.
    pub fn send(&mut self, message: &Value) -> NetworkResult<()> {
        let enc = self
            .enc
            .as_mut()
            .ok_or(NetworkError::Fatal(ErrorType::ProtocolViolation))?;

        let mut bytes = message.to_string().into_bytes();
        bytes.push(b'\n');

        if bytes.len() > self.write_buffer.free_capacity() {
            return Err(NetworkError::Wait);
        }

        enc.apply(&mut bytes);
        self.write_buffer.extend(&bytes);

        Ok(())
    }

    /// Moves the link into the exchange stage, arming the idle clocks.
    pub fn begin_exchange(&mut self, now: Instant) {
        self.stage = Stage::Exchange;
        self.stage_started = now;
        self.last_ingress = now;
        self.last_egress = now;

        logging::debug!(self.log, "protocol exchange open"; "role" => ?self.role);
    }

    /// Sends `(bye <reason>)` best-effort, then closes.
    pub fn bye(&mut self, reason: &str) {
        if self.enc.is_some() && self.stage != Stage::Closed {
            let _ = self.send(&value::message("bye", vec![Value::sym(reason)]));
            let _ = self.flush(Instant::now());
        }

        self.close();
    }

    /// Shuts the stream down without notice.
    pub fn close(&mut self) {
        if self.stage == Stage::Closed {
            return;
        }

        self.stage = Stage::Closed;
        let _ = self.stream.shutdown(Shutdown::Both);

        logging::debug!(self.log, "link closed"; "role" => ?self.role);
    }

    /// Time until this link next needs attention (stage deadline, idle
    /// timeout or keepalive emission), floored to keep timers sane.
    pub fn next_wake(&self, now: Instant) -> Duration {
        let deadline = match self.stage {
            Stage::Hello | Stage::Negotiate => self.stage_started + STAGE_TIMEOUT,
            Stage::Exchange => {
                let idle = self.last_ingress + self.idle_timeout;
                let keepalive = self.last_egress + self.keepalive_interval();
                idle.min(keepalive)
            }
            Stage::Closed => return Duration::from_millis(0),
        };

        deadline
            .saturating_duration_since(now)
            .max(Duration::from_millis(10))
    }
}
