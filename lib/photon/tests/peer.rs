use photon::net::link::{Link, Role};
use photon::net::sock;
use photon::prelude::*;
use glint::encoding;
use glint::time::timestamp_secs;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn runtime() -> Arc<Runtime> {
    let mut config = Config::default();
    config.max_process = 64;
    config.max_threads = 4;
    Runtime::new(config, None).unwrap()
}

fn start(rt: &Arc<Runtime>) -> thread::JoinHandle<()> {
    let rt = rt.clone();
    thread::spawn(move || rt.run())
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Boots a server runtime with a `ping`-capable listener on an ephemeral
/// port. Returns the runtime, its join handle, the bound address and the
/// server identity.
fn ping_server() -> (Arc<Runtime>, thread::JoinHandle<()>, String, String) {
    let key = Arc::new(LongTermKey::generate());
    let identity = key.identity();
    let registry = Arc::new(builtin_registry());

    let listener = Listener::bind(
        "127.0.0.1:0",
        key,
        registry,
        Duration::from_secs(60),
        None,
    )
    .unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let rt = runtime();
    let handle = start(&rt);
    rt.spawn_root("listener", Box::new(listener), Value::nil()).unwrap();

    (rt, handle, address, identity)
}

struct NullProtocol;

impl Protocol for NullProtocol {
    fn on_message(&mut self, _wire: &mut Wire, _ctx: &mut Ctx, _msg: &Value) -> NetworkResult<()> {
        Ok(())
    }
}

/// S1: ten ping/pong exchanges over a fresh secure session, then `(bye)`.
#[test]
fn test_ping_pong_ten_exchanges() {
    struct PingTester {
        remaining: u32,
        done: mpsc::Sender<()>,
    }

    fn ping() -> Value {
        value::message("ping", vec![Value::int(glint::time::timestamp_millis() as i64)])
    }

    impl Protocol for PingTester {
        fn on_open(&mut self, wire: &mut Wire, _ctx: &mut Ctx) {
            wire.send(&ping());
        }

        fn on_message(&mut self, wire: &mut Wire, ctx: &mut Ctx, msg: &Value) -> NetworkResult<()> {
            if msg.head() == Some("pong") {
                self.remaining -= 1;

                if self.remaining == 0 {
                    let _ = self.done.send(());
                    wire.bye("done");
                    ctx.shutdown();
                } else {
                    wire.send(&ping());
                }
            }
            Ok(())
        }
    }

    let (server_rt, server_handle, address, server_identity) = ping_server();

    let (done_tx, done_rx) = mpsc::channel();
    let client_key = Arc::new(LongTermKey::generate());
    let peer = Peer::connect(
        &address,
        &server_identity,
        client_key,
        "ping",
        Box::new(PingTester {
            remaining: 10,
            done: done_tx,
        }),
        Duration::from_secs(60),
        None,
    )
    .unwrap();

    let client_rt = runtime();
    let client_handle = start(&client_rt);

    let started = Instant::now();
    client_rt.spawn_root("peer", Box::new(peer), Value::nil()).unwrap();

    done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("ten exchanges should complete within two seconds on localhost");
    assert!(started.elapsed() <= Duration::from_secs(2));

    // The client runtime stops itself; the server's peer process exits.
    client_handle.join().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        server_rt.processes().len() == 1
    }));

    server_rt.shutdown();
    server_handle.join().unwrap();
}

/// S4: a negotiation replayed with a 61-second-old timestamp is rejected
/// before protocol exchange, and the server's process table stays sane.
#[test]
fn test_negotiation_replay_rejected() {
    let (server_rt, server_handle, address, _identity) = ping_server();

    let client_key = Arc::new(LongTermKey::generate());
    let stream = sock::connect_tcp(&address).unwrap();
    let mut link = Link::new(
        stream,
        Role::Client,
        client_key.clone(),
        Duration::from_secs(60),
        None,
    );

    // Complete the ephemeral handshake honestly.
    let deadline = Instant::now() + Duration::from_secs(5);
    while !link.secured() {
        assert!(Instant::now() < deadline, "handshake stalled");
        link.pump(Instant::now()).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    // Present credentials that were valid 61 seconds ago.
    let server_static = *link.peer_static().unwrap();
    let proof = client_key.agree(&server_static).unwrap();
    let stale = value::message(
        "use",
        vec![
            Value::sym("ping"),
            Value::Str(client_key.identity()),
            Value::Str(encoding::to_hex(&client_key.public_bytes())),
            Value::Str(encoding::to_hex(&proof)),
            Value::int(timestamp_secs() as i64 - 61),
        ],
    );
    link.send(&stale).unwrap();

    // The server must close without replying.
    let mut replies = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    let closed = loop {
        assert!(Instant::now() < deadline, "server never closed the stream");

        match link.pump(Instant::now()) {
            Ok(()) => {
                while let Some(_msg) = link.next_message().unwrap() {
                    replies += 1;
                }
            }
            Err(NetworkError::Fatal(kind)) => break kind,
            Err(NetworkError::Wait) => {}
        }
        thread::sleep(Duration::from_millis(2));
    };

    assert_eq!(closed, ErrorType::Closed);
    assert_eq!(replies, 0, "replayed credentials must not reach exchange");

    // No peer process survives the rejection.
    assert!(wait_until(Duration::from_secs(5), || {
        server_rt.processes().len() == 1
    }));

    server_rt.shutdown();
    server_handle.join().unwrap();
}

/// A client told to expect one identity but reaching a server holding a
/// different key closes without presenting credentials.
#[test]
fn test_client_rejects_wrong_server_identity() {
    let (server_rt, server_handle, address, _identity) = ping_server();

    let wrong_identity = LongTermKey::generate().identity();
    let peer = Peer::connect(
        &address,
        &wrong_identity,
        Arc::new(LongTermKey::generate()),
        "ping",
        Box::new(NullProtocol),
        Duration::from_secs(60),
        None,
    )
    .unwrap();

    let client_rt = runtime();
    let client_handle = start(&client_rt);
    client_rt.spawn_root("peer", Box::new(peer), Value::nil()).unwrap();

    // The client peer tears itself down on the mismatch.
    assert!(wait_until(Duration::from_secs(5), || {
        client_rt.processes().is_empty()
    }));

    // The server sheds the dead connection as well.
    assert!(wait_until(Duration::from_secs(5), || {
        server_rt.processes().len() == 1
    }));

    client_rt.shutdown();
    client_handle.join().unwrap();
    server_rt.shutdown();
    server_handle.join().unwrap();
}

/// Requesting a protocol the server does not carry draws
/// `(bye unsupported-protocol)` and both sides exit cleanly.
#[test]
fn test_unsupported_protocol_is_refused() {
    let (server_rt, server_handle, address, server_identity) = ping_server();

    let peer = Peer::connect(
        &address,
        &server_identity,
        Arc::new(LongTermKey::generate()),
        "warp",
        Box::new(NullProtocol),
        Duration::from_secs(60),
        None,
    )
    .unwrap();

    let client_rt = runtime();
    let client_handle = start(&client_rt);
    client_rt.spawn_root("peer", Box::new(peer), Value::nil()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        client_rt.processes().is_empty()
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        server_rt.processes().len() == 1
    }));

    client_rt.shutdown();
    client_handle.join().unwrap();
    server_rt.shutdown();
    server_handle.join().unwrap();
}
