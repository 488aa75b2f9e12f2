use clap::{App, AppSettings, Arg, SubCommand};
use glint::logging::{self, Logger};
use photon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

mod opts;
mod programs;

fn main() {
    let matches = App::new("twk")
        .version("0.1.0")
        .about("Embeddable distributed application runtime")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .global(true)
                .help("Logger severity (trace, debug, info, warning, error)"),
        )
        .subcommand(SubCommand::with_name("help").about("Prints usage information"))
        .subcommand(
            SubCommand::with_name("keygen")
                .about("Generates a long-term keypair file and prints its identity")
                .arg(Arg::with_name("FILE").help("Destination keypair file").required(true)),
        )
        .subcommand(
            SubCommand::with_name("launch")
                .about("Launches a named program as the privileged root process")
                .setting(AppSettings::AllowLeadingHyphen)
                .arg(Arg::with_name("NAME").help("Program name").required(true))
                .arg(Arg::with_name("OPTS").help("Program options").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("exec")
                .about("Runs one program method locally and prints the result")
                .setting(AppSettings::AllowLeadingHyphen)
                .arg(Arg::with_name("PROGRAM").required(true))
                .arg(Arg::with_name("METHOD").required(true))
                .arg(Arg::with_name("PARAMS").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("rexec")
                .about("Calls a program method on a remote server over the secure transport")
                .setting(AppSettings::AllowLeadingHyphen)
                .arg(Arg::with_name("SERVER_UUID").help("Server identity").required(true))
                .arg(Arg::with_name("SERVER_IP").required(true))
                .arg(Arg::with_name("SERVER_PORT").required(true))
                .arg(Arg::with_name("KEYPAIR_FILE").required(true))
                .arg(Arg::with_name("PROGRAM").required(true))
                .arg(Arg::with_name("METHOD").required(true))
                .arg(Arg::with_name("PARAMS").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("test")
                .about("Runs a named self-test scenario")
                .arg(Arg::with_name("NAME").help("Scenario name (ping)").required(true)),
        )
        .get_matches();

    let log = logging::init(matches.value_of("log-level").unwrap_or("info"));

    let code = match matches.subcommand() {
        ("help", _) => {
            print_help();
            0
        }
        ("keygen", Some(sub)) => cmd_keygen(sub.value_of("FILE").unwrap(), &log),
        ("launch", Some(sub)) => {
            let name = sub.value_of("NAME").unwrap();
            let raw: Vec<String> = sub
                .values_of("OPTS")
                .map(|values| values.map(String::from).collect())
                .unwrap_or_default();
            cmd_launch(name, &raw, &log)
        }
        ("exec", Some(sub)) => {
            let params: Vec<String> = sub
                .values_of("PARAMS")
                .map(|values| values.map(String::from).collect())
                .unwrap_or_default();
            cmd_exec(
                sub.value_of("PROGRAM").unwrap(),
                sub.value_of("METHOD").unwrap(),
                &params,
                &log,
            )
        }
        ("rexec", Some(sub)) => {
            let params: Vec<String> = sub
                .values_of("PARAMS")
                .map(|values| values.map(String::from).collect())
                .unwrap_or_default();
            cmd_rexec(
                sub.value_of("SERVER_UUID").unwrap(),
                sub.value_of("SERVER_IP").unwrap(),
                sub.value_of("SERVER_PORT").unwrap(),
                sub.value_of("KEYPAIR_FILE").unwrap(),
                sub.value_of("PROGRAM").unwrap(),
                sub.value_of("METHOD").unwrap(),
                &params,
                &log,
            )
        }
        ("test", Some(sub)) => cmd_test(sub.value_of("NAME").unwrap(), &log),
        _ => {
            print_help();
            2
        }
    };

    std::process::exit(code);
}

fn print_help() {
    println!(
        "twk - embeddable distributed application runtime

USAGE:
    twk help
    twk keygen <file>
    twk launch <name> [opts]
    twk exec <program> <method> [params]
    twk rexec <server-uuid> <server-ip> <server-port> <keypair-file> <program> <method> [params]
    twk test <name>

Program options after the positional arguments:
    -name            symbol flag
    --name value     single-valued option
    ---name a b c    consumes the rest of the line as a list

Environment:
    TWK_DIST         read-only distribution path (default .)
    TWK_VAR          mutable state path (default ./var)

Programs: {programs}
Test scenarios: ping",
        programs = programs::names().join(", ")
    );
}

/// Arms a watchdog that stops the runtime if the command overstays.
fn watchdog(rt: &Arc<Runtime>, timeout: Duration) {
    let weak = Arc::downgrade(rt);
    thread::spawn(move || {
        thread::sleep(timeout);
        if let Some(rt) = weak.upgrade() {
            rt.shutdown();
        }
    });
}

fn cmd_keygen(file: &str, log: &Logger) -> i32 {
    let key = LongTermKey::generate();

    if let Err(err) = key.save(file) {
        logging::error!(log, "cannot write keypair file"; "file" => file, "error" => %err);
        return 1;
    }

    println!("{}", key.identity());
    0
}

fn cmd_launch(name: &str, raw: &[String], log: &Logger) -> i32 {
    let options = match opts::parse(raw) {
        Ok(options) => options,
        Err(err) => {
            logging::error!(log, "bad program options"; "error" => %err);
            return 2;
        }
    };

    let mut options = options;

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            logging::error!(log, "configuration error"; "error" => %err);
            return 1;
        }
    };

    // An optional twk.toml in the distribution overrides the env defaults.
    let config_file = config.dist_path.join("twk.toml");
    let config = if config_file.is_file() {
        match Config::load(&config_file) {
            Ok(config) => config,
            Err(err) => {
                logging::error!(log, "configuration error"; "error" => %err);
                return 1;
            }
        }
    } else {
        config
    };

    // A configured listen address backs any program that was not handed one.
    if opts::lookup(&options, "address").is_none() {
        if let Some(address) = config.listen_address.clone() {
            if let Value::List(entries) = &mut options {
                entries.push(Value::pair(Value::sym("address"), Value::Str(address)));
            }
        }
    }

    if let Err(err) = Store::open(&config, Some(log)) {
        logging::error!(log, "cannot prepare state directories"; "error" => %err);
        return 1;
    }

    let program = match programs::create(name, log) {
        Some(program) => program,
        None => {
            logging::error!(log, "unknown program";
                            "name" => name,
                            "known" => ?programs::names());
            return 2;
        }
    };

    let rt = match Runtime::new(config, Some(log)) {
        Ok(rt) => rt,
        Err(err) => {
            logging::error!(log, "cannot create runtime"; "error" => %err);
            return 1;
        }
    };

    rt.set_host_callback(Box::new(|msg| println!("{}", msg)));

    if let Err(err) = rt.spawn_root(name, Box::new(Dispatcher::new(program)), options) {
        logging::error!(log, "cannot spawn root process"; "error" => %err);
        return 1;
    }

    rt.run();
    0
}

fn cmd_exec(program_name: &str, method: &str, params: &[String], log: &Logger) -> i32 {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            logging::error!(log, "configuration error"; "error" => %err);
            return 1;
        }
    };

    let program = match programs::create(program_name, log) {
        Some(program) => program,
        None => {
            logging::error!(log, "unknown program"; "name" => program_name);
            return 2;
        }
    };

    let rt = match Runtime::new(config, Some(log)) {
        Ok(rt) => rt,
        Err(err) => {
            logging::error!(log, "cannot create runtime"; "error" => %err);
            return 1;
        }
    };

    let root = match rt.spawn_root(program_name, Box::new(Dispatcher::new(program)), Value::nil()) {
        Ok(pid) => pid,
        Err(err) => {
            logging::error!(log, "cannot spawn root process"; "error" => %err);
            return 1;
        }
    };

    // The host plays requester: the method call goes in as a request from
    // pid -1 and the reply comes back through the host callback.
    let mut raw = [0u8; 8];
    glint::crypto::random_bytes(&mut raw);
    let id = i64::from_le_bytes(raw);

    let done = Arc::new(AtomicBool::new(false));
    let done_cb = done.clone();
    let weak = Arc::downgrade(&rt);

    rt.set_host_callback(Box::new(move |msg| {
        if msg.head() == Some("did-request") && msg.nth(1).and_then(Value::as_int) == Some(id) {
            if let Some(response) = msg.nth(2) {
                println!("{}", response);
            }
            done_cb.store(true, Ordering::SeqCst);
            if let Some(rt) = weak.upgrade() {
                rt.shutdown();
            }
        }
    }));

    let payload = value::message(
        method,
        params.iter().map(|raw| opts::classify(raw)).collect(),
    );
    let request = value::message(
        "request",
        vec![Value::int(HOST_PID), Value::int(id), payload],
    );

    if !rt.send_message(root, &request) {
        logging::error!(log, "cannot deliver request to root process");
        return 1;
    }

    watchdog(&rt, Duration::from_secs(30));
    rt.run();

    if done.load(Ordering::SeqCst) {
        0
    } else {
        logging::error!(log, "no response from program"; "program" => program_name);
        1
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_rexec(
    server_uuid: &str,
    server_ip: &str,
    server_port: &str,
    keypair_file: &str,
    program: &str,
    method: &str,
    params: &[String],
    log: &Logger,
) -> i32 {
    let key = match LongTermKey::load(keypair_file) {
        Ok(key) => key,
        Err(err) => {
            logging::error!(log, "cannot load keypair"; "file" => keypair_file, "error" => %err);
            return 1;
        }
    };

    let address = format!("{}:{}", server_ip, server_port);
    let request = value::message(
        method,
        params.iter().map(|raw| opts::classify(raw)).collect(),
    );

    let done = Arc::new(AtomicBool::new(false));
    let handler = programs::RexecClient::new(request, done.clone());

    let peer = match Peer::connect(
        &address,
        server_uuid,
        Arc::new(key),
        program,
        Box::new(handler),
        Duration::from_secs(60),
        Some(log),
    ) {
        Ok(peer) => peer,
        Err(err) => {
            logging::error!(log, "cannot connect"; "address" => %address, "error" => ?err);
            return 1;
        }
    };

    let rt = match Runtime::new(Config::default(), Some(log)) {
        Ok(rt) => rt,
        Err(err) => {
            logging::error!(log, "cannot create runtime"; "error" => %err);
            return 1;
        }
    };

    if let Err(err) = rt.spawn_root("peer", Box::new(peer), Value::nil()) {
        logging::error!(log, "cannot spawn peer process"; "error" => %err);
        return 1;
    }

    watchdog(&rt, Duration::from_secs(30));
    rt.run();

    if done.load(Ordering::SeqCst) {
        0
    } else {
        logging::error!(log, "no response from server"; "address" => %address);
        1
    }
}

fn cmd_test(name: &str, log: &Logger) -> i32 {
    match name {
        "ping" => cmd_test_ping(log),
        _ => {
            logging::error!(log, "unknown test scenario"; "name" => name);
            2
        }
    }
}

/// Scenario: fresh server and client identities, ten ping/pong exchanges
/// over 127.0.0.1:9001, then `(bye)`; the whole round trip fits in two
/// seconds on localhost.
fn cmd_test_ping(log: &Logger) -> i32 {
    let server_key = Arc::new(LongTermKey::generate());
    let server_identity = server_key.identity();

    let listener = match Listener::bind(
        "127.0.0.1:9001",
        server_key,
        Arc::new(builtin_registry()),
        Duration::from_secs(60),
        Some(log),
    ) {
        Ok(listener) => listener,
        Err(err) => {
            logging::error!(log, "cannot bind test listener"; "error" => ?err);
            return 1;
        }
    };

    let server_rt = match Runtime::new(Config::default(), Some(log)) {
        Ok(rt) => rt,
        Err(err) => {
            logging::error!(log, "cannot create server runtime"; "error" => %err);
            return 1;
        }
    };

    if server_rt.spawn_root("listener", Box::new(listener), Value::nil()).is_err() {
        return 1;
    }

    let server_thread = {
        let rt = server_rt.clone();
        thread::spawn(move || rt.run())
    };

    let (done_tx, done_rx) = mpsc::channel();
    let client_key = Arc::new(LongTermKey::generate());
    let peer = match Peer::connect(
        "127.0.0.1:9001",
        &server_identity,
        client_key,
        "ping",
        Box::new(programs::PingClient::new(10, done_tx)),
        Duration::from_secs(60),
        Some(log),
    ) {
        Ok(peer) => peer,
        Err(err) => {
            logging::error!(log, "cannot connect test client"; "error" => ?err);
            server_rt.shutdown();
            let _ = server_thread.join();
            return 1;
        }
    };

    let client_rt = match Runtime::new(Config::default(), Some(log)) {
        Ok(rt) => rt,
        Err(err) => {
            logging::error!(log, "cannot create client runtime"; "error" => %err);
            server_rt.shutdown();
            let _ = server_thread.join();
            return 1;
        }
    };

    let started = Instant::now();
    if client_rt.spawn_root("peer", Box::new(peer), Value::nil()).is_err() {
        server_rt.shutdown();
        let _ = server_thread.join();
        return 1;
    }

    let client_thread = {
        let rt = client_rt.clone();
        thread::spawn(move || rt.run())
    };

    let passed = done_rx.recv_timeout(Duration::from_secs(2)).is_ok();
    let elapsed = started.elapsed();

    client_rt.shutdown();
    let _ = client_thread.join();
    server_rt.shutdown();
    let _ = server_thread.join();

    if passed {
        println!("ping: ok ({} ms)", elapsed.as_millis());
        0
    } else {
        println!("ping: FAILED");
        1
    }
}
