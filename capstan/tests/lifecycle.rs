//! Socket and context lifecycle: linger, bind conflicts, monitoring,
//! handshake failures and termination.

use capstan::{
    dev_tracing, Context, EngineError, Msg, SocketEvent, SocketMonitor, SocketOptions, SocketType,
};
use std::time::{Duration, Instant};

fn patient() -> SocketOptions {
    SocketOptions::default().with_recv_timeout(Duration::from_secs(5))
}

fn tcp_endpoint() -> String {
    let port = portpicker::pick_unused_port().expect("no free port");
    format!("tcp://127.0.0.1:{port}")
}

/// Read events until one matches, skipping the rest. Panics after five
/// seconds.
fn wait_for(
    monitor: &SocketMonitor,
    what: &str,
    matches: impl Fn(&SocketEvent) -> bool,
) -> SocketEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_else(|| panic!("timed out waiting for {what}"));
        match monitor.recv_timeout(remaining) {
            Ok(event) if matches(&event) => return event,
            Ok(_) => continue,
            Err(err) => panic!("waiting for {what}: {err}"),
        }
    }
}

#[test]
fn test_close_with_default_linger_delivers_pending() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(1).build().unwrap();
    let endpoint = tcp_endpoint();

    let mut pull = ctx.socket(SocketType::Pull).unwrap();
    pull.set_options(patient()).unwrap();
    pull.bind(&endpoint).unwrap();

    let mut push = ctx.socket(SocketType::Push).unwrap();
    push.connect(&endpoint).unwrap();
    for i in 0..100u32 {
        push.send(Msg::from(format!("pending-{i}"))).unwrap();
    }
    // Default linger keeps the session alive until the queue drains.
    push.close();

    for i in 0..100u32 {
        let msg = pull.recv().unwrap();
        assert_eq!(msg.data(), format!("pending-{i}").as_bytes());
    }

    pull.close();
    ctx.terminate().unwrap();
}

#[test]
fn test_bind_conflicts_report_address_in_use() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(1).build().unwrap();
    let endpoint = tcp_endpoint();

    let mut first = ctx.socket(SocketType::Pull).unwrap();
    first.bind(&endpoint).unwrap();

    let mut second = ctx.socket(SocketType::Pull).unwrap();
    assert!(matches!(
        second.bind(&endpoint).unwrap_err(),
        EngineError::AddressInUse(_)
    ));

    // Inproc names clash the same way, inside the context registry.
    first.bind("inproc://taken").unwrap();
    assert!(matches!(
        second.bind("inproc://taken").unwrap_err(),
        EngineError::AddressInUse(_)
    ));

    first.close();
    second.close();
    ctx.terminate().unwrap();
}

#[test]
fn test_unbind_releases_the_endpoint() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(0).build().unwrap();

    let mut sock = ctx.socket(SocketType::Pull).unwrap();
    sock.bind("inproc://transient").unwrap();
    sock.unbind("inproc://transient").unwrap();

    // Unknown endpoints are a state error, not a silent no-op.
    assert!(matches!(
        sock.unbind("inproc://transient").unwrap_err(),
        EngineError::InvalidState(_)
    ));

    // The name is free again.
    let mut other = ctx.socket(SocketType::Pull).unwrap();
    other.bind("inproc://transient").unwrap();

    sock.close();
    other.close();
    ctx.terminate().unwrap();
}

#[test]
fn test_monitor_reports_connection_events() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(2).build().unwrap();
    let endpoint = tcp_endpoint();

    let mut server = ctx.socket(SocketType::Pull).unwrap();
    server.set_options(patient()).unwrap();
    let server_events = server.monitor();
    server.bind(&endpoint).unwrap();
    wait_for(&server_events, "Listening", |e| {
        matches!(e, SocketEvent::Listening(_))
    });

    let mut client = ctx.socket(SocketType::Push).unwrap();
    let client_events = client.monitor();
    client.connect(&endpoint).unwrap();

    client.send(Msg::from("hello")).unwrap();
    assert_eq!(server.recv().unwrap().data(), b"hello");

    wait_for(&server_events, "Accepted", |e| {
        matches!(e, SocketEvent::Accepted(_))
    });
    wait_for(&client_events, "Connected", |e| {
        matches!(e, SocketEvent::Connected(_))
    });

    client.close();
    server.close();
    wait_for(&client_events, "Closed", |e| *e == SocketEvent::Closed);
    ctx.terminate().unwrap();
}

#[test]
fn test_incompatible_peers_fail_the_handshake() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(1).build().unwrap();
    let endpoint = tcp_endpoint();

    let mut listener = ctx.socket(SocketType::Pull).unwrap();
    listener.bind(&endpoint).unwrap();

    // PUB cannot talk to PULL: both greetings parse, the type check
    // fails, and the connecting side keeps redialing.
    let mut publisher = ctx.socket(SocketType::Pub).unwrap();
    let events = publisher.monitor();
    publisher.connect(&endpoint).unwrap();

    wait_for(&events, "HandshakeFailed", |e| {
        matches!(e, SocketEvent::HandshakeFailed(_))
    });
    wait_for(&events, "ConnectRetried", |e| {
        matches!(e, SocketEvent::ConnectRetried(_))
    });

    publisher.close();
    listener.close();
    ctx.terminate().unwrap();
}

#[test]
fn test_terminate_unblocks_a_parked_recv() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(0).build().unwrap();

    let mut sock = ctx.socket(SocketType::Pull).unwrap();
    sock.bind("inproc://parked").unwrap();

    // No receive timeout: the worker parks until termination reaches it.
    let worker = std::thread::spawn(move || {
        let err = sock.recv().unwrap_err();
        assert!(matches!(err, EngineError::Terminated));
        sock.close();
    });

    std::thread::sleep(Duration::from_millis(100));
    ctx.terminate().unwrap();
    worker.join().unwrap();
}

#[test]
fn test_socket_refused_after_terminate_begins() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(0).build().unwrap();
    let sock = ctx.socket(SocketType::Pair).unwrap();

    let ctx2 = ctx.clone();
    let worker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        assert!(matches!(
            ctx2.socket(SocketType::Pair),
            Err(EngineError::Terminated)
        ));
        sock.close();
    });

    ctx.terminate().unwrap();
    worker.join().unwrap();
}

#[test]
fn test_last_endpoint_reports_the_assigned_port() {
    dev_tracing::init_tracing();
    let ctx = Context::builder().io_threads(1).build().unwrap();

    let mut sock = ctx.socket(SocketType::Pull).unwrap();
    sock.bind("tcp://127.0.0.1:0").unwrap();

    let endpoint = sock.last_endpoint().unwrap();
    assert!(endpoint.starts_with("tcp://127.0.0.1:"));
    assert!(!endpoint.ends_with(":0"), "wildcard port must be resolved");

    // The reported endpoint is dialable.
    let mut peer = ctx.socket(SocketType::Push).unwrap();
    peer.connect(&endpoint).unwrap();
    peer.send(Msg::from("check")).unwrap();
    sock.set_options(patient()).unwrap();
    assert_eq!(sock.recv().unwrap().data(), b"check");

    peer.close();
    sock.close();
    ctx.terminate().unwrap();
}
