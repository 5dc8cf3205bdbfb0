//! End-to-end scenarios over real loopback sockets: a stub health endpoint,
//! a UDP collector, and a relay running on its own thread.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use statsd_relay::{Config, DownstreamSpec, LogLevel, Relay};

const LOOPBACK_A: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const LOOPBACK_B: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 2);

/// Answers probes with `health: up\n` until `silent` flips, after which
/// connections are accepted and held open so the probe hangs mid-read.
fn serve_health(listener: TcpListener, silent: Arc<AtomicBool>) {
    thread::spawn(move || {
        let mut held = Vec::new();
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { continue };
            if silent.load(Ordering::Acquire) {
                held.push(conn);
                continue;
            }
            let mut buf = [0u8; 16];
            let _ = conn.read(&mut buf);
            let _ = conn.write_all(b"health: up\n");
        }
    });
}

fn relay_config(data_port: u16, health_port: u16) -> Config {
    Config {
        data_port: 0,
        flush_interval: Duration::from_millis(150),
        log_level: LogLevel::Error,
        dns_refresh_interval: Duration::from_secs(60),
        health_check_interval: Duration::from_millis(50),
        downstream: DownstreamSpec {
            host: LOOPBACK_A.to_string(),
            data_port,
            health_port,
        },
    }
}

fn recv_datagram(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 2048];
    let (len, _) = socket
        .recv_from(&mut buf)
        .expect("timed out waiting for a relay flush");
    buf[..len].to_vec()
}

fn drain(socket: &UdpSocket, window: Duration) {
    let mut buf = [0u8; 2048];
    socket.set_read_timeout(Some(window)).unwrap();
    while socket.recv_from(&mut buf).is_ok() {}
}

/// Sends warmup metrics until one makes it through the whole pipeline (the
/// first probe has to mark the downstream alive before anything flows), then
/// drains the stragglers.
fn await_pipeline(sender: &UdpSocket, ingress: SocketAddr, collectors: &[&UdpSocket]) {
    let mut buf = [0u8; 2048];
    for collector in collectors {
        collector.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    }
    let mut warmed = vec![false; collectors.len()];
    for _ in 0..100 {
        sender.send_to(b"warmup:1|c\n", ingress).unwrap();
        for (i, collector) in collectors.iter().enumerate() {
            if collector.recv_from(&mut buf).is_ok() {
                warmed[i] = true;
            }
        }
        if warmed.iter().all(|&w| w) {
            for collector in collectors {
                drain(collector, Duration::from_millis(300));
                collector.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            }
            return;
        }
    }
    panic!("relay pipeline did not come up");
}

#[test]
fn aggregates_and_relays_end_to_end() {
    let health = TcpListener::bind((LOOPBACK_A, 0)).unwrap();
    let health_port = health.local_addr().unwrap().port();
    serve_health(health, Arc::new(AtomicBool::new(false)));

    let collector = UdpSocket::bind((LOOPBACK_A, 0)).unwrap();
    let data_port = collector.local_addr().unwrap().port();

    let relay = Relay::new(&relay_config(data_port, health_port)).unwrap();
    let ingress = relay.ingress_addr().unwrap();
    let handle = relay.handle();
    let runner = thread::spawn(move || {
        let mut relay = relay;
        relay.run()
    });

    let sender = UdpSocket::bind((LOOPBACK_A, 0)).unwrap();
    await_pipeline(&sender, ingress, &[&collector]);

    // Identical counters coalesce into one accumulated sample.
    sender.send_to(b"aa:1|c\naa:2|c\n", ingress).unwrap();
    assert_eq!(recv_datagram(&collector), b"aa:3|c\n");

    // A sampled counter scales by its rate.
    sender.send_to(b"m:5|c|@0.5\n", ingress).unwrap();
    assert_eq!(recv_datagram(&collector), b"m:10|c\n");

    // Non-counters are appended verbatim and share one name segment.
    sender.send_to(b"t:250|ms\nt:300|ms\n", ingress).unwrap();
    assert_eq!(recv_datagram(&collector), b"t:250|ms:300|ms\n");

    // A conflicting type for an existing slot is rejected.
    sender.send_to(b"ab:1|c\nab:2|ms\n", ingress).unwrap();
    assert_eq!(recv_datagram(&collector), b"ab:1|c\n");

    // Undersized lines are dropped before they reach a slot.
    sender.send_to(b"a:1|c\nzz:9|c\n", ingress).unwrap();
    assert_eq!(recv_datagram(&collector), b"zz:9|c\n");

    handle.shutdown();
    runner.join().unwrap().unwrap();
}

fn recv_from_either(a: &UdpSocket, b: &UdpSocket) -> usize {
    let mut buf = [0u8; 2048];
    a.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    b.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if a.recv_from(&mut buf).is_ok() {
            return 0;
        }
        if b.recv_from(&mut buf).is_ok() {
            return 1;
        }
    }
    panic!("timed out waiting for a relay flush on either collector");
}

#[test]
fn round_robins_across_healthy_downstreams() {
    let health_a = TcpListener::bind((LOOPBACK_A, 0)).unwrap();
    let health_port = health_a.local_addr().unwrap().port();
    let health_b = TcpListener::bind((LOOPBACK_B, health_port)).unwrap();
    serve_health(health_a, Arc::new(AtomicBool::new(false)));
    serve_health(health_b, Arc::new(AtomicBool::new(false)));

    let collector_a = UdpSocket::bind((LOOPBACK_A, 0)).unwrap();
    let data_port = collector_a.local_addr().unwrap().port();
    let collector_b = UdpSocket::bind((LOOPBACK_B, data_port)).unwrap();

    let relay = Relay::new(&relay_config(data_port, health_port)).unwrap();
    let ingress = relay.ingress_addr().unwrap();
    let handle = relay.handle();
    let runner = thread::spawn(move || {
        let mut relay = relay;
        relay.run()
    });

    let sender = UdpSocket::bind((LOOPBACK_A, 0)).unwrap();
    await_pipeline(&sender, ingress, &[&collector_a]);

    // Grow the fleet to two addresses; wait for the handoff slot to free up
    // in case the startup seed has not been consumed yet.
    let deadline = Instant::now() + Duration::from_secs(2);
    while !handle.update_downstreams(vec![LOOPBACK_A, LOOPBACK_B]) {
        assert!(Instant::now() < deadline, "address handoff never freed up");
        thread::sleep(Duration::from_millis(20));
    }
    await_pipeline(&sender, ingress, &[&collector_a, &collector_b]);

    // Six windows alternate strictly between the two healthy hosts.
    let mut picks = Vec::new();
    for _ in 0..6 {
        sender.send_to(b"rr:1|c\n", ingress).unwrap();
        picks.push(recv_from_either(&collector_a, &collector_b));
    }
    assert_eq!(picks.iter().filter(|&&p| p == 0).count(), 3);
    assert_eq!(picks.iter().filter(|&&p| p == 1).count(), 3);
    for pair in picks.windows(2) {
        assert_ne!(pair[0], pair[1], "selection did not alternate: {picks:?}");
    }

    handle.shutdown();
    runner.join().unwrap().unwrap();
}

#[test]
fn stuck_probe_fails_the_host_over() {
    let health_a = TcpListener::bind((LOOPBACK_A, 0)).unwrap();
    let health_port = health_a.local_addr().unwrap().port();
    let health_b = TcpListener::bind((LOOPBACK_B, health_port)).unwrap();
    let silence_a = Arc::new(AtomicBool::new(false));
    serve_health(health_a, Arc::clone(&silence_a));
    serve_health(health_b, Arc::new(AtomicBool::new(false)));

    let collector_a = UdpSocket::bind((LOOPBACK_A, 0)).unwrap();
    let data_port = collector_a.local_addr().unwrap().port();
    let collector_b = UdpSocket::bind((LOOPBACK_B, data_port)).unwrap();

    let relay = Relay::new(&relay_config(data_port, health_port)).unwrap();
    let ingress = relay.ingress_addr().unwrap();
    let handle = relay.handle();
    let runner = thread::spawn(move || {
        let mut relay = relay;
        relay.run()
    });

    let sender = UdpSocket::bind((LOOPBACK_A, 0)).unwrap();
    await_pipeline(&sender, ingress, &[&collector_a]);
    let deadline = Instant::now() + Duration::from_secs(2);
    while !handle.update_downstreams(vec![LOOPBACK_A, LOOPBACK_B]) {
        assert!(Instant::now() < deadline, "address handoff never freed up");
        thread::sleep(Duration::from_millis(20));
    }
    await_pipeline(&sender, ingress, &[&collector_a, &collector_b]);

    // Host A's probes now hang; the next tick force-aborts the overdue
    // probe and marks A down.
    silence_a.store(true, Ordering::Release);
    thread::sleep(Duration::from_millis(500));
    drain(&collector_a, Duration::from_millis(300));
    drain(&collector_b, Duration::from_millis(300));
    collector_a.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    collector_b.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let mut buf = [0u8; 2048];
    for _ in 0..4 {
        sender.send_to(b"fo:1|c\n", ingress).unwrap();
        assert_eq!(recv_datagram(&collector_b), b"fo:1|c\n");
    }
    assert!(collector_a.recv_from(&mut buf).is_err(), "dead host still receives flushes");

    handle.shutdown();
    runner.join().unwrap().unwrap();
}
