//! End-to-end transfers between two reliable UDP transports on loopback.

use quark::CloseReason;
use tachyon::io::pipe::ByteAgent;
use tachyon::io::rudp::{RudpConfig, RudpTransport};
use tachyon::io::HalfClosePolicy;
use tachyon::reactor::Reactor;
use std::time::Duration;

struct Side {
    transport: RudpTransport,
    agent: ByteAgent,
}

/// Builds two connected transports on loopback sockets, each wired to a
/// duplex byte agent.
fn connect(reactor: &Reactor, config: RudpConfig) -> (Side, Side) {
    let sched = reactor.scheduler();

    let sock_a = mio::net::UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let sock_b = mio::net::UdpSocket::bind(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr_a = sock_a.local_addr().unwrap();
    let addr_b = sock_b.local_addr().unwrap();

    let transport_a = RudpTransport::new(
        &sched,
        sock_a,
        addr_b,
        b"a",
        b"b",
        config.clone(),
        None,
    )
    .unwrap();
    let transport_b = RudpTransport::new(
        &sched,
        sock_b,
        addr_a,
        b"b",
        b"a",
        config,
        None,
    )
    .unwrap();

    let agent_a = ByteAgent::new(&sched, 1 << 20, HalfClosePolicy::half_close(), None).unwrap();
    let agent_b = ByteAgent::new(&sched, 1 << 20, HalfClosePolicy::half_close(), None).unwrap();
    agent_a.byte_io().attach(&transport_a.byte_io()).unwrap();
    agent_b.byte_io().attach(&transport_b.byte_io()).unwrap();

    (
        Side {
            transport: transport_a,
            agent: agent_a,
        },
        Side {
            transport: transport_b,
            agent: agent_b,
        },
    )
}

#[test]
fn test_ideal_transfer_with_clean_close() {
    let mut reactor = Reactor::new(None).unwrap();
    let (a, b) = connect(&reactor, RudpConfig::default());

    assert!(reactor.run_until(Duration::from_secs(10), || {
        a.transport.validated() && b.transport.validated()
    }));

    // A sends a message and ends its stream
    a.agent.writer().write(b"hello world").unwrap();
    a.agent.writer().end_write(true);

    // B reads the exact bytes followed by a clean end-of-stream
    assert!(reactor.run_until(Duration::from_secs(10), || {
        b.agent.ended() == Some(true)
    }));

    let reader = b.agent.reader();
    let mut received = Vec::new();
    reader.read_to_end(&mut received, Some(Duration::from_millis(100))).unwrap();
    assert_eq!(received, b"hello world".to_vec());

    // B closes its (empty) stream too; both connections wind down cleanly
    b.agent.writer().end_write(true);
    assert!(reactor.run_until(Duration::from_secs(10), || {
        a.agent.ended() == Some(true)
    }));

    assert!(!a.transport.failed());
    assert!(!b.transport.failed());
}

#[test]
fn test_bulk_transfer_is_byte_exact() {
    let mut reactor = Reactor::new(None).unwrap();
    let (a, b) = connect(&reactor, RudpConfig::default());

    // A payload larger than the stream buffers exercises window flow
    let payload: Vec<u8> = (0..200_000u32).map(|idx| (idx * 31) as u8).collect();
    a.agent.writer().write(&payload).unwrap();
    a.agent.writer().end_write(true);

    let reader = b.agent.reader();
    let mut received = Vec::new();
    let expected = payload.len();

    assert!(reactor.run_until(Duration::from_secs(60), || {
        let mut chunk = [0u8; 16384];
        while let Ok(count) = reader.read(&mut chunk, Some(Duration::from_millis(1))) {
            if count == 0 {
                return true;
            }
            received.extend_from_slice(&chunk[..count]);
        }
        received.len() == expected && b.agent.ended() == Some(true)
    }));

    assert_eq!(received.len(), expected);
    assert_eq!(received, payload);
    assert!(!a.transport.failed());
    assert!(!b.transport.failed());
}

#[test]
fn test_lossy_transfer_recovers() {
    let mut reactor = Reactor::new(None).unwrap();

    // 30% uniform loss in both directions; retransmission carries it
    let config = RudpConfig {
        loss_rate: 30,
        rto_initial: 0.5,
        ..RudpConfig::default()
    };
    let (a, b) = connect(&reactor, config);

    let payload = vec![0u8; 65536];
    a.agent.writer().write(&payload).unwrap();
    a.agent.writer().end_write(true);

    let reader = b.agent.reader();
    let mut received = Vec::new();
    let expected = payload.len();

    assert!(reactor.run_until(Duration::from_secs(240), || {
        let mut chunk = [0u8; 16384];
        while let Ok(count) = reader.read(&mut chunk, Some(Duration::from_millis(1))) {
            if count == 0 {
                return true;
            }
            received.extend_from_slice(&chunk[..count]);
        }
        received.len() == expected && b.agent.ended() == Some(true)
    }));

    assert_eq!(received.len(), expected);
    assert_eq!(received, payload);

    // Loss never escalated to a connection failure
    assert!(!a.transport.failed());
    assert!(!b.transport.failed());
}

#[test]
fn test_abort_surfaces_as_unclean_close() {
    let mut reactor = Reactor::new(None).unwrap();
    let (a, b) = connect(&reactor, RudpConfig::default());

    assert!(reactor.run_until(Duration::from_secs(10), || {
        a.transport.validated() && b.transport.validated()
    }));

    a.transport.abort();

    // The local reader observes a terminal non-clean close
    let reader = a.agent.reader();
    let mut buf = [0u8; 16];
    let result = reader.read(&mut buf, Some(Duration::from_millis(200)));
    assert_eq!(result.unwrap_err(), quark::IoError::Ended(CloseReason::Lost));

    // Aborting again is a no-op
    a.transport.abort();
}
