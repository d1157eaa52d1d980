use clap::{App, Arg};
use quark::logging;
use tachyon::io::pipe::ByteAgent;
use tachyon::io::rudp::{RudpConfig, RudpTransport};
use tachyon::io::HalfClosePolicy;
use tachyon::reactor::Reactor;
use std::net::SocketAddr;
use std::time::Duration;

/// Sends a message over a reliable UDP connection, closes the output stream
/// and prints whatever the peer sends back until end-of-stream.
fn main() {
    let matches = App::new("RUDP Send")
        .about("Sends a message to an RUDP echo peer.")
        .arg(Arg::with_name("LOCAL").help("Local address to bind").required(true))
        .arg(Arg::with_name("PEER").help("Peer address").required(true))
        .arg(Arg::with_name("MESSAGE").help("Message to send").required(true))
        .arg(
            Arg::with_name("secret")
                .long("secret")
                .takes_value(true)
                .default_value("b")
                .help("Local authentication secret"),
        )
        .arg(
            Arg::with_name("peer-secret")
                .long("peer-secret")
                .takes_value(true)
                .default_value("a")
                .help("Peer authentication secret"),
        )
        .get_matches();

    let log = logging::init();

    let local: SocketAddr = matches.value_of("LOCAL").unwrap().parse().unwrap();
    let peer: SocketAddr = matches.value_of("PEER").unwrap().parse().unwrap();
    let message = matches.value_of("MESSAGE").unwrap().as_bytes().to_vec();
    let secret = matches.value_of("secret").unwrap().as_bytes().to_vec();
    let peer_secret = matches.value_of("peer-secret").unwrap().as_bytes().to_vec();

    let mut reactor = Reactor::new(&log).unwrap();
    let sched = reactor.scheduler();

    let sock = mio::net::UdpSocket::bind(&local).unwrap();
    let transport = RudpTransport::new(
        &sched,
        sock,
        peer,
        &secret,
        &peer_secret,
        RudpConfig::default(),
        &log,
    )
    .unwrap();

    let agent = ByteAgent::new(&sched, 65536, HalfClosePolicy::half_close(), &log).unwrap();
    agent.byte_io().attach(&transport.byte_io()).unwrap();

    let reader = agent.reader();
    let writer = agent.writer();
    let remote = reactor.remote();

    let exchange = std::thread::spawn(move || {
        writer.write(&message).unwrap();
        writer.end_write(true);

        let mut response = Vec::new();
        match reader.read_to_end(&mut response, Some(Duration::from_secs(30))) {
            Ok(()) => println!("{}", String::from_utf8_lossy(&response)),
            Err(err) => eprintln!("transfer failed: {:?}", err),
        }
        remote.shutdown();
    });

    reactor.run().unwrap();
    exchange.join().unwrap();
}
