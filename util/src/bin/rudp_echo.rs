use clap::{App, Arg};
use quark::logging;
use tachyon::io::pipe::ByteAgent;
use tachyon::io::rudp::{RudpConfig, RudpTransport};
use tachyon::io::HalfClosePolicy;
use tachyon::reactor::Reactor;
use std::net::SocketAddr;
use std::time::Duration;

/// Echoes every byte received over a reliable UDP connection back to the
/// peer, until the peer closes its stream.
fn main() {
    let matches = App::new("RUDP Echo")
        .about("Runs an echo peer over the reliable UDP transport.")
        .arg(Arg::with_name("LOCAL").help("Local address to bind").required(true))
        .arg(Arg::with_name("PEER").help("Peer address").required(true))
        .arg(
            Arg::with_name("secret")
                .long("secret")
                .takes_value(true)
                .default_value("a")
                .help("Local authentication secret"),
        )
        .arg(
            Arg::with_name("peer-secret")
                .long("peer-secret")
                .takes_value(true)
                .default_value("b")
                .help("Peer authentication secret"),
        )
        .get_matches();

    let log = logging::init();

    let local: SocketAddr = matches.value_of("LOCAL").unwrap().parse().unwrap();
    let peer: SocketAddr = matches.value_of("PEER").unwrap().parse().unwrap();
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

    let echo = std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf, None) {
                Ok(0) => {
                    writer.end_write(true);
                    break;
                }
                Ok(count) => {
                    if writer.write(&buf[..count]).is_err() {
                        break;
                    }
                }
                Err(_) => {
                    writer.end_write(false);
                    break;
                }
            }
        }
        remote.shutdown();
    });

    logging::info!(log, "echo peer running"; "local" => %local, "peer" => %peer);
    reactor.run_until(Duration::from_secs(3600), || false);
    echo.join().unwrap();
}
