//! Link adapter.
//!
//! Hooks a remote-object link's entity I/O to a byte transport: the link's
//! entity pair attaches to the entity channel serializer, whose byte side
//! either attaches straight to the transport or goes through the
//! object-protocol handshake bridge first. The adapter can lazily create and
//! own its reactor; an owned reactor is stopped on final shutdown.

use crate::io::entity::EntityIoPair;
use crate::io::rudp::{HostFilter, RudpConfig, RudpTransport};
use crate::io::vec::{EntitySerializer, Frame, FrameCodec, SerializerConfig};
use crate::io::vop::{SecureFactory, VopBridge};
use crate::io::ByteIoPair;
use crate::reactor::{Reactor, RemoteHandle, Scheduler};
use quark::logging;
use quark::IoResult;
use std::net::SocketAddr;
use std::time::Duration;

/// A remote-object link, seen by the adapter only through its entity
/// endpoint and its shutdown notification.
pub trait Link {
    /// The entity interface carrying the link's message traffic.
    fn entity_io(&self, sched: &Scheduler) -> IoResult<EntityIoPair<Frame>>;

    /// Informs the link that its session ended.
    fn shutdown(&self, clean: bool);
}

/// Which side of the object-protocol handshake this link plays.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VopRole {
    Client,
    Server,
}

/// Configuration of the optional object-protocol bridge under the channel.
pub struct VopOptions {
    pub role: VopRole,
    pub vts: Option<SecureFactory>,
    pub tls: Option<SecureFactory>,
    pub insecure: bool,
    /// Deadline for completing the transport negotiation.
    pub handshake_timeout: Option<Duration>,
}

impl VopOptions {
    /// Plaintext-only bridge for the given role.
    pub fn insecure(role: VopRole) -> VopOptions {
        VopOptions {
            role,
            vts: None,
            tls: None,
            insecure: true,
            handshake_timeout: None,
        }
    }
}

/// A wired link session: the serializer and optional bridge backing one
/// link's byte channel.
pub struct LinkSession {
    serializer: EntitySerializer<FrameCodec>,
    bridge: Option<VopBridge>,
}

impl LinkSession {
    /// True while any stage of the session handshake is incomplete.
    pub fn handshaking(&self) -> bool {
        if self.serializer.handshaking() {
            return true;
        }
        match &self.bridge {
            Some(bridge) => bridge.handshaking(),
            None => false,
        }
    }

    /// True if the bridge negotiation failed.
    pub fn failed(&self) -> bool {
        match &self.bridge {
            Some(bridge) => bridge.handshake_failed(),
            None => false,
        }
    }

    /// Aborts the whole session pipeline.
    pub fn abort(&self) {
        if let Some(bridge) = &self.bridge {
            bridge.abort();
        }
        self.serializer.abort();
    }
}

/// Convenience owner wiring links to transports on a reactor.
pub struct LinkAgent {
    reactor: Option<Reactor>,
    remote: Option<RemoteHandle>,
    sched: Scheduler,
    log: logging::Logger,
}

impl LinkAgent {
    /// Creates an agent using an externally driven reactor.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(sched: &Scheduler, log: L) -> LinkAgent {
        LinkAgent {
            reactor: None,
            remote: None,
            sched: sched.clone(),
            log: logging::child_or_discard(log),
        }
    }

    /// Creates an agent that lazily owns its reactor. The reactor is driven
    /// by [`LinkAgent::run`] and stopped by [`LinkAgent::stop`].
    pub fn with_own_reactor<'a, L: Into<Option<&'a logging::Logger>>>(
        log: L,
    ) -> IoResult<LinkAgent> {
        let log = logging::child_or_discard(log);
        let reactor = Reactor::new(&log)?;
        let sched = reactor.scheduler();
        let remote = reactor.remote();
        Ok(LinkAgent {
            reactor: Some(reactor),
            remote: Some(remote),
            sched,
            log,
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        self.sched.clone()
    }

    /// Wires a link to a byte transport: link entity I/O through the entity
    /// channel serializer and, when `vop` is set, the handshake bridge.
    pub fn attach_link(
        &self,
        link: &dyn Link,
        transport: &ByteIoPair,
        codec: FrameCodec,
        vec_conf: SerializerConfig,
        vop: Option<VopOptions>,
    ) -> IoResult<LinkSession> {
        let serializer = EntitySerializer::new(&self.sched, codec, vec_conf, &self.log);
        let link_io = link.entity_io(&self.sched)?;
        serializer.entity_io().attach(&link_io)?;

        let bridge = match vop {
            None => {
                serializer.byte_io().attach(transport)?;
                None
            }
            Some(options) => {
                let bridge = match options.role {
                    VopRole::Client => VopBridge::client(
                        &self.sched,
                        serializer.byte_io(),
                        options.vts,
                        options.tls,
                        options.insecure,
                        &self.log,
                    )?,
                    VopRole::Server => VopBridge::server(
                        &self.sched,
                        serializer.byte_io(),
                        options.vts,
                        options.tls,
                        options.insecure,
                        &self.log,
                    )?,
                };
                bridge.external_io().attach(transport)?;

                if let Some(timeout) = options.handshake_timeout {
                    let probe = bridge.clone();
                    let channel = serializer.clone();
                    let log = self.log.clone();
                    self.sched.schedule(timeout, move || {
                        if probe.handshaking() || channel.handshaking() {
                            logging::debug!(log, "link handshake deadline exceeded");
                            probe.abort();
                            channel.abort();
                        }
                    });
                }
                Some(bridge)
            }
        };

        logging::debug!(self.log, "link attached"; "bridged" => bridge.is_some());
        Ok(LinkSession { serializer, bridge })
    }

    /// Builds a reliable UDP transport to `peer` and wires the link over it.
    pub fn connect_rudp(
        &self,
        link: &dyn Link,
        sock: mio::net::UdpSocket,
        peer: SocketAddr,
        secret: &[u8],
        peer_secret: &[u8],
        config: RudpConfig,
        filter: &dyn HostFilter,
        codec: FrameCodec,
        vec_conf: SerializerConfig,
        vop: Option<VopOptions>,
    ) -> IoResult<(RudpTransport, LinkSession)> {
        let transport = RudpTransport::with_filter(
            &self.sched,
            sock,
            peer,
            secret,
            peer_secret,
            config,
            filter,
            &self.log,
        )?;
        let session = self.attach_link(link, &transport.byte_io(), codec, vec_conf, vop)?;
        Ok((transport, session))
    }

    /// Drives an owned reactor until [`LinkAgent::stop`] is called. A no-op
    /// for agents on an external reactor.
    pub fn run(&mut self) -> IoResult<()> {
        match &mut self.reactor {
            Some(reactor) => reactor.run(),
            None => Ok(()),
        }
    }

    /// Runs an owned reactor until the predicate holds or the timeout
    /// elapses.
    pub fn run_until<F: FnMut() -> bool>(&mut self, timeout: Duration, pred: F) -> bool {
        match &mut self.reactor {
            Some(reactor) => reactor.run_until(timeout, pred),
            None => false,
        }
    }

    /// Stops a lazily created reactor. Safe to call from any thread via the
    /// stored remote handle.
    pub fn stop(&self) {
        if let Some(remote) = &self.remote {
            remote.shutdown();
        }
    }
}
