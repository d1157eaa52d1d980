#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

//! Reactor-driven byte pipeline framework with a reliable UDP transport.
//!
//! The crate is organized around a producer/consumer flow-control substrate
//! (`io`), a single-threaded reactor (`reactor`), and the transports and
//! channel bridges built on top of them: the reliable UDP transport
//! (`io::rudp`), the entity channel serializer (`io::vec`), the
//! object-protocol handshake bridge (`io::vop`) and the link adapter
//! (`io::link`).

pub mod io;
pub mod reactor;

pub mod prelude {
    pub use crate::io::{
        ByteConsumer, ByteIoPair, ByteProducer, ControlMsg, Credit, HalfClosePolicy,
    };
    pub use crate::reactor::{Reactor, Scheduler};
    pub use quark::{CloseReason, ErrorUtils, IoError, IoResult};
}
