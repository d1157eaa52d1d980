//! Producer/consumer flow-control substrate.
//!
//! Every data path in the framework is a chain of producer/consumer pairs.
//! A producer pushes data to its attached consumer; the consumer advertises a
//! cumulative credit limit bounding how much it will accept. Credit flows
//! against the data direction, data deliveries happen synchronously down the
//! chain, and credit notifications that could recurse are deferred through
//! the reactor's zero-delay task queue.
//!
//! Endpoints are owned by a single reactor thread. Attached peers hold strong
//! references to each other for the duration of the attachment; every close,
//! abort and failure path detaches, which is what breaks the reference cycle.

pub mod buffer;
pub mod entity;
pub mod link;
pub mod pipe;
pub mod rudp;
pub mod vec;
pub mod vop;

use quark::{IoError, IoResult};
use std::net::SocketAddr;
use std::rc::Rc;

pub use self::buffer::Buffer;

/// Cumulative credit limit advertised by a consumer. A negative value means
/// the producer may push without bound.
pub type Credit = i64;

/// Remaining headroom against a cumulative limit; negative means unbounded.
#[inline]
pub fn headroom(done: u64, lim: Credit) -> Credit {
    if lim < 0 {
        -1
    } else {
        (lim - done as Credit).max(0)
    }
}

/// Returns the smallest `lim - base` across the supplied limits, or -1 if
/// every limit is unbounded.
#[inline]
pub fn merge_lim(base: usize, lims: &[Credit]) -> Credit {
    let mut result: Credit = -1;
    for &lim in lims {
        if lim >= 0 {
            let rem = (lim - base as Credit).max(0);
            result = if result < 0 { rem } else { result.min(rem) };
        }
    }
    result
}

/// Applies a newly advertised cumulative limit to a producer's stored limit.
///
/// Limits are monotonic from the producer's perspective: duplicate or smaller
/// bounded limits are ignored. Returns true when the stored limit grew.
#[inline]
pub fn advance_lim(current: &mut Credit, new_lim: Credit) -> bool {
    if new_lim < 0 {
        if *current >= 0 {
            *current = -1;
            true
        } else {
            false
        }
    } else if *current >= 0 && *current < new_lim {
        *current = new_lim;
        true
    } else {
        false
    }
}

/// Runs a best-effort control delivery, ignoring a missing handler and any
/// other failure.
#[inline]
pub fn notify_best_effort<F: FnOnce() -> IoResult<()>>(notify: F) {
    drop(notify());
}

/// Endpoint role discriminator used for identity checks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Consumer,
    Producer,
}

/// Identity of an endpoint, stable across facade handles to the same
/// underlying component.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EndpointId {
    core: usize,
    role: Role,
}

impl EndpointId {
    #[inline]
    pub fn new<T>(core: &Rc<T>, role: Role) -> EndpointId {
        EndpointId {
            core: Rc::as_ptr(core) as usize,
            role,
        }
    }
}

/// Opaque credential material passed through the `Authorize` control message.
/// Consumed by secure transport factories; not interpreted by this crate.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub key: Vec<u8>,
    pub certificates: Vec<Vec<u8>>,
    pub identity: Option<String>,
    pub protocol: String,
}

/// Named control messages carried through an endpoint's control channel.
///
/// A handler that does not implement a given message answers
/// `Err(IoError::MissingControl)`, which callers must treat as benign.
#[derive(Debug)]
pub enum ControlMsg<'a> {
    /// The underlying transport reached its peer.
    Connected(&'a SocketAddr),
    NotifyConsumerAttached,
    NotifyProducerAttached,
    /// Request a re-notification of producer state (e.g. connectivity).
    ReqProducerState,
    Authorize(&'a AuthRequest),
    CanConnect(&'a SocketAddr),
}

/// Receives byte data pushed by an attached producer.
///
/// All methods must be invoked on the owning reactor thread.
pub trait ByteConsumer {
    /// Push data to the consumer. The consumer drains the bytes it accepts
    /// from the front of `data` (bounded by its advertised credit) and
    /// returns its new cumulative limit.
    fn consume(&self, data: &mut Buffer) -> IoResult<Credit>;

    /// Signals end-of-data; no further `consume` calls are accepted.
    fn end_consume(&self, clean: bool);

    /// Aborts this consumer's processing chain.
    fn abort(&self);

    /// Attach a producer, issuing the reciprocal attach on it. Idempotent
    /// for the already attached producer.
    fn attach(&self, producer: &ByteProducerRef) -> IoResult<()>;

    /// Severs the attachment in both directions.
    fn detach(&self);

    /// Delivers a named control message. The default handler reports the
    /// message as unsupported.
    fn control(&self, _msg: &ControlMsg) -> IoResult<()> {
        Err(IoError::MissingControl)
    }

    fn endpoint_id(&self) -> EndpointId;
}

/// Pushes byte data to an attached consumer, honoring its credit.
///
/// All methods must be invoked on the owning reactor thread.
pub trait ByteProducer {
    /// Updates the cumulative limit of bytes the attached consumer accepts.
    ///
    /// Implementations must not call `consume` on the attached consumer
    /// synchronously from this method; deliveries are deferred through the
    /// reactor to bound stack depth.
    fn can_produce(&self, limit: Credit);

    /// Aborts this producer's processing chain.
    fn abort(&self);

    /// Attach a consumer, issuing the reciprocal attach on it. Idempotent
    /// for the already attached consumer.
    fn attach(&self, consumer: &ByteConsumerRef) -> IoResult<()>;

    /// Severs the attachment in both directions.
    fn detach(&self);

    /// Delivers a named control message. The default handler reports the
    /// message as unsupported.
    fn control(&self, _msg: &ControlMsg) -> IoResult<()> {
        Err(IoError::MissingControl)
    }

    fn endpoint_id(&self) -> EndpointId;
}

pub type ByteConsumerRef = Rc<dyn ByteConsumer>;
pub type ByteProducerRef = Rc<dyn ByteProducer>;

/// A consumer/producer pair making up one end of a duplex byte channel.
pub struct ByteIoPair {
    pub consumer: ByteConsumerRef,
    pub producer: ByteProducerRef,
}

impl ByteIoPair {
    pub fn new(consumer: ByteConsumerRef, producer: ByteProducerRef) -> ByteIoPair {
        ByteIoPair { consumer, producer }
    }

    /// Cross-attaches two pairs: our consumer to their producer and our
    /// producer to their consumer.
    pub fn attach(&self, other: &ByteIoPair) -> IoResult<()> {
        self.consumer.attach(&other.producer)?;
        self.producer.attach(&other.consumer)
    }

    /// Aborts both directions.
    pub fn abort(&self) {
        self.consumer.abort();
        self.producer.abort();
    }
}

/// Governs whether one direction of a duplex channel may close while the
/// other stays open.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HalfClosePolicy {
    pub half_in: bool,
    pub half_out: bool,
}

impl HalfClosePolicy {
    /// Allows half-close in both directions.
    pub fn half_close() -> HalfClosePolicy {
        HalfClosePolicy {
            half_in: true,
            half_out: true,
        }
    }

    /// Closing either direction closes both.
    pub fn full_close() -> HalfClosePolicy {
        HalfClosePolicy {
            half_in: false,
            half_out: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headroom() {
        assert_eq!(headroom(10, -1), -1);
        assert_eq!(headroom(10, 25), 15);
        assert_eq!(headroom(25, 10), 0);
    }

    #[test]
    fn test_merge_lim() {
        assert_eq!(merge_lim(5, &[-1, -1]), -1);
        assert_eq!(merge_lim(5, &[20, -1]), 15);
        assert_eq!(merge_lim(5, &[20, 8]), 3);
        assert_eq!(merge_lim(10, &[8]), 0);
        assert_eq!(merge_lim(0, &[]), -1);
    }

    #[test]
    fn test_advance_lim_is_monotonic() {
        let mut lim: Credit = 0;
        assert!(advance_lim(&mut lim, 10));
        assert_eq!(lim, 10);

        // Duplicate and smaller limits are ignored
        assert!(!advance_lim(&mut lim, 10));
        assert!(!advance_lim(&mut lim, 5));
        assert_eq!(lim, 10);

        assert!(advance_lim(&mut lim, 11));
        assert_eq!(lim, 11);

        // Unbounded supersedes bounded, and stays
        assert!(advance_lim(&mut lim, -1));
        assert_eq!(lim, -1);
        assert!(!advance_lim(&mut lim, 100));
        assert_eq!(lim, -1);
    }
}
