//! Concrete byte pipe endpoints.
//!
//! `ByteSink` is a leaf consumer buffering received bytes for a reader;
//! `ByteWriter` is a leaf producer fed from a thread-safe write buffer;
//! `ByteAgent` pairs the two into a duplex endpoint governed by a
//! half-close policy. The sink and writer are the adaptation points between
//! the reactor-owned pipeline and synchronous callers: their `BlockingReader`
//! and `WriterHandle` handles may be used from any thread and signal the
//! reactor through a user-space readiness registration.

use crate::io::{
    headroom, Buffer, ByteConsumer, ByteConsumerRef, ByteIoPair, ByteProducer, ByteProducerRef,
    ControlMsg, Credit, EndpointId, HalfClosePolicy, Role,
};
use crate::reactor::{IoHandler, Scheduler};
use quark::logging;
use quark::{CloseReason, IoError, IoResult};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

// ================================================================= ByteSink

struct SinkQueue {
    data: VecDeque<u8>,
    eod: Option<bool>,
    aborted: bool,
}

struct SinkShared {
    queue: Mutex<SinkQueue>,
    cond: Condvar,
}

struct SinkState {
    producer: Option<ByteProducerRef>,
    consumed: u64,
    lim_sent: Credit,
    eod: bool,
    aborted: bool,
}

struct SinkCore {
    sched: Scheduler,
    capacity: usize,
    shared: Arc<SinkShared>,
    state: RefCell<SinkState>,
    registration: mio::Registration,
    readiness: mio::SetReadiness,
    token: Cell<Option<mio::Token>>,
    log: logging::Logger,
}

/// Leaf byte consumer buffering received data for a reader.
///
/// The buffered data can be drained on the reactor thread with `pop`, or from
/// any thread through a [`BlockingReader`]. Draining frees credit, which is
/// re-advertised to the attached producer on the next reactor dispatch.
pub struct ByteSink {
    core: Rc<SinkCore>,
}

impl ByteSink {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        capacity: usize,
        log: L,
    ) -> IoResult<ByteSink> {
        let (registration, readiness) = mio::Registration::new2();
        let core = Rc::new(SinkCore {
            sched: sched.clone(),
            capacity,
            shared: Arc::new(SinkShared {
                queue: Mutex::new(SinkQueue {
                    data: VecDeque::new(),
                    eod: None,
                    aborted: false,
                }),
                cond: Condvar::new(),
            }),
            state: RefCell::new(SinkState {
                producer: None,
                consumed: 0,
                lim_sent: 0,
                eod: false,
                aborted: false,
            }),
            registration,
            readiness,
            token: Cell::new(None),
            log: logging::child_or_discard(log),
        });

        let handler = Rc::new(SinkHandler { core: core.clone() });
        let token = sched.register(&core.registration, mio::Ready::readable(), handler)?;
        core.token.set(Some(token));

        Ok(ByteSink { core })
    }

    /// The consumer interface to this sink.
    pub fn byte_consume(&self) -> ByteConsumerRef {
        Rc::new(SinkConsumerFacade {
            core: self.core.clone(),
        })
    }

    /// Thread-safe reader handle draining this sink.
    pub fn reader(&self) -> BlockingReader {
        BlockingReader {
            shared: self.core.shared.clone(),
            readiness: self.core.readiness.clone(),
        }
    }

    /// Drains up to `max` buffered bytes without blocking.
    pub fn pop(&self, max: usize) -> Vec<u8> {
        let out = {
            let mut queue = self.core.shared.queue.lock().expect("Sink queue poisoned");
            let count = max.min(queue.data.len());
            queue.data.drain(..count).collect()
        };
        drop(self.core.readiness.set_readiness(mio::Ready::readable()));
        out
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        let queue = self.core.shared.queue.lock().expect("Sink queue poisoned");
        queue.data.len()
    }

    /// End-of-data marker: `None` while open, otherwise the clean flag.
    pub fn ended(&self) -> Option<bool> {
        let queue = self.core.shared.queue.lock().expect("Sink queue poisoned");
        queue.eod
    }

    /// Closes the sink locally, aborting the attached producer chain.
    pub fn close(&self, reason: CloseReason) {
        SinkCore::close(&self.core, reason);
    }

    pub fn abort(&self) {
        SinkCore::abort(&self.core);
    }
}

impl SinkCore {
    fn free_capacity(&self) -> usize {
        let queue = self.shared.queue.lock().expect("Sink queue poisoned");
        self.capacity.saturating_sub(queue.data.len())
    }

    fn consume(core: &Rc<SinkCore>, data: &mut Buffer) -> IoResult<Credit> {
        {
            let state = core.state.borrow();
            if state.eod {
                return Err(IoError::Closed);
            }
            if state.producer.is_none() {
                return Err(IoError::Contract("no attached producer"));
            }
            if data.is_empty() {
                return Err(IoError::Contract("no data to consume"));
            }
            if headroom(state.consumed, state.lim_sent) == 0 {
                return Err(IoError::Contract("consume limit exceeded"));
            }
        }

        let free = core.free_capacity();
        let take = {
            let state = core.state.borrow();
            let mut take = free.min(data.len());
            let room = headroom(state.consumed, state.lim_sent);
            if room >= 0 {
                take = take.min(room as usize);
            }
            take
        };

        let bytes = data.pop(take);
        let new_lim = {
            let mut queue = core.shared.queue.lock().expect("Sink queue poisoned");
            queue.data.extend(bytes);
            let free = core.capacity.saturating_sub(queue.data.len());

            let mut state = core.state.borrow_mut();
            state.consumed += take as u64;
            state.lim_sent = state.consumed as Credit + free as Credit;
            state.lim_sent
        };
        core.shared.cond.notify_all();

        Ok(new_lim)
    }

    fn end_consume(core: &Rc<SinkCore>, clean: bool) {
        {
            let mut state = core.state.borrow_mut();
            if state.eod {
                return;
            }
            state.eod = true;
        }
        {
            let mut queue = core.shared.queue.lock().expect("Sink queue poisoned");
            if queue.eod.is_none() {
                queue.eod = Some(clean);
            }
        }
        core.shared.cond.notify_all();
        logging::debug!(core.log, "sink end-of-data"; "clean" => clean);
        Self::detach(core);
        Self::unregister(core);
    }

    fn abort(core: &Rc<SinkCore>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.eod = true;
            state.producer.take()
        };
        {
            let mut queue = core.shared.queue.lock().expect("Sink queue poisoned");
            queue.aborted = true;
            if queue.eod.is_none() {
                queue.eod = Some(false);
            }
        }
        core.shared.cond.notify_all();
        logging::debug!(core.log, "sink aborted");

        if let Some(producer) = producer {
            producer.abort();
            producer.detach();
        }
        Self::unregister(core);
    }

    fn close(core: &Rc<SinkCore>, reason: CloseReason) {
        {
            let mut queue = core.shared.queue.lock().expect("Sink queue poisoned");
            if queue.eod.is_none() {
                queue.eod = Some(reason.is_clean());
            }
        }
        Self::abort(core);
    }

    fn attach(core: &Rc<SinkCore>, producer: &ByteProducerRef) -> IoResult<()> {
        let initial_lim = {
            let state = core.state.borrow();
            if let Some(current) = &state.producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("producer already attached"));
            }
            if state.eod {
                return Err(IoError::Closed);
            }
            drop(state);

            let mut state = core.state.borrow_mut();
            state.producer = Some(producer.clone());
            state.consumed = 0;
            state.lim_sent = core.free_capacity() as Credit;
            state.lim_sent
        };

        producer.attach(&Self::facade(core))?;
        producer.can_produce(initial_lim);
        crate::io::notify_best_effort(|| producer.control(&ControlMsg::NotifyConsumerAttached));
        Ok(())
    }

    fn detach(core: &Rc<SinkCore>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            match state.producer.take() {
                Some(producer) => {
                    state.consumed = 0;
                    state.lim_sent = 0;
                    producer
                }
                None => return,
            }
        };
        producer.detach();
    }

    fn facade(core: &Rc<SinkCore>) -> ByteConsumerRef {
        Rc::new(SinkConsumerFacade { core: core.clone() })
    }

    fn unregister(core: &Rc<SinkCore>) {
        if let Some(token) = core.token.take() {
            drop(core.sched.deregister(&core.registration, token));
        }
    }

    /// Re-advertises credit after a reader drained the queue.
    fn update_limit(core: &Rc<SinkCore>) {
        drop(core.readiness.set_readiness(mio::Ready::empty()));

        let (producer, lim) = {
            let mut state = core.state.borrow_mut();
            if state.eod || state.producer.is_none() {
                return;
            }
            let free = core.free_capacity();
            let lim = state.consumed as Credit + free as Credit;
            if lim <= state.lim_sent {
                return;
            }
            state.lim_sent = lim;
            (state.producer.clone(), lim)
        };

        if let Some(producer) = producer {
            producer.can_produce(lim);
        }
    }
}

struct SinkHandler {
    core: Rc<SinkCore>,
}

impl IoHandler for SinkHandler {
    fn ready(&self, _ready: mio::Ready) {
        SinkCore::update_limit(&self.core);
    }
}

struct SinkConsumerFacade {
    core: Rc<SinkCore>,
}

impl ByteConsumer for SinkConsumerFacade {
    fn consume(&self, data: &mut Buffer) -> IoResult<Credit> {
        SinkCore::consume(&self.core, data)
    }

    fn end_consume(&self, clean: bool) {
        SinkCore::end_consume(&self.core, clean)
    }

    fn abort(&self) {
        SinkCore::abort(&self.core)
    }

    fn attach(&self, producer: &ByteProducerRef) -> IoResult<()> {
        SinkCore::attach(&self.core, producer)
    }

    fn detach(&self) {
        SinkCore::detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Consumer)
    }
}

/// Thread-safe blocking reader over a [`ByteSink`].
#[derive(Clone)]
pub struct BlockingReader {
    shared: Arc<SinkShared>,
    readiness: mio::SetReadiness,
}

impl BlockingReader {
    /// Reads available bytes into `buf`, blocking up to `timeout`.
    ///
    /// Returns `Ok(0)` on clean end-of-data. A non-clean close surfaces as
    /// `IoError::Ended` and an exceeded deadline as `IoError::Timeout`.
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> IoResult<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.shared.queue.lock().expect("Sink queue poisoned");

        loop {
            if !queue.data.is_empty() {
                let count = buf.len().min(queue.data.len());
                for (idx, byte) in queue.data.drain(..count).enumerate() {
                    buf[idx] = byte;
                }
                drop(queue);
                drop(self.readiness.set_readiness(mio::Ready::readable()));
                return Ok(count);
            }

            if queue.aborted {
                return Err(IoError::Ended(CloseReason::Lost));
            }
            match queue.eod {
                Some(true) => return Ok(0),
                Some(false) => return Err(IoError::Ended(CloseReason::Lost)),
                None => {}
            }

            queue = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(IoError::Timeout);
                    }
                    let (queue, result) = self
                        .shared
                        .cond
                        .wait_timeout(queue, deadline - now)
                        .expect("Sink queue poisoned");
                    if result.timed_out() && queue.data.is_empty() && queue.eod.is_none() {
                        return Err(IoError::Timeout);
                    }
                    queue
                }
                None => self.shared.cond.wait(queue).expect("Sink queue poisoned"),
            };
        }
    }

    /// Reads until clean end-of-data, appending everything to `out`.
    pub fn read_to_end(&self, out: &mut Vec<u8>, timeout: Option<Duration>) -> IoResult<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.read(&mut chunk, timeout)? {
                0 => return Ok(()),
                count => out.extend_from_slice(&chunk[..count]),
            }
        }
    }
}

// =============================================================== ByteWriter

struct WriterQueue {
    data: VecDeque<u8>,
    eod: bool,
    eod_clean: bool,
    abort_requested: bool,
}

struct WriterShared {
    queue: Mutex<WriterQueue>,
}

struct WriterState {
    consumer: Option<ByteConsumerRef>,
    produced: u64,
    prod_lim: Credit,
    sent_eod: bool,
    aborted: bool,
}

struct WriterCore {
    sched: Scheduler,
    shared: Arc<WriterShared>,
    state: RefCell<WriterState>,
    registration: mio::Registration,
    readiness: mio::SetReadiness,
    token: Cell<Option<mio::Token>>,
    log: logging::Logger,
}

/// Leaf byte producer fed from a thread-safe write buffer.
///
/// The [`WriterHandle`] is the only cross-thread-writable surface of a
/// pipeline: writes append to a locked buffer and wake the reactor, which
/// drains the buffer into the attached consumer within its credit.
pub struct ByteWriter {
    core: Rc<WriterCore>,
}

impl ByteWriter {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        log: L,
    ) -> IoResult<ByteWriter> {
        let (registration, readiness) = mio::Registration::new2();
        let core = Rc::new(WriterCore {
            sched: sched.clone(),
            shared: Arc::new(WriterShared {
                queue: Mutex::new(WriterQueue {
                    data: VecDeque::new(),
                    eod: false,
                    eod_clean: true,
                    abort_requested: false,
                }),
            }),
            state: RefCell::new(WriterState {
                consumer: None,
                produced: 0,
                prod_lim: 0,
                sent_eod: false,
                aborted: false,
            }),
            registration,
            readiness,
            token: Cell::new(None),
            log: logging::child_or_discard(log),
        });

        let handler = Rc::new(WriterHandler { core: core.clone() });
        let token = sched.register(&core.registration, mio::Ready::readable(), handler)?;
        core.token.set(Some(token));

        Ok(ByteWriter { core })
    }

    /// The producer interface to this writer.
    pub fn byte_produce(&self) -> ByteProducerRef {
        Rc::new(WriterProducerFacade {
            core: self.core.clone(),
        })
    }

    /// Thread-safe handle for feeding the writer.
    pub fn handle(&self) -> WriterHandle {
        WriterHandle {
            shared: self.core.shared.clone(),
            readiness: self.core.readiness.clone(),
        }
    }

    pub fn abort(&self) {
        WriterCore::abort(&self.core);
    }
}

impl WriterCore {
    fn do_produce(core: &Rc<WriterCore>) {
        drop(core.readiness.set_readiness(mio::Ready::empty()));

        // Apply an abort requested through the handle
        let abort_requested = {
            let queue = core.shared.queue.lock().expect("Writer queue poisoned");
            queue.abort_requested
        };
        if abort_requested {
            Self::abort(core);
            return;
        }

        loop {
            let (consumer, chunk, eod, eod_clean) = {
                let state = core.state.borrow();
                if state.aborted || state.sent_eod {
                    return;
                }
                let consumer = match &state.consumer {
                    Some(consumer) => consumer.clone(),
                    None => return,
                };

                let room = headroom(state.produced, state.prod_lim);
                if room == 0 {
                    return;
                }

                let mut queue = core.shared.queue.lock().expect("Writer queue poisoned");
                let take = match room {
                    r if r < 0 => queue.data.len(),
                    r => queue.data.len().min(r as usize),
                };
                let chunk: Vec<u8> = queue.data.drain(..take).collect();
                (consumer, chunk, queue.eod, queue.eod_clean)
            };

            if chunk.is_empty() {
                // The write buffer is drained; deliver a pending end-of-data
                if eod {
                    let notify = {
                        let mut state = core.state.borrow_mut();
                        if state.sent_eod {
                            false
                        } else {
                            state.sent_eod = true;
                            true
                        }
                    };
                    if notify {
                        consumer.end_consume(eod_clean);
                        logging::debug!(core.log, "writer delivered end-of-data";
                                        "clean" => eod_clean);
                    }
                }
                return;
            }

            let mut buf = Buffer::new(chunk.len());
            buf.append(&chunk);
            let result = consumer.consume(&mut buf);

            // Bytes the consumer did not accept go back to the front of the
            // write buffer, preserving order.
            let leftover = buf.pop_all();
            let accepted = chunk.len() - leftover.len();
            if !leftover.is_empty() {
                let mut queue = core.shared.queue.lock().expect("Writer queue poisoned");
                for byte in leftover.into_iter().rev() {
                    queue.data.push_front(byte);
                }
            }

            match result {
                Ok(new_lim) => {
                    let blocked = {
                        let mut state = core.state.borrow_mut();
                        state.produced += accepted as u64;
                        state.prod_lim = new_lim;
                        headroom(state.produced, state.prod_lim) == 0
                    };
                    if blocked || accepted == 0 {
                        return;
                    }
                }
                Err(IoError::Wait) | Err(IoError::MissingControl) => return,
                Err(err) => {
                    logging::debug!(core.log, "writer consume failed"; "err" => ?err);
                    Self::abort(core);
                    return;
                }
            }
        }
    }

    fn abort(core: &Rc<WriterCore>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.produced = 0;
            state.prod_lim = 0;
            state.consumer.take()
        };
        {
            let mut queue = core.shared.queue.lock().expect("Writer queue poisoned");
            queue.eod = true;
            queue.data.clear();
        }
        logging::debug!(core.log, "writer aborted");

        if let Some(consumer) = consumer {
            consumer.abort();
            consumer.detach();
        }
        if let Some(token) = core.token.take() {
            drop(core.sched.deregister(&core.registration, token));
        }
    }

    fn can_produce(core: &Rc<WriterCore>, limit: Credit) {
        let grew = {
            let mut state = core.state.borrow_mut();
            if state.consumer.is_none() {
                return;
            }
            crate::io::advance_lim(&mut state.prod_lim, limit)
        };
        if grew {
            let core = core.clone();
            core.sched.clone().defer(move || WriterCore::do_produce(&core));
        }
    }

    fn attach(core: &Rc<WriterCore>, consumer: &ByteConsumerRef) -> IoResult<()> {
        {
            let state = core.state.borrow();
            if let Some(current) = &state.consumer {
                if current.endpoint_id() == consumer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("consumer already attached"));
            }
            if state.sent_eod {
                return Err(IoError::Closed);
            }
        }
        {
            let mut state = core.state.borrow_mut();
            state.consumer = Some(consumer.clone());
            state.produced = 0;
            state.prod_lim = 0;
        }

        consumer.attach(&Self::facade(core))?;
        crate::io::notify_best_effort(|| consumer.control(&ControlMsg::NotifyProducerAttached));
        Ok(())
    }

    fn detach(core: &Rc<WriterCore>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            match state.consumer.take() {
                Some(consumer) => {
                    state.produced = 0;
                    state.prod_lim = 0;
                    consumer
                }
                None => return,
            }
        };
        consumer.detach();
    }

    fn facade(core: &Rc<WriterCore>) -> ByteProducerRef {
        Rc::new(WriterProducerFacade { core: core.clone() })
    }
}

struct WriterHandler {
    core: Rc<WriterCore>,
}

impl IoHandler for WriterHandler {
    fn ready(&self, _ready: mio::Ready) {
        WriterCore::do_produce(&self.core);
    }
}

struct WriterProducerFacade {
    core: Rc<WriterCore>,
}

impl ByteProducer for WriterProducerFacade {
    fn can_produce(&self, limit: Credit) {
        WriterCore::can_produce(&self.core, limit)
    }

    fn abort(&self) {
        WriterCore::abort(&self.core)
    }

    fn attach(&self, consumer: &ByteConsumerRef) -> IoResult<()> {
        WriterCore::attach(&self.core, consumer)
    }

    fn detach(&self) {
        WriterCore::detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Producer)
    }
}

/// Thread-safe handle feeding a [`ByteWriter`].
#[derive(Clone)]
pub struct WriterHandle {
    shared: Arc<WriterShared>,
    readiness: mio::SetReadiness,
}

impl WriterHandle {
    /// Appends data to the write buffer and wakes the reactor.
    pub fn write(&self, data: &[u8]) -> IoResult<()> {
        {
            let mut queue = self.shared.queue.lock().expect("Writer queue poisoned");
            if queue.eod {
                return Err(IoError::Closed);
            }
            queue.data.extend(data.iter().cloned());
        }
        drop(self.readiness.set_readiness(mio::Ready::readable()));
        Ok(())
    }

    /// Marks end-of-data; buffered bytes are still delivered first.
    pub fn end_write(&self, clean: bool) {
        {
            let mut queue = self.shared.queue.lock().expect("Writer queue poisoned");
            if !queue.eod {
                queue.eod = true;
                queue.eod_clean = clean;
            }
        }
        drop(self.readiness.set_readiness(mio::Ready::readable()));
    }

    /// Requests an abort of the writer's pipeline.
    pub fn abort_writer(&self) {
        {
            let mut queue = self.shared.queue.lock().expect("Writer queue poisoned");
            queue.abort_requested = true;
            queue.eod = true;
            queue.data.clear();
        }
        drop(self.readiness.set_readiness(mio::Ready::readable()));
    }
}

// ================================================================= BytePipe

struct PipeState {
    buf: Buffer,
    up_producer: Option<ByteProducerRef>,
    consumed: u64,
    lim_sent: Credit,
    eod_in: bool,
    eod_clean: bool,
    down_consumer: Option<ByteConsumerRef>,
    produced: u64,
    prod_lim: Credit,
    sent_eod: bool,
    aborted: bool,
}

struct PipeCore {
    sched: Scheduler,
    capacity: usize,
    state: RefCell<PipeState>,
    log: logging::Logger,
}

/// Bounded pass-through byte pipe: a consumer endpoint buffering into a
/// producer endpoint, relaying credit in both directions.
pub struct BytePipe {
    core: Rc<PipeCore>,
}

impl BytePipe {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        capacity: usize,
        log: L,
    ) -> BytePipe {
        BytePipe {
            core: Rc::new(PipeCore {
                sched: sched.clone(),
                capacity,
                state: RefCell::new(PipeState {
                    buf: Buffer::new(capacity),
                    up_producer: None,
                    consumed: 0,
                    lim_sent: 0,
                    eod_in: false,
                    eod_clean: true,
                    down_consumer: None,
                    produced: 0,
                    prod_lim: 0,
                    sent_eod: false,
                    aborted: false,
                }),
                log: logging::child_or_discard(log),
            }),
        }
    }

    /// The upstream-facing consumer endpoint.
    pub fn byte_consume(&self) -> ByteConsumerRef {
        Rc::new(PipeConsumerFacade {
            core: self.core.clone(),
        })
    }

    /// The downstream-facing producer endpoint.
    pub fn byte_produce(&self) -> ByteProducerRef {
        Rc::new(PipeProducerFacade {
            core: self.core.clone(),
        })
    }
}

impl PipeCore {
    fn consume(core: &Rc<PipeCore>, data: &mut Buffer) -> IoResult<Credit> {
        let new_lim = {
            let mut state = core.state.borrow_mut();
            if state.eod_in {
                return Err(IoError::Closed);
            }
            if state.up_producer.is_none() {
                return Err(IoError::Contract("no attached producer"));
            }
            if data.is_empty() {
                return Err(IoError::Contract("no data to consume"));
            }
            let room = headroom(state.consumed, state.lim_sent);
            if room == 0 {
                return Err(IoError::Contract("consume limit exceeded"));
            }

            let mut take = core.capacity.saturating_sub(state.buf.len()).min(data.len());
            if room > 0 {
                take = take.min(room as usize);
            }
            let moved = data.transfer(&mut state.buf, take);
            state.consumed += moved as u64;

            let free = core.capacity.saturating_sub(state.buf.len());
            state.lim_sent = state.consumed as Credit + free as Credit;
            state.lim_sent
        };

        let core = core.clone();
        core.sched.clone().defer(move || Self::do_produce(&core));
        Ok(new_lim)
    }

    fn do_produce(core: &Rc<PipeCore>) {
        let (consumer, mut buf, eod, eod_clean) = {
            let mut state = core.state.borrow_mut();
            if state.aborted || state.sent_eod {
                return;
            }
            let consumer = match &state.down_consumer {
                Some(consumer) => consumer.clone(),
                None => return,
            };
            let room = headroom(state.produced, state.prod_lim);
            if room == 0 && !state.buf.is_empty() {
                return;
            }
            let mut chunk = Buffer::new(0);
            let take = match room {
                r if r < 0 => state.buf.len(),
                r => state.buf.len().min(r as usize),
            };
            state.buf.transfer(&mut chunk, take);
            (consumer, chunk, state.eod_in, state.eod_clean)
        };

        if !buf.is_empty() {
            let before = buf.len();
            let result = consumer.consume(&mut buf);
            let mut state = core.state.borrow_mut();
            let sent = before - buf.len();
            state.produced += sent as u64;

            // Unaccepted bytes go back to the front of the relay buffer
            let leftover = buf.pop_all();
            if !leftover.is_empty() {
                let mut rebuilt = Buffer::new(core.capacity);
                rebuilt.append(&leftover);
                state.buf.transfer(&mut rebuilt, usize::max_value());
                state.buf = rebuilt;
            }

            match result {
                Ok(new_lim) => state.prod_lim = new_lim,
                Err(IoError::Wait) | Err(IoError::MissingControl) => {}
                Err(_) => {
                    drop(state);
                    Self::abort(core);
                    return;
                }
            }
            drop(state);
            Self::update_upstream_limit(core);
        }

        // Forward a pending end-of-data once drained
        let consumer = {
            let mut state = core.state.borrow_mut();
            if eod && state.buf.is_empty() && !state.sent_eod {
                match state.down_consumer.clone() {
                    Some(consumer) => {
                        state.sent_eod = true;
                        Some(consumer)
                    }
                    None => None,
                }
            } else {
                None
            }
        };
        if let Some(consumer) = consumer {
            consumer.end_consume(eod_clean);
        }
    }

    fn update_upstream_limit(core: &Rc<PipeCore>) {
        let (producer, lim) = {
            let mut state = core.state.borrow_mut();
            let producer = match &state.up_producer {
                Some(producer) => producer.clone(),
                None => return,
            };
            if state.eod_in {
                return;
            }
            let free = core.capacity.saturating_sub(state.buf.len());
            let lim = state.consumed as Credit + free as Credit;
            if lim <= state.lim_sent {
                return;
            }
            state.lim_sent = lim;
            (producer, lim)
        };
        producer.can_produce(lim);
    }

    fn end_consume(core: &Rc<PipeCore>, clean: bool) {
        {
            let mut state = core.state.borrow_mut();
            if state.eod_in {
                return;
            }
            state.eod_in = true;
            state.eod_clean = clean;
        }
        let core = core.clone();
        core.sched.clone().defer(move || Self::do_produce(&core));
    }

    fn abort(core: &Rc<PipeCore>) {
        let (producer, consumer) = {
            let mut state = core.state.borrow_mut();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.eod_in = true;
            state.buf.clear();
            (state.up_producer.take(), state.down_consumer.take())
        };
        logging::debug!(core.log, "byte pipe aborted");
        if let Some(producer) = producer {
            producer.abort();
            producer.detach();
        }
        if let Some(consumer) = consumer {
            consumer.abort();
            consumer.detach();
        }
    }

    fn can_produce(core: &Rc<PipeCore>, limit: Credit) {
        let grew = {
            let mut state = core.state.borrow_mut();
            if state.down_consumer.is_none() {
                return;
            }
            crate::io::advance_lim(&mut state.prod_lim, limit)
        };
        if grew {
            let core = core.clone();
            core.sched.clone().defer(move || Self::do_produce(&core));
        }
    }

    fn attach_producer(core: &Rc<PipeCore>, producer: &ByteProducerRef) -> IoResult<()> {
        let initial_lim = {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.up_producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("producer already attached"));
            }
            if state.eod_in {
                return Err(IoError::Closed);
            }
            state.up_producer = Some(producer.clone());
            state.consumed = 0;
            state.lim_sent = core.capacity.saturating_sub(state.buf.len()) as Credit;
            state.lim_sent
        };

        producer.attach(&(Rc::new(PipeConsumerFacade { core: core.clone() }) as ByteConsumerRef))?;
        producer.can_produce(initial_lim);
        crate::io::notify_best_effort(|| producer.control(&ControlMsg::NotifyConsumerAttached));
        Ok(())
    }

    fn detach_producer(core: &Rc<PipeCore>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            match state.up_producer.take() {
                Some(producer) => {
                    state.consumed = 0;
                    state.lim_sent = 0;
                    producer
                }
                None => return,
            }
        };
        producer.detach();
    }

    fn attach_consumer(core: &Rc<PipeCore>, consumer: &ByteConsumerRef) -> IoResult<()> {
        {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.down_consumer {
                if current.endpoint_id() == consumer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("consumer already attached"));
            }
            if state.sent_eod {
                return Err(IoError::Closed);
            }
            state.down_consumer = Some(consumer.clone());
            state.produced = 0;
            state.prod_lim = 0;
        }

        consumer.attach(&(Rc::new(PipeProducerFacade { core: core.clone() }) as ByteProducerRef))?;
        crate::io::notify_best_effort(|| consumer.control(&ControlMsg::NotifyProducerAttached));
        Ok(())
    }

    fn detach_consumer(core: &Rc<PipeCore>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            match state.down_consumer.take() {
                Some(consumer) => {
                    state.produced = 0;
                    state.prod_lim = 0;
                    consumer
                }
                None => return,
            }
        };
        consumer.detach();
    }
}

struct PipeConsumerFacade {
    core: Rc<PipeCore>,
}

impl ByteConsumer for PipeConsumerFacade {
    fn consume(&self, data: &mut Buffer) -> IoResult<Credit> {
        PipeCore::consume(&self.core, data)
    }

    fn end_consume(&self, clean: bool) {
        PipeCore::end_consume(&self.core, clean)
    }

    fn abort(&self) {
        PipeCore::abort(&self.core)
    }

    fn attach(&self, producer: &ByteProducerRef) -> IoResult<()> {
        PipeCore::attach_producer(&self.core, producer)
    }

    fn detach(&self) {
        PipeCore::detach_producer(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Consumer)
    }
}

struct PipeProducerFacade {
    core: Rc<PipeCore>,
}

impl ByteProducer for PipeProducerFacade {
    fn can_produce(&self, limit: Credit) {
        PipeCore::can_produce(&self.core, limit)
    }

    fn abort(&self) {
        PipeCore::abort(&self.core)
    }

    fn attach(&self, consumer: &ByteConsumerRef) -> IoResult<()> {
        PipeCore::attach_consumer(&self.core, consumer)
    }

    fn detach(&self) {
        PipeCore::detach_consumer(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Producer)
    }
}

// ================================================================ ByteAgent

struct AgentState {
    closed_in: bool,
    closed_out: bool,
}

/// Duplex byte endpoint pairing a sink (input) and a writer (output) under a
/// half-close policy.
pub struct ByteAgent {
    sink: ByteSink,
    writer: ByteWriter,
    policy: HalfClosePolicy,
    state: RefCell<AgentState>,
    log: logging::Logger,
}

impl ByteAgent {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        capacity: usize,
        policy: HalfClosePolicy,
        log: L,
    ) -> IoResult<ByteAgent> {
        let log = logging::child_or_discard(log);
        Ok(ByteAgent {
            sink: ByteSink::new(sched, capacity, &log)?,
            writer: ByteWriter::new(sched, &log)?,
            policy,
            state: RefCell::new(AgentState {
                closed_in: false,
                closed_out: false,
            }),
            log,
        })
    }

    /// The pipeline-facing byte interface of the agent.
    pub fn byte_io(&self) -> ByteIoPair {
        ByteIoPair::new(self.sink.byte_consume(), self.writer.byte_produce())
    }

    /// Reader for the agent's input direction.
    pub fn reader(&self) -> BlockingReader {
        self.sink.reader()
    }

    /// Writer handle for the agent's output direction.
    pub fn writer(&self) -> WriterHandle {
        self.writer.handle()
    }

    /// Number of received bytes waiting to be read.
    pub fn pending(&self) -> usize {
        self.sink.len()
    }

    /// End-of-data marker of the input direction: `None` while open,
    /// otherwise the clean flag.
    pub fn ended(&self) -> Option<bool> {
        self.sink.ended()
    }

    pub fn half_close_policy(&self) -> HalfClosePolicy {
        self.policy
    }

    /// Whether the input (read) direction is closed.
    pub fn input_closed(&self) -> bool {
        self.state.borrow().closed_in
    }

    /// Whether the output (write) direction is closed.
    pub fn output_closed(&self) -> bool {
        self.state.borrow().closed_out
    }

    /// Closes the input direction. Without `half_in` permission this closes
    /// the whole agent.
    pub fn close_input(&self, reason: CloseReason) {
        {
            let mut state = self.state.borrow_mut();
            if state.closed_in {
                return;
            }
            state.closed_in = true;
        }
        logging::debug!(self.log, "agent input closed"; "reason" => ?reason);
        self.sink.close(reason);

        if !self.policy.half_in {
            self.close_output(reason);
        }
    }

    /// Closes the output direction. Without `half_out` permission this closes
    /// the whole agent.
    pub fn close_output(&self, reason: CloseReason) {
        {
            let mut state = self.state.borrow_mut();
            if state.closed_out {
                return;
            }
            state.closed_out = true;
        }
        logging::debug!(self.log, "agent output closed"; "reason" => ?reason);
        self.writer.handle().end_write(reason.is_clean());

        if !self.policy.half_out {
            self.close_input(reason);
        }
    }

    /// Closes both directions.
    pub fn close_io(&self, reason: CloseReason) {
        self.close_input(reason);
        self.close_output(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    fn pump<F: FnMut() -> bool>(reactor: &mut Reactor, pred: F) -> bool {
        reactor.run_until(Duration::from_secs(5), pred)
    }

    #[test]
    fn test_writer_to_sink_delivery() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink = ByteSink::new(&sched, 1024, None).unwrap();
        let writer = ByteWriter::new(&sched, None).unwrap();

        writer.byte_produce().attach(&sink.byte_consume()).unwrap();

        let handle = writer.handle();
        handle.write(b"hello world").unwrap();

        assert!(pump(&mut reactor, || sink.len() == 11));
        assert_eq!(sink.pop(1024), b"hello world".to_vec());

        handle.end_write(true);
        assert!(pump(&mut reactor, || sink.ended() == Some(true)));
    }

    #[test]
    fn test_credit_monotonicity_and_backpressure() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        // Sink with a 4 byte buffer throttles the writer
        let sink = ByteSink::new(&sched, 4, None).unwrap();
        let writer = ByteWriter::new(&sched, None).unwrap();
        writer.byte_produce().attach(&sink.byte_consume()).unwrap();

        let handle = writer.handle();
        handle.write(b"abcdefgh").unwrap();

        assert!(pump(&mut reactor, || sink.len() == 4));
        assert_eq!(sink.pop(2), b"ab".to_vec());

        // Freed capacity must reach the writer and pull the next bytes
        assert!(pump(&mut reactor, || sink.len() == 4));
        assert_eq!(sink.pop(100), b"cdef".to_vec());
        assert!(pump(&mut reactor, || sink.len() == 2));
        assert_eq!(sink.pop(100), b"gh".to_vec());
    }

    #[test]
    fn test_attach_twice_is_contract_error() {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink = ByteSink::new(&sched, 16, None).unwrap();
        let writer_a = ByteWriter::new(&sched, None).unwrap();
        let writer_b = ByteWriter::new(&sched, None).unwrap();

        writer_a.byte_produce().attach(&sink.byte_consume()).unwrap();

        // Re-attaching the same producer is idempotent
        writer_a.byte_produce().attach(&sink.byte_consume()).unwrap();

        let result = writer_b.byte_produce().attach(&sink.byte_consume());
        assert_eq!(
            result.unwrap_err(),
            IoError::Contract("producer already attached")
        );
    }

    #[test]
    fn test_consume_contract_errors() {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink = ByteSink::new(&sched, 4, None).unwrap();
        let consumer = sink.byte_consume();

        // No producer attached yet
        let mut data = Buffer::new(16);
        data.append(b"x");
        assert_eq!(
            consumer.consume(&mut data).unwrap_err(),
            IoError::Contract("no attached producer")
        );

        let writer = ByteWriter::new(&sched, None).unwrap();
        writer.byte_produce().attach(&sink.byte_consume()).unwrap();

        // Empty push is a contract violation
        let mut empty = Buffer::new(16);
        assert_eq!(
            consumer.consume(&mut empty).unwrap_err(),
            IoError::Contract("no data to consume")
        );

        // Fill the advertised credit, then push past it
        let mut data = Buffer::new(16);
        data.append(b"abcd");
        consumer.consume(&mut data).unwrap();

        let mut more = Buffer::new(16);
        more.append(b"e");
        assert_eq!(
            consumer.consume(&mut more).unwrap_err(),
            IoError::Contract("consume limit exceeded")
        );

        // After end-of-data the direction is closed
        consumer.end_consume(true);
        let mut late = Buffer::new(16);
        late.append(b"f");
        assert_eq!(consumer.consume(&mut late).unwrap_err(), IoError::Closed);

        drop(reactor);
    }

    #[test]
    fn test_abort_is_idempotent_and_terminal() {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink = ByteSink::new(&sched, 16, None).unwrap();
        let writer = ByteWriter::new(&sched, None).unwrap();
        writer.byte_produce().attach(&sink.byte_consume()).unwrap();

        sink.abort();
        sink.abort();

        let reader = sink.reader();
        let mut buf = [0u8; 8];
        assert_eq!(
            reader.read(&mut buf, Some(Duration::from_millis(10))).unwrap_err(),
            IoError::Ended(CloseReason::Lost)
        );

        // The writer side was aborted along with the sink
        assert_eq!(writer.handle().write(b"x").unwrap_err(), IoError::Closed);

        drop(reactor);
    }

    #[test]
    fn test_blocking_reader_timeout() {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink = ByteSink::new(&sched, 16, None).unwrap();
        let reader = sink.reader();

        let mut buf = [0u8; 4];
        assert_eq!(
            reader.read(&mut buf, Some(Duration::from_millis(20))).unwrap_err(),
            IoError::Timeout
        );

        drop(reactor);
    }

    #[test]
    fn test_endpoint_identity_is_stable() {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let sink = ByteSink::new(&sched, 16, None).unwrap();
        assert_eq!(
            sink.byte_consume().endpoint_id(),
            sink.byte_consume().endpoint_id()
        );

        let other = ByteSink::new(&sched, 16, None).unwrap();
        assert_ne!(
            sink.byte_consume().endpoint_id(),
            other.byte_consume().endpoint_id()
        );

        drop(reactor);
    }

    #[test]
    fn test_half_close_policy_input_only() {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        // half_in allows the output to stay up after input close
        let policy = HalfClosePolicy {
            half_in: true,
            half_out: false,
        };
        let agent = ByteAgent::new(&sched, 64, policy, None).unwrap();

        agent.close_input(CloseReason::Completed);
        assert!(agent.input_closed());
        assert!(!agent.output_closed());

        // A write after input-only close succeeds
        agent.writer().write(b"still open").unwrap();

        drop(reactor);
    }

    #[test]
    fn test_half_close_policy_output_closes_both() {
        let reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let policy = HalfClosePolicy {
            half_in: true,
            half_out: false,
        };
        let agent = ByteAgent::new(&sched, 64, policy, None).unwrap();

        agent.close_output(CloseReason::Completed);
        assert!(agent.output_closed());
        assert!(agent.input_closed());

        // A read after output close fails terminally (input was closed along
        // with the output, with no buffered data)
        let reader = agent.reader();
        let mut buf = [0u8; 4];
        let result = reader.read(&mut buf, Some(Duration::from_millis(10)));
        assert!(result.is_err());

        drop(reactor);
    }

    #[test]
    fn test_byte_pipe_relays_with_backpressure() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let writer = ByteWriter::new(&sched, None).unwrap();
        let pipe = BytePipe::new(&sched, 8, None);
        let sink = ByteSink::new(&sched, 1024, None).unwrap();

        writer.byte_produce().attach(&pipe.byte_consume()).unwrap();
        pipe.byte_produce().attach(&sink.byte_consume()).unwrap();

        writer.handle().write(b"relay me through a tiny pipe").unwrap();
        writer.handle().end_write(true);

        assert!(pump(&mut reactor, || sink.ended() == Some(true)));
        assert_eq!(sink.pop(1024), b"relay me through a tiny pipe".to_vec());
    }

    #[test]
    fn test_agent_pipeline_roundtrip() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        // Two agents wired back to back form a duplex in-memory channel
        let a = ByteAgent::new(&sched, 1024, HalfClosePolicy::half_close(), None).unwrap();
        let b = ByteAgent::new(&sched, 1024, HalfClosePolicy::half_close(), None).unwrap();
        a.byte_io().attach(&b.byte_io()).unwrap();

        a.writer().write(b"ping").unwrap();
        b.writer().write(b"pong").unwrap();

        let b_reader = b.reader();
        let a_reader = a.reader();

        assert!(pump(&mut reactor, || {
            let a_sink_len = a.sink.len();
            let b_sink_len = b.sink.len();
            a_sink_len == 4 && b_sink_len == 4
        }));

        let mut buf = [0u8; 16];
        let count = b_reader.read(&mut buf, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(&buf[..count], b"ping");
        let count = a_reader.read(&mut buf, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(&buf[..count], b"pong");
    }
}
