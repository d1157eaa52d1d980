//! Entity channel serializer.
//!
//! Bridges a byte pipe to an entity pipe through a streaming codec. Before
//! any entities flow, the channel performs a framed handshake: each side
//! sends `VEC_DRAFT-0.8`, optionally suffixed with its string codec, then a
//! newline. The incoming handshake is bounded to 32 bytes and validated
//! strictly; an announced codec becomes the peer's decoding codec.

use crate::io::entity::{EntityConsumer, EntityConsumerRef, EntityIoPair, EntityProducer, EntityProducerRef};
use crate::io::{
    advance_lim, headroom, merge_lim, notify_best_effort, Buffer, ByteConsumer, ByteConsumerRef,
    ByteIoPair, ByteProducer, ByteProducerRef, ControlMsg, Credit, EndpointId, Role,
};
use crate::reactor::Scheduler;
use hashbrown::HashSet;
use lazy_static::lazy_static;
use quark::encoding::netint;
use quark::logging;
use quark::{IoError, IoResult};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub const PROTO_NAME: &[u8] = b"VEC_DRAFT";
pub const PROTO_VERSION: &[u8] = b"0.8";

const HANDSHAKE_MAXLEN: usize = 32;

lazy_static! {
    /// String codecs a peer may announce in its handshake.
    static ref KNOWN_CODECS: HashSet<&'static str> = {
        let mut codecs = HashSet::new();
        codecs.insert("utf8");
        codecs.insert("utf16");
        codecs
    };
}

/// Returns true if `codec` is a known string codec name.
pub fn known_codec(codec: &str) -> bool {
    KNOWN_CODECS.contains(codec)
}

/// Entity channel tuning parameters.
#[derive(Clone)]
pub struct SerializerConfig {
    /// Whether to perform the channel handshake before serializing.
    pub handshake: bool,
    /// Byte-side receive buffer length.
    pub rbuf_len: usize,
    /// Max bytes serialized per produce call.
    pub max_write: usize,
    /// Max bytes of a single serialized message, unlimited if `None`.
    pub msg_max: Option<u64>,
    /// Entity-side output queue bound governing back-pressure.
    pub ebuf_len: usize,
}

impl Default for SerializerConfig {
    fn default() -> SerializerConfig {
        SerializerConfig {
            handshake: true,
            rbuf_len: 0x4000,
            max_write: 0x4000,
            msg_max: Some(101 * 1024 * 1024),
            ebuf_len: 3,
        }
    }
}

/// Streaming decoder for a single entity message.
pub trait StreamReader {
    type Entity;

    /// Consumes bytes from the buffer until the message completes or the
    /// buffer drains.
    fn read(&mut self, buf: &mut Buffer) -> IoResult<()>;

    /// Bytes consumed so far for the current message.
    fn num_read(&self) -> u64;

    fn done(&self) -> bool;

    /// Takes the decoded entity once `done` reports true.
    fn take(&mut self) -> Option<Self::Entity>;
}

/// Streaming encoder for a single entity message.
pub trait StreamWriter {
    /// Produces up to `max` further bytes of the serialized message.
    fn write(&mut self, max: usize) -> Vec<u8>;

    fn done(&self) -> bool;
}

/// Entity codec seam. The serializer treats message encoding as opaque and
/// only drives the streaming reader/writer protocol.
pub trait StreamCodec: Clone + 'static {
    type Entity: 'static;
    type Reader: StreamReader<Entity = Self::Entity> + 'static;
    type Writer: StreamWriter + 'static;

    fn reader(&self) -> Self::Reader;
    fn writer(&self, entity: Self::Entity) -> Self::Writer;

    /// String codec announced in our handshake, if any.
    fn encoding(&self) -> Option<&'static str>;

    /// Applies the peer's announced string codec for decoding.
    fn set_peer_decoding(&self, codec: &str);
}

// =============================================================== FrameCodec

/// An opaque byte frame entity.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame(pub Vec<u8>);

struct FrameCtx {
    encoding: Option<&'static str>,
    peer_decoding: Option<String>,
}

/// Length-prefixed frame codec: each message is a positive-integer length
/// followed by that many payload bytes.
#[derive(Clone)]
pub struct FrameCodec {
    ctx: Rc<RefCell<FrameCtx>>,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec {
            ctx: Rc::new(RefCell::new(FrameCtx {
                encoding: None,
                peer_decoding: None,
            })),
        }
    }

    /// Codec announcing `encoding` in the channel handshake.
    pub fn with_encoding(encoding: &'static str) -> FrameCodec {
        FrameCodec {
            ctx: Rc::new(RefCell::new(FrameCtx {
                encoding: Some(encoding),
                peer_decoding: None,
            })),
        }
    }

    /// The peer's negotiated decoding codec, if it announced one.
    pub fn peer_decoding(&self) -> Option<String> {
        self.ctx.borrow().peer_decoding.clone()
    }
}

pub struct FrameReader {
    header: Vec<u8>,
    want: Option<u64>,
    data: Vec<u8>,
    num_read: u64,
}

impl StreamReader for FrameReader {
    type Entity = Frame;

    fn read(&mut self, buf: &mut Buffer) -> IoResult<()> {
        while !self.done() && !buf.is_empty() {
            match self.want {
                None => {
                    let byte = buf.pop(1);
                    self.header.extend_from_slice(&byte);
                    self.num_read += 1;
                    if let Some((want, _)) = netint::decode(&self.header)? {
                        self.want = Some(want);
                    }
                }
                Some(want) => {
                    let missing = (want - self.data.len() as u64) as usize;
                    let chunk = buf.pop(missing);
                    self.num_read += chunk.len() as u64;
                    self.data.extend_from_slice(&chunk);
                }
            }
        }
        Ok(())
    }

    fn num_read(&self) -> u64 {
        self.num_read
    }

    fn done(&self) -> bool {
        match self.want {
            Some(want) => self.data.len() as u64 == want,
            None => false,
        }
    }

    fn take(&mut self) -> Option<Frame> {
        if self.done() {
            self.want = None;
            Some(Frame(std::mem::take(&mut self.data)))
        } else {
            None
        }
    }
}

pub struct FrameWriter {
    data: Vec<u8>,
    pos: usize,
}

impl StreamWriter for FrameWriter {
    fn write(&mut self, max: usize) -> Vec<u8> {
        let end = (self.pos + max).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        chunk
    }

    fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

impl StreamCodec for FrameCodec {
    type Entity = Frame;
    type Reader = FrameReader;
    type Writer = FrameWriter;

    fn reader(&self) -> FrameReader {
        FrameReader {
            header: Vec::new(),
            want: None,
            data: Vec::new(),
            num_read: 0,
        }
    }

    fn writer(&self, entity: Frame) -> FrameWriter {
        let mut data = Vec::with_capacity(entity.0.len() + netint::MAX_LEN);
        netint::encode(entity.0.len() as u64, &mut data);
        data.extend_from_slice(&entity.0);
        FrameWriter { data, pos: 0 }
    }

    fn encoding(&self) -> Option<&'static str> {
        self.ctx.borrow().encoding
    }

    fn set_peer_decoding(&self, codec: &str) {
        self.ctx.borrow_mut().peer_decoding = Some(codec.to_string());
    }
}

// ========================================================= EntitySerializer

struct SerState<C: StreamCodec> {
    handshaking: bool,
    handshake_recv: Vec<u8>,
    handshake_send: Option<Buffer>,

    bc_producer: Option<ByteProducerRef>,
    bc_consumed: u64,
    bc_consume_lim: Credit,
    bc_eod: bool,
    bc_eod_clean: bool,
    bc_rbuf: Buffer,
    bc_reader: Option<C::Reader>,
    bc_aborted: bool,

    bp_consumer: Option<ByteConsumerRef>,
    bp_produced: u64,
    bp_produce_lim: Credit,
    bp_wbuf: Buffer,
    bp_writer: Option<C::Writer>,
    bp_sent_eod: bool,

    ec_producer: Option<EntityProducerRef<C::Entity>>,
    ec_consumed: u64,
    ec_consume_lim: Credit,
    ec_eod: bool,
    ec_eod_clean: bool,
    ec_queue: VecDeque<C::Entity>,
    ec_aborted: bool,

    ep_consumer: Option<EntityConsumerRef<C::Entity>>,
    ep_produced: u64,
    ep_produce_lim: Credit,
    ep_queue: VecDeque<C::Entity>,
    ep_sent_eod: bool,
}

impl<C: StreamCodec> SerState<C> {
    fn bp_eod(&self) -> bool {
        self.ec_eod && self.ec_queue.is_empty() && self.bp_wbuf.is_empty()
            && self.bp_writer.is_none()
    }

    fn ep_eod(&self) -> bool {
        self.bc_eod && self.ep_queue.is_empty()
    }
}

struct SerializerCore<C: StreamCodec> {
    sched: Scheduler,
    config: SerializerConfig,
    codec: C,
    state: RefCell<SerState<C>>,
    log: logging::Logger,
}

/// A producer/consumer bridge between serialized byte data and entities.
///
/// The byte interface (`byte_io`) attaches toward the transport; the entity
/// interface (`entity_io`) attaches toward the application.
pub struct EntitySerializer<C: StreamCodec> {
    core: Rc<SerializerCore<C>>,
}

impl<C: StreamCodec> Clone for EntitySerializer<C> {
    fn clone(&self) -> Self {
        EntitySerializer {
            core: self.core.clone(),
        }
    }
}

impl<C: StreamCodec> EntitySerializer<C> {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        sched: &Scheduler,
        codec: C,
        config: SerializerConfig,
        log: L,
    ) -> EntitySerializer<C> {
        let handshake_send = match config.handshake {
            true => {
                let mut hello = Vec::new();
                hello.extend_from_slice(PROTO_NAME);
                hello.push(b'-');
                hello.extend_from_slice(PROTO_VERSION);
                if let Some(encoding) = codec.encoding() {
                    hello.push(b'-');
                    hello.extend_from_slice(encoding.as_bytes());
                }
                hello.push(b'\n');
                let mut buf = Buffer::new(HANDSHAKE_MAXLEN);
                buf.append(&hello);
                Some(buf)
            }
            false => None,
        };

        let rbuf_len = config.rbuf_len;
        EntitySerializer {
            core: Rc::new(SerializerCore {
                sched: sched.clone(),
                codec,
                state: RefCell::new(SerState {
                    handshaking: config.handshake,
                    handshake_recv: Vec::new(),
                    handshake_send,
                    bc_producer: None,
                    bc_consumed: 0,
                    bc_consume_lim: 0,
                    bc_eod: false,
                    bc_eod_clean: true,
                    bc_rbuf: Buffer::new(rbuf_len),
                    bc_reader: None,
                    bc_aborted: false,
                    bp_consumer: None,
                    bp_produced: 0,
                    bp_produce_lim: 0,
                    bp_wbuf: Buffer::new(rbuf_len),
                    bp_writer: None,
                    bp_sent_eod: false,
                    ec_producer: None,
                    ec_consumed: 0,
                    ec_consume_lim: 0,
                    ec_eod: false,
                    ec_eod_clean: true,
                    ec_queue: VecDeque::new(),
                    ec_aborted: false,
                    ep_consumer: None,
                    ep_produced: 0,
                    ep_produce_lim: 0,
                    ep_queue: VecDeque::new(),
                    ep_sent_eod: false,
                }),
                config,
                log: logging::child_or_discard(log),
            }),
        }
    }

    pub fn byte_consume(&self) -> ByteConsumerRef {
        Rc::new(SerByteConsumer {
            core: self.core.clone(),
        })
    }

    pub fn byte_produce(&self) -> ByteProducerRef {
        Rc::new(SerByteProducer {
            core: self.core.clone(),
        })
    }

    pub fn byte_io(&self) -> ByteIoPair {
        ByteIoPair::new(self.byte_consume(), self.byte_produce())
    }

    pub fn entity_consume(&self) -> EntityConsumerRef<C::Entity> {
        Rc::new(SerEntityConsumer {
            core: self.core.clone(),
        })
    }

    pub fn entity_produce(&self) -> EntityProducerRef<C::Entity> {
        Rc::new(SerEntityProducer {
            core: self.core.clone(),
        })
    }

    pub fn entity_io(&self) -> EntityIoPair<C::Entity> {
        EntityIoPair::new(self.entity_consume(), self.entity_produce())
    }

    pub fn config(&self) -> &SerializerConfig {
        &self.core.config
    }

    /// True while the channel handshake is incomplete.
    pub fn handshaking(&self) -> bool {
        self.core.state.borrow().handshaking
    }

    /// Aborts both directions of the channel.
    pub fn abort(&self) {
        SerializerCore::bc_abort(&self.core);
        SerializerCore::ec_abort(&self.core);
    }
}

impl<C: StreamCodec> SerializerCore<C> {
    // Byte consumer side: serialized data arriving from the transport

    fn bc_consume(core: &Rc<Self>, data: &mut Buffer) -> IoResult<Credit> {
        {
            let state = core.state.borrow();
            if state.bc_eod {
                return Err(IoError::Closed);
            }
            if state.bc_producer.is_none() {
                return Err(IoError::Contract("no attached producer"));
            }
            if data.is_empty() {
                return Err(IoError::Contract("no data to consume"));
            }
            if headroom(state.bc_consumed, state.bc_consume_lim) == 0 {
                return Err(IoError::Contract("consume limit exceeded"));
            }
        }

        {
            let mut state = core.state.borrow_mut();
            let mut max_cons = headroom(state.bc_consumed, state.bc_consume_lim);
            if max_cons < 0 {
                max_cons = data.len() as Credit;
            }
            let moved = data.transfer(&mut state.bc_rbuf, max_cons as usize);
            state.bc_consumed += moved as u64;
        }

        if core.state.borrow().handshaking {
            if let Err(err) = Self::handshake(core) {
                Self::bc_abort(core);
                return Err(err);
            }
        }

        if !core.state.borrow().handshaking {
            if let Err(err) = Self::decode_entities(core) {
                Self::bc_abort(core);
                return Err(err);
            }
            Self::ep_produce(core);
        }

        let mut state = core.state.borrow_mut();
        let max_add = merge_lim(state.bc_rbuf.len(), &[state.bc_rbuf.size() as Credit]);
        state.bc_consume_lim = match max_add >= 0 {
            true => state.bc_consumed as Credit + max_add,
            false => -1,
        };
        Ok(state.bc_consume_lim)
    }

    /// Decodes complete messages from the byte-side receive buffer onto the
    /// entity output queue.
    fn decode_entities(core: &Rc<Self>) -> IoResult<()> {
        loop {
            let mut state = core.state.borrow_mut();
            if state.bc_rbuf.is_empty() {
                return Ok(());
            }
            let mut reader = match state.bc_reader.take() {
                Some(reader) => reader,
                None => core.codec.reader(),
            };

            let mut rbuf = std::mem::replace(&mut state.bc_rbuf, Buffer::new(0));
            drop(state);
            let result = reader.read(&mut rbuf);
            let mut state = core.state.borrow_mut();
            state.bc_rbuf = rbuf;

            result.map_err(|_| IoError::Protocol("malformed entity data"))?;

            if let Some(msg_max) = core.config.msg_max {
                if reader.num_read() > msg_max {
                    return Err(IoError::Protocol("message size limit exceeded"));
                }
            }

            if reader.done() {
                if let Some(entity) = reader.take() {
                    state.ep_queue.push_back(entity);
                }
            } else {
                state.bc_reader = Some(reader);
                return Ok(());
            }
        }
    }

    fn bc_end_consume(core: &Rc<Self>, clean: bool) {
        {
            let mut state = core.state.borrow_mut();
            if state.bc_eod {
                return;
            }
            state.bc_eod = true;
            state.bc_eod_clean = clean;

            if state.ep_consumer.is_some() {
                // End-of-data inside a partly read message is not clean
                if state.bc_reader.is_some() {
                    state.bc_eod_clean = false;
                    state.bc_reader = None;
                }
            }
        }

        let has_consumer = core.state.borrow().ep_consumer.is_some();
        match has_consumer {
            true => Self::ep_produce(core),
            false => Self::bc_abort(core),
        }
    }

    fn bc_abort(core: &Rc<Self>) {
        let (ep_consumer, bc_producer) = {
            let mut state = core.state.borrow_mut();
            if state.bc_aborted {
                return;
            }
            state.bc_aborted = true;
            state.bc_eod = true;
            state.bc_rbuf.clear();
            state.bc_reader = None;
            state.ep_queue.clear();
            (state.ep_consumer.take(), state.bc_producer.take())
        };

        if let Some(consumer) = ep_consumer {
            consumer.abort();
            consumer.detach();
        }
        if let Some(producer) = bc_producer {
            producer.abort();
            producer.detach();
        }
    }

    fn bc_attach(core: &Rc<Self>, producer: &ByteProducerRef) -> IoResult<()> {
        let initial_lim = {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.bc_producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("producer already attached"));
            }
            if state.bc_eod {
                return Err(IoError::Closed);
            }
            state.bc_producer = Some(producer.clone());
            state.bc_consumed = 0;
            state.bc_consume_lim = merge_lim(state.bc_rbuf.len(), &[state.bc_rbuf.size() as Credit]);
            state.bc_consume_lim
        };

        producer.attach(&(Rc::new(SerByteConsumer { core: core.clone() }) as ByteConsumerRef))?;
        producer.can_produce(initial_lim);
        notify_best_effort(|| producer.control(&ControlMsg::NotifyConsumerAttached));
        Ok(())
    }

    fn bc_detach(core: &Rc<Self>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            match state.bc_producer.take() {
                Some(producer) => {
                    state.bc_consumed = 0;
                    state.bc_consume_lim = 0;
                    producer
                }
                None => return,
            }
        };
        producer.detach();
    }

    // Byte producer side: serialized data leaving toward the transport

    fn bp_can_produce(core: &Rc<Self>, limit: Credit) {
        let grew = {
            let mut state = core.state.borrow_mut();
            if state.bp_consumer.is_none() {
                return;
            }
            advance_lim(&mut state.bp_produce_lim, limit)
        };
        if grew {
            let core = core.clone();
            core.sched.clone().defer(move || Self::bp_do_produce(&core));
        }
    }

    fn bp_abort(core: &Rc<Self>) {
        Self::ec_abort(core);
    }

    fn bp_attach(core: &Rc<Self>, consumer: &ByteConsumerRef) -> IoResult<()> {
        {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.bp_consumer {
                if current.endpoint_id() == consumer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("consumer already attached"));
            }
            if state.bp_eod() {
                return Err(IoError::Closed);
            }
            state.bp_consumer = Some(consumer.clone());
            state.bp_produced = 0;
            state.bp_produce_lim = 0;
        }

        consumer.attach(&(Rc::new(SerByteProducer { core: core.clone() }) as ByteProducerRef))?;

        // With a byte-side consumer in place the entity input can drain
        let (producer, lim) = {
            let mut state = core.state.borrow_mut();
            match state.ec_producer.clone() {
                Some(producer) => {
                    let lim = merge_lim(state.ec_queue.len(), &[core.config.ebuf_len as Credit]);
                    state.ec_consume_lim = match lim >= 0 {
                        true => state.ec_consumed as Credit + lim,
                        false => -1,
                    };
                    (Some(producer), state.ec_consume_lim)
                }
                None => (None, 0),
            }
        };
        if let Some(producer) = producer {
            producer.can_produce(lim);
        }

        notify_best_effort(|| consumer.control(&ControlMsg::NotifyProducerAttached));
        Ok(())
    }

    fn bp_detach(core: &Rc<Self>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            match state.bp_consumer.take() {
                Some(consumer) => {
                    state.bp_produced = 0;
                    state.bp_produce_lim = 0;
                    consumer
                }
                None => return,
            }
        };
        consumer.detach();
    }

    /// Serializes queued entities and pushes byte data downstream.
    fn bp_do_produce(core: &Rc<Self>) {
        // Send any pending handshake hello first
        loop {
            let (consumer, mut send) = {
                let mut state = core.state.borrow_mut();
                let consumer = match &state.bp_consumer {
                    Some(consumer) => consumer.clone(),
                    None => return,
                };
                if headroom(state.bp_produced, state.bp_produce_lim) == 0 {
                    return;
                }
                match state.handshake_send.take() {
                    Some(send) => (consumer, send),
                    None => break,
                }
            };

            let before = send.len();
            let result = consumer.consume(&mut send);
            {
                let mut state = core.state.borrow_mut();
                state.bp_produced += (before - send.len()) as u64;
                match result {
                    Ok(new_lim) => {
                        state.bp_produce_lim = new_lim;
                        if !send.is_empty() {
                            state.handshake_send = Some(send);
                            return;
                        }
                    }
                    Err(IoError::Wait) | Err(IoError::MissingControl) => {
                        state.handshake_send = Some(send);
                        return;
                    }
                    Err(_) => {
                        drop(state);
                        Self::ec_abort(core);
                        return;
                    }
                }
            }
        }

        if core.state.borrow().handshaking {
            return;
        }

        loop {
            let (consumer, mut wbuf, eod, eod_clean) = {
                let mut state = core.state.borrow_mut();
                let consumer = match &state.bp_consumer {
                    Some(consumer) => consumer.clone(),
                    None => return,
                };
                if state.bp_sent_eod {
                    return;
                }

                if state.bp_eod() {
                    state.bp_sent_eod = true;
                    (consumer, Buffer::new(0), true, state.ec_eod_clean)
                } else {
                    let max_write = merge_lim(
                        0,
                        &[
                            headroom(state.bp_produced, state.bp_produce_lim),
                            core.config.max_write as Credit,
                        ],
                    );
                    if max_write == 0 {
                        return;
                    }
                    let mut bytes_left = match max_write < 0 {
                        true => core.config.max_write,
                        false => max_write as usize,
                    };
                    bytes_left = bytes_left.saturating_sub(state.bp_wbuf.len());

                    while bytes_left > 0 && (state.bp_writer.is_some() || !state.ec_queue.is_empty()) {
                        let mut writer = match state.bp_writer.take() {
                            Some(writer) => writer,
                            None => {
                                let entity = state.ec_queue.pop_front()
                                    .expect("Entity queue emptied mid-iteration");
                                core.codec.writer(entity)
                            }
                        };
                        let chunk = writer.write(bytes_left);
                        if chunk.is_empty() && !writer.done() {
                            state.bp_writer = Some(writer);
                            break;
                        }
                        state.bp_wbuf.append(&chunk);
                        bytes_left -= chunk.len();
                        if !writer.done() {
                            state.bp_writer = Some(writer);
                        }
                    }

                    if state.bp_wbuf.is_empty() {
                        return;
                    }
                    let wbuf = std::mem::replace(&mut state.bp_wbuf, Buffer::new(0));
                    (consumer, wbuf, false, true)
                }
            };

            if eod {
                consumer.end_consume(eod_clean);
                logging::debug!(core.log, "serializer byte output ended"; "clean" => eod_clean);
                return;
            }

            let before = wbuf.len();
            let result = consumer.consume(&mut wbuf);
            let blocked = {
                let mut state = core.state.borrow_mut();
                let sent = before - wbuf.len();
                state.bp_produced += sent as u64;
                // Unsent serialized bytes stay buffered for the next round
                let mut wbuf = wbuf;
                wbuf.transfer(&mut state.bp_wbuf, usize::max_value());
                match result {
                    Ok(new_lim) => {
                        state.bp_produce_lim = new_lim;
                        !state.bp_wbuf.is_empty()
                            || headroom(state.bp_produced, state.bp_produce_lim) == 0
                    }
                    Err(IoError::Wait) | Err(IoError::MissingControl) => true,
                    Err(_) => {
                        drop(state);
                        Self::ec_abort(core);
                        return;
                    }
                }
            };

            Self::ec_update_limit(core);

            if blocked {
                return;
            }

            let idle = {
                let state = core.state.borrow();
                state.ec_queue.is_empty() && state.bp_writer.is_none() && !state.bp_eod()
            };
            if idle {
                return;
            }
        }
    }

    /// Re-advertises entity-side input credit after queue space was freed.
    fn ec_update_limit(core: &Rc<Self>) {
        let (producer, lim) = {
            let mut state = core.state.borrow_mut();
            let producer = match &state.ec_producer {
                Some(producer) => producer.clone(),
                None => return,
            };
            let old_lim = state.ec_consume_lim;
            let max_add = merge_lim(state.ec_queue.len(), &[core.config.ebuf_len as Credit]);
            state.ec_consume_lim = match max_add >= 0 {
                true => state.ec_consumed as Credit + max_add,
                false => -1,
            };
            if state.ec_consume_lim == old_lim {
                return;
            }
            (producer, state.ec_consume_lim)
        };
        let core = core.clone();
        core.sched.clone().defer(move || {
            let state = core.state.borrow();
            if let Some(current) = &state.ec_producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    let current = current.clone();
                    drop(state);
                    current.can_produce(lim);
                }
            }
        });
    }

    // Entity consumer side: entities arriving from the application

    fn ec_consume(core: &Rc<Self>, entities: &mut VecDeque<C::Entity>) -> IoResult<Credit> {
        {
            let state = core.state.borrow();
            if state.ec_eod {
                return Err(IoError::Closed);
            }
            if state.ec_producer.is_none() {
                return Err(IoError::Contract("no attached producer"));
            }
            if entities.is_empty() {
                return Err(IoError::Contract("no entities to consume"));
            }
            let room = headroom(state.ec_consumed, state.ec_consume_lim);
            if room == 0 || (room > 0 && (room as usize) < entities.len()) {
                return Err(IoError::Contract("consume limit exceeded"));
            }
        }

        {
            let mut state = core.state.borrow_mut();
            let count = entities.len();
            state.ec_queue.extend(entities.drain(..));
            state.ec_consumed += count as u64;
        }

        Self::bp_do_produce(core);

        let mut state = core.state.borrow_mut();
        let max_add = merge_lim(state.ec_queue.len(), &[core.config.ebuf_len as Credit]);
        state.ec_consume_lim = match max_add >= 0 {
            true => state.ec_consumed as Credit + max_add,
            false => -1,
        };
        Ok(state.ec_consume_lim)
    }

    fn ec_end_consume(core: &Rc<Self>, clean: bool) {
        {
            let mut state = core.state.borrow_mut();
            if state.ec_eod {
                return;
            }
            state.ec_eod = true;
            state.ec_eod_clean = clean;
        }

        let has_consumer = core.state.borrow().bp_consumer.is_some();
        match has_consumer {
            true => Self::bp_do_produce(core),
            false => Self::ec_abort(core),
        }
    }

    fn ec_abort(core: &Rc<Self>) {
        let (bp_consumer, ec_producer) = {
            let mut state = core.state.borrow_mut();
            if state.ec_aborted {
                return;
            }
            state.ec_aborted = true;
            state.ec_eod = true;
            state.bp_wbuf.clear();
            state.bp_writer = None;
            state.ec_queue.clear();
            (state.bp_consumer.take(), state.ec_producer.take())
        };

        if let Some(consumer) = bp_consumer {
            consumer.abort();
            consumer.detach();
        }
        if let Some(producer) = ec_producer {
            producer.abort();
            producer.detach();
        }
    }

    fn ec_attach(core: &Rc<Self>, producer: &EntityProducerRef<C::Entity>) -> IoResult<()> {
        let initial_lim = {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.ec_producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("producer already attached"));
            }
            if state.ec_eod {
                return Err(IoError::Closed);
            }
            state.ec_producer = Some(producer.clone());
            state.ec_consumed = 0;
            state.ec_consume_lim = merge_lim(state.ec_queue.len(), &[core.config.ebuf_len as Credit]);
            state.ec_consume_lim
        };

        producer.attach(&(Rc::new(SerEntityConsumer { core: core.clone() }) as EntityConsumerRef<C::Entity>))?;
        producer.can_produce(initial_lim);
        notify_best_effort(|| producer.control(&ControlMsg::NotifyConsumerAttached));
        Ok(())
    }

    fn ec_detach(core: &Rc<Self>) {
        let producer = {
            let mut state = core.state.borrow_mut();
            match state.ec_producer.take() {
                Some(producer) => {
                    state.ec_consumed = 0;
                    state.ec_consume_lim = 0;
                    producer
                }
                None => return,
            }
        };
        producer.detach();
    }

    // Entity producer side: decoded entities leaving toward the application

    fn ep_can_produce(core: &Rc<Self>, limit: Credit) {
        let grew = {
            let mut state = core.state.borrow_mut();
            if state.ep_consumer.is_none() {
                return;
            }
            advance_lim(&mut state.ep_produce_lim, limit)
        };
        if grew {
            let core = core.clone();
            core.sched.clone().defer(move || Self::ep_produce(&core));
        }
    }

    fn ep_abort(core: &Rc<Self>) {
        Self::bc_abort(core);
    }

    fn ep_attach(core: &Rc<Self>, consumer: &EntityConsumerRef<C::Entity>) -> IoResult<()> {
        {
            let mut state = core.state.borrow_mut();
            if let Some(current) = &state.ep_consumer {
                if current.endpoint_id() == consumer.endpoint_id() {
                    return Ok(());
                }
                return Err(IoError::Contract("consumer already attached"));
            }
            if state.ep_eod() {
                return Err(IoError::Closed);
            }
            state.ep_consumer = Some(consumer.clone());
            state.ep_produced = 0;
            state.ep_produce_lim = 0;
        }

        consumer.attach(&(Rc::new(SerEntityProducer { core: core.clone() }) as EntityProducerRef<C::Entity>))?;
        notify_best_effort(|| consumer.control(&ControlMsg::NotifyProducerAttached));
        Ok(())
    }

    fn ep_detach(core: &Rc<Self>) {
        let consumer = {
            let mut state = core.state.borrow_mut();
            match state.ep_consumer.take() {
                Some(consumer) => {
                    state.ep_produced = 0;
                    state.ep_produce_lim = 0;
                    consumer
                }
                None => return,
            }
        };
        consumer.detach();
    }

    /// Pushes decoded entities to the attached entity consumer.
    fn ep_produce(core: &Rc<Self>) {
        loop {
            let (consumer, mut batch) = {
                let mut state = core.state.borrow_mut();
                let consumer = match &state.ep_consumer {
                    Some(consumer) => consumer.clone(),
                    None => return,
                };
                if state.ep_sent_eod {
                    return;
                }
                if state.ep_queue.is_empty() {
                    break;
                }
                let room = headroom(state.ep_produced, state.ep_produce_lim);
                if room == 0 {
                    break;
                }
                let take = match room {
                    r if r < 0 => state.ep_queue.len(),
                    r => state.ep_queue.len().min(r as usize),
                };
                let batch: VecDeque<C::Entity> = state.ep_queue.drain(..take).collect();
                (consumer, batch)
            };

            let sent = batch.len();
            let result = consumer.consume(&mut batch);
            let leftover = batch.len();
            let accepted = sent - leftover;

            let done = {
                let mut state = core.state.borrow_mut();
                for entity in batch.into_iter().rev() {
                    state.ep_queue.push_front(entity);
                }
                state.ep_produced += accepted as u64;
                match result {
                    Ok(new_lim) => {
                        state.ep_produce_lim = new_lim;
                        state.ep_queue.is_empty()
                            || headroom(state.ep_produced, state.ep_produce_lim) == 0
                    }
                    Err(IoError::Wait) | Err(IoError::MissingControl) => true,
                    Err(_) => {
                        drop(state);
                        Self::bc_abort(core);
                        return;
                    }
                }
            };

            // Freed receive buffer space may grow the byte-side credit
            Self::bc_update_limit(core);

            if done {
                break;
            }
        }

        // Forward end-of-data once all decoded entities were delivered
        let (consumer, clean) = {
            let mut state = core.state.borrow_mut();
            if !state.ep_eod() || state.ep_sent_eod {
                return;
            }
            match state.ep_consumer.clone() {
                Some(consumer) => {
                    state.ep_sent_eod = true;
                    (consumer, state.bc_eod_clean)
                }
                None => return,
            }
        };
        consumer.end_consume(clean);
        logging::debug!(core.log, "serializer entity output ended"; "clean" => clean);
    }

    /// Re-advertises byte-side input credit after buffer space was freed.
    fn bc_update_limit(core: &Rc<Self>) {
        let (producer, lim) = {
            let mut state = core.state.borrow_mut();
            let producer = match &state.bc_producer {
                Some(producer) => producer.clone(),
                None => return,
            };
            let old_lim = state.bc_consume_lim;
            let max_add = merge_lim(state.bc_rbuf.len(), &[state.bc_rbuf.size() as Credit]);
            state.bc_consume_lim = match max_add >= 0 {
                true => state.bc_consumed as Credit + max_add,
                false => -1,
            };
            if state.bc_consume_lim == old_lim {
                return;
            }
            (producer, state.bc_consume_lim)
        };
        let core_clone = core.clone();
        core.sched.defer(move || {
            let state = core_clone.state.borrow();
            if let Some(current) = &state.bc_producer {
                if current.endpoint_id() == producer.endpoint_id() {
                    let current = current.clone();
                    drop(state);
                    current.can_produce(lim);
                }
            }
        });
    }

    /// Consumes and validates the peer's handshake line.
    fn handshake(core: &Rc<Self>) -> IoResult<()> {
        let header = {
            let mut state = core.state.borrow_mut();
            loop {
                if state.bc_rbuf.is_empty() {
                    break;
                }
                if state.handshake_recv.len() >= HANDSHAKE_MAXLEN {
                    return Err(IoError::Protocol("handshake exceeded byte limit"));
                }
                let byte = state.bc_rbuf.pop(1);
                state.handshake_recv.extend_from_slice(&byte);
                if byte[0] == b'\n' {
                    break;
                }
            }

            match state.handshake_recv.last() {
                Some(&b'\n') => {
                    let mut header = std::mem::take(&mut state.handshake_recv);
                    header.pop();
                    header
                }
                _ => {
                    if state.handshake_recv.len() >= HANDSHAKE_MAXLEN {
                        return Err(IoError::Protocol("handshake exceeded byte limit"));
                    }
                    return Ok(());
                }
            }
        };

        let parts: Vec<&[u8]> = header.split(|&byte| byte == b'-').collect();
        if parts.len() != 2 && parts.len() != 3 {
            return Err(IoError::Protocol("malformed handshake header"));
        }
        if parts[0] != PROTO_NAME {
            return Err(IoError::Protocol("unknown channel protocol"));
        }
        let version = parts[1];
        if version.iter().any(|&c| !(c.is_ascii_digit() || c == b'.')) {
            return Err(IoError::Protocol("illegal protocol version number"));
        }
        if version != PROTO_VERSION {
            return Err(IoError::Protocol("protocol version not supported"));
        }
        if parts.len() == 3 {
            let codec = std::str::from_utf8(parts[2])
                .map_err(|_| IoError::Protocol("invalid string codec"))?;
            if codec.is_empty() || !known_codec(codec) {
                return Err(IoError::Protocol("invalid string codec"));
            }
            core.codec.set_peer_decoding(codec);
            logging::debug!(core.log, "peer string codec negotiated"; "codec" => codec);
        }

        core.state.borrow_mut().handshaking = false;
        logging::debug!(core.log, "channel handshake complete");

        let core = core.clone();
        core.sched.clone().defer(move || Self::bp_do_produce(&core));
        Ok(())
    }
}

// ================================================================== facades

struct SerByteConsumer<C: StreamCodec> {
    core: Rc<SerializerCore<C>>,
}

impl<C: StreamCodec> ByteConsumer for SerByteConsumer<C> {
    fn consume(&self, data: &mut Buffer) -> IoResult<Credit> {
        SerializerCore::bc_consume(&self.core, data)
    }

    fn end_consume(&self, clean: bool) {
        SerializerCore::bc_end_consume(&self.core, clean)
    }

    fn abort(&self) {
        SerializerCore::bc_abort(&self.core)
    }

    fn attach(&self, producer: &ByteProducerRef) -> IoResult<()> {
        SerializerCore::bc_attach(&self.core, producer)
    }

    fn detach(&self) {
        SerializerCore::bc_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Consumer)
    }
}

struct SerByteProducer<C: StreamCodec> {
    core: Rc<SerializerCore<C>>,
}

impl<C: StreamCodec> ByteProducer for SerByteProducer<C> {
    fn can_produce(&self, limit: Credit) {
        SerializerCore::bp_can_produce(&self.core, limit)
    }

    fn abort(&self) {
        SerializerCore::bp_abort(&self.core)
    }

    fn attach(&self, consumer: &ByteConsumerRef) -> IoResult<()> {
        SerializerCore::bp_attach(&self.core, consumer)
    }

    fn detach(&self) {
        SerializerCore::bp_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Producer)
    }
}

struct SerEntityConsumer<C: StreamCodec> {
    core: Rc<SerializerCore<C>>,
}

impl<C: StreamCodec> EntityConsumer<C::Entity> for SerEntityConsumer<C> {
    fn consume(&self, entities: &mut VecDeque<C::Entity>) -> IoResult<Credit> {
        SerializerCore::ec_consume(&self.core, entities)
    }

    fn end_consume(&self, clean: bool) {
        SerializerCore::ec_end_consume(&self.core, clean)
    }

    fn abort(&self) {
        SerializerCore::ec_abort(&self.core)
    }

    fn attach(&self, producer: &EntityProducerRef<C::Entity>) -> IoResult<()> {
        SerializerCore::ec_attach(&self.core, producer)
    }

    fn detach(&self) {
        SerializerCore::ec_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Consumer)
    }
}

struct SerEntityProducer<C: StreamCodec> {
    core: Rc<SerializerCore<C>>,
}

impl<C: StreamCodec> EntityProducer<C::Entity> for SerEntityProducer<C> {
    fn can_produce(&self, limit: Credit) {
        SerializerCore::ep_can_produce(&self.core, limit)
    }

    fn abort(&self) {
        SerializerCore::ep_abort(&self.core)
    }

    fn attach(&self, consumer: &EntityConsumerRef<C::Entity>) -> IoResult<()> {
        SerializerCore::ep_attach(&self.core, consumer)
    }

    fn detach(&self) {
        SerializerCore::ep_detach(&self.core)
    }

    fn endpoint_id(&self) -> EndpointId {
        EndpointId::new(&self.core, Role::Producer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::entity::{EntitySink, EntityWriter};
    use crate::reactor::Reactor;
    use std::time::Duration;

    fn frame(data: &[u8]) -> Frame {
        Frame(data.to_vec())
    }

    #[test]
    fn test_frame_codec_roundtrip() {
        let codec = FrameCodec::new();

        let mut writer = codec.writer(frame(b"hello"));
        let mut wire = Vec::new();
        loop {
            let chunk = writer.write(2);
            if chunk.is_empty() {
                break;
            }
            wire.extend_from_slice(&chunk);
        }
        assert!(writer.done());
        assert_eq!(wire, vec![1, 5, b'h', b'e', b'l', b'l', b'o']);

        let mut buf = Buffer::new(64);
        buf.append(&wire);
        let mut reader = codec.reader();
        reader.read(&mut buf).unwrap();
        assert!(reader.done());
        assert_eq!(reader.take().unwrap(), frame(b"hello"));
    }

    struct Channel {
        serializer: EntitySerializer<FrameCodec>,
        codec: FrameCodec,
        input: EntityWriter<Frame>,
        output: EntitySink<Frame>,
    }

    fn channel(sched: &crate::reactor::Scheduler, codec: FrameCodec) -> Channel {
        let serializer = EntitySerializer::new(sched, codec.clone(), SerializerConfig::default(), None);
        let input: EntityWriter<Frame> = EntityWriter::new(sched, None);
        let output: EntitySink<Frame> = EntitySink::new(16, None);

        input.entity_produce().attach(&serializer.entity_consume()).unwrap();
        serializer.entity_produce().attach(&output.entity_consume()).unwrap();

        Channel {
            serializer,
            codec,
            input,
            output,
        }
    }

    #[test]
    fn test_channel_handshake_and_transfer() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let a = channel(&sched, FrameCodec::with_encoding("utf8"));
        let b = channel(&sched, FrameCodec::new());
        a.serializer.byte_io().attach(&b.serializer.byte_io()).unwrap();

        a.input.write(frame(b"first")).unwrap();
        a.input.write(frame(b"second")).unwrap();
        b.input.write(frame(b"reply")).unwrap();

        assert!(reactor.run_until(Duration::from_secs(5), || {
            b.output.len() == 2 && a.output.len() == 1
        }));

        assert!(!a.serializer.handshaking());
        assert!(!b.serializer.handshaking());

        assert_eq!(b.output.pop().unwrap(), frame(b"first"));
        assert_eq!(b.output.pop().unwrap(), frame(b"second"));
        assert_eq!(a.output.pop().unwrap(), frame(b"reply"));

        // Codec negotiation: A announced utf8, so B decodes with utf8
        assert_eq!(b.codec.peer_decoding(), Some("utf8".to_string()));
        assert_eq!(a.codec.peer_decoding(), None);
    }

    #[test]
    fn test_channel_end_of_data_forwarding() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let a = channel(&sched, FrameCodec::new());
        let b = channel(&sched, FrameCodec::new());
        a.serializer.byte_io().attach(&b.serializer.byte_io()).unwrap();

        a.input.write(frame(b"payload")).unwrap();
        a.input.end_write(true);

        assert!(reactor.run_until(Duration::from_secs(5), || b.output.ended() == Some(true)));
        assert_eq!(b.output.pop().unwrap(), frame(b"payload"));
    }

    #[test]
    fn test_handshake_version_rejected() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let b = channel(&sched, FrameCodec::new());
        let writer = crate::io::pipe::ByteWriter::new(&sched, None).unwrap();
        writer.byte_produce().attach(&b.serializer.byte_consume()).unwrap();

        writer.handle().write(b"VEC_DRAFT-0.9\n").unwrap();

        // The channel aborts, which propagates an unclean close upward
        assert!(reactor.run_until(Duration::from_secs(5), || b.output.ended() == Some(false)));
    }

    #[test]
    fn test_handshake_overrun_aborts() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let b = channel(&sched, FrameCodec::new());
        let writer = crate::io::pipe::ByteWriter::new(&sched, None).unwrap();
        writer.byte_produce().attach(&b.serializer.byte_consume()).unwrap();

        // 33 bytes with no terminating newline
        writer.handle().write(&[b'x'; HANDSHAKE_MAXLEN + 1]).unwrap();

        assert!(reactor.run_until(Duration::from_secs(5), || b.output.ended() == Some(false)));
    }

    #[test]
    fn test_handshake_unknown_codec_rejected() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let b = channel(&sched, FrameCodec::new());
        let writer = crate::io::pipe::ByteWriter::new(&sched, None).unwrap();
        writer.byte_produce().attach(&b.serializer.byte_consume()).unwrap();

        writer.handle().write(b"VEC_DRAFT-0.8-ebcdic\n").unwrap();

        assert!(reactor.run_until(Duration::from_secs(5), || b.output.ended() == Some(false)));
    }

    #[test]
    fn test_message_size_cap_aborts() {
        let mut reactor = Reactor::new(None).unwrap();
        let sched = reactor.scheduler();

        let config = SerializerConfig {
            msg_max: Some(8),
            ..SerializerConfig::default()
        };
        let codec = FrameCodec::new();
        let b = EntitySerializer::new(&sched, codec, config, None);
        let output: EntitySink<Frame> = EntitySink::new(16, None);
        b.entity_produce().attach(&output.entity_consume()).unwrap();

        let a = channel(&sched, FrameCodec::new());
        a.serializer.byte_consume().attach(&b.byte_produce()).unwrap();
        b.byte_consume().attach(&a.serializer.byte_produce()).unwrap();

        a.input.write(frame(&[7u8; 64])).unwrap();

        assert!(reactor.run_until(Duration::from_secs(5), || output.ended() == Some(false)));
    }
}
